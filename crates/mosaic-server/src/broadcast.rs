//! Fan-out to connected clients.
//!
//! Media is shared by refcount: one `Arc<Vec<u8>>` payload, one queue
//! entry per recipient. Sealing happens per recipient in its writer
//! thread because every connection has its own key and sequence space.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use mosaic_core::queue::PushOutcome;
use mosaic_core::registry::{ClientSlot, Outbound};
use mosaic_proto::messages::{ClientJoin, ClientLeave};
use mosaic_proto::{PacketFlags, PacketType};

use crate::server::ServerContext;

/// Forward one client's VIDEO_FRAME to every other active client.
pub fn video(ctx: &ServerContext, origin: u32, flags: PacketFlags, payload: Vec<u8>) {
    let payload = Arc::new(payload);
    for slot in ctx.registry.active() {
        if slot.slot_id == origin {
            continue;
        }
        match slot.push_media(Outbound::new(PacketType::VideoFrame, flags, origin, Arc::clone(&payload))) {
            Ok(PushOutcome::Pushed) => {}
            Ok(PushOutcome::DroppedOldest(_)) => {
                debug!(to = slot.slot_id, origin, "send queue full, oldest frame evicted");
            }
            Ok(PushOutcome::DroppedNewest(_)) => {}
            Err(_) => {} // slot closed mid-iteration; housekeeping reaps it
        }
    }
}

/// Broadcast a server-composed frame (or mixed audio batch) to every
/// active client.
pub fn media_from_server(ctx: &ServerContext, typ: PacketType, flags: PacketFlags, payload: Vec<u8>) {
    let payload = Arc::new(payload);
    for slot in ctx.registry.active() {
        let _ = slot.push_media(Outbound::new(typ, flags, 0, Arc::clone(&payload)));
    }
}

/// Control-plane fan-out (join/leave/layout): blocks briefly rather than
/// dropping, and logs when a peer is too backed up to hear it.
pub fn control(ctx: &ServerContext, skip: Option<u32>, typ: PacketType, payload: Vec<u8>) {
    let payload = Arc::new(payload);
    for slot in ctx.registry.active() {
        if Some(slot.slot_id) == skip {
            continue;
        }
        if let Err(e) = slot.push_control(Outbound::new(typ, PacketFlags::empty(), 0, Arc::clone(&payload))) {
            warn!(to = slot.slot_id, ?typ, error = %e, "control packet not delivered");
        }
    }
}

/// Announce a newcomer to the rest of the room.
pub fn announce_join(ctx: &ServerContext, newcomer: &ClientSlot) {
    let join = ClientJoin {
        slot_id: newcomer.slot_id,
        display_name: newcomer.display_name.clone(),
    };
    match join.encode() {
        Ok(payload) => control(ctx, Some(newcomer.slot_id), PacketType::ClientJoin, payload),
        Err(e) => warn!(slot = newcomer.slot_id, error = %e, "join announcement skipped"),
    }
}

/// Tell a newcomer who is already here.
pub fn send_roster(ctx: &ServerContext, newcomer: &ClientSlot) {
    for slot in ctx.registry.active() {
        if slot.slot_id == newcomer.slot_id {
            continue;
        }
        let join = ClientJoin { slot_id: slot.slot_id, display_name: slot.display_name.clone() };
        if let Ok(payload) = join.encode() {
            let _ = newcomer.push_control(Outbound::new(
                PacketType::ClientJoin,
                PacketFlags::empty(),
                0,
                Arc::new(payload),
            ));
        }
    }
}

/// Fan out CLIENT_LEAVE for a departed slot, exactly once.
pub fn announce_leave(ctx: &ServerContext, departed: &ClientSlot) {
    if departed.leave_sent.swap(true, Ordering::AcqRel) {
        return;
    }
    let leave = ClientLeave { slot_id: departed.slot_id };
    control(ctx, Some(departed.slot_id), PacketType::ClientLeave, leave.encode());
    // Forget the last frame so composed grids drop the cell immediately;
    // the mixer prunes its own sources against the active set each tick.
    ctx.frame_cache.lock().remove(&departed.slot_id);
}
