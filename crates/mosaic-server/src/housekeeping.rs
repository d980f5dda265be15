//! Housekeeping thread: heartbeats, idle reaping, leave fan-out, and
//! final slot cleanup.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use mosaic_core::registry::{Outbound, SlotState};
use mosaic_proto::messages::Heartbeat;
use mosaic_proto::{PacketFlags, PacketType};

use crate::broadcast;
use crate::server::ServerContext;

const SWEEP: Duration = Duration::from_millis(500);

pub fn run(ctx: &ServerContext) {
    let mut last_heartbeat = Instant::now();
    let mut ping_nonce: u64 = 1;
    loop {
        if ctx.shutting_down() {
            break;
        }
        std::thread::sleep(SWEEP);

        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let idle_ns = ctx.config.idle_timeout().as_nanos() as u64;

        // Reap idle connections: no traffic for 2x the heartbeat interval.
        for slot in ctx.registry.active() {
            let last_rx = slot.last_rx_ns.load(Ordering::Relaxed);
            if last_rx != 0 && now_ns.saturating_sub(last_rx) > idle_ns {
                info!(slot = slot.slot_id, "idle connection reaped");
                slot.set_state(SlotState::Closed);
            }
        }

        // Announce departures once, to whoever remains.
        for slot in ctx.registry.all() {
            match slot.state() {
                SlotState::Closed | SlotState::Draining => broadcast::announce_leave(ctx, &slot),
                _ => {}
            }
        }

        // Heartbeat fan-out.
        if last_heartbeat.elapsed() >= ctx.config.heartbeat_interval() {
            last_heartbeat = Instant::now();
            ping_nonce = ping_nonce.wrapping_add(1);
            let payload = Arc::new(Heartbeat { nonce: ping_nonce }.encode());
            for slot in ctx.registry.active() {
                let _ = slot.push_control(Outbound::new(
                    PacketType::Ping,
                    PacketFlags::empty(),
                    0,
                    Arc::clone(&payload),
                ));
            }
            debug!(nonce = ping_nonce, "heartbeat fan-out");
        }
    }
    debug!("housekeeping stopped");
}
