//! Slotted client registry.
//!
//! Slots are append-with-tombstone: ids come from a monotonic counter and
//! are never reused within a server run. An entry is freed only after the
//! slot is `Closed` AND both the reader and writer thread serving it have
//! detached, so neither thread can observe its slot vanish mid-operation.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use mosaic_proto::messages::Capabilities;
use mosaic_proto::{PacketFlags, PacketType};

use crate::queue::{Lane, OverflowPolicy};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("server is full ({max} clients)")]
    Full { max: usize },
}

impl RegistryError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            RegistryError::Full { .. } => "E_RESOURCE_SERVER_FULL",
        }
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Connecting = 0,
    Handshaking = 1,
    Active = 2,
    Draining = 3,
    Closed = 4,
}

impl SlotState {
    fn from_u8(raw: u8) -> SlotState {
        match raw {
            0 => SlotState::Connecting,
            1 => SlotState::Handshaking,
            2 => SlotState::Active,
            3 => SlotState::Draining,
            _ => SlotState::Closed,
        }
    }
}

/// Which per-slot thread is detaching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRole {
    Reader,
    Writer,
}

const DETACH_READER: u8 = 0b01;
const DETACH_WRITER: u8 = 0b10;

/// A packet staged for one recipient. The payload is shared by
/// refcount across all recipients of a broadcast; sealing happens in the
/// recipient's writer thread because each connection has its own key and
/// sequence space.
#[derive(Clone)]
pub struct Outbound {
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    /// Slot id of the originating client (rides in the header so the
    /// receiver knows whose frame this is).
    pub origin_slot: u32,
    pub payload: Arc<Vec<u8>>,
    /// When this entered the queue; media older than the frame deadline
    /// is discarded by the writer instead of sent late.
    pub queued_at: Instant,
}

impl Outbound {
    pub fn new(packet_type: PacketType, flags: PacketFlags, origin_slot: u32, payload: Arc<Vec<u8>>) -> Self {
        Outbound { packet_type, flags, origin_slot, payload, queued_at: Instant::now() }
    }

    /// Media can go stale; control packets cannot.
    pub fn is_media(&self) -> bool {
        matches!(self.packet_type, PacketType::VideoFrame | PacketType::AudioBatch)
    }
}

/// One connected client.
pub struct ClientSlot {
    pub slot_id: u32,
    pub display_name: String,
    pub addr: SocketAddr,
    pub caps: Capabilities,
    pub send_queue: Lane<Outbound>,
    control_timeout: Duration,
    state: AtomicU8,
    detached: AtomicU8,
    pub last_rx_ns: AtomicU64,
    pub last_tx_ns: AtomicU64,
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    /// Housekeeping has already fanned out CLIENT_LEAVE for this slot.
    pub leave_sent: AtomicBool,
}

impl ClientSlot {
    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SlotState) {
        self.state.store(state as u8, Ordering::Release);
        if state == SlotState::Closed {
            // Wake the writer so it notices the close promptly.
            self.send_queue.close();
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == SlotState::Active
    }

    /// Enqueue a media packet under the queue's drop policy.
    pub fn push_media(&self, out: Outbound) -> Result<crate::queue::PushOutcome<Outbound>, crate::queue::QueueError> {
        self.send_queue.push(out)
    }

    /// Enqueue a control packet, waiting briefly for room instead of
    /// dropping.
    pub fn push_control(&self, out: Outbound) -> Result<(), crate::queue::QueueError> {
        self.send_queue.push_blocking(out, self.control_timeout)
    }
}

/// Capacities for the three send-side traffic classes multiplexed onto a
/// client's queue, plus the control-push timeout.
#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub send_depth: usize,
    pub control_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings { send_depth: 32, control_timeout: Duration::from_millis(50) }
    }
}

/// The shared slot table.
pub struct Registry {
    slots: RwLock<Vec<Arc<ClientSlot>>>,
    next_slot: AtomicU32,
    max_clients: usize,
    queues: QueueSettings,
}

impl Registry {
    pub fn new(max_clients: usize, queues: QueueSettings) -> Self {
        Registry {
            slots: RwLock::new(Vec::new()),
            next_slot: AtomicU32::new(1),
            max_clients,
            queues,
        }
    }

    /// Allocate a slot for a connection that finished its handshake.
    pub fn add(
        &self,
        display_name: String,
        addr: SocketAddr,
        caps: Capabilities,
    ) -> Result<Arc<ClientSlot>, RegistryError> {
        let mut slots = self.slots.write();
        let live = slots.iter().filter(|s| s.state() != SlotState::Closed).count();
        if live >= self.max_clients {
            return Err(RegistryError::Full { max: self.max_clients });
        }
        let slot_id = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(ClientSlot {
            slot_id,
            display_name,
            addr,
            caps,
            // The send queue is SPSC: broadcast produces, the writer
            // thread consumes. Video dominates the traffic so the lane
            // carries its drop policy; control packets go through
            // `push_control` instead.
            send_queue: Lane::new(self.queues.send_depth, OverflowPolicy::DropOldest),
            control_timeout: self.queues.control_timeout,
            state: AtomicU8::new(SlotState::Handshaking as u8),
            detached: AtomicU8::new(0),
            last_rx_ns: AtomicU64::new(0),
            last_tx_ns: AtomicU64::new(0),
            rx_packets: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            leave_sent: AtomicBool::new(false),
        });
        slots.push(Arc::clone(&slot));
        debug!(slot_id, live = live + 1, "slot added");
        Ok(slot)
    }

    pub fn get(&self, slot_id: u32) -> Option<Arc<ClientSlot>> {
        self.slots.read().iter().find(|s| s.slot_id == slot_id).cloned()
    }

    /// Snapshot of slots currently in `Active`.
    ///
    /// A slot marked `Draining`/`Closed` before its CLIENT_LEAVE is
    /// fanned out will never appear here, which is what keeps leave
    /// ordering sane for recipients.
    pub fn active(&self) -> Vec<Arc<ClientSlot>> {
        self.slots.read().iter().filter(|s| s.is_active()).cloned().collect()
    }

    /// Every slot that is not yet freed, whatever its state.
    pub fn all(&self) -> Vec<Arc<ClientSlot>> {
        self.slots.read().clone()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Mark a slot closed (idempotent).
    pub fn close_slot(&self, slot_id: u32) {
        if let Some(slot) = self.get(slot_id) {
            slot.set_state(SlotState::Closed);
            self.maybe_free(slot_id);
        }
    }

    /// A per-slot thread is done with the slot. When both threads of a
    /// closed slot have detached the entry is freed; the slot id stays
    /// burned.
    pub fn detach(&self, slot_id: u32, role: SlotRole) {
        let bit = match role {
            SlotRole::Reader => DETACH_READER,
            SlotRole::Writer => DETACH_WRITER,
        };
        if let Some(slot) = self.get(slot_id) {
            slot.detached.fetch_or(bit, Ordering::AcqRel);
        }
        self.maybe_free(slot_id);
    }

    fn maybe_free(&self, slot_id: u32) {
        let free = match self.get(slot_id) {
            Some(slot) => {
                slot.detached.load(Ordering::Acquire) == (DETACH_READER | DETACH_WRITER)
                    && slot.state() == SlotState::Closed
            }
            None => false,
        };
        if free {
            self.slots.write().retain(|s| s.slot_id != slot_id);
            debug!(slot_id, "slot freed");
        }
    }
}
