//! Fixed-capacity slot array with concurrent enqueue/checkout/acknowledge/
//! requeue/replace, per SPEC_FULL.md §4.1.
//!
//! Each slot carries an atomic state tag (`SlotState`) that every transition
//! moves with a compare-and-swap; only the CAS winner for a slot is allowed to
//! touch that slot's envelope, via a `parking_lot::Mutex` that is only ever
//! contended during the brief window between winning the CAS and publishing
//! the new state.

use std::sync::atomic::{AtomicU8, Ordering};

use chrono::Utc;
use parking_lot::Mutex;

use crate::core::{MessageId, QueueError, Result};
use crate::envelope::{Lease, MessageEnvelope, MessageStatus};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty = 0,
    Claimed = 1,
    Ready = 2,
    InFlight = 3,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Empty,
            1 => Self::Claimed,
            2 => Self::Ready,
            _ => Self::InFlight,
        }
    }
}

struct Slot {
    state: AtomicU8,
    envelope: Mutex<Option<MessageEnvelope>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SlotState::Empty as u8),
            envelope: Mutex::new(None),
        }
    }

    fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn cas(&self, current: SlotState, new: SlotState) -> bool {
        self.state
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Outcome of a [`CircularBuffer::replace`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// No non-terminal envelope carried the key; caller should fall through
    /// to a plain enqueue.
    NotFound,
    /// The prior envelope was Ready and was overwritten in place.
    ReplacedInPlace,
    /// The prior envelope was InFlight and has been marked superseded; the
    /// new envelope was inserted into a fresh slot.
    SupersededAndInserted,
}

pub struct CircularBuffer {
    slots: Vec<Slot>,
    capacity: usize,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::new);
        Self { slots, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Inserts `envelope` into an `Empty` slot. Lock-free on the common path:
    /// each slot is tried with a single CAS; only the winner locks its slot
    /// to publish the payload.
    pub fn enqueue(&self, envelope: MessageEnvelope) -> Result<()> {
        for slot in &self.slots {
            if slot.state() != SlotState::Empty {
                continue;
            }
            if slot.cas(SlotState::Empty, SlotState::Claimed) {
                *slot.envelope.lock() = Some(envelope);
                slot.state.store(SlotState::Ready as u8, Ordering::Release);
                return Ok(());
            }
        }
        Err(QueueError::Capacity)
    }

    /// Selects an eligible `Ready` envelope for `message_type`, transitions it
    /// to `InFlight` with a fresh lease, and returns a clone. Never blocks;
    /// returns `None` if nothing is eligible right now.
    pub fn checkout(
        &self,
        message_type: &str,
        handler_id: &str,
        lease_duration: chrono::Duration,
    ) -> Option<MessageEnvelope> {
        loop {
            let now = Utc::now();
            // Scan for the earliest-enqueued eligible candidate without
            // mutating anything yet; the CAS below is what actually claims it.
            let mut best_index: Option<usize> = None;
            let mut best_enqueued_at = None;
            for (idx, slot) in self.slots.iter().enumerate() {
                if slot.state() != SlotState::Ready {
                    continue;
                }
                let guard = slot.envelope.lock();
                let Some(env) = guard.as_ref() else { continue };
                if !env.is_eligible_for_checkout(message_type, now) {
                    continue;
                }
                if best_enqueued_at.is_none_or(|best| env.enqueued_at < best) {
                    best_enqueued_at = Some(env.enqueued_at);
                    best_index = Some(idx);
                }
            }

            let idx = best_index?;
            let slot = &self.slots[idx];
            if !slot.cas(SlotState::Ready, SlotState::Claimed) {
                // Lost the race to another checkout/requeue/replace; rescan.
                continue;
            }

            let mut guard = slot.envelope.lock();
            let Some(env) = guard.as_mut() else {
                // Shouldn't happen: Claimed implies a payload is present.
                slot.state.store(SlotState::Empty as u8, Ordering::Release);
                continue;
            };
            // Re-validate eligibility: the envelope could have been replaced
            // out from under a stale scan in pathological interleavings.
            if !env.is_eligible_for_checkout(message_type, Utc::now()) {
                slot.state.store(SlotState::Ready as u8, Ordering::Release);
                continue;
            }
            env.status = MessageStatus::InFlight;
            env.lease = Some(Lease {
                handler_id: handler_id.to_string(),
                checkout_time: now,
                lease_expiry: now + lease_duration,
                extension_count: 0,
            });
            let result = env.clone();
            drop(guard);
            slot.state.store(SlotState::InFlight as u8, Ordering::Release);
            return Some(result);
        }
    }

    /// Transitions `InFlight -> Empty`, reclaiming the slot.
    pub fn acknowledge(&self, message_id: MessageId) -> bool {
        for slot in &self.slots {
            if slot.state() != SlotState::InFlight {
                continue;
            }
            let matches = {
                let guard = slot.envelope.lock();
                guard.as_ref().is_some_and(|e| e.message_id == message_id)
            };
            if !matches {
                continue;
            }
            if slot.cas(SlotState::InFlight, SlotState::Claimed) {
                *slot.envelope.lock() = None;
                slot.state.store(SlotState::Empty as u8, Ordering::Release);
                return true;
            }
        }
        false
    }

    /// Applies `mutate` to the envelope (to set retry_count/not_before) and
    /// transitions `InFlight -> Ready`.
    pub fn requeue(
        &self,
        message_id: MessageId,
        mutate: impl FnOnce(&mut MessageEnvelope),
    ) -> Option<MessageEnvelope> {
        for slot in &self.slots {
            if slot.state() != SlotState::InFlight {
                continue;
            }
            let matches = {
                let guard = slot.envelope.lock();
                guard.as_ref().is_some_and(|e| e.message_id == message_id)
            };
            if !matches {
                continue;
            }
            if slot.cas(SlotState::InFlight, SlotState::Claimed) {
                let mut guard = slot.envelope.lock();
                let env = guard.as_mut().expect("claimed slot has a payload");
                env.status = MessageStatus::Ready;
                env.lease = None;
                mutate(env);
                let result = env.clone();
                drop(guard);
                slot.state.store(SlotState::Ready as u8, Ordering::Release);
                return Some(result);
            }
        }
        None
    }

    /// Pushes back an `InFlight` message's lease expiry without otherwise
    /// touching its state. Used by heartbeats/lease extension.
    pub fn extend_lease(&self, message_id: MessageId, new_expiry: chrono::DateTime<Utc>) -> bool {
        for slot in &self.slots {
            if slot.state() != SlotState::InFlight {
                continue;
            }
            let matches = {
                let guard = slot.envelope.lock();
                guard.as_ref().is_some_and(|e| e.message_id == message_id)
            };
            if !matches {
                continue;
            }
            if slot.cas(SlotState::InFlight, SlotState::Claimed) {
                let mut guard = slot.envelope.lock();
                if let Some(env) = guard.as_mut() {
                    if let Some(lease) = env.lease.as_mut() {
                        lease.lease_expiry = new_expiry;
                        lease.extension_count += 1;
                    }
                }
                drop(guard);
                slot.state.store(SlotState::InFlight as u8, Ordering::Release);
                return true;
            }
        }
        false
    }

    /// `InFlight -> Empty` without acknowledge semantics, returning the
    /// removed envelope. Used when routing to the DLQ.
    pub fn remove(&self, message_id: MessageId) -> Option<MessageEnvelope> {
        for slot in &self.slots {
            let state = slot.state();
            if state != SlotState::InFlight && state != SlotState::Ready {
                continue;
            }
            let matches = {
                let guard = slot.envelope.lock();
                guard.as_ref().is_some_and(|e| e.message_id == message_id)
            };
            if !matches {
                continue;
            }
            if slot.cas(state, SlotState::Claimed) {
                let removed = slot.envelope.lock().take();
                slot.state.store(SlotState::Empty as u8, Ordering::Release);
                return removed;
            }
        }
        None
    }

    /// Finds the non-terminal envelope carrying `deduplication_key` and
    /// applies the replace semantics of SPEC_FULL.md §4.1.
    pub fn replace(
        &self,
        new_envelope: MessageEnvelope,
        deduplication_key: &str,
    ) -> Result<ReplaceOutcome> {
        for slot in &self.slots {
            let state = slot.state();
            if state != SlotState::Ready && state != SlotState::InFlight {
                continue;
            }
            let matches = {
                let guard = slot.envelope.lock();
                guard
                    .as_ref()
                    .is_some_and(|e| e.deduplication_key.as_deref() == Some(deduplication_key))
            };
            if !matches {
                continue;
            }

            match state {
                SlotState::Ready => {
                    if slot.cas(SlotState::Ready, SlotState::Claimed) {
                        *slot.envelope.lock() = Some(new_envelope);
                        slot.state.store(SlotState::Ready as u8, Ordering::Release);
                        return Ok(ReplaceOutcome::ReplacedInPlace);
                    }
                    // Lost the race; let the caller re-attempt the whole enqueue.
                    return Ok(ReplaceOutcome::NotFound);
                }
                SlotState::InFlight => {
                    let mut guard = slot.envelope.lock();
                    if let Some(env) = guard.as_mut() {
                        env.is_superseded = true;
                    }
                    drop(guard);
                    self.enqueue(new_envelope)?;
                    return Ok(ReplaceOutcome::SupersededAndInserted);
                }
                _ => unreachable!(),
            }
        }
        Ok(ReplaceOutcome::NotFound)
    }

    /// Recovery-only: writes `envelope` into any `Empty` slot, preserving its
    /// status and lease as given (no eligibility/state-machine checks).
    pub fn restore(&self, envelope: MessageEnvelope) -> Result<()> {
        self.enqueue(envelope)
    }

    pub fn get(&self, message_id: MessageId) -> Option<MessageEnvelope> {
        for slot in &self.slots {
            if slot.state() == SlotState::Empty {
                continue;
            }
            let guard = slot.envelope.lock();
            if let Some(env) = guard.as_ref() {
                if env.message_id == message_id {
                    return Some(env.clone());
                }
            }
        }
        None
    }

    /// All non-empty envelopes, for snapshotting and metrics.
    pub fn get_all(&self) -> Vec<MessageEnvelope> {
        let mut out = Vec::new();
        for slot in &self.slots {
            if slot.state() == SlotState::Empty {
                continue;
            }
            if let Some(env) = slot.envelope.lock().as_ref() {
                out.push(env.clone());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state() != SlotState::Empty)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Breaks `len()` down by visible state. `superseded_in_flight` is kept
    /// separate from `in_flight` rather than folded in: those slots are not
    /// eligible for checkout and not pending in the sense a consumer cares
    /// about, they're just waiting on a worker that no longer matters to
    /// finish or time out.
    pub fn counts(&self) -> BufferCounts {
        let mut counts = BufferCounts::default();
        for slot in &self.slots {
            let guard = slot.envelope.lock();
            let Some(env) = guard.as_ref() else { continue };
            match (slot.state(), env.is_superseded) {
                (SlotState::Ready, _) => counts.ready += 1,
                (SlotState::InFlight, true) => counts.superseded_in_flight += 1,
                (SlotState::InFlight, false) => counts.in_flight += 1,
                _ => {}
            }
        }
        counts
    }
}

/// Slot-state breakdown of a [`CircularBuffer`] at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferCounts {
    pub ready: usize,
    pub in_flight: usize,
    pub superseded_in_flight: usize,
}
