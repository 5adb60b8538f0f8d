//! Tick-level scheduling: which channels to read, which writes to send.
//!
//! Both halves are plain data structures; the engine owns the clock and the
//! bus. Writes drain before reads within a tick, the rotation provides
//! fairness across ticks.

use crate::channel_cache::ChannelField;
use crate::protocol::Operation;
use crate::registers::{Channel, SetpointKind};
use std::collections::VecDeque;

/// Round-robin rotation over the ordered Active Channel Set.
///
/// Registration is additive and happens at startup, before the first cycle;
/// channels are never removed.
#[derive(Default)]
pub struct PollRotation {
    active: Vec<Channel>,
    cursor: usize,
}

impl PollRotation {
    pub fn new() -> PollRotation {
        PollRotation::default()
    }

    pub fn add_channel(&mut self, channel: Channel) {
        if let Err(position) = self.active.binary_search(&channel) {
            self.active.insert(position, channel);
        }
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.active.binary_search(&channel).is_ok()
    }

    pub fn active(&self) -> &[Channel] {
        &self.active
    }

    /// Select the channels to poll this cycle and advance the cursor past
    /// them. Every active channel is visited at least once within
    /// `ceil(active / budget)` cycles.
    pub fn next_cycle(&mut self, budget: usize) -> Vec<Channel> {
        if self.active.is_empty() || budget == 0 {
            return Vec::new();
        }
        let take = budget.min(self.active.len());
        let selected = (0..take)
            .map(|offset| self.active[(self.cursor + offset) % self.active.len()])
            .collect();
        self.cursor = (self.cursor + take) % self.active.len();
        selected
    }
}

/// What a pending write targets; the coalescing key together with the
/// channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSlot {
    Setpoint(SetpointKind),
    ChildLock,
    Standby,
    Repair,
}

impl WriteSlot {
    /// The cache field whose dirty flag this write confirms. Repairs adjust
    /// device-internal flags only and leave the cache to the next read.
    pub fn cache_field(self) -> Option<ChannelField> {
        match self {
            WriteSlot::Setpoint(SetpointKind::Comfort) => Some(ChannelField::ComfortSetpoint),
            WriteSlot::Setpoint(SetpointKind::Standby) => Some(ChannelField::StandbySetpoint),
            WriteSlot::Setpoint(SetpointKind::Hysteresis) => Some(ChannelField::Hysteresis),
            WriteSlot::ChildLock => Some(ChannelField::ChildLock),
            WriteSlot::Standby => Some(ChannelField::StandbyMode),
            WriteSlot::Repair => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub channel: Channel,
    pub slot: WriteSlot,
    pub operations: Vec<Operation>,
    pub created_at: jiff::Timestamp,
    pub retries_remaining: u8,
}

/// How many ticks a pending write survives failed drain attempts before it
/// is dropped and surfaced as a failure.
pub const WRITE_TICK_RETRIES: u8 = 3;

/// Pending user-initiated writes, drained with priority over polling.
#[derive(Default)]
pub struct WriteQueue {
    queue: VecDeque<PendingWrite>,
}

impl WriteQueue {
    pub fn new() -> WriteQueue {
        WriteQueue::default()
    }

    /// Add a write, replacing any unsent write for the same (channel, slot).
    ///
    /// Last writer wins: the superseded write is cancelled in place, never
    /// sent stale. The queue position is kept so a channel cannot jump the
    /// line by rewriting its own value.
    pub fn enqueue(&mut self, write: PendingWrite) {
        let existing = self
            .queue
            .iter_mut()
            .find(|queued| queued.channel == write.channel && queued.slot == write.slot);
        match existing {
            Some(queued) => *queued = write,
            None => self.queue.push_back(write),
        }
    }

    pub fn pop(&mut self) -> Option<PendingWrite> {
        self.queue.pop_front()
    }

    pub fn push_front(&mut self, write: PendingWrite) {
        self.queue.push_front(write);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Category;

    fn channel(number: u8) -> Channel {
        Channel::new(number).unwrap()
    }

    fn channels(numbers: &[u8]) -> Vec<Channel> {
        numbers.iter().map(|&n| channel(n)).collect()
    }

    fn rotation(numbers: &[u8]) -> PollRotation {
        let mut rotation = PollRotation::new();
        for &number in numbers {
            rotation.add_channel(channel(number));
        }
        rotation
    }

    fn setpoint_write(ch: u8, value: u16) -> PendingWrite {
        PendingWrite {
            channel: channel(ch),
            slot: WriteSlot::Setpoint(SetpointKind::Comfort),
            operations: vec![Operation::WriteRegister {
                category: Category::Packed,
                page: ch - 1,
                index: 0,
                value,
            }],
            created_at: jiff::Timestamp::UNIX_EPOCH,
            retries_remaining: WRITE_TICK_RETRIES,
        }
    }

    #[test]
    fn rotation_is_deterministic_round_robin() {
        let mut rotation = rotation(&[1, 2, 3, 4, 5]);
        assert_eq!(rotation.next_cycle(2), channels(&[1, 2]));
        assert_eq!(rotation.next_cycle(2), channels(&[3, 4]));
        assert_eq!(rotation.next_cycle(2), channels(&[5, 1]));
        assert_eq!(rotation.next_cycle(2), channels(&[2, 3]));
    }

    #[test]
    fn rotation_orders_and_deduplicates_registration() {
        let mut rotation = rotation(&[9, 2, 9, 16, 2]);
        assert_eq!(rotation.active(), channels(&[2, 9, 16]));
        assert!(rotation.contains(channel(9)));
        assert!(!rotation.contains(channel(3)));
    }

    #[test]
    fn every_active_channel_is_visited_within_the_fairness_bound() {
        for size in 1..=16u8 {
            for budget in 1..=16usize {
                let numbers: Vec<u8> = (1..=size).collect();
                let mut rotation = rotation(&numbers);
                // Start from an arbitrary rotation point.
                rotation.next_cycle(3);
                let bound = (usize::from(size)).div_ceil(budget);
                let mut seen: Vec<Channel> = Vec::new();
                for _ in 0..bound {
                    seen.extend(rotation.next_cycle(budget));
                }
                for number in numbers {
                    assert!(
                        seen.contains(&channel(number)),
                        "channel {number} missed with {size} active, budget {budget}",
                    );
                }
            }
        }
    }

    #[test]
    fn oversized_budget_visits_each_channel_once() {
        let mut rotation = rotation(&[1, 2, 3]);
        assert_eq!(rotation.next_cycle(16), channels(&[1, 2, 3]));
        assert_eq!(rotation.next_cycle(16), channels(&[1, 2, 3]));
    }

    #[test]
    fn empty_rotation_polls_nothing() {
        let mut rotation = PollRotation::new();
        assert!(rotation.next_cycle(2).is_empty());
    }

    #[test]
    fn newer_write_replaces_the_unsent_one() {
        let mut queue = WriteQueue::new();
        queue.enqueue(setpoint_write(3, 215));
        queue.enqueue(setpoint_write(3, 230));
        assert_eq!(queue.len(), 1);
        let only = queue.pop().unwrap();
        assert!(matches!(
            only.operations[0],
            Operation::WriteRegister { value: 230, .. },
        ));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn distinct_slots_do_not_coalesce() {
        let mut queue = WriteQueue::new();
        queue.enqueue(setpoint_write(3, 215));
        let mut lock = setpoint_write(3, 0);
        lock.slot = WriteSlot::ChildLock;
        queue.enqueue(lock);
        queue.enqueue(setpoint_write(5, 215));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn coalescing_keeps_the_queue_position() {
        let mut queue = WriteQueue::new();
        queue.enqueue(setpoint_write(3, 215));
        queue.enqueue(setpoint_write(5, 215));
        queue.enqueue(setpoint_write(3, 230));
        let first = queue.pop().unwrap();
        assert_eq!(first.channel, channel(3));
        assert!(matches!(
            first.operations[0],
            Operation::WriteRegister { value: 230, .. },
        ));
    }
}
