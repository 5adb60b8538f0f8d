//! Last-known validated state per channel.
//!
//! Only successful transactions ever write here; a failed read leaves the
//! previous value untouched and merely bumps the failure bookkeeping. Fields
//! with an unconfirmed user write are "dirty": the optimistic value stays
//! visible and device reads do not clobber it until the write is confirmed
//! or abandoned.

use crate::registers::Channel;
use std::collections::{BTreeMap, BTreeSet};

/// Consecutive failed poll attempts after which a channel is published as
/// unavailable. It stays in the rotation regardless; bus faults are expected
/// to self-heal.
pub const OFFLINE_AFTER_FAILURES: u32 = 3;

/// One logical quantity tracked per channel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord,
    strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum ChannelField {
    Temperature,
    FloorTemperature,
    Battery,
    ComfortSetpoint,
    StandbySetpoint,
    Hysteresis,
    OutputActive,
    Problem,
    ChildLock,
    StandbyMode,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Celsius(f32),
    Percent(u8),
    Bool(bool),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Value::Celsius(c) => write!(f, "{c:.1}"),
            Value::Percent(p) => write!(f, "{p}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

#[derive(Default)]
struct ChannelEntry {
    values: BTreeMap<ChannelField, Value>,
    dirty: BTreeSet<ChannelField>,
    last_update: Option<jiff::Timestamp>,
    consecutive_failures: u32,
    online: bool,
}

#[derive(Default)]
pub struct ChannelCache {
    channels: BTreeMap<Channel, ChannelEntry>,
}

impl ChannelCache {
    pub fn new() -> ChannelCache {
        ChannelCache::default()
    }

    pub fn get(&self, channel: Channel, field: ChannelField) -> Option<Value> {
        self.channels.get(&channel)?.values.get(&field).copied()
    }

    pub fn is_dirty(&self, channel: Channel, field: ChannelField) -> bool {
        self.channels.get(&channel).is_some_and(|e| e.dirty.contains(&field))
    }

    /// A channel is reported available once it has been read at least once
    /// and its recent polls have not all failed.
    pub fn is_online(&self, channel: Channel) -> bool {
        self.channels.get(&channel).is_some_and(|e| e.online)
    }

    pub fn last_update(&self, channel: Channel) -> Option<jiff::Timestamp> {
        self.channels.get(&channel)?.last_update
    }

    /// Record a value obtained from a successful read.
    ///
    /// Returns `true` if the visible value changed. Dirty fields are left
    /// alone: the unconfirmed user write wins until it resolves.
    pub fn update_from_read(
        &mut self,
        channel: Channel,
        field: ChannelField,
        value: Value,
    ) -> bool {
        let entry = self.channels.entry(channel).or_default();
        if entry.dirty.contains(&field) {
            return false;
        }
        let changed = entry.values.get(&field) != Some(&value);
        entry.values.insert(field, value);
        changed
    }

    /// Record an accepted user write before it is confirmed on the bus.
    pub fn set_optimistic(&mut self, channel: Channel, field: ChannelField, value: Value) {
        let entry = self.channels.entry(channel).or_default();
        entry.values.insert(field, value);
        entry.dirty.insert(field);
    }

    /// The pending write for this field made it to the device.
    pub fn confirm_write(&mut self, channel: Channel, field: ChannelField) {
        if let Some(entry) = self.channels.get_mut(&channel) {
            entry.dirty.remove(&field);
        }
    }

    /// The pending write for this field was dropped; let the next read
    /// reconcile the displayed value with device truth.
    pub fn abandon_write(&mut self, channel: Channel, field: ChannelField) {
        self.confirm_write(channel, field);
    }

    pub fn note_read_success(&mut self, channel: Channel, at: jiff::Timestamp) {
        let entry = self.channels.entry(channel).or_default();
        entry.consecutive_failures = 0;
        entry.online = true;
        entry.last_update = Some(at);
    }

    /// Returns `true` if this failure pushed the channel over the
    /// availability threshold.
    pub fn note_read_failure(&mut self, channel: Channel) -> bool {
        let entry = self.channels.entry(channel).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        let went_offline = entry.online && entry.consecutive_failures >= OFFLINE_AFTER_FAILURES;
        if went_offline {
            entry.online = false;
        }
        went_offline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(number: u8) -> Channel {
        Channel::new(number).unwrap()
    }

    fn now() -> jiff::Timestamp {
        jiff::Timestamp::UNIX_EPOCH
    }

    #[test]
    fn absent_until_first_read() {
        let cache = ChannelCache::new();
        assert_eq!(cache.get(channel(1), ChannelField::Temperature), None);
        assert!(!cache.is_online(channel(1)));
    }

    #[test]
    fn reads_overwrite_and_report_changes() {
        let mut cache = ChannelCache::new();
        let ch = channel(2);
        assert!(cache.update_from_read(ch, ChannelField::Temperature, Value::Celsius(21.5)));
        assert!(!cache.update_from_read(ch, ChannelField::Temperature, Value::Celsius(21.5)));
        assert!(cache.update_from_read(ch, ChannelField::Temperature, Value::Celsius(21.0)));
        assert_eq!(cache.get(ch, ChannelField::Temperature), Some(Value::Celsius(21.0)));
    }

    #[test]
    fn failures_never_touch_values() {
        let mut cache = ChannelCache::new();
        let ch = channel(3);
        cache.update_from_read(ch, ChannelField::Battery, Value::Percent(80));
        cache.note_read_success(ch, now());
        for _ in 0..10 {
            cache.note_read_failure(ch);
        }
        assert_eq!(cache.get(ch, ChannelField::Battery), Some(Value::Percent(80)));
    }

    #[test]
    fn dirty_fields_resist_reads_until_confirmed() {
        let mut cache = ChannelCache::new();
        let ch = channel(4);
        cache.update_from_read(ch, ChannelField::ComfortSetpoint, Value::Celsius(21.0));
        cache.set_optimistic(ch, ChannelField::ComfortSetpoint, Value::Celsius(23.0));

        // A poll result still carrying the old device value must not revert
        // the optimistic one.
        assert!(!cache.update_from_read(ch, ChannelField::ComfortSetpoint, Value::Celsius(21.0)));
        assert_eq!(cache.get(ch, ChannelField::ComfortSetpoint), Some(Value::Celsius(23.0)));

        cache.confirm_write(ch, ChannelField::ComfortSetpoint);
        assert!(cache.update_from_read(ch, ChannelField::ComfortSetpoint, Value::Celsius(21.0)));
        assert_eq!(cache.get(ch, ChannelField::ComfortSetpoint), Some(Value::Celsius(21.0)));
    }

    #[test]
    fn availability_follows_the_failure_threshold() {
        let mut cache = ChannelCache::new();
        let ch = channel(5);
        cache.note_read_success(ch, now());
        assert!(cache.is_online(ch));
        assert!(!cache.note_read_failure(ch));
        assert!(!cache.note_read_failure(ch));
        assert!(cache.note_read_failure(ch));
        assert!(!cache.is_online(ch));
        // Recovery is immediate on the next good read.
        cache.note_read_success(ch, now());
        assert!(cache.is_online(ch));
    }
}
