//! The boundary between the engine and the home-automation platform.
//!
//! Outbound: bindings map a channel field, a climate zone or the discovery
//! dump to sink objects with a uniform `publish` capability; the
//! synchronizer diffs the cache against the last-published snapshot and
//! publishes only changes. Inbound: controls send [`Intent`]s over a
//! channel; the engine validates and queues them. Sinks know nothing about
//! the bus and the engine knows nothing about topics.

pub mod mqtt;

use crate::channel_cache::{ChannelCache, ChannelField, Value};
use crate::registers::{Channel, RepairMode, SetpointKind};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;

/// One outbound state change.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Value(Value),
    Climate(ClimateState),
    Availability(bool),
    Text(String),
}

pub trait Sink: Send {
    fn publish(&mut self, update: &Update);
}

/// Aggregated display state of one climate zone.
///
/// For a group zone this is the first member's state: the members regulate
/// together, so one representative is enough for display.
#[derive(Debug, Clone, PartialEq)]
pub struct ClimateState {
    pub available: bool,
    pub current_temperature: Option<f32>,
    pub target_temperature: Option<f32>,
    pub standby: Option<bool>,
    pub heating: Option<bool>,
}

impl ClimateState {
    fn from_cache(cache: &ChannelCache, representative: Channel) -> ClimateState {
        let celsius = |field| match cache.get(representative, field) {
            Some(Value::Celsius(c)) => Some(c),
            _ => None,
        };
        let flag = |field| match cache.get(representative, field) {
            Some(Value::Bool(b)) => Some(b),
            _ => None,
        };
        ClimateState {
            available: cache.is_online(representative),
            current_temperature: celsius(ChannelField::Temperature),
            target_temperature: celsius(ChannelField::ComfortSetpoint),
            standby: flag(ChannelField::StandbyMode),
            heating: flag(ChannelField::OutputActive),
        }
    }
}

/// A climate binding covers exactly one channel or one named group; the
/// enum makes "both" unrepresentable past configuration validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ClimateZone {
    Single(Channel),
    Group { name: String, members: Vec<Channel> },
}

impl ClimateZone {
    pub fn members(&self) -> &[Channel] {
        match self {
            ClimateZone::Single(channel) => std::slice::from_ref(channel),
            ClimateZone::Group { members, .. } => members,
        }
    }

    pub fn representative(&self) -> Channel {
        self.members()[0]
    }
}

/// Where a write intent is aimed.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteTarget {
    Channel(Channel),
    /// A named group zone; the engine fans the write out to every member.
    Zone(String),
}

/// An inbound request from a control.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    SetSetpoint { target: WriteTarget, kind: SetpointKind, celsius: f32 },
    SetChildLock { channel: Channel, locked: bool },
    SetStandby { target: WriteTarget, standby: bool },
    Repair { channel: Channel, mode: RepairMode },
    Discover,
}

pub type IntentSender = mpsc::UnboundedSender<Intent>;

#[derive(thiserror::Error, Debug)]
pub enum BindError {
    #[error("a group zone must have at least one member")]
    EmptyGroup,
    #[error("channel {0} belongs to more than one group zone")]
    OverlappingGroups(Channel),
    #[error("group zone {0:?} is declared twice")]
    DuplicateZone(String),
}

enum BindingTarget {
    Field { channel: Channel, field: ChannelField },
    Availability { channel: Channel },
    Climate { zone: ClimateZone },
    Discovery,
}

struct Binding {
    target: BindingTarget,
    sink: Box<dyn Sink>,
    last: Option<Update>,
}

impl Binding {
    /// Publish `update` if it differs from what this sink saw last.
    fn publish_if_changed(&mut self, update: Update) {
        if self.last.as_ref() != Some(&update) {
            self.sink.publish(&update);
            self.last = Some(update);
        }
    }
}

/// The binding registry and entity synchronizer.
#[derive(Default)]
pub struct Bindings {
    bindings: Vec<Binding>,
    active: BTreeSet<Channel>,
    grouped: BTreeSet<Channel>,
    zones: BTreeMap<String, Vec<Channel>>,
    repair_buttons: Vec<(Channel, RepairMode)>,
}

impl std::fmt::Debug for Bindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // `Box<dyn Sink>` is not `Debug`; summarise instead of recursing.
        f.debug_struct("Bindings")
            .field("bindings", &self.bindings.len())
            .field("active", &self.active)
            .field("grouped", &self.grouped)
            .field("zones", &self.zones)
            .field("repair_buttons", &self.repair_buttons)
            .finish()
    }
}

impl Bindings {
    pub fn new() -> Bindings {
        Bindings::default()
    }

    /// Channels that have at least one bound entity; the poll rotation is
    /// seeded from this.
    pub fn active_channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.active.iter().copied()
    }

    pub fn zone_members(&self, name: &str) -> Option<&[Channel]> {
        self.zones.get(name).map(|members| members.as_slice())
    }

    pub fn repair_buttons(&self) -> &[(Channel, RepairMode)] {
        &self.repair_buttons
    }

    pub fn bind_field(&mut self, channel: Channel, field: ChannelField, sink: Box<dyn Sink>) {
        self.active.insert(channel);
        self.bindings.push(Binding {
            target: BindingTarget::Field { channel, field },
            sink,
            last: None,
        });
    }

    pub fn bind_temperature(&mut self, channel: Channel, sink: Box<dyn Sink>) {
        self.bind_field(channel, ChannelField::Temperature, sink);
    }

    pub fn bind_floor_temperature(&mut self, channel: Channel, sink: Box<dyn Sink>) {
        self.bind_field(channel, ChannelField::FloorTemperature, sink);
    }

    pub fn bind_battery(&mut self, channel: Channel, sink: Box<dyn Sink>) {
        self.bind_field(channel, ChannelField::Battery, sink);
    }

    pub fn bind_setpoint(&mut self, channel: Channel, kind: SetpointKind, sink: Box<dyn Sink>) {
        let field = match kind {
            SetpointKind::Comfort => ChannelField::ComfortSetpoint,
            SetpointKind::Standby => ChannelField::StandbySetpoint,
            SetpointKind::Hysteresis => ChannelField::Hysteresis,
        };
        self.bind_field(channel, field, sink);
    }

    pub fn bind_lock_switch(&mut self, channel: Channel, sink: Box<dyn Sink>) {
        self.bind_field(channel, ChannelField::ChildLock, sink);
    }

    pub fn bind_standby_switch(&mut self, channel: Channel, sink: Box<dyn Sink>) {
        self.bind_field(channel, ChannelField::StandbyMode, sink);
    }

    pub fn bind_availability(&mut self, channel: Channel, sink: Box<dyn Sink>) {
        self.active.insert(channel);
        self.bindings.push(Binding {
            target: BindingTarget::Availability { channel },
            sink,
            last: None,
        });
    }

    pub fn bind_climate(&mut self, zone: ClimateZone, sink: Box<dyn Sink>) -> Result<(), BindError> {
        if let ClimateZone::Group { name, members } = &zone {
            if members.is_empty() {
                return Err(BindError::EmptyGroup);
            }
            if self.zones.contains_key(name) {
                return Err(BindError::DuplicateZone(name.clone()));
            }
            for &member in members {
                if !self.grouped.insert(member) {
                    return Err(BindError::OverlappingGroups(member));
                }
            }
            self.zones.insert(name.clone(), members.clone());
        }
        self.active.extend(zone.members().iter().copied());
        self.bindings.push(Binding {
            target: BindingTarget::Climate { zone },
            sink,
            last: None,
        });
        Ok(())
    }

    /// A repair button has no outbound state; registering it still marks the
    /// channel active and records it for the discovery dump.
    pub fn bind_repair_button(&mut self, channel: Channel, mode: RepairMode) {
        self.active.insert(channel);
        self.repair_buttons.push((channel, mode));
    }

    pub fn bind_discovery_output(&mut self, sink: Box<dyn Sink>) {
        self.bindings.push(Binding { target: BindingTarget::Discovery, sink, last: None });
    }

    /// The cache-diff pass: push every changed value to its sinks.
    pub fn sync(&mut self, cache: &ChannelCache) {
        for binding in &mut self.bindings {
            match &binding.target {
                BindingTarget::Field { channel, field } => {
                    // Nothing is published until the first successful read.
                    if let Some(value) = cache.get(*channel, *field) {
                        binding.publish_if_changed(Update::Value(value));
                    }
                }
                BindingTarget::Availability { channel } => {
                    binding.publish_if_changed(Update::Availability(cache.is_online(*channel)));
                }
                BindingTarget::Climate { zone } => {
                    let state = ClimateState::from_cache(cache, zone.representative());
                    binding.publish_if_changed(Update::Climate(state));
                }
                BindingTarget::Discovery => {}
            }
        }
    }

    /// Push a discovery report to every discovery sink, unconditionally.
    pub fn publish_discovery(&mut self, report: &str) {
        for binding in &mut self.bindings {
            if matches!(binding.target, BindingTarget::Discovery) {
                binding.sink.publish(&Update::Text(report.to_string()));
            }
        }
    }
}

/// Render the configuration suggestion for the discovery dump: one line per
/// active channel with whatever the cache knows about it.
pub fn discovery_report(
    active: &[Channel],
    names: &BTreeMap<Channel, String>,
    cache: &ChannelCache,
) -> String {
    use std::fmt::Write as _;
    let mut report = String::new();
    for &channel in active {
        let name = names
            .get(&channel)
            .map(|n| n.as_str())
            .unwrap_or("(unnamed)");
        write!(report, "channel {channel} -> {name}").unwrap();
        match cache.get(channel, ChannelField::Temperature) {
            Some(value) => {
                write!(report, ", {value} degC").unwrap();
                if let Some(battery) = cache.get(channel, ChannelField::Battery) {
                    write!(report, ", battery {battery}%").unwrap();
                }
            }
            None => report.push_str(", no thermostat data yet"),
        }
        if !cache.is_online(channel) {
            report.push_str(" [offline]");
        }
        report.push('\n');
    }
    report
}
