//! The entity layout file: which channels exist, what they are called, and
//! which entities bind to them.
//!
//! The layout is deliberately dumb data; every structural rule (channel
//! range, climate single-or-group, group overlap) is checked once at load
//! time and reported as a setup error. The `suggest` command emits a ready
//! layout for the channels it finds.

use crate::channel_cache::ChannelField;
use crate::entity::{BindError, Bindings, ClimateZone, Sink};
use crate::registers::{Channel, RepairMode, SetpointKind};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read the layout file at {1:?}")]
    ReadFile(#[source] std::io::Error, PathBuf),
    #[error("could not parse the layout file at {1:?}")]
    Parse(#[source] serde_json::Error, PathBuf),
    #[error("channel {0} has more than one layout entry")]
    DuplicateChannel(Channel),
    #[error("climate entry #{0} specifies both a channel and group members")]
    AmbiguousClimate(usize),
    #[error("climate entry #{0} specifies neither a channel nor group members")]
    UnboundClimate(usize),
    #[error("climate entry #{0} is a group and needs a name")]
    UnnamedGroup(usize),
    #[error(transparent)]
    Bind(#[from] BindError),
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Layout {
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
    #[serde(default)]
    pub climates: Vec<ClimateEntry>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelEntry {
    pub channel: Channel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "enabled")]
    pub temperature: bool,
    #[serde(default)]
    pub floor_temperature: bool,
    #[serde(default = "enabled")]
    pub battery: bool,
    /// Which setpoint numbers to expose.
    #[serde(default)]
    pub setpoints: Vec<SetpointKind>,
    #[serde(default)]
    pub child_lock: bool,
    #[serde(default)]
    pub standby_switch: bool,
    #[serde(default)]
    pub output: bool,
    #[serde(default)]
    pub problem: bool,
    /// Expose a repair button with this mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repair: Option<RepairMode>,
}

impl ChannelEntry {
    pub fn with_defaults(channel: Channel) -> ChannelEntry {
        ChannelEntry {
            channel,
            name: None,
            temperature: true,
            floor_temperature: false,
            battery: true,
            setpoints: vec![SetpointKind::Comfort],
            child_lock: false,
            standby_switch: false,
            output: false,
            problem: true,
            repair: None,
        }
    }
}

/// One climate zone: exactly one of `channel` and `members` must be given.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClimateEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<Channel>>,
}

fn enabled() -> bool {
    true
}

/// What a sink produced by the factory will be asked to publish.
pub enum SinkSpec<'a> {
    Field { channel: Channel, field: ChannelField },
    Availability { channel: Channel },
    Climate { zone: &'a ClimateZone },
    Discovery,
}

impl Layout {
    pub fn load(path: &Path) -> Result<Layout, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ReadFile(e, path.to_path_buf()))?;
        serde_json::from_str(&text).map_err(|e| Error::Parse(e, path.to_path_buf()))
    }

    /// The fallback when no layout file is given: every channel, standard
    /// entities, one climate zone per channel.
    pub fn everything() -> Layout {
        Layout {
            channels: Channel::all().map(ChannelEntry::with_defaults).collect(),
            climates: Channel::all()
                .map(|channel| ClimateEntry { name: None, channel: Some(channel), members: None })
                .collect(),
        }
    }

    pub fn friendly_names(&self) -> BTreeMap<Channel, String> {
        self.channels
            .iter()
            .filter_map(|entry| Some((entry.channel, entry.name.clone()?)))
            .collect()
    }

    fn climate_zone(index: usize, entry: &ClimateEntry) -> Result<ClimateZone, Error> {
        match (&entry.channel, &entry.members) {
            (Some(_), Some(_)) => Err(Error::AmbiguousClimate(index)),
            (None, None) => Err(Error::UnboundClimate(index)),
            (Some(channel), None) => Ok(ClimateZone::Single(*channel)),
            (None, Some(members)) => {
                let name = entry.name.clone().ok_or(Error::UnnamedGroup(index))?;
                Ok(ClimateZone::Group { name, members: members.clone() })
            }
        }
    }

    /// Validate the layout and register every entity it names, asking the
    /// factory for one sink per binding.
    pub fn build_bindings(
        &self,
        mut make_sink: impl FnMut(&SinkSpec<'_>) -> Box<dyn Sink>,
    ) -> Result<Bindings, Error> {
        let mut bindings = Bindings::new();
        let mut seen = BTreeSet::new();
        for entry in &self.channels {
            let channel = entry.channel;
            if !seen.insert(channel) {
                return Err(Error::DuplicateChannel(channel));
            }
            let mut field = |bindings: &mut Bindings, field: ChannelField, on: bool| {
                if on {
                    let spec = SinkSpec::Field { channel, field };
                    bindings.bind_field(channel, field, make_sink(&spec));
                }
            };
            field(&mut bindings, ChannelField::Temperature, entry.temperature);
            field(&mut bindings, ChannelField::FloorTemperature, entry.floor_temperature);
            field(&mut bindings, ChannelField::Battery, entry.battery);
            field(&mut bindings, ChannelField::ChildLock, entry.child_lock);
            field(&mut bindings, ChannelField::StandbyMode, entry.standby_switch);
            field(&mut bindings, ChannelField::OutputActive, entry.output);
            field(&mut bindings, ChannelField::Problem, entry.problem);
            for &kind in &entry.setpoints {
                let field = match kind {
                    SetpointKind::Comfort => ChannelField::ComfortSetpoint,
                    SetpointKind::Standby => ChannelField::StandbySetpoint,
                    SetpointKind::Hysteresis => ChannelField::Hysteresis,
                };
                let spec = SinkSpec::Field { channel, field };
                bindings.bind_setpoint(channel, kind, make_sink(&spec));
            }
            if let Some(mode) = entry.repair {
                bindings.bind_repair_button(channel, mode);
            }
            let spec = SinkSpec::Availability { channel };
            bindings.bind_availability(channel, make_sink(&spec));
        }
        for (index, entry) in self.climates.iter().enumerate() {
            let zone = Self::climate_zone(index, entry)?;
            let sink = make_sink(&SinkSpec::Climate { zone: &zone });
            bindings.bind_climate(zone, sink)?;
        }
        bindings.bind_discovery_output(make_sink(&SinkSpec::Discovery));
        Ok(bindings)
    }
}
