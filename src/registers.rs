//! The AHC 9000 register map.
//!
//! The controller exposes registers through a two-part addressing scheme: a
//! *category* selects a register table, a *page* selects an instance within
//! it (a channel or a thermostat element) and an *index* selects the word.
//! The constants here follow the register map published for this device
//! family; the exact bit positions are validated against hardware.

/// A register table on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[repr(u8)]
pub enum Category {
    /// Per-thermostat data blocks, one page per element.
    Elements = 0x01,
    /// Per-channel setpoint and configuration words.
    Packed = 0x02,
    /// Per-channel status words.
    Channels = 0x03,
}

// Channels category.
pub const CHANNELS_TIMER_EVENT: u8 = 0x00;
pub const TIMER_EVENT_OUTP_ON_MASK: u16 = 0x0010;
pub const CHANNELS_PRIMARY_ELEMENT: u8 = 0x02;
pub const PRIMARY_ELEMENT_ELEMENT_MASK: u16 = 0x003F;
pub const PRIMARY_ELEMENT_ALL_TP_LOST_MASK: u16 = 0x0400;
/// Words read per channel status block (indices 0..=2).
pub const CHANNEL_STATUS_LEN: u8 = 0x03;

// Elements category.
pub const ELEMENTS_AIR_TEMPERATURE: u8 = 0x04;
pub const ELEMENTS_FLOOR_TEMPERATURE: u8 = 0x05;
pub const ELEMENTS_BATTERY_STATUS: u8 = 0x0A;
/// Words read per element block (indices 0..=10).
pub const ELEMENT_BLOCK_LEN: u8 = 0x0B;

// Packed category.
pub const PACKED_MANUAL_TEMPERATURE: u8 = 0x00;
pub const PACKED_HYSTERESIS: u8 = 0x03;
pub const PACKED_STANDBY_TEMPERATURE: u8 = 0x04;
pub const PACKED_CONFIGURATION: u8 = 0x07;
/// Words read per packed block (indices 0..=7).
pub const PACKED_BLOCK_LEN: u8 = 0x08;

pub const CONFIGURATION_MODE_MASK: u16 = 0x0007;
pub const CONFIGURATION_MODE_MANUAL: u16 = 0x0000;
pub const CONFIGURATION_MODE_STANDBY: u16 = 0x0001;
pub const CONFIGURATION_LOCK_MASK: u16 = 0x0800;
/// Every configuration bit outside the regulation mode field.
pub const CONFIGURATION_FLAGS_MASK: u16 = !CONFIGURATION_MODE_MASK;

/// One heating zone on the controller, numbered 1 through 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(into = "u8")]
pub struct Channel(u8);

pub const CHANNEL_COUNT: u8 = 16;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("channel number {0} is outside 1..=16")]
pub struct InvalidChannel(pub u8);

impl Channel {
    pub fn new(number: u8) -> Result<Self, InvalidChannel> {
        if (1..=CHANNEL_COUNT).contains(&number) {
            Ok(Self(number))
        } else {
            Err(InvalidChannel(number))
        }
    }

    pub fn number(self) -> u8 {
        self.0
    }

    /// The device page for this channel, zero-based.
    pub fn page(self) -> u8 {
        self.0 - 1
    }

    pub fn all() -> impl Iterator<Item = Channel> {
        (1..=CHANNEL_COUNT).map(Channel)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for Channel {
    type Error = InvalidChannel;
    fn try_from(number: u8) -> Result<Self, Self::Error> {
        Self::new(number)
    }
}

impl From<Channel> for u8 {
    fn from(channel: Channel) -> u8 {
        channel.0
    }
}

impl<'de> serde::Deserialize<'de> for Channel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let number = u8::deserialize(deserializer)?;
        Channel::new(number).map_err(serde::de::Error::custom)
    }
}

/// The regulation mode field of the packed configuration word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive)]
pub enum RegulationMode {
    Manual = 0,
    Standby = 1,
}

impl RegulationMode {
    pub fn from_configuration(word: u16) -> Option<Self> {
        num_traits::FromPrimitive::from_u16(word & CONFIGURATION_MODE_MASK)
    }
}

/// Raw-word temperature conversion with the configured divisor.
///
/// Registers carry temperatures in fixed point; the default divisor of 10.0
/// means tenths of a degree.
#[derive(Debug, Clone, Copy)]
pub struct Units {
    pub temp_divisor: f32,
}

impl Default for Units {
    fn default() -> Self {
        Self { temp_divisor: 10.0 }
    }
}

impl Units {
    pub fn raw_to_celsius(&self, word: u16) -> f32 {
        word as i16 as f32 / self.temp_divisor
    }

    pub fn celsius_to_raw(&self, celsius: f32) -> u16 {
        (celsius * self.temp_divisor + 0.5) as u16
    }
}

/// Battery level register words count in 10 % steps.
pub fn battery_percent(word: u16) -> u8 {
    (word.min(10) * 10) as u8
}

/// Which writable temperature-like quantity a write addresses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
    clap::ValueEnum, serde::Deserialize, serde::Serialize,
    strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SetpointKind {
    Comfort,
    Standby,
    Hysteresis,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
#[error("{kind} value {value} is outside {min}..={max}")]
pub struct OutOfRangeValue {
    pub kind: SetpointKind,
    pub value: f32,
    pub min: f32,
    pub max: f32,
}

impl SetpointKind {
    pub fn packed_index(self) -> u8 {
        match self {
            SetpointKind::Comfort => PACKED_MANUAL_TEMPERATURE,
            SetpointKind::Standby => PACKED_STANDBY_TEMPERATURE,
            SetpointKind::Hysteresis => PACKED_HYSTERESIS,
        }
    }

    pub fn bounds(self) -> (f32, f32, f32) {
        match self {
            SetpointKind::Comfort | SetpointKind::Standby => (5.0, 35.0, 0.5),
            SetpointKind::Hysteresis => (0.1, 1.0, 0.1),
        }
    }

    /// Snap `value` to the register step and reject it if out of range.
    ///
    /// Runs before any bus I/O; a rejected value never produces a
    /// transaction.
    pub fn quantize(self, value: f32) -> Result<f32, OutOfRangeValue> {
        let (min, max, step) = self.bounds();
        if !(value >= min && value <= max) {
            return Err(OutOfRangeValue { kind: self, value, min, max });
        }
        let quantized = (value / step).round() * step;
        Ok(quantized.clamp(min, max))
    }
}

/// A named recipe of register writes that clears stuck status or lock bits
/// on a channel. Closed set; each variant has exactly one write sequence,
/// assembled in `access`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq,
    clap::ValueEnum, serde::Deserialize, serde::Serialize,
    strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RepairMode {
    /// Clear the child-lock bit.
    Basic,
    /// Clear every flag bit outside the regulation mode field.
    Extended,
    /// Extended, then rewrite the whole configuration word to plain manual.
    Aggressive,
    /// Force the regulation mode back to manual.
    Normalize,
    /// Force the regulation mode to standby.
    NormalizeOff,
}

impl RepairMode {
    /// Whether the recipe touches the regulation mode field and is therefore
    /// subject to the `allow_mode_writes` gate.
    pub fn changes_mode(self) -> bool {
        matches!(
            self,
            RepairMode::Aggressive | RepairMode::Normalize | RepairMode::NormalizeOff,
        )
    }
}

/// Register access mode, for the `registers` command output.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Mode(u8);

impl Mode {
    pub const R: Self = Self(1 << 0);
    pub const W: Self = Self(1 << 1);
    pub const RW: Self = Self(Self::R.0 | Self::W.0);
    const R_: Self = Self::R;

    pub fn is_writable(&self) -> bool {
        self.0 & Self::W.0 != 0
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0 & Self::R.0 == 0 { "-" } else { "R" })?;
        f.write_str(if self.0 & Self::W.0 == 0 { "-" } else { "W" })?;
        Ok(())
    }
}

impl serde::Serialize for Mode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(serde::Serialize)]
pub struct RegisterSchema {
    pub category: Category,
    pub index: u8,
    pub name: &'static str,
    pub mode: Mode,
    pub description: &'static str,
}

macro_rules! register_schema {
    ($($category:ident / $index:expr => $mode:ident, $name:literal, $description:literal;)*) => {
        pub const REGISTER_SCHEMA: &[RegisterSchema] = &[
            $(RegisterSchema {
                category: Category::$category,
                index: $index,
                name: $name,
                mode: Mode::$mode,
                description: $description,
            },)*
        ];
    }
}

register_schema! {
    Channels / CHANNELS_TIMER_EVENT => R_, "CHANNEL_TIMER_EVENT",
        "Channel status word; bit 0x0010 reports the heating output as on.";
    Channels / CHANNELS_PRIMARY_ELEMENT => R_, "CHANNEL_PRIMARY_ELEMENT",
        "Primary thermostat element serving the channel (bits 0x003F); bit 0x0400 latches when every thermostat is lost.";
    Elements / ELEMENTS_AIR_TEMPERATURE => R_, "ELEMENT_AIR_TEMPERATURE",
        "Air temperature measured by the thermostat, fixed point.";
    Elements / ELEMENTS_FLOOR_TEMPERATURE => R_, "ELEMENT_FLOOR_TEMPERATURE",
        "Floor probe temperature, fixed point; zero when no probe is fitted.";
    Elements / ELEMENTS_BATTERY_STATUS => R_, "ELEMENT_BATTERY_STATUS",
        "Thermostat battery level in 10 % steps, 0..=10.";
    Packed / PACKED_MANUAL_TEMPERATURE => RW, "PACKED_MANUAL_TEMPERATURE",
        "Comfort setpoint, fixed point.";
    Packed / PACKED_HYSTERESIS => RW, "PACKED_HYSTERESIS",
        "Regulation hysteresis, fixed point.";
    Packed / PACKED_STANDBY_TEMPERATURE => RW, "PACKED_STANDBY_TEMPERATURE",
        "Standby setpoint, fixed point.";
    Packed / PACKED_CONFIGURATION => RW, "PACKED_CONFIGURATION",
        "Configuration word: regulation mode in bits 0x0007, child lock at 0x0800.";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_range_is_enforced() {
        assert!(Channel::new(0).is_err());
        assert!(Channel::new(17).is_err());
        assert_eq!(Channel::new(16).unwrap().page(), 15);
        assert_eq!(Channel::all().count(), usize::from(CHANNEL_COUNT));
    }

    #[test]
    fn temperature_conversion_uses_divisor() {
        let units = Units::default();
        assert_eq!(units.raw_to_celsius(215), 21.5);
        assert_eq!(units.celsius_to_raw(21.5), 215);
        let halves = Units { temp_divisor: 2.0 };
        assert_eq!(halves.raw_to_celsius(43), 21.5);
        assert_eq!(halves.celsius_to_raw(21.5), 43);
    }

    #[test]
    fn battery_words_count_in_tens() {
        assert_eq!(battery_percent(0), 0);
        assert_eq!(battery_percent(7), 70);
        assert_eq!(battery_percent(10), 100);
        assert_eq!(battery_percent(200), 100);
    }

    #[test]
    fn setpoints_snap_to_half_degrees() {
        assert_eq!(SetpointKind::Comfort.quantize(21.3).unwrap(), 21.5);
        assert_eq!(SetpointKind::Comfort.quantize(5.0).unwrap(), 5.0);
        assert_eq!(SetpointKind::Hysteresis.quantize(0.26).unwrap(), 0.3);
    }

    #[test]
    fn out_of_range_setpoints_are_rejected() {
        assert!(SetpointKind::Comfort.quantize(4.9).is_err());
        assert!(SetpointKind::Comfort.quantize(35.1).is_err());
        assert!(SetpointKind::Standby.quantize(f32::NAN).is_err());
        assert!(SetpointKind::Hysteresis.quantize(1.2).is_err());
    }

    #[test]
    fn regulation_mode_ignores_flag_bits() {
        assert_eq!(
            RegulationMode::from_configuration(CONFIGURATION_LOCK_MASK | CONFIGURATION_MODE_STANDBY),
            Some(RegulationMode::Standby),
        );
        assert_eq!(RegulationMode::from_configuration(0x0004), None);
    }
}
