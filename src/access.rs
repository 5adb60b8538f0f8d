//! Typed access to the controller's registers.
//!
//! Everything here either converts raw words into engineering units or
//! assembles the register operations a logical request needs. Validation
//! happens in the pure builders, before any bus I/O; the async methods only
//! compose builders with the transport session.

use crate::connection::{self, Connection};
use crate::protocol::{Operation, Response};
use crate::registers::{
    battery_percent, Category, Channel, RegulationMode, RepairMode, SetpointKind, Units,
    CHANNELS_PRIMARY_ELEMENT, CHANNELS_TIMER_EVENT, CHANNEL_STATUS_LEN,
    CONFIGURATION_FLAGS_MASK, CONFIGURATION_LOCK_MASK, CONFIGURATION_MODE_MANUAL,
    CONFIGURATION_MODE_MASK, CONFIGURATION_MODE_STANDBY, ELEMENTS_AIR_TEMPERATURE,
    ELEMENTS_BATTERY_STATUS, ELEMENTS_FLOOR_TEMPERATURE, ELEMENT_BLOCK_LEN,
    OutOfRangeValue, PACKED_BLOCK_LEN, PACKED_CONFIGURATION,
    PRIMARY_ELEMENT_ALL_TP_LOST_MASK, PRIMARY_ELEMENT_ELEMENT_MASK, TIMER_EVENT_OUTP_ON_MASK,
};

/// A write request refused before it produced any bus traffic.
#[derive(thiserror::Error, Debug)]
pub enum WriteRejected {
    #[error(transparent)]
    OutOfRange(#[from] OutOfRangeValue),
    #[error("mode-changing writes are disabled (`allow_mode_writes` is off)")]
    ModeWritesDisabled,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("write request rejected")]
    Rejected(#[from] WriteRejected),
    #[error("bus transaction failed")]
    Bus(#[from] connection::Error),
}

/// Decoded channel status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub output_active: bool,
    pub all_thermostats_lost: bool,
    /// The thermostat element serving this channel; `None` when the device
    /// reports no element bound.
    pub primary_element: Option<u8>,
}

impl ChannelStatus {
    fn from_words(words: &[u16]) -> ChannelStatus {
        let timer_event = words[usize::from(CHANNELS_TIMER_EVENT)];
        let primary = words[usize::from(CHANNELS_PRIMARY_ELEMENT)];
        let element = primary & PRIMARY_ELEMENT_ELEMENT_MASK;
        ChannelStatus {
            output_active: timer_event & TIMER_EVENT_OUTP_ON_MASK != 0,
            all_thermostats_lost: primary & PRIMARY_ELEMENT_ALL_TP_LOST_MASK != 0,
            primary_element: (element != 0).then_some(element as u8),
        }
    }
}

/// Decoded per-channel packed block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackedBlock {
    pub comfort_setpoint: f32,
    pub standby_setpoint: f32,
    pub hysteresis: f32,
    pub child_lock: bool,
    /// `None` when the configuration word carries a mode this tool does not
    /// know about.
    pub regulation_mode: Option<RegulationMode>,
}

impl PackedBlock {
    fn from_words(words: &[u16], units: Units) -> PackedBlock {
        let configuration = words[usize::from(PACKED_CONFIGURATION)];
        PackedBlock {
            comfort_setpoint: units
                .raw_to_celsius(words[usize::from(SetpointKind::Comfort.packed_index())]),
            standby_setpoint: units
                .raw_to_celsius(words[usize::from(SetpointKind::Standby.packed_index())]),
            hysteresis: units
                .raw_to_celsius(words[usize::from(SetpointKind::Hysteresis.packed_index())]),
            child_lock: configuration & CONFIGURATION_LOCK_MASK != 0,
            regulation_mode: RegulationMode::from_configuration(configuration),
        }
    }
}

/// Decoded thermostat element block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementBlock {
    pub air_temperature: f32,
    /// `None` when no floor probe is fitted (the register reads zero).
    pub floor_temperature: Option<f32>,
    pub battery_percent: u8,
}

impl ElementBlock {
    fn from_words(words: &[u16], units: Units) -> ElementBlock {
        let floor_raw = words[usize::from(ELEMENTS_FLOOR_TEMPERATURE)];
        ElementBlock {
            air_temperature: units.raw_to_celsius(words[usize::from(ELEMENTS_AIR_TEMPERATURE)]),
            floor_temperature: (floor_raw != 0).then(|| units.raw_to_celsius(floor_raw)),
            battery_percent: battery_percent(words[usize::from(ELEMENTS_BATTERY_STATUS)]),
        }
    }
}

/// Everything a one-shot full read of a channel yields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelReadout {
    pub status: ChannelStatus,
    pub packed: PackedBlock,
    pub element: Option<ElementBlock>,
}

/// Register semantics knobs shared by every command that interprets
/// channel data.
#[derive(clap::Parser, Clone)]
#[group(id = "access::Args")]
pub struct Args {
    /// Divisor applied to raw temperature words. The default of 10 means
    /// registers count tenths of a degree.
    #[arg(long, default_value_t = 10.0)]
    pub temp_divisor: f32,

    /// Permit writes that change a channel's regulation mode (standby
    /// toggles, normalizing repairs).
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub allow_mode_writes: bool,
}

impl Args {
    pub fn units(&self) -> Units {
        Units { temp_divisor: self.temp_divisor }
    }
}

pub struct Access {
    connection: Connection,
    units: Units,
    allow_mode_writes: bool,
}

impl Access {
    pub fn new(connection: Connection, units: Units, allow_mode_writes: bool) -> Access {
        Access { connection, units, allow_mode_writes }
    }

    pub fn from_args(connection: Connection, args: &Args) -> Access {
        Access::new(connection, args.units(), args.allow_mode_writes)
    }

    pub fn units(&self) -> Units {
        self.units
    }

    pub async fn read_channel_status(
        &mut self,
        channel: Channel,
    ) -> Result<ChannelStatus, connection::Error> {
        let words = self
            .read_block(Category::Channels, channel.page(), CHANNEL_STATUS_LEN)
            .await?;
        Ok(ChannelStatus::from_words(&words))
    }

    pub async fn read_packed_block(
        &mut self,
        channel: Channel,
    ) -> Result<PackedBlock, connection::Error> {
        let words = self
            .read_block(Category::Packed, channel.page(), PACKED_BLOCK_LEN)
            .await?;
        Ok(PackedBlock::from_words(&words, self.units))
    }

    pub async fn read_element_block(
        &mut self,
        element: u8,
    ) -> Result<ElementBlock, connection::Error> {
        let words = self
            .read_block(Category::Elements, element - 1, ELEMENT_BLOCK_LEN)
            .await?;
        Ok(ElementBlock::from_words(&words, self.units))
    }

    /// Full read-out of one channel, for the one-shot commands. The engine
    /// reads block-wise instead so a partial failure still refreshes what it
    /// can.
    pub async fn read_channel(
        &mut self,
        channel: Channel,
    ) -> Result<ChannelReadout, connection::Error> {
        let status = self.read_channel_status(channel).await?;
        let packed = self.read_packed_block(channel).await?;
        let element = match status.primary_element {
            Some(element) => Some(self.read_element_block(element).await?),
            None => None,
        };
        Ok(ChannelReadout { status, packed, element })
    }

    async fn read_block(
        &mut self,
        category: Category,
        page: u8,
        count: u8,
    ) -> Result<Vec<u16>, connection::Error> {
        debug_assert!(count <= crate::protocol::MAX_READ_COUNT);
        let operation = Operation::ReadRegisters { category, page, index: 0, count };
        match self.connection.execute_retrying(&operation).await? {
            Response::Registers(words) => Ok(words),
            // `check_answers` in the connection already rules this out.
            Response::WriteAck { .. } => {
                Err(connection::Error::ResponseMismatch("acknowledgement for a read"))
            }
        }
    }

    /// Validate and assemble a setpoint write. Returns the quantized value
    /// actually written alongside the operation.
    pub fn setpoint_write(
        &self,
        channel: Channel,
        kind: SetpointKind,
        celsius: f32,
    ) -> Result<(f32, Operation), WriteRejected> {
        let quantized = kind.quantize(celsius)?;
        let operation = Operation::WriteRegister {
            category: Category::Packed,
            page: channel.page(),
            index: kind.packed_index(),
            value: self.units.celsius_to_raw(quantized),
        };
        Ok((quantized, operation))
    }

    /// Assemble a child-lock toggle. The lock is a flag bit, not a mode, so
    /// it is not subject to the mode-write gate.
    pub fn child_lock_write(&self, channel: Channel, locked: bool) -> Operation {
        Operation::WriteMasked {
            category: Category::Packed,
            page: channel.page(),
            index: PACKED_CONFIGURATION,
            value: if locked { CONFIGURATION_LOCK_MASK } else { 0 },
            mask: CONFIGURATION_LOCK_MASK,
        }
    }

    /// Validate and assemble a standby-mode toggle.
    pub fn standby_write(
        &self,
        channel: Channel,
        standby: bool,
    ) -> Result<Operation, WriteRejected> {
        if !self.allow_mode_writes {
            return Err(WriteRejected::ModeWritesDisabled);
        }
        Ok(Operation::WriteMasked {
            category: Category::Packed,
            page: channel.page(),
            index: PACKED_CONFIGURATION,
            value: if standby { CONFIGURATION_MODE_STANDBY } else { CONFIGURATION_MODE_MANUAL },
            mask: CONFIGURATION_MODE_MASK,
        })
    }

    /// Assemble the register-write recipe for a repair mode.
    pub fn repair_writes(
        &self,
        channel: Channel,
        mode: RepairMode,
    ) -> Result<Vec<Operation>, WriteRejected> {
        if mode.changes_mode() && !self.allow_mode_writes {
            return Err(WriteRejected::ModeWritesDisabled);
        }
        let page = channel.page();
        let masked = |value: u16, mask: u16| Operation::WriteMasked {
            category: Category::Packed,
            page,
            index: PACKED_CONFIGURATION,
            value,
            mask,
        };
        Ok(match mode {
            RepairMode::Basic => vec![masked(0, CONFIGURATION_LOCK_MASK)],
            RepairMode::Extended => vec![masked(0, CONFIGURATION_FLAGS_MASK)],
            RepairMode::Aggressive => vec![
                masked(0, CONFIGURATION_FLAGS_MASK),
                Operation::WriteRegister {
                    category: Category::Packed,
                    page,
                    index: PACKED_CONFIGURATION,
                    value: CONFIGURATION_MODE_MANUAL,
                },
            ],
            RepairMode::Normalize => {
                vec![masked(CONFIGURATION_MODE_MANUAL, CONFIGURATION_MODE_MASK)]
            }
            RepairMode::NormalizeOff => {
                vec![masked(CONFIGURATION_MODE_STANDBY, CONFIGURATION_MODE_MASK)]
            }
        })
    }

    pub async fn execute_write(&mut self, operation: &Operation) -> Result<(), connection::Error> {
        self.connection.execute_retrying(operation).await?;
        Ok(())
    }

    /// One-shot setpoint write, for the CLI paths that bypass the engine.
    pub async fn write_setpoint(
        &mut self,
        channel: Channel,
        kind: SetpointKind,
        celsius: f32,
    ) -> Result<f32, Error> {
        let (quantized, operation) = self.setpoint_write(channel, kind, celsius)?;
        self.execute_write(&operation).await?;
        Ok(quantized)
    }

    /// One-shot repair, for the CLI paths that bypass the engine.
    pub async fn repair(&mut self, channel: Channel, mode: RepairMode) -> Result<(), Error> {
        for operation in self.repair_writes(channel, mode)? {
            self.execute_write(&operation).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use std::time::Duration;

    fn test_access(allow_mode_writes: bool) -> Access {
        let (engine_side, _device_side) = tokio::io::duplex(64);
        let connection = Connection::from_link(Box::pin(engine_side), Duration::from_millis(10), 0);
        Access::new(connection, Units::default(), allow_mode_writes)
    }

    fn channel(number: u8) -> Channel {
        Channel::new(number).unwrap()
    }

    #[test]
    fn channel_status_decodes_bits() {
        let mut words = [0u16; 3];
        words[usize::from(CHANNELS_TIMER_EVENT)] = TIMER_EVENT_OUTP_ON_MASK;
        words[usize::from(CHANNELS_PRIMARY_ELEMENT)] = PRIMARY_ELEMENT_ALL_TP_LOST_MASK | 0x05;
        let status = ChannelStatus::from_words(&words);
        assert!(status.output_active);
        assert!(status.all_thermostats_lost);
        assert_eq!(status.primary_element, Some(5));

        let empty = ChannelStatus::from_words(&[0, 0, 0]);
        assert_eq!(empty.primary_element, None);
        assert!(!empty.output_active);
    }

    #[test]
    fn packed_block_decodes_setpoints_and_flags() {
        let mut words = [0u16; 8];
        words[usize::from(SetpointKind::Comfort.packed_index())] = 215;
        words[usize::from(SetpointKind::Standby.packed_index())] = 80;
        words[usize::from(SetpointKind::Hysteresis.packed_index())] = 3;
        words[usize::from(PACKED_CONFIGURATION)] =
            CONFIGURATION_LOCK_MASK | CONFIGURATION_MODE_STANDBY;
        let packed = PackedBlock::from_words(&words, Units::default());
        assert_eq!(packed.comfort_setpoint, 21.5);
        assert_eq!(packed.standby_setpoint, 8.0);
        assert_eq!(packed.hysteresis, 0.3);
        assert!(packed.child_lock);
        assert_eq!(packed.regulation_mode, Some(RegulationMode::Standby));
    }

    #[test]
    fn setpoint_write_quantizes_and_converts() {
        let access = test_access(true);
        let (quantized, operation) =
            access.setpoint_write(channel(3), SetpointKind::Comfort, 21.3).unwrap();
        assert_eq!(quantized, 21.5);
        assert_eq!(
            operation,
            Operation::WriteRegister {
                category: Category::Packed,
                page: 2,
                index: SetpointKind::Comfort.packed_index(),
                value: 215,
            },
        );
    }

    #[test]
    fn out_of_range_setpoint_never_builds_an_operation() {
        let access = test_access(true);
        let error = access.setpoint_write(channel(3), SetpointKind::Comfort, 40.0).unwrap_err();
        assert!(matches!(error, WriteRejected::OutOfRange(_)));
    }

    #[test]
    fn standby_write_is_gated_by_configuration() {
        let access = test_access(false);
        assert!(matches!(
            access.standby_write(channel(4), true),
            Err(WriteRejected::ModeWritesDisabled),
        ));
        // The child lock is not a mode write and stays available.
        let _ = access.child_lock_write(channel(4), true);

        let permissive = test_access(true);
        let operation = permissive.standby_write(channel(4), true).unwrap();
        assert_eq!(
            operation,
            Operation::WriteMasked {
                category: Category::Packed,
                page: 3,
                index: PACKED_CONFIGURATION,
                value: CONFIGURATION_MODE_STANDBY,
                mask: CONFIGURATION_MODE_MASK,
            },
        );
    }

    #[test]
    fn extended_repair_clears_flag_bits_only() {
        let access = test_access(true);
        let writes = access.repair_writes(channel(6), RepairMode::Extended).unwrap();
        assert_eq!(
            writes,
            vec![Operation::WriteMasked {
                category: Category::Packed,
                page: 5,
                index: PACKED_CONFIGURATION,
                value: 0,
                mask: CONFIGURATION_FLAGS_MASK,
            }],
        );
    }

    #[test]
    fn mode_changing_repairs_are_gated() {
        let access = test_access(false);
        assert!(access.repair_writes(channel(6), RepairMode::Basic).is_ok());
        assert!(access.repair_writes(channel(6), RepairMode::Extended).is_ok());
        for mode in [RepairMode::Aggressive, RepairMode::Normalize, RepairMode::NormalizeOff] {
            assert!(matches!(
                access.repair_writes(channel(6), mode),
                Err(WriteRejected::ModeWritesDisabled),
            ));
        }
    }

    #[test]
    fn aggressive_repair_ends_in_a_full_rewrite() {
        let access = test_access(true);
        let writes = access.repair_writes(channel(1), RepairMode::Aggressive).unwrap();
        assert_eq!(writes.len(), 2);
        assert!(matches!(writes[1], Operation::WriteRegister { value, .. } if value == CONFIGURATION_MODE_MANUAL));
    }
}
