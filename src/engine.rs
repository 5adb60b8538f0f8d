//! The periodic communication and state-synchronization engine.
//!
//! One task owns everything: the transport session, the cache, the poll
//! rotation, the write queue and the bindings. Each tick drains queued
//! writes first (bounded, so a chatty UI cannot starve polling), then reads
//! the channels the rotation selects, then diffs the cache against the
//! last-published state. All bus transactions are awaited serially; the
//! tick's worst case is `write_budget + 3 * poll_budget` exchanges.

use crate::access::Access;
use crate::channel_cache::{ChannelCache, ChannelField, Value};
use crate::connection;
use crate::entity::{discovery_report, Bindings, Intent, IntentSender, WriteTarget};
use crate::registers::{Channel, RegulationMode};
use crate::schedule::{PendingWrite, PollRotation, WriteQueue, WriteSlot, WRITE_TICK_RETRIES};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Engine pacing knobs shared by the `run` command.
#[derive(clap::Parser, Clone)]
#[group(id = "engine::Args")]
pub struct Args {
    /// How often one poll-and-write cycle runs.
    #[arg(long, default_value = "5s")]
    pub update_interval: humantime::Duration,

    /// How many channels are read per cycle. Every active channel is still
    /// visited within ceil(active / this) cycles; raising it trades tick
    /// latency for staleness.
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(1..=16))]
    pub poll_channels_per_cycle: u8,

    /// Upper bound of queued writes sent per cycle before the cycle's reads
    /// start.
    #[arg(long, default_value_t = 4)]
    pub write_budget_per_cycle: u8,
}

pub struct Engine {
    access: Access,
    cache: ChannelCache,
    rotation: PollRotation,
    queue: WriteQueue,
    bindings: Bindings,
    names: BTreeMap<Channel, String>,
    intents: mpsc::UnboundedReceiver<Intent>,
    update_interval: Duration,
    poll_budget: usize,
    write_budget: usize,
}

impl Engine {
    pub fn new(
        access: Access,
        bindings: Bindings,
        names: BTreeMap<Channel, String>,
        args: &Args,
    ) -> (Engine, IntentSender) {
        let (sender, intents) = mpsc::unbounded_channel();
        let mut rotation = PollRotation::new();
        for channel in bindings.active_channels() {
            rotation.add_channel(channel);
        }
        let engine = Engine {
            access,
            cache: ChannelCache::new(),
            rotation,
            queue: WriteQueue::new(),
            bindings,
            names,
            intents,
            update_interval: *args.update_interval,
            poll_budget: usize::from(args.poll_channels_per_cycle),
            write_budget: usize::from(args.write_budget_per_cycle),
        };
        (engine, sender)
    }

    /// Run until every intent sender is gone or the link fails fatally.
    /// Transient bus errors never surface here.
    pub async fn run(mut self) -> Result<(), connection::Error> {
        info!(
            active_channels = self.rotation.active().len(),
            poll_budget = self.poll_budget,
            "engine starting",
        );
        let mut ticker = tokio::time::interval(self.update_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                intent = self.intents.recv() => match intent {
                    Some(intent) => self.handle_intent(intent),
                    None => {
                        debug!("every intent source is gone; stopping");
                        return Ok(());
                    }
                },
                _ = ticker.tick() => self.tick().await?,
            }
        }
    }

    /// Validate an inbound request and queue the register writes it needs.
    /// Rejections are surfaced here and never produce bus traffic.
    fn handle_intent(&mut self, intent: Intent) {
        let now = jiff::Timestamp::now();
        match intent {
            Intent::SetSetpoint { target, kind, celsius } => {
                let Some(members) = self.resolve(&target) else { return };
                // Quantize once; every member carries the same value.
                let quantized = match kind.quantize(celsius) {
                    Ok(quantized) => quantized,
                    Err(error) => {
                        warn!(
                            error = &error as &dyn std::error::Error,
                            "setpoint request rejected",
                        );
                        return;
                    }
                };
                for channel in members {
                    let Ok((_, operation)) = self.access.setpoint_write(channel, kind, quantized)
                    else {
                        continue;
                    };
                    let slot = WriteSlot::Setpoint(kind);
                    self.enqueue(channel, slot, vec![operation], now);
                    if let Some(field) = slot.cache_field() {
                        self.cache.set_optimistic(channel, field, Value::Celsius(quantized));
                    }
                }
            }
            Intent::SetChildLock { channel, locked } => {
                let operation = self.access.child_lock_write(channel, locked);
                self.enqueue(channel, WriteSlot::ChildLock, vec![operation], now);
                self.cache.set_optimistic(channel, ChannelField::ChildLock, Value::Bool(locked));
            }
            Intent::SetStandby { target, standby } => {
                let Some(members) = self.resolve(&target) else { return };
                for channel in members {
                    match self.access.standby_write(channel, standby) {
                        Ok(operation) => {
                            self.enqueue(channel, WriteSlot::Standby, vec![operation], now);
                            self.cache.set_optimistic(
                                channel,
                                ChannelField::StandbyMode,
                                Value::Bool(standby),
                            );
                        }
                        Err(error) => {
                            // The gate is global; no member would fare better.
                            warn!(
                                %channel,
                                error = &error as &dyn std::error::Error,
                                "standby request rejected",
                            );
                            return;
                        }
                    }
                }
            }
            Intent::Repair { channel, mode } => match self.access.repair_writes(channel, mode) {
                Ok(operations) => {
                    info!(%channel, %mode, "queueing repair sequence");
                    // The cache is left alone; the next successful read
                    // reconciles whatever the recipe changed.
                    self.enqueue(channel, WriteSlot::Repair, operations, now);
                }
                Err(error) => {
                    warn!(
                        %channel,
                        %mode,
                        error = &error as &dyn std::error::Error,
                        "repair request rejected",
                    );
                }
            },
            Intent::Discover => {
                let report = discovery_report(self.rotation.active(), &self.names, &self.cache);
                self.bindings.publish_discovery(&report);
            }
        }
        // Accepted writes become visible optimistically, without waiting for
        // the next cycle.
        self.bindings.sync(&self.cache);
    }

    fn resolve(&self, target: &WriteTarget) -> Option<Vec<Channel>> {
        match target {
            WriteTarget::Channel(channel) => Some(vec![*channel]),
            WriteTarget::Zone(name) => match self.bindings.zone_members(name) {
                Some(members) => Some(members.to_vec()),
                None => {
                    warn!(zone = name.as_str(), "write intent for an unknown zone");
                    None
                }
            },
        }
    }

    fn enqueue(
        &mut self,
        channel: Channel,
        slot: WriteSlot,
        operations: Vec<crate::protocol::Operation>,
        now: jiff::Timestamp,
    ) {
        self.queue.enqueue(PendingWrite {
            channel,
            slot,
            operations,
            created_at: now,
            retries_remaining: WRITE_TICK_RETRIES,
        });
    }

    /// One cycle: writes, then reads, then the publish pass.
    async fn tick(&mut self) -> Result<(), connection::Error> {
        self.drain_writes().await?;
        for channel in self.rotation.next_cycle(self.poll_budget) {
            self.poll_channel(channel).await?;
        }
        self.bindings.sync(&self.cache);
        Ok(())
    }

    async fn drain_writes(&mut self) -> Result<(), connection::Error> {
        let mut deferred = Vec::new();
        for _ in 0..self.write_budget {
            let Some(mut write) = self.queue.pop() else { break };
            match self.send_write(&write).await {
                Ok(()) => {
                    debug!(channel = %write.channel, slot = ?write.slot, "write confirmed");
                    if let Some(field) = write.slot.cache_field() {
                        self.cache.confirm_write(write.channel, field);
                    }
                }
                Err(error) if error.is_retryable() => {
                    write.retries_remaining = write.retries_remaining.saturating_sub(1);
                    if write.retries_remaining == 0 {
                        warn!(
                            channel = %write.channel,
                            slot = ?write.slot,
                            error = &error as &dyn std::error::Error,
                            "write failed repeatedly and is dropped",
                        );
                        if let Some(field) = write.slot.cache_field() {
                            self.cache.abandon_write(write.channel, field);
                        }
                    } else {
                        debug!(
                            channel = %write.channel,
                            slot = ?write.slot,
                            "write deferred to the next cycle",
                        );
                        deferred.push(write);
                    }
                }
                Err(fatal) => return Err(fatal),
            }
        }
        // Keep the original order when putting deferred writes back.
        for write in deferred.into_iter().rev() {
            self.queue.push_front(write);
        }
        Ok(())
    }

    async fn send_write(&mut self, write: &PendingWrite) -> Result<(), connection::Error> {
        // Multi-operation recipes restart from the top when retried; the
        // writes are idempotent register stores.
        for operation in &write.operations {
            self.access.execute_write(operation).await?;
        }
        Ok(())
    }

    /// Read one channel's blocks. Each successful block updates the cache on
    /// its own; a transient failure leaves everything cached untouched and
    /// defers the channel to its next rotation slot.
    async fn poll_channel(&mut self, channel: Channel) -> Result<(), connection::Error> {
        let status = match self.access.read_channel_status(channel).await {
            Ok(status) => status,
            Err(error) => return self.note_poll_failure(channel, error),
        };
        self.cache.update_from_read(
            channel,
            ChannelField::OutputActive,
            Value::Bool(status.output_active),
        );
        self.cache.update_from_read(
            channel,
            ChannelField::Problem,
            Value::Bool(status.all_thermostats_lost),
        );

        let packed = match self.access.read_packed_block(channel).await {
            Ok(packed) => packed,
            Err(error) => return self.note_poll_failure(channel, error),
        };
        self.cache.update_from_read(
            channel,
            ChannelField::ComfortSetpoint,
            Value::Celsius(packed.comfort_setpoint),
        );
        self.cache.update_from_read(
            channel,
            ChannelField::StandbySetpoint,
            Value::Celsius(packed.standby_setpoint),
        );
        self.cache.update_from_read(
            channel,
            ChannelField::Hysteresis,
            Value::Celsius(packed.hysteresis),
        );
        self.cache.update_from_read(channel, ChannelField::ChildLock, Value::Bool(packed.child_lock));
        if let Some(mode) = packed.regulation_mode {
            self.cache.update_from_read(
                channel,
                ChannelField::StandbyMode,
                Value::Bool(mode == RegulationMode::Standby),
            );
        }

        if let Some(element) = status.primary_element {
            let block = match self.access.read_element_block(element).await {
                Ok(block) => block,
                Err(error) => return self.note_poll_failure(channel, error),
            };
            self.cache.update_from_read(
                channel,
                ChannelField::Temperature,
                Value::Celsius(block.air_temperature),
            );
            if let Some(floor) = block.floor_temperature {
                self.cache.update_from_read(
                    channel,
                    ChannelField::FloorTemperature,
                    Value::Celsius(floor),
                );
            }
            self.cache.update_from_read(
                channel,
                ChannelField::Battery,
                Value::Percent(block.battery_percent),
            );
        }

        self.cache.note_read_success(channel, jiff::Timestamp::now());
        Ok(())
    }

    fn note_poll_failure(
        &mut self,
        channel: Channel,
        error: connection::Error,
    ) -> Result<(), connection::Error> {
        if !error.is_retryable() {
            return Err(error);
        }
        let went_offline = self.cache.note_read_failure(channel);
        if went_offline {
            warn!(%channel, "channel keeps timing out; publishing it as unavailable");
        } else {
            debug!(
                %channel,
                error = &error as &dyn std::error::Error,
                "poll failed; deferred to the next rotation slot",
            );
        }
        Ok(())
    }
}
