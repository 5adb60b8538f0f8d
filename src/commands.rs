fn runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    // The engine is a single cooperative task; a current-thread runtime is
    // all any command needs.
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

pub mod registers {
    use crate::output;
    use crate::registers::{RegisterSchema, REGISTER_SCHEMA};

    /// Search and output the known device registers.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// Only show registers whose name or description contains this.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error(transparent)]
        Output(#[from] output::Error),
    }

    fn is_match(schema: &RegisterSchema, pattern: &str) -> bool {
        let pattern = pattern.to_uppercase();
        schema.name.contains(&pattern) || schema.description.to_uppercase().contains(&pattern)
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output()?;
        output.headers(vec!["Category", "Index", "Name", "Mode", "Description"])?;
        for schema in REGISTER_SCHEMA {
            if let Some(pattern) = &args.filter {
                if !is_match(schema, pattern) {
                    continue;
                }
            }
            output.row(
                || {
                    vec![
                        format!("{:?}", schema.category),
                        format!("0x{:02X}", schema.index),
                        schema.name.to_string(),
                        schema.mode.to_string(),
                        schema.description.to_string(),
                    ]
                },
                || schema,
            )?;
        }
        output.finish()?;
        Ok(())
    }
}

pub mod read {
    use crate::access::{self, Access, ChannelReadout};
    use crate::registers::{Channel, InvalidChannel};
    use crate::{connection, output};
    use tracing::warn;

    /// Read one or more channels once and print their state.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        access: access::Args,
        #[clap(flatten)]
        output: output::Args,
        /// Channels to read. All sixteen when omitted.
        channels: Vec<u8>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error(transparent)]
        InvalidChannel(#[from] InvalidChannel),
        #[error("communicating with the controller failed")]
        Bus(#[from] connection::Error),
        #[error(transparent)]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Row {
        channel: Channel,
        responding: bool,
        temperature: Option<f32>,
        floor_temperature: Option<f32>,
        battery_percent: Option<u8>,
        comfort_setpoint: Option<f32>,
        standby_setpoint: Option<f32>,
        hysteresis: Option<f32>,
        standby: Option<bool>,
        child_lock: Option<bool>,
        output_active: Option<bool>,
        problem: Option<bool>,
    }

    impl Row {
        fn silent(channel: Channel) -> Row {
            Row {
                channel,
                responding: false,
                temperature: None,
                floor_temperature: None,
                battery_percent: None,
                comfort_setpoint: None,
                standby_setpoint: None,
                hysteresis: None,
                standby: None,
                child_lock: None,
                output_active: None,
                problem: None,
            }
        }

        fn from_readout(channel: Channel, readout: &ChannelReadout) -> Row {
            use crate::registers::RegulationMode;
            Row {
                channel,
                responding: true,
                temperature: readout.element.map(|e| e.air_temperature),
                floor_temperature: readout.element.and_then(|e| e.floor_temperature),
                battery_percent: readout.element.map(|e| e.battery_percent),
                comfort_setpoint: Some(readout.packed.comfort_setpoint),
                standby_setpoint: Some(readout.packed.standby_setpoint),
                hysteresis: Some(readout.packed.hysteresis),
                standby: readout
                    .packed
                    .regulation_mode
                    .map(|mode| mode == RegulationMode::Standby),
                child_lock: Some(readout.packed.child_lock),
                output_active: Some(readout.status.output_active),
                problem: Some(readout.status.all_thermostats_lost),
            }
        }

        fn cells(&self) -> Vec<String> {
            fn opt<T: std::fmt::Display>(value: &Option<T>) -> String {
                value.as_ref().map(|v| v.to_string()).unwrap_or_default()
            }
            vec![
                self.channel.to_string(),
                self.responding.to_string(),
                opt(&self.temperature),
                opt(&self.floor_temperature),
                opt(&self.battery_percent),
                opt(&self.comfort_setpoint),
                opt(&self.standby_setpoint),
                opt(&self.hysteresis),
                opt(&self.standby),
                opt(&self.child_lock),
                opt(&self.output_active),
                opt(&self.problem),
            ]
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let channels: Vec<Channel> = if args.channels.is_empty() {
            Channel::all().collect()
        } else {
            args.channels
                .iter()
                .map(|&number| Channel::new(number))
                .collect::<Result<_, _>>()?
        };
        let mut output = args.output.to_output()?;
        output.headers(vec![
            "Channel",
            "Responding",
            "Temp",
            "Floor",
            "Battery",
            "Comfort",
            "Standby SP",
            "Hysteresis",
            "Standby",
            "Lock",
            "Output",
            "Problem",
        ])?;
        let rows = super::runtime().map_err(Error::Runtime)?.block_on(async {
            let connection = crate::connection::Connection::open(&args.connection).await?;
            let mut access = Access::from_args(connection, &args.access);
            let mut rows = Vec::with_capacity(channels.len());
            for &channel in &channels {
                match access.read_channel(channel).await {
                    Ok(readout) => rows.push(Row::from_readout(channel, &readout)),
                    Err(error) if error.is_retryable() => {
                        warn!(
                            %channel,
                            error = &error as &dyn std::error::Error,
                            "channel did not respond",
                        );
                        rows.push(Row::silent(channel));
                    }
                    Err(fatal) => return Err(fatal),
                }
            }
            Ok(rows)
        })?;
        for row in rows {
            output.row(|| row.cells(), || &row)?;
        }
        output.finish()?;
        Ok(())
    }
}

pub mod repair {
    use crate::access::{self, Access};
    use crate::registers::{Channel, InvalidChannel, RepairMode};
    use crate::connection;
    use tracing::info;

    /// Send one repair sequence to a channel and exit.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        access: access::Args,
        /// The channel to repair.
        #[arg(long, short = 'c')]
        channel: u8,
        /// Which flag-clearing recipe to send.
        #[arg(long, value_enum, default_value_t = RepairMode::Basic)]
        mode: RepairMode,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error(transparent)]
        InvalidChannel(#[from] InvalidChannel),
        #[error(transparent)]
        Access(#[from] access::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let channel = Channel::new(args.channel)?;
        super::runtime().map_err(Error::Runtime)?.block_on(async {
            let connection = crate::connection::Connection::open(&args.connection).await?;
            let mut access = Access::from_args(connection, &args.access);
            access.repair(channel, args.mode).await?;
            Ok::<_, access::Error>(())
        })?;
        info!(%channel, mode = %args.mode, "repair sequence sent");
        Ok(())
    }
}

pub mod suggest {
    use crate::access::{self, Access};
    use crate::layout::{ChannelEntry, ClimateEntry, Layout};
    use crate::registers::Channel;
    use crate::connection;
    use tracing::{info, warn};

    /// Poll every channel once and print a ready-to-edit layout file for the
    /// thermostats that answered.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        access: access::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("communicating with the controller failed")]
        Bus(#[from] connection::Error),
        #[error("could not serialize the layout suggestion")]
        Serialize(#[source] serde_json::Error),
        #[error("could not write the layout suggestion")]
        Write(#[source] std::io::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let detected = super::runtime().map_err(Error::Runtime)?.block_on(async {
            let connection = crate::connection::Connection::open(&args.connection).await?;
            let mut access = Access::from_args(connection, &args.access);
            let mut detected = Vec::new();
            for channel in Channel::all() {
                match access.read_channel(channel).await {
                    Ok(readout) if readout.element.is_some() => detected.push(channel),
                    Ok(_) => info!(%channel, "no thermostat bound; skipping"),
                    Err(error) if error.is_retryable() => {
                        warn!(%channel, "channel did not respond");
                    }
                    Err(fatal) => return Err(fatal),
                }
            }
            Ok(detected)
        })?;
        let layout = Layout {
            channels: detected.iter().map(|&ch| ChannelEntry::with_defaults(ch)).collect(),
            climates: detected
                .iter()
                .map(|&ch| ClimateEntry { name: None, channel: Some(ch), members: None })
                .collect(),
        };
        let text = serde_json::to_string_pretty(&layout).map_err(Error::Serialize)?;
        use std::io::Write as _;
        writeln!(std::io::stdout().lock(), "{text}").map_err(Error::Write)?;
        info!(channels = detected.len(), "layout suggestion written");
        Ok(())
    }
}

pub mod run {
    use crate::access::{self, Access};
    use crate::connection::{self, Connection};
    use crate::engine::{self, Engine};
    use crate::entity::mqtt::{self, MqttSink};
    use crate::entity::{ClimateZone, Sink};
    use crate::layout::{self, Layout, SinkSpec};
    use std::path::PathBuf;

    /// Run the bridge: poll the controller and attach its channels to an
    /// MQTT broker until interrupted.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        access: access::Args,
        #[clap(flatten)]
        engine: engine::Args,
        #[clap(flatten)]
        mqtt: mqtt::Args,
        /// Path to the layout file describing channels, names and zones.
        /// Every channel gets a default set of entities when omitted.
        #[arg(long)]
        layout: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error(transparent)]
        Layout(#[from] layout::Error),
        #[error("the MQTT broker URL is not usable")]
        MqttUrl(#[from] rumqttc::OptionError),
        #[error("communicating with the controller failed")]
        Bus(#[from] connection::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let layout = match &args.layout {
            Some(path) => Layout::load(path)?,
            None => Layout::everything(),
        };
        let (client, event_loop) = args.mqtt.connect()?;
        let prefix = args.mqtt.topic_prefix.clone();
        let bindings = layout.build_bindings(|spec| -> Box<dyn Sink> {
            let topic = match spec {
                SinkSpec::Field { channel, field } => {
                    mqtt::channel_field_topic(&prefix, *channel, *field)
                }
                SinkSpec::Availability { channel } => mqtt::channel_topic(&prefix, *channel),
                SinkSpec::Climate { zone: ClimateZone::Single(channel) } => {
                    mqtt::channel_climate_topic(&prefix, *channel)
                }
                SinkSpec::Climate { zone: ClimateZone::Group { name, .. } } => {
                    mqtt::zone_topic(&prefix, name)
                }
                SinkSpec::Discovery => mqtt::discovery_topic(&prefix),
            };
            Box::new(MqttSink::new(client.clone(), topic))
        })?;
        super::runtime().map_err(Error::Runtime)?.block_on(async {
            let connection = Connection::open(&args.connection).await?;
            let access = Access::from_args(connection, &args.access);
            let (engine, intents) =
                Engine::new(access, bindings, layout.friendly_names(), &args.engine);
            let pump = tokio::spawn(mqtt::pump(client, event_loop, prefix, intents));
            let result = engine.run().await;
            pump.abort();
            Ok(result?)
        })
    }
}
