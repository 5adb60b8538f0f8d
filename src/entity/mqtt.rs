//! MQTT rendition of the sink/control boundary.
//!
//! State topics live under a configurable prefix and are retained so a
//! freshly connected client sees the last published state. Command topics
//! end in `/set` and are translated into [`Intent`]s; nothing here talks to
//! the bus.
//!
//! Topic layout:
//!
//! ```text
//! <prefix>/channel/<n>/<field>            state, e.g. temperature
//! <prefix>/channel/<n>/availability      "online" / "offline"
//! <prefix>/channel/<n>/climate/...        single-channel climate zone
//! <prefix>/zone/<name>/...                group climate zone
//! <prefix>/discovery                      configuration suggestion text
//! <prefix>/channel/<n>/<field>/set        commands
//! <prefix>/zone/<name>/<field>/set
//! <prefix>/channel/<n>/repair/set         payload names the repair mode
//! <prefix>/discover/set
//! ```

use super::{Intent, IntentSender, Sink, Update, WriteTarget};
use crate::channel_cache::ChannelField;
use crate::registers::{Channel, RepairMode, SetpointKind};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tracing::{debug, warn};

#[derive(clap::Parser, Clone)]
#[group(id = "mqtt::Args")]
pub struct Args {
    /// The MQTT broker to publish to, e.g.
    /// `mqtt://broker.local:1883?client_id=wavin-ahc`.
    #[arg(long)]
    pub mqtt_url: String,

    /// Topic prefix under which every state and command topic lives.
    #[arg(long, default_value = "wavin")]
    pub topic_prefix: String,
}

impl Args {
    pub fn connect(&self) -> Result<(AsyncClient, EventLoop), rumqttc::OptionError> {
        let options = MqttOptions::parse_url(&self.mqtt_url)?;
        Ok(AsyncClient::new(options, 64))
    }
}

pub fn channel_field_topic(prefix: &str, channel: Channel, field: ChannelField) -> String {
    format!("{prefix}/channel/{channel}/{field}")
}

/// Base topic for per-channel updates that are not a single field, such as
/// availability (the sink appends the suffix).
pub fn channel_topic(prefix: &str, channel: Channel) -> String {
    format!("{prefix}/channel/{channel}")
}

pub fn channel_climate_topic(prefix: &str, channel: Channel) -> String {
    format!("{prefix}/channel/{channel}/climate")
}

pub fn zone_topic(prefix: &str, name: &str) -> String {
    format!("{prefix}/zone/{name}")
}

pub fn discovery_topic(prefix: &str) -> String {
    format!("{prefix}/discovery")
}

pub fn command_filters(prefix: &str) -> [String; 3] {
    [
        format!("{prefix}/channel/+/+/set"),
        format!("{prefix}/zone/+/+/set"),
        format!("{prefix}/discover/set"),
    ]
}

/// One binding's outbound half: publishes updates under a fixed base topic.
pub struct MqttSink {
    client: AsyncClient,
    base_topic: String,
}

impl MqttSink {
    pub fn new(client: AsyncClient, base_topic: String) -> MqttSink {
        MqttSink { client, base_topic }
    }

    fn send(&self, topic: &str, payload: String) {
        // The engine must not block on a slow broker; a full client queue
        // drops the update and the next delta will carry fresher state
        // anyway.
        if let Err(error) = self.client.try_publish(topic, QoS::AtLeastOnce, true, payload) {
            warn!(
                message = "could not queue an MQTT publish",
                topic,
                error = &error as &dyn std::error::Error,
            );
        }
    }

    fn send_sub(&self, suffix: &str, payload: String) {
        self.send(&format!("{}/{}", self.base_topic, suffix), payload);
    }
}

fn availability_payload(available: bool) -> String {
    if available { "online" } else { "offline" }.to_string()
}

impl Sink for MqttSink {
    fn publish(&mut self, update: &Update) {
        match update {
            Update::Value(value) => self.send(&self.base_topic, value.to_string()),
            Update::Text(text) => self.send(&self.base_topic, text.clone()),
            Update::Availability(available) => {
                self.send_sub("availability", availability_payload(*available));
            }
            Update::Climate(state) => {
                if let Some(current) = state.current_temperature {
                    self.send_sub("current_temperature", format!("{current:.1}"));
                }
                if let Some(target) = state.target_temperature {
                    self.send_sub("target_temperature", format!("{target:.1}"));
                }
                if let Some(standby) = state.standby {
                    self.send_sub("mode", if standby { "standby" } else { "heat" }.to_string());
                }
                if let Some(heating) = state.heating {
                    self.send_sub("action", if heating { "heating" } else { "idle" }.to_string());
                }
                self.send_sub("availability", availability_payload(state.available));
            }
        }
    }
}

fn parse_bool(payload: &str) -> Option<bool> {
    match payload.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

fn parse_setpoint(field: &str, payload: &str) -> Option<(SetpointKind, f32)> {
    let kind = match field {
        "comfort_setpoint" => SetpointKind::Comfort,
        "standby_setpoint" => SetpointKind::Standby,
        "hysteresis" => SetpointKind::Hysteresis,
        _ => return None,
    };
    Some((kind, payload.parse::<f32>().ok()?))
}

/// Translate a command-topic publish into an intent. `None` means the topic
/// or payload is not one of ours; the caller logs and moves on.
pub fn intent_from_publish(prefix: &str, topic: &str, payload: &[u8]) -> Option<Intent> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let payload = str::from_utf8(payload).ok()?.trim();
    let segments: Vec<&str> = rest.split('/').collect();
    match segments.as_slice() {
        ["discover", "set"] => Some(Intent::Discover),
        ["channel", number, field, "set"] => {
            let channel = number.parse::<u8>().ok().and_then(|n| Channel::new(n).ok())?;
            match *field {
                "repair" => {
                    let mode = payload.parse::<RepairMode>().ok()?;
                    Some(Intent::Repair { channel, mode })
                }
                "child_lock" => {
                    Some(Intent::SetChildLock { channel, locked: parse_bool(payload)? })
                }
                "standby_mode" => Some(Intent::SetStandby {
                    target: WriteTarget::Channel(channel),
                    standby: parse_bool(payload)?,
                }),
                field => {
                    let (kind, celsius) = parse_setpoint(field, payload)?;
                    Some(Intent::SetSetpoint {
                        target: WriteTarget::Channel(channel),
                        kind,
                        celsius,
                    })
                }
            }
        }
        ["zone", name, field, "set"] => {
            let target = WriteTarget::Zone(name.to_string());
            match *field {
                "standby_mode" => {
                    Some(Intent::SetStandby { target, standby: parse_bool(payload)? })
                }
                field => {
                    let (kind, celsius) = parse_setpoint(field, payload)?;
                    Some(Intent::SetSetpoint { target, kind, celsius })
                }
            }
        }
        _ => None,
    }
}

/// Drive the MQTT session: subscribe to command topics on every (re)connect
/// and forward command publishes as intents. Runs until the engine side of
/// the intent channel goes away.
pub async fn pump(
    client: AsyncClient,
    mut event_loop: EventLoop,
    prefix: String,
    intents: IntentSender,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                for filter in command_filters(&prefix) {
                    if let Err(error) = client.subscribe(filter, QoS::AtLeastOnce).await {
                        warn!(
                            message = "could not subscribe to command topics",
                            error = &error as &dyn std::error::Error,
                        );
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match intent_from_publish(&prefix, &publish.topic, &publish.payload) {
                    Some(intent) => {
                        debug!(topic = %publish.topic, ?intent, "command received");
                        if intents.send(intent).is_err() {
                            return;
                        }
                    }
                    None => {
                        debug!(topic = %publish.topic, "ignoring an unrecognized publish");
                    }
                }
            }
            Ok(_) => {}
            Err(error) => {
                warn!(
                    message = "MQTT connection error, will reconnect",
                    error = &error as &dyn std::error::Error,
                );
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(number: u8) -> Channel {
        Channel::new(number).unwrap()
    }

    #[test]
    fn command_topics_parse_into_intents() {
        assert_eq!(
            intent_from_publish("wavin", "wavin/channel/3/comfort_setpoint/set", b"21.5"),
            Some(Intent::SetSetpoint {
                target: WriteTarget::Channel(channel(3)),
                kind: SetpointKind::Comfort,
                celsius: 21.5,
            }),
        );
        assert_eq!(
            intent_from_publish("wavin", "wavin/channel/4/standby_mode/set", b"ON"),
            Some(Intent::SetStandby { target: WriteTarget::Channel(channel(4)), standby: true }),
        );
        assert_eq!(
            intent_from_publish("wavin", "wavin/channel/7/child_lock/set", b"off"),
            Some(Intent::SetChildLock { channel: channel(7), locked: false }),
        );
        assert_eq!(
            intent_from_publish("wavin", "wavin/channel/6/repair/set", b"normalize_off"),
            Some(Intent::Repair { channel: channel(6), mode: RepairMode::NormalizeOff }),
        );
        assert_eq!(
            intent_from_publish("wavin", "wavin/zone/south/comfort_setpoint/set", b"19"),
            Some(Intent::SetSetpoint {
                target: WriteTarget::Zone("south".to_string()),
                kind: SetpointKind::Comfort,
                celsius: 19.0,
            }),
        );
        assert_eq!(intent_from_publish("wavin", "wavin/discover/set", b""), Some(Intent::Discover));
    }

    #[test]
    fn foreign_and_malformed_topics_are_ignored() {
        assert_eq!(intent_from_publish("wavin", "other/channel/3/comfort_setpoint/set", b"21"), None);
        assert_eq!(intent_from_publish("wavin", "wavin/channel/3/comfort_setpoint", b"21"), None);
        assert_eq!(intent_from_publish("wavin", "wavin/channel/17/comfort_setpoint/set", b"21"), None);
        assert_eq!(intent_from_publish("wavin", "wavin/channel/3/comfort_setpoint/set", b"warm"), None);
        assert_eq!(intent_from_publish("wavin", "wavin/channel/3/repair/set", b"harder"), None);
        assert_eq!(intent_from_publish("wavin", "wavin/zone/south/child_lock/set", b"on"), None);
    }

    #[test]
    fn state_topics_are_stable() {
        assert_eq!(
            channel_field_topic("wavin", channel(3), ChannelField::Temperature),
            "wavin/channel/3/temperature",
        );
        assert_eq!(channel_climate_topic("wavin", channel(3)), "wavin/channel/3/climate");
        assert_eq!(zone_topic("wavin", "south"), "wavin/zone/south");
        assert_eq!(discovery_topic("wavin"), "wavin/discovery");
    }
}
