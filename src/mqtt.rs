use anyhow::{bail, Context, Result};
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::mpsc;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
    #[serde(
        default = "MqttConfig::default_reconnect_interval",
        with = "humantime_serde"
    )]
    reconnect_interval: Duration,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "mppt".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("mpptctl-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_reconnect_interval() -> Duration {
        Duration::from_secs(5)
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        config.qos()?;
        Ok(config)
    }

    fn qos(&self) -> Result<QoS> {
        match self.qos {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => bail!("Invalid MQTT QoS {other}, expected 0, 1 or 2"),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options
            .set_keep_alive(self.keep_alive_interval)
            .set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.clone().unwrap_or_default());
        }
        options
    }
}

/// Interprets a load switch command payload.
pub fn parse_load_command(payload: &[u8]) -> Option<bool> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    if ["on", "1", "true"]
        .iter()
        .any(|word| text.eq_ignore_ascii_case(word))
    {
        Some(true)
    } else if ["off", "0", "false"]
        .iter()
        .any(|word| text.eq_ignore_ascii_case(word))
    {
        Some(false)
    } else {
        None
    }
}

fn run_event_loop(
    mut connection: Connection,
    client: Client,
    command_topic: String,
    qos: QoS,
    commands: mpsc::Sender<bool>,
    reconnect_interval: Duration,
) {
    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                log::info!("Connected to MQTT broker.");
                // the session is clean, so subscribe again after every connect
                if let Err(e) = client.try_subscribe(command_topic.as_str(), qos) {
                    log::error!("Cannot subscribe to {command_topic}: {e}");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == command_topic => {
                match parse_load_command(&publish.payload) {
                    Some(on) => {
                        if commands.send(on).is_err() {
                            return;
                        }
                    }
                    None => log::warn!(
                        "Ignoring load command {:?} on {command_topic}",
                        String::from_utf8_lossy(&publish.payload)
                    ),
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("MQTT connection error: {e}");
                std::thread::sleep(reconnect_interval);
            }
        }
    }
}

pub struct MqttPublisher {
    client: Client,
    config: MqttConfig,
    qos: QoS,
    commands: mpsc::Receiver<bool>,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Result<Self> {
        let qos = config.qos()?;
        log::info!(
            "Connecting to MQTT broker: {}:{} with client_id: {}",
            config.host,
            config.port,
            config.client_id
        );
        let (client, connection) = Client::new(config.options(), 16);
        let (sender, commands) = mpsc::channel();

        let command_topic = Self::command_topic_for(&config.topic);
        let loop_client = client.clone();
        let reconnect_interval = config.reconnect_interval;
        std::thread::Builder::new()
            .name("mqtt".into())
            .spawn(move || {
                run_event_loop(
                    connection,
                    loop_client,
                    command_topic,
                    qos,
                    sender,
                    reconnect_interval,
                )
            })
            .with_context(|| "Cannot start MQTT event loop")?;

        Ok(Self {
            client,
            config,
            qos,
            commands,
        })
    }

    fn command_topic_for(topic: &str) -> String {
        format!("{topic}/load/set")
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{}', Payload='{payload}', QoS={:?}",
            topic,
            self.qos
        );

        self.client
            .publish(topic, self.qos, false, payload.as_bytes().to_vec())
            .with_context(|| format!("Failed to publish message to MQTT topic: {}", topic))?;

        Ok(())
    }

    /// Waits up to `timeout` for a load switch command from the broker.
    pub fn next_load_command(&self, timeout: Duration) -> Option<bool> {
        match self.commands.recv_timeout(timeout) {
            Ok(on) => Some(on),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                None
            }
        }
    }
}
