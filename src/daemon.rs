use anyhow::{Context, Result};
use log::{error, info, warn};
use mpptctl_lib::poll::{Field, PollCycle, Sinks, Value};
use mpptctl_lib::protocol::RunningStatus;
use mpptctl_lib::serialport::SerialTransport;
use mpptctl_lib::Dispatcher;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::{commandline, mqtt, with_retries};

/// Formats a field for humans, including its unit.
pub fn render(field: Field, value: Value) -> String {
    match field.unit() {
        Some(unit) => format!("{field}: {value} {unit}"),
        None => format!("{field}: {value}"),
    }
}

fn console_sinks() -> Sinks {
    let mut sinks = Sinks::default();
    for field in Field::ALL {
        sinks.set(field, move |value: Value| println!("{}", render(field, value)));
    }
    sinks
}

fn mqtt_sinks(publisher: &Rc<mqtt::MqttPublisher>) -> Sinks {
    let mut sinks = Sinks::default();
    for field in Field::ALL {
        let publisher = Rc::clone(publisher);
        let topic = format!("{}/{field}", publisher.topic());
        sinks.set(field, move |value: Value| {
            if let Err(e) = publisher.publish(&topic, &value.to_string()) {
                error!("Failed to publish message to topic {topic}: {e}");
            }
        });
    }
    sinks
}

fn publish_json(publisher: &mqtt::MqttPublisher, status: &RunningStatus) {
    let mut data_to_publish = serde_json::Map::new();
    data_to_publish.insert(
        "timestamp".to_string(),
        serde_json::json!(chrono::Utc::now().to_rfc3339()),
    );
    match serde_json::to_value(status) {
        Ok(value) => {
            data_to_publish.insert("status".to_string(), value);
        }
        Err(e) => {
            error!("Failed to serialize running status: {e}");
            return;
        }
    }
    match serde_json::to_string(&data_to_publish) {
        Ok(json_payload) => {
            if let Err(e) = publisher.publish(publisher.topic(), &json_payload) {
                error!("Failed to publish data to MQTT: {e:?}");
            }
        }
        Err(e) => error!("Failed to serialize data to JSON string: {e}"),
    }
}

fn handle_load_command(
    dispatcher: &mut Dispatcher<SerialTransport>,
    publisher: &mqtt::MqttPublisher,
    on: bool,
    retries: u8,
) {
    info!("Load switch command: {}", if on { "ON" } else { "OFF" });
    match with_retries(retries, "set load state", || dispatcher.set_load_state(on)) {
        Ok(()) => {
            let topic = format!("{}/load/state", publisher.topic());
            if let Err(e) = publisher.publish(&topic, if on { "ON" } else { "OFF" }) {
                error!("Failed to publish load state: {e}");
            }
        }
        Err(e) => error!("Cannot switch load: {e}"),
    }
}

fn run_console(mut dispatcher: Dispatcher<SerialTransport>, interval: Duration) -> Result<()> {
    let mut cycle = PollCycle::new(console_sinks());
    loop {
        println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
        if cycle.tick(&mut dispatcher).is_none() {
            println!("no data, see log");
        }
        println!("--------------------------");
        std::thread::sleep(interval);
    }
}

fn run_mqtt(
    mut dispatcher: Dispatcher<SerialTransport>,
    config_file: &str,
    format: commandline::MqttFormat,
    interval: Duration,
    retries: u8,
) -> Result<()> {
    let config = mqtt::MqttConfig::load(config_file)
        .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
    info!("Successfully loaded MQTT config from {config_file}: {config:?}");
    let publisher = Rc::new(
        mqtt::MqttPublisher::new(config).with_context(|| "Failed to create MQTT publisher")?,
    );

    let sinks = match format {
        commandline::MqttFormat::Simple => mqtt_sinks(&publisher),
        commandline::MqttFormat::Json => Sinks::default(),
    };
    let mut cycle = PollCycle::new(sinks);

    loop {
        let started = Instant::now();
        match cycle.tick(&mut dispatcher) {
            Some(status) if format == commandline::MqttFormat::Json => {
                publish_json(&publisher, &status)
            }
            Some(_) => {}
            None => warn!("No data in this cycle to publish via MQTT."),
        }

        // serve load switch commands until the next poll is due
        while let Some(remaining) = interval.checked_sub(started.elapsed()) {
            match publisher.next_load_command(remaining) {
                Some(on) => handle_load_command(&mut dispatcher, &publisher, on, retries),
                None => break,
            }
        }
    }
}

pub fn run(
    dispatcher: Dispatcher<SerialTransport>,
    output: commandline::DaemonOutput,
    interval: Duration,
    retries: u8,
) -> Result<()> {
    info!("Starting daemon mode: output={output:?}, interval={interval:?}");
    match output {
        commandline::DaemonOutput::Console => run_console(dispatcher, interval),
        commandline::DaemonOutput::Mqtt {
            config_file,
            format,
        } => run_mqtt(dispatcher, &config_file, format, interval, retries),
    }
}
