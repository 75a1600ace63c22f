use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use mpptctl_lib::Timing;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum LoadState {
    On,
    Off,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show running status: PV, battery, load, energy counters, working mode and error
    Status,
    /// Show the controller's 16 byte parameter block
    Parameters,
    /// Clear the energy counters and/or reboot the controller
    ResetEnergy {
        /// Do not clear the energy counters
        #[clap(long, action)]
        keep_energy: bool,
        /// Reboot the controller
        #[clap(long, action)]
        reboot: bool,
    },
    /// Set charge current, battery type, constant voltage and load under-voltage threshold
    SetChargingParams {
        /// Charge current (raw controller value)
        charge_current: u8,
        /// Battery type (raw controller value)
        battery_type: u8,
        /// Constant charge voltage (raw controller value)
        const_voltage: u16,
        /// Load under-voltage disconnect threshold (raw controller value)
        load_undervoltage: u16,
    },
    /// Set the load output mode
    SetLoadOutput {
        /// Raw load output mode, 0 switches the load off and 1 switches it on
        mode: u8,
    },
    /// Switch the load output on or off
    Load {
        #[arg(value_enum)]
        state: LoadState,
    },
    /// Run in daemon mode, periodically polling the running status
    Daemon {
        /// Output destination for the running status
        #[command(subcommand)]
        output: DaemonOutput,
        /// Poll interval (e.g., "5s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "5s")]
        interval: Duration,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously poll and print the values to the standard output (console).
    Console,
    /// Continuously poll and publish the values to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "MPPT solar charge controller command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    /// Serial port baud rate
    #[arg(long, default_value_t = mpptctl_lib::transport::DEFAULT_BAUD_RATE)]
    pub baud_rate: u32,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Maximum wait for the first reply byte (e.g., "500ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "1s")]
    pub timeout: Duration,

    /// Overall bound of one request/response exchange
    #[arg(value_parser = humantime::parse_duration, long, default_value = "2s")]
    pub exchange_timeout: Duration,

    /// Delay between sending a query and reading its reply
    #[arg(value_parser = humantime::parse_duration, long, default_value = "50ms")]
    pub query_settle: Duration,

    /// Delay between sending a parameter write and reading its reply
    /// (the controller needs time to store the parameters)
    #[arg(value_parser = humantime::parse_duration, long, default_value = "200ms")]
    pub write_settle: Duration,

    /// Number of retries for failed commands
    #[arg(long, default_value = "3")]
    pub retries: u8,
}

impl CliArgs {
    pub fn timing(&self) -> Timing {
        Timing {
            query_settle: self.query_settle,
            write_settle: self.write_settle,
            response_timeout: self.timeout,
            exchange_timeout: self.exchange_timeout,
            ..Timing::default()
        }
    }
}
