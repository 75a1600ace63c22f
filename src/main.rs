use anyhow::{Context, Result};
use clap::Parser;
use commandline::{CliArgs, CliCommands, LoadState};
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use mpptctl_lib::poll::Field;
use mpptctl_lib::Dispatcher;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod mqtt;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

/// Runs `operation` once plus up to `retries` more times while it fails.
///
/// A wrongly sized configuration block fails the same way every time and is
/// returned immediately.
pub fn with_retries<T, F>(
    retries: u8,
    what: &str,
    mut operation: F,
) -> Result<T, mpptctl_lib::Error>
where
    F: FnMut() -> Result<T, mpptctl_lib::Error>,
{
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(err @ mpptctl_lib::Error::InvalidInput { .. }) => return Err(err),
            Err(err) if attempt < retries => {
                attempt += 1;
                warn!("{what} failed, retry {attempt} of {retries} ({err})");
            }
            Err(err) => return Err(err),
        }
    }
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let mut controller = Dispatcher::open(&args.device, args.baud_rate, args.timing())
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    let retries = args.retries;

    match args.command {
        CliCommands::Status => {
            let status = with_retries(retries, "status", || controller.query_running_status())
                .with_context(|| "Cannot get running status")?;
            for field in Field::ALL {
                println!("{}", daemon::render(field, status.value(field)));
            }
        }
        CliCommands::Parameters => {
            let block = with_retries(retries, "parameters", || controller.query_parameters())
                .with_context(|| "Cannot get parameters")?;
            println!("Parameters: {block}");
        }
        CliCommands::ResetEnergy {
            keep_energy,
            reboot,
        } => with_retries(retries, "reset energy", || {
            controller.reset_energy(!keep_energy, reboot)
        })
        .with_context(|| "Cannot reset energy")?,
        CliCommands::SetChargingParams {
            charge_current,
            battery_type,
            const_voltage,
            load_undervoltage,
        } => with_retries(retries, "set charging parameters", || {
            controller.set_charging_params(
                charge_current,
                battery_type,
                const_voltage,
                load_undervoltage,
            )
        })
        .with_context(|| "Cannot set charging parameters")?,
        CliCommands::SetLoadOutput { mode } => {
            with_retries(retries, "set load output", || controller.set_load_output(mode))
                .with_context(|| "Cannot set load output")?
        }
        CliCommands::Load { state } => with_retries(retries, "switch load", || {
            controller.set_load_state(state == LoadState::On)
        })
        .with_context(|| "Cannot switch load")?,
        CliCommands::Daemon { output, interval } => {
            daemon::run(controller, output, interval, retries)?
        }
    }

    Ok(())
}
