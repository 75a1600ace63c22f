//! Safe configuration writes.
//!
//! Every operation reads the controller's current parameter block, changes
//! only the bytes it owns and writes the whole block back. If the read fails
//! nothing is written, so the controller is never configured from a zeroed
//! or partial block.

use crate::dispatcher::Dispatcher;
use crate::protocol::ConfigBlock;
use crate::transport::Transport;
use crate::Error;

/// Load output mode that switches the load on.
pub const LOAD_OUTPUT_ON: u8 = 0x01;
/// Load output mode that switches the load off.
pub const LOAD_OUTPUT_OFF: u8 = 0x00;

impl<T: Transport> Dispatcher<T> {
    /// Performs one read exchange and, if it succeeded, one write exchange
    /// carrying the block as changed by `mutate`. Returns the written block.
    pub fn update_configuration<F>(
        &mut self,
        operation: &str,
        mutate: F,
    ) -> Result<ConfigBlock, Error>
    where
        F: FnOnce(&mut ConfigBlock),
    {
        let mut block = self.query_parameters().map_err(|err| {
            log::warn!("{operation}: cannot read configuration, nothing written ({err})");
            err
        })?;
        log::debug!("{operation}: current configuration {block:?}");

        mutate(&mut block);

        log::debug!("{operation}: writing configuration {block:?}");
        match self.write_configuration(&block[..]) {
            Ok(()) => {
                log::info!("{operation}: configuration acknowledged");
                Ok(block)
            }
            Err(err) => {
                log::warn!("{operation}: configuration write failed ({err})");
                Err(err)
            }
        }
    }

    /// Clears the energy counters and/or reboots the controller.
    pub fn reset_energy(&mut self, clear: bool, reboot: bool) -> Result<(), Error> {
        self.update_configuration("reset energy", |block| {
            block.set_reset_control(clear, reboot)
        })
        .map(|_| ())
    }

    pub fn set_charging_params(
        &mut self,
        charge_current: u8,
        battery_type: u8,
        const_voltage: u16,
        load_undervoltage: u16,
    ) -> Result<(), Error> {
        self.update_configuration("set charging parameters", |block| {
            block.set_charging_params(
                charge_current,
                battery_type,
                const_voltage,
                load_undervoltage,
            )
        })
        .map(|_| ())
    }

    pub fn set_load_output(&mut self, mode: u8) -> Result<(), Error> {
        self.update_configuration("set load output", |block| block.set_load_output(mode))
            .map(|_| ())
    }

    /// Entry point for a load switch: `true` turns the load output on.
    pub fn set_load_state(&mut self, on: bool) -> Result<(), Error> {
        self.set_load_output(if on { LOAD_OUTPUT_ON } else { LOAD_OUTPUT_OFF })
    }
}
