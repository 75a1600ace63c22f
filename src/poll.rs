//! Periodic status polling and publishing to externally supplied sinks.

use crate::dispatcher::Dispatcher;
use crate::protocol::RunningStatus;
use crate::transport::Transport;
use std::fmt;

/// A telemetry value the poll cycle publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    PvVoltage,
    PvCurrent,
    PvPower,
    BatteryVoltage,
    Temperature,
    LoadCurrent,
    DailyEnergy,
    TotalEnergy,
    WorkingMode,
    Error,
}

impl Field {
    pub const ALL: [Field; 10] = [
        Field::PvVoltage,
        Field::PvCurrent,
        Field::PvPower,
        Field::BatteryVoltage,
        Field::Temperature,
        Field::LoadCurrent,
        Field::DailyEnergy,
        Field::TotalEnergy,
        Field::WorkingMode,
        Field::Error,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Field::PvVoltage => "pv_voltage",
            Field::PvCurrent => "pv_current",
            Field::PvPower => "pv_power",
            Field::BatteryVoltage => "battery_voltage",
            Field::Temperature => "temperature",
            Field::LoadCurrent => "load_current",
            Field::DailyEnergy => "daily_energy",
            Field::TotalEnergy => "total_energy",
            Field::WorkingMode => "working_mode",
            Field::Error => "error",
        }
    }

    pub fn unit(&self) -> Option<&'static str> {
        match self {
            Field::PvVoltage | Field::BatteryVoltage => Some("V"),
            Field::PvCurrent | Field::LoadCurrent => Some("A"),
            Field::PvPower => Some("W"),
            Field::Temperature => Some("°C"),
            Field::DailyEnergy | Field::TotalEnergy => Some("kWh"),
            Field::WorkingMode | Field::Error => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.name() == name)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Number(f32),
    Text(&'static str),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Number(value) => write!(f, "{value}"),
            Value::Text(text) => f.write_str(text),
        }
    }
}

impl RunningStatus {
    pub fn value(&self, field: Field) -> Value {
        match field {
            Field::PvVoltage => Value::Number(self.pv_voltage),
            Field::PvCurrent => Value::Number(self.pv_current),
            Field::PvPower => Value::Number(self.pv_power),
            Field::BatteryVoltage => Value::Number(self.battery_voltage),
            Field::Temperature => Value::Number(self.temperature),
            Field::LoadCurrent => Value::Number(self.load_current),
            Field::DailyEnergy => Value::Number(self.daily_energy),
            Field::TotalEnergy => Value::Number(self.total_energy),
            Field::WorkingMode => Value::Text(self.working_mode.label()),
            Field::Error => Value::Text(self.error_code.label()),
        }
    }
}

/// Receives published values. Implemented for any `FnMut(Value)`.
pub trait Sink {
    fn publish(&mut self, value: Value);
}

impl<F> Sink for F
where
    F: FnMut(Value),
{
    fn publish(&mut self, value: Value) {
        self(value)
    }
}

/// One optional sink per published field, assigned when the driver is
/// assembled. An absent sink is skipped.
#[derive(Default)]
pub struct Sinks {
    pub pv_voltage: Option<Box<dyn Sink>>,
    pub pv_current: Option<Box<dyn Sink>>,
    pub pv_power: Option<Box<dyn Sink>>,
    pub battery_voltage: Option<Box<dyn Sink>>,
    pub temperature: Option<Box<dyn Sink>>,
    pub load_current: Option<Box<dyn Sink>>,
    pub daily_energy: Option<Box<dyn Sink>>,
    pub total_energy: Option<Box<dyn Sink>>,
    pub working_mode: Option<Box<dyn Sink>>,
    pub error: Option<Box<dyn Sink>>,
}

impl Sinks {
    fn slot(&mut self, field: Field) -> &mut Option<Box<dyn Sink>> {
        match field {
            Field::PvVoltage => &mut self.pv_voltage,
            Field::PvCurrent => &mut self.pv_current,
            Field::PvPower => &mut self.pv_power,
            Field::BatteryVoltage => &mut self.battery_voltage,
            Field::Temperature => &mut self.temperature,
            Field::LoadCurrent => &mut self.load_current,
            Field::DailyEnergy => &mut self.daily_energy,
            Field::TotalEnergy => &mut self.total_energy,
            Field::WorkingMode => &mut self.working_mode,
            Field::Error => &mut self.error,
        }
    }

    fn slot_ref(&self, field: Field) -> &Option<Box<dyn Sink>> {
        match field {
            Field::PvVoltage => &self.pv_voltage,
            Field::PvCurrent => &self.pv_current,
            Field::PvPower => &self.pv_power,
            Field::BatteryVoltage => &self.battery_voltage,
            Field::Temperature => &self.temperature,
            Field::LoadCurrent => &self.load_current,
            Field::DailyEnergy => &self.daily_energy,
            Field::TotalEnergy => &self.total_energy,
            Field::WorkingMode => &self.working_mode,
            Field::Error => &self.error,
        }
    }

    pub fn set<S: Sink + 'static>(&mut self, field: Field, sink: S) -> &mut Self {
        *self.slot(field) = Some(Box::new(sink));
        self
    }

    pub fn is_set(&self, field: Field) -> bool {
        self.slot_ref(field).is_some()
    }

    /// Hands every field of `status` to its sink, if one is set.
    pub fn publish(&mut self, status: &RunningStatus) {
        for field in Field::ALL {
            if let Some(sink) = self.slot(field) {
                sink.publish(status.value(field));
            }
        }
    }
}

impl fmt::Debug for Sinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(Field::ALL.iter().filter(|field| self.is_set(**field)))
            .finish()
    }
}

/// Runs one status query per tick and republishes the decoded telemetry.
#[derive(Debug, Default)]
pub struct PollCycle {
    sinks: Sinks,
    last_status: Option<RunningStatus>,
    consecutive_failures: u32,
}

impl PollCycle {
    pub fn new(sinks: Sinks) -> Self {
        Self {
            sinks,
            last_status: None,
            consecutive_failures: 0,
        }
    }

    pub fn sinks_mut(&mut self) -> &mut Sinks {
        &mut self.sinks
    }

    /// The most recently published status.
    pub fn last_status(&self) -> Option<&RunningStatus> {
        self.last_status.as_ref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Runs one exchange. A failed tick is logged and leaves every sink
    /// untouched.
    pub fn tick<T: Transport>(
        &mut self,
        dispatcher: &mut Dispatcher<T>,
    ) -> Option<RunningStatus> {
        match dispatcher.query_running_status() {
            Ok(status) => {
                log::debug!("Running status: {status:?}");
                self.consecutive_failures = 0;
                self.sinks.publish(&status);
                self.last_status = Some(status.clone());
                Some(status)
            }
            Err(err) => {
                self.consecutive_failures += 1;
                log::warn!(
                    "Status poll failed ({} in a row): {err}",
                    self.consecutive_failures
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tests::status_response;
    use crate::transport::mock::MockTransport;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<(Field, String)>>>;

    fn recording_sinks(fields: &[Field]) -> (Sinks, Log) {
        let log: Log = Rc::default();
        let mut sinks = Sinks::default();
        for &field in fields {
            let log = Rc::clone(&log);
            sinks.set(field, move |value: Value| {
                log.borrow_mut().push((field, value.to_string()))
            });
        }
        (sinks, log)
    }

    #[test]
    fn field_names_round_trip() {
        for field in Field::ALL {
            assert_eq!(Field::from_name(field.name()), Some(field));
        }
        assert_eq!(Field::from_name("soc"), None);
    }

    #[test]
    fn publishes_every_set_sink() {
        let (sinks, log) = recording_sinks(&Field::ALL);
        let mut cycle = PollCycle::new(sinks);
        let mut dispatcher = Dispatcher::new(MockTransport::with_replies([status_response()]));

        assert!(cycle.tick(&mut dispatcher).is_some());
        let log = log.borrow();
        assert_eq!(log.len(), Field::ALL.len());
        assert!(log.contains(&(Field::PvVoltage, "20".to_string())));
        assert!(log.contains(&(Field::PvPower, "10".to_string())));
        assert!(log.contains(&(Field::LoadCurrent, "0.15".to_string())));
        assert!(log.contains(&(Field::WorkingMode, "Tracking".to_string())));
        assert!(log.contains(&(Field::Error, "No Error".to_string())));
    }

    #[test]
    fn missing_sinks_are_skipped() {
        let (sinks, log) = recording_sinks(&[Field::BatteryVoltage]);
        let mut cycle = PollCycle::new(sinks);
        let mut dispatcher = Dispatcher::new(MockTransport::with_replies([status_response()]));

        cycle.tick(&mut dispatcher);
        assert_eq!(*log.borrow(), vec![(Field::BatteryVoltage, "30".to_string())]);
    }

    #[test]
    fn failed_tick_keeps_published_values() {
        let (sinks, log) = recording_sinks(&Field::ALL);
        let mut cycle = PollCycle::new(sinks);
        let mut tampered = status_response();
        tampered[20] = tampered[20].wrapping_sub(1);
        let mut dispatcher = Dispatcher::new(MockTransport::with_replies([
            status_response(),
            tampered,
            vec![0xab, 0xbb, 0x00],
        ]));

        assert!(cycle.tick(&mut dispatcher).is_some());
        let published = log.borrow().len();
        let last = cycle.last_status().cloned();

        assert!(cycle.tick(&mut dispatcher).is_none());
        assert!(cycle.tick(&mut dispatcher).is_none());
        assert!(cycle.tick(&mut dispatcher).is_none());
        assert_eq!(cycle.consecutive_failures(), 3);
        assert_eq!(log.borrow().len(), published);
        assert_eq!(cycle.last_status().cloned(), last);
    }
}
