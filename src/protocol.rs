use crate::Error;
use std::fmt;
use std::ops::{Deref, DerefMut};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Every command frame and every accepted response frame is this long.
pub const FRAME_LENGTH: usize = 21;
/// Size of the persisted parameter block carried by parameter frames.
pub const CONFIG_BLOCK_LENGTH: usize = 16;
/// The driver only ever talks to a single controller.
pub const DEVICE_ADDRESS: u8 = 0x01;

const REQUEST_MAGIC: [u8; 2] = [0x5a, 0xa5];
const RESPONSE_MAGIC: [u8; 2] = [0xaa, 0xbb];

const ADDRESS_OFFSET: usize = 2;
const DATA_TYPE_OFFSET: usize = 3;
const PAYLOAD_OFFSET: usize = 4;
const CHECKSUM_OFFSET: usize = 20;

const ACK_MARKER: &[u8] = b"ACK";
const NAK_MARKERS: [&[u8]; 2] = [b"NAK", b"RAK"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    QueryStatus = 0x00,
    SetParameters = 0x01,
    QueryParameters = 0x02,
}

/// A fixed-length outbound command frame.
pub struct Frame([u8; FRAME_LENGTH]);

impl Frame {
    fn new(data_type: DataType) -> Self {
        let mut buffer = [0; FRAME_LENGTH];
        buffer[..2].copy_from_slice(&REQUEST_MAGIC);
        buffer[ADDRESS_OFFSET] = DEVICE_ADDRESS;
        buffer[DATA_TYPE_OFFSET] = data_type as u8;
        Self(buffer)
    }

    fn seal(mut self) -> Self {
        self.0[CHECKSUM_OFFSET] = checksum(&self.0);
        self
    }

    pub fn data_type(&self) -> u8 {
        self.0[DATA_TYPE_OFFSET]
    }
}

impl Deref for Frame {
    type Target = [u8; FRAME_LENGTH];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X?}", self.0)
    }
}

/// Sum of the bytes at offsets 2..=19, modulo 256.
///
/// Bytes past offset 19 never contribute, so the function can be applied to a
/// complete frame including its trailing checksum byte.
pub fn checksum(frame: &[u8]) -> u8 {
    frame
        .iter()
        .take(CHECKSUM_OFFSET)
        .skip(ADDRESS_OFFSET)
        .fold(0u8, |sum, b| sum.wrapping_add(*b))
}

pub fn build_status_query() -> Frame {
    Frame::new(DataType::QueryStatus).seal()
}

pub fn build_parameter_query() -> Frame {
    Frame::new(DataType::QueryParameters).seal()
}

/// Builds a set-parameters frame carrying `config` verbatim as its payload.
pub fn build_parameter_write(config: &[u8]) -> Result<Frame, Error> {
    if config.len() != CONFIG_BLOCK_LENGTH {
        log::warn!(
            "Invalid configuration block size - required={} received={}",
            CONFIG_BLOCK_LENGTH,
            config.len()
        );
        return Err(Error::InvalidInput {
            expected: CONFIG_BLOCK_LENGTH,
            received: config.len(),
        });
    }
    let mut frame = Frame::new(DataType::SetParameters);
    frame.0[PAYLOAD_OFFSET..CHECKSUM_OFFSET].copy_from_slice(config);
    Ok(frame.seal())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Valid,
    Malformed,
    ChecksumMismatch,
}

impl FrameStatus {
    pub fn is_valid(&self) -> bool {
        *self == FrameStatus::Valid
    }

    /// Converts the classification of `frame` into the matching error.
    pub fn into_result(self, frame: &[u8]) -> Result<(), Error> {
        match self {
            FrameStatus::Valid => Ok(()),
            FrameStatus::Malformed => Err(Error::MalformedFrame),
            FrameStatus::ChecksumMismatch => Err(Error::ChecksumMismatch {
                calculated: checksum(frame),
                received: frame.get(CHECKSUM_OFFSET).copied().unwrap_or_default(),
            }),
        }
    }
}

/// Classifies a received frame. Must pass before any payload is interpreted.
pub fn validate_response(frame: &[u8]) -> FrameStatus {
    match check_response(frame) {
        Ok(()) => FrameStatus::Valid,
        Err(Error::ChecksumMismatch { .. }) => FrameStatus::ChecksumMismatch,
        Err(_) => FrameStatus::Malformed,
    }
}

fn check_response(frame: &[u8]) -> Result<(), Error> {
    if frame.len() < FRAME_LENGTH {
        log::warn!(
            "Invalid frame size - required={} received={}",
            FRAME_LENGTH,
            frame.len()
        );
        return Err(Error::MalformedFrame);
    }
    if frame[..2] != RESPONSE_MAGIC {
        log::warn!("Invalid response header {:02X?}", &frame[..2]);
        return Err(Error::MalformedFrame);
    }
    let calculated = checksum(frame);
    let received = frame[CHECKSUM_OFFSET];
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={:02X?} received={:02X?} buffer={:02X?}",
            calculated,
            received,
            frame
        );
        return Err(Error::ChecksumMismatch {
            calculated,
            received,
        });
    }
    Ok(())
}

fn read_u16(frame: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([frame[offset], frame[offset + 1]])
}

// Keeps float noise out of published values and comparisons.
fn round3(value: f32) -> f32 {
    (value * 1000.0).round() / 1000.0
}

fn scaled(frame: &[u8], offset: usize, divisor: f32) -> f32 {
    round3(read_u16(frame, offset) as f32 / divisor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum WorkingMode {
    Standby,
    Tracking,
    ConstantVoltage,
    Float,
    CurrentLimited,
    Unknown(u8),
}

impl From<u8> for WorkingMode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => WorkingMode::Standby,
            0x01 => WorkingMode::Tracking,
            0x02 => WorkingMode::ConstantVoltage,
            0x03 => WorkingMode::Float,
            0x04 => WorkingMode::CurrentLimited,
            other => WorkingMode::Unknown(other),
        }
    }
}

impl WorkingMode {
    pub fn label(&self) -> &'static str {
        match self {
            WorkingMode::Standby => "Standby",
            WorkingMode::Tracking => "Tracking",
            WorkingMode::ConstantVoltage => "Constant Voltage",
            WorkingMode::Float => "Float",
            WorkingMode::CurrentLimited => "Current Limited",
            WorkingMode::Unknown(_) => "Unknown",
        }
    }
}

impl fmt::Display for WorkingMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ErrorCode {
    NoError,
    BatteryOverVoltage,
    BatteryUnderVoltage,
    PvOverVoltage,
    OverTemperature,
    LoadOverCurrent,
    LoadShortCircuit,
    Unknown(u8),
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => ErrorCode::NoError,
            0x01 => ErrorCode::BatteryOverVoltage,
            0x02 => ErrorCode::BatteryUnderVoltage,
            0x03 => ErrorCode::PvOverVoltage,
            0x04 => ErrorCode::OverTemperature,
            0x05 => ErrorCode::LoadOverCurrent,
            0x06 => ErrorCode::LoadShortCircuit,
            other => ErrorCode::Unknown(other),
        }
    }
}

impl ErrorCode {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "No Error",
            ErrorCode::BatteryOverVoltage => "Battery Over Voltage",
            ErrorCode::BatteryUnderVoltage => "Battery Under Voltage",
            ErrorCode::PvOverVoltage => "PV Over Voltage",
            ErrorCode::OverTemperature => "Over Temperature",
            ErrorCode::LoadOverCurrent => "Load Over Current",
            ErrorCode::LoadShortCircuit => "Load Short Circuit",
            ErrorCode::Unknown(_) => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Telemetry carried by a query-status response.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RunningStatus {
    pub pv_voltage: f32,
    pub pv_current: f32,
    pub pv_power: f32,
    pub battery_voltage: f32,
    pub temperature: f32,
    pub load_current: f32,
    pub daily_energy: f32, // kWh
    pub total_energy: f32, // kWh
    pub working_mode: WorkingMode,
    pub error_code: ErrorCode,
}

impl RunningStatus {
    pub fn decode(frame: &[u8]) -> Result<Self, Error> {
        check_response(frame)?;
        let pv_voltage = scaled(frame, 4, 10.0);
        let pv_current = scaled(frame, 6, 10.0);
        Ok(Self {
            pv_voltage,
            pv_current,
            pv_power: round3(pv_voltage * pv_current),
            battery_voltage: scaled(frame, 8, 10.0),
            temperature: scaled(frame, 10, 10.0),
            load_current: scaled(frame, 12, 100.0),
            working_mode: WorkingMode::from(frame[14]),
            error_code: ErrorCode::from(frame[15]),
            daily_energy: scaled(frame, 16, 100.0),
            total_energy: scaled(frame, 18, 10.0),
        })
    }
}

pub fn decode_running_status(frame: &[u8]) -> Result<RunningStatus, Error> {
    RunningStatus::decode(frame)
}

/// The controller's 16 byte parameter block.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ConfigBlock([u8; CONFIG_BLOCK_LENGTH]);

impl ConfigBlock {
    const CHARGE_CURRENT: usize = 0;
    const BATTERY_TYPE: usize = 1;
    const CONST_VOLTAGE: usize = 2;
    const LOAD_UNDERVOLTAGE: usize = 8;
    const RESET_CONTROL: usize = 10;
    const LOAD_OUTPUT: usize = 11;

    pub fn new(bytes: [u8; CONFIG_BLOCK_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn charge_current(&self) -> u8 {
        self.0[Self::CHARGE_CURRENT]
    }

    pub fn battery_type(&self) -> u8 {
        self.0[Self::BATTERY_TYPE]
    }

    pub fn const_voltage(&self) -> u16 {
        read_u16(&self.0, Self::CONST_VOLTAGE)
    }

    pub fn load_undervoltage(&self) -> u16 {
        read_u16(&self.0, Self::LOAD_UNDERVOLTAGE)
    }

    pub fn reset_control(&self) -> u8 {
        self.0[Self::RESET_CONTROL]
    }

    pub fn load_output(&self) -> u8 {
        self.0[Self::LOAD_OUTPUT]
    }

    /// Bit 0 clears the energy counters, bit 1 reboots the controller.
    pub fn set_reset_control(&mut self, clear: bool, reboot: bool) {
        self.0[Self::RESET_CONTROL] = u8::from(clear) | (u8::from(reboot) << 1);
    }

    pub fn set_charging_params(
        &mut self,
        charge_current: u8,
        battery_type: u8,
        const_voltage: u16,
        load_undervoltage: u16,
    ) {
        self.0[Self::CHARGE_CURRENT] = charge_current;
        self.0[Self::BATTERY_TYPE] = battery_type;
        self.0[Self::CONST_VOLTAGE..Self::CONST_VOLTAGE + 2]
            .copy_from_slice(&const_voltage.to_be_bytes());
        self.0[Self::LOAD_UNDERVOLTAGE..Self::LOAD_UNDERVOLTAGE + 2]
            .copy_from_slice(&load_undervoltage.to_be_bytes());
    }

    pub fn set_load_output(&mut self, mode: u8) {
        self.0[Self::LOAD_OUTPUT] = mode;
    }

    /// Extracts the block from a query-parameters response.
    pub fn decode(frame: &[u8]) -> Result<Self, Error> {
        check_response(frame)?;
        let received = frame[DATA_TYPE_OFFSET];
        if received != DataType::QueryParameters as u8 {
            log::warn!(
                "Unexpected data type - expected={:02X?} received={:02X?}",
                DataType::QueryParameters as u8,
                received
            );
            return Err(Error::UnexpectedDataType {
                expected: DataType::QueryParameters as u8,
                received,
            });
        }
        Self::try_from(&frame[PAYLOAD_OFFSET..CHECKSUM_OFFSET])
    }
}

impl TryFrom<&[u8]> for ConfigBlock {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let block: [u8; CONFIG_BLOCK_LENGTH] =
            bytes.try_into().map_err(|_| Error::InvalidInput {
                expected: CONFIG_BLOCK_LENGTH,
                received: bytes.len(),
            })?;
        Ok(Self(block))
    }
}

impl Deref for ConfigBlock {
    type Target = [u8; CONFIG_BLOCK_LENGTH];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ConfigBlock {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl fmt::Debug for ConfigBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X?}", self.0)
    }
}

impl fmt::Display for ConfigBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "charge_current={} battery_type={} const_voltage={} load_undervoltage={} \
             reset_control={:#04x} load_output={} raw={:02X?}",
            self.charge_current(),
            self.battery_type(),
            self.const_voltage(),
            self.load_undervoltage(),
            self.reset_control(),
            self.load_output(),
            self.0
        )
    }
}

pub fn decode_parameter_response(frame: &[u8]) -> Result<ConfigBlock, Error> {
    ConfigBlock::decode(frame)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Interprets the controller's reply to a set-parameters frame.
///
/// Only an "ACK" marker anywhere in the reply counts as success.
pub fn decode_write_reply(reply: &[u8]) -> Result<(), Error> {
    if reply.is_empty() {
        return Err(Error::NoResponse);
    }
    if contains(reply, ACK_MARKER) {
        return Ok(());
    }
    if let Some(marker) = NAK_MARKERS.iter().find(|marker| contains(reply, marker)) {
        return Err(Error::DeviceNak(String::from_utf8_lossy(marker).into_owned()));
    }
    log::warn!("No acknowledgement in write reply {:02X?}", reply);
    Err(Error::UnexpectedReply(reply.to_vec()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a response frame around `payload` and fixes up its checksum.
    pub(crate) fn response(data_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0; FRAME_LENGTH];
        frame[..2].copy_from_slice(&RESPONSE_MAGIC);
        frame[ADDRESS_OFFSET] = DEVICE_ADDRESS;
        frame[DATA_TYPE_OFFSET] = data_type;
        frame[PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload.len()].copy_from_slice(payload);
        frame[CHECKSUM_OFFSET] = checksum(&frame);
        frame
    }

    pub(crate) fn status_response() -> Vec<u8> {
        let mut frame = vec![
            0xAA, 0xBB, 0x01, 0x00, 0x00, 0xC8, 0x00, 0x05, 0x01, 0x2C, 0x00, 0x96, 0x00, 0x0F,
            0x01, 0x00, 0x03, 0x00, 0x00, 0x27, 0x00,
        ];
        frame[20] = checksum(&frame);
        frame
    }

    #[test]
    fn checksum_sums_address_through_payload() {
        let mut frame = [0xffu8; FRAME_LENGTH];
        frame[0] = 0x01;
        frame[1] = 0x01;
        frame[20] = 0x01;
        assert_eq!(checksum(&frame), (18 * 0xffusize % 256) as u8);
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0x10, 0x20, 0x30]), 0x30);
    }

    #[test]
    fn checksum_over_any_length() {
        for len in 0..64usize {
            let frame: Vec<u8> = (0..len).map(|i| (i * 37 + len * 11) as u8).collect();
            let end = len.min(20);
            let expected = if end > 2 {
                frame[2..end].iter().map(|b| *b as usize).sum::<usize>() % 256
            } else {
                0
            };
            assert_eq!(checksum(&frame) as usize, expected, "length {len}");
        }
    }

    #[test]
    fn status_query_layout() {
        let frame = build_status_query();
        assert_eq!(frame[..4], [0x5a, 0xa5, 0x01, 0x00]);
        assert!(frame[4..20].iter().all(|b| *b == 0));
        assert_eq!(frame[20], 0x01);
    }

    #[test]
    fn parameter_query_layout() {
        let frame = build_parameter_query();
        assert_eq!(frame.data_type(), 0x02);
        assert_eq!(frame[20], 0x03);
    }

    #[test]
    fn parameter_write_copies_block() {
        let config: Vec<u8> = (1..=16).collect();
        let frame = build_parameter_write(&config).unwrap();
        assert_eq!(frame.data_type(), 0x01);
        assert_eq!(&frame[4..20], config.as_slice());
        assert_eq!(frame[20], checksum(&*frame));
    }

    #[test]
    fn parameter_write_rejects_wrong_size() {
        for len in [0, 15, 17, 21] {
            let config = vec![0; len];
            match build_parameter_write(&config) {
                Err(Error::InvalidInput { expected, received }) => {
                    assert_eq!(expected, 16);
                    assert_eq!(received, len);
                }
                other => panic!("unexpected result {other:?}"),
            }
        }
    }

    #[test]
    fn own_frames_pass_integrity_check() {
        for frame in [build_status_query(), build_parameter_query()] {
            assert_eq!(frame[20], checksum(&*frame));
        }
    }

    #[test]
    fn validate_classifies_frames() {
        let valid = status_response();
        assert_eq!(validate_response(&valid), FrameStatus::Valid);

        assert_eq!(validate_response(&valid[..20]), FrameStatus::Malformed);

        let mut bad_magic = valid.clone();
        bad_magic[0] = 0xab;
        assert_eq!(validate_response(&bad_magic), FrameStatus::Malformed);

        let mut tampered = valid.clone();
        tampered[20] = tampered[20].wrapping_add(1);
        assert_eq!(validate_response(&tampered), FrameStatus::ChecksumMismatch);

        let mut longer = valid.clone();
        longer.extend_from_slice(&[0x00, 0x11]);
        assert!(validate_response(&longer).is_valid());

        assert!(matches!(
            validate_response(&bad_magic).into_result(&bad_magic),
            Err(Error::MalformedFrame)
        ));
        let received = tampered[20];
        assert!(matches!(
            validate_response(&tampered).into_result(&tampered),
            Err(Error::ChecksumMismatch { received: r, .. }) if r == received
        ));
    }

    #[test]
    fn decode_status_scenario() {
        let status = decode_running_status(&status_response()).unwrap();
        assert_eq!(status.pv_voltage, 20.0);
        assert_eq!(status.pv_current, 0.5);
        assert_eq!(status.pv_power, 10.0);
        assert_eq!(status.battery_voltage, 30.0);
        assert_eq!(status.temperature, 15.0);
        assert_eq!(status.load_current, 0.15);
        assert_eq!(status.daily_energy, 7.68);
        assert_eq!(status.total_energy, 3.9);
        assert_eq!(status.working_mode.label(), "Tracking");
        assert_eq!(status.error_code.label(), "No Error");
    }

    #[test]
    fn decode_status_is_idempotent() {
        let frame = status_response();
        assert_eq!(
            decode_running_status(&frame).unwrap(),
            decode_running_status(&frame).unwrap()
        );
    }

    #[test]
    fn decode_status_rejects_tampered_checksum() {
        let mut frame = status_response();
        frame[20] ^= 0xff;
        assert!(matches!(
            decode_running_status(&frame),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn unmapped_codes_are_unknown() {
        let mut payload = [0u8; 16];
        payload[10] = 0x7f;
        payload[11] = 0xee;
        let status = decode_running_status(&response(0x00, &payload)).unwrap();
        assert_eq!(status.working_mode, WorkingMode::Unknown(0x7f));
        assert_eq!(status.working_mode.to_string(), "Unknown");
        assert_eq!(status.error_code.to_string(), "Unknown");
    }

    #[test]
    fn decode_parameters_extracts_block() {
        let payload: Vec<u8> = (0x10..0x20).collect();
        let block = decode_parameter_response(&response(0x02, &payload)).unwrap();
        assert_eq!(&block[..], payload.as_slice());
    }

    #[test]
    fn decode_parameters_checks_echo() {
        let payload = [0u8; 16];
        assert!(matches!(
            decode_parameter_response(&response(0x00, &payload)),
            Err(Error::UnexpectedDataType {
                expected: 0x02,
                received: 0x00
            })
        ));
    }

    #[test]
    fn config_block_mutations() {
        let mut block = ConfigBlock::new([0xee; 16]);
        block.set_reset_control(true, false);
        assert_eq!(block[10], 0x01);
        block.set_reset_control(false, true);
        assert_eq!(block[10], 0x02);
        block.set_reset_control(true, true);
        assert_eq!(block.reset_control(), 0x03);

        block.set_charging_params(20, 3, 0x0123, 0x0456);
        assert_eq!(block[..4], [20, 3, 0x01, 0x23]);
        assert_eq!(block[8..10], [0x04, 0x56]);
        assert_eq!(block.const_voltage(), 0x0123);
        assert_eq!(block.load_undervoltage(), 0x0456);
        // untouched offsets keep their value
        assert_eq!(block[4..8], [0xee; 4]);

        block.set_load_output(1);
        assert_eq!(block.load_output(), 1);
        assert_eq!(block[12..], [0xee; 4]);
    }

    #[test]
    fn config_block_from_slice() {
        assert!(ConfigBlock::try_from(&[0u8; 16][..]).is_ok());
        assert!(matches!(
            ConfigBlock::try_from(&[0u8; 3][..]),
            Err(Error::InvalidInput { received: 3, .. })
        ));
    }

    #[test]
    fn write_reply_markers() {
        assert!(decode_write_reply(b"ACK").is_ok());
        assert!(decode_write_reply(&[0xaa, 0xbb, b'A', b'C', b'K', 0x00]).is_ok());
        assert!(matches!(
            decode_write_reply(b"NAK"),
            Err(Error::DeviceNak(marker)) if marker == "NAK"
        ));
        assert!(matches!(
            decode_write_reply(b"xxRAK"),
            Err(Error::DeviceNak(marker)) if marker == "RAK"
        ));
        assert!(matches!(decode_write_reply(&[]), Err(Error::NoResponse)));
        assert!(matches!(
            decode_write_reply(b"AC"),
            Err(Error::UnexpectedReply(_))
        ));
    }
}
