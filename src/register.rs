//! Typed records for the two readable registers and the bitfields inside them.
//!
//! Register map (offsets relative to the payload, all multi-byte values big-endian):
//!
//! | offset | type | content |
//! |---|---|---|
//! | 0  | u16 | pack voltage, 10 mV |
//! | 2  | i16 | pack current, 10 mA |
//! | 4  | u16 | balance capacity, 10 mAh |
//! | 6  | u16 | full capacity, 10 mAh |
//! | 8  | u16 | charge cycles |
//! | 10 | u16 | production date, packed |
//! | 12 | u16 | balance bitmap cells 0-15 |
//! | 14 | u16 | balance bitmap cells 16-31 |
//! | 16 | u16 | protection status |
//! | 18 | u8  | software version, 0.1 |
//! | 19 | u8  | state of charge, % |
//! | 20 | u8  | FET status |
//! | 21 | u8  | number of cells |
//! | 22 | u8  | number of NTC sensors |
//! | 23 | u16 | NTC readings, 0.1 K each |

use crate::protocol::{Frame, Register};
use crate::DecodeError;
use chrono::NaiveDate;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const REG_VOLTAGE_U16: usize = 0;
const REG_CURRENT_S16: usize = 2;
const REG_BALANCE_CAPACITY_U16: usize = 4;
const REG_FULL_CAPACITY_U16: usize = 6;
const REG_CHARGE_CYCLES_U16: usize = 8;
const REG_PRODUCTION_DATE_U16: usize = 10;
const REG_BALANCE_0_15_U16: usize = 12;
const REG_BALANCE_16_31_U16: usize = 14;
const REG_PROTECTION_U16: usize = 16;
const REG_SOFTWARE_VERSION_U8: usize = 18;
const REG_SOC_U8: usize = 19;
const REG_FET_STATUS_U8: usize = 20;
const REG_NUMBER_OF_CELLS_U8: usize = 21;
const REG_NTC_COUNT_U8: usize = 22;
const REG_NTC_READINGS_U16: usize = 23;

/// Balance bitmaps cover at most this many cells.
pub const MAX_BALANCE_CELLS: u8 = 32;

macro_rules! read_bit {
    ($value:expr,$position:expr) => {
        ($value >> $position) & 1 != 0
    };
}

fn read_u16(payload: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([payload[offset], payload[offset + 1]])
}

fn validate_len(register: Register, payload: &[u8], required: usize) -> Result<(), DecodeError> {
    if payload.len() < required {
        log::warn!(
            "Invalid payload size for {:?} - required={} received={}",
            register,
            required,
            payload.len()
        );
        return Err(DecodeError::PayloadTooShort {
            register: register as u8,
            required,
            actual: payload.len(),
        });
    }
    Ok(())
}

/// Decikelvin to degree Celsius, rounded half up to one decimal.
///
/// Every reading lands exactly on a .x5 boundary, so the rounding is done on
/// integers to keep the result independent of float representation. Half up
/// makes each raw step map to `raw - 2731` tenths of a degree.
fn decikelvin_to_celsius(raw: u16) -> f32 {
    let centi = raw as i32 * 10 - 27315;
    (centi + 5).div_euclid(10) as f32 / 10.0
}

/// `year = 2000 + bits 15:9`, `month = bits 8:5`, `day = bits 4:0`.
fn decode_date(packed: u16) -> Option<NaiveDate> {
    let year = 2000 + (packed >> 9) as i32;
    let month = ((packed >> 5) & 0x0f) as u32;
    let day = (packed & 0x1f) as u32;
    let date = NaiveDate::from_ymd_opt(year, month, day);
    if date.is_none() {
        log::warn!(
            "Invalid production date {packed:04X} - year={year} month={month} day={day}"
        );
    }
    date
}

macro_rules! faults {
    ($($variant:ident = $bit:expr, $accessor:ident, $text:literal;)*) => {
        /// Protection conditions reported in the status word, one bit each.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        pub enum Fault {
            $($variant,)*
        }

        impl Fault {
            pub const ALL: &'static [Fault] = &[$(Fault::$variant,)*];

            pub const fn bit(self) -> u8 {
                match self {
                    $(Fault::$variant => $bit,)*
                }
            }
        }

        impl fmt::Display for Fault {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match self {
                    $(Fault::$variant => f.write_str($text),)*
                }
            }
        }

        impl FaultFlags {
            $(
                pub fn $accessor(&self) -> bool {
                    self.is_set(Fault::$variant)
                }
            )*
        }
    };
}

faults! {
    SingleCellOvervoltage = 0, single_cell_overvoltage, "Single cell overvoltage";
    SingleCellUndervoltage = 1, single_cell_undervoltage, "Single cell undervoltage";
    PackOvervoltage = 2, pack_overvoltage, "Pack overvoltage";
    PackUndervoltage = 3, pack_undervoltage, "Pack undervoltage";
    ChargeOvertemperature = 4, charge_overtemperature, "Charging over temperature";
    ChargeUndertemperature = 5, charge_undertemperature, "Charging under temperature";
    DischargeOvertemperature = 6, discharge_overtemperature, "Discharging over temperature";
    DischargeUndertemperature = 7, discharge_undertemperature, "Discharging under temperature";
    ChargeOvercurrent = 8, charge_overcurrent, "Charge overcurrent";
    DischargeOvercurrent = 9, discharge_overcurrent, "Discharge overcurrent";
    ShortCircuit = 10, short_circuit, "Short circuit";
    FrontEndIcError = 11, front_end_ic_error, "Front-end detection IC error";
    SoftwareMosLock = 12, software_mos_lock, "Software locked MOS";
}

/// The protection status word. Bits 13-15 are reserved and never reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FaultFlags(u16);

impl FaultFlags {
    pub fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u16 {
        self.0
    }

    pub fn is_set(&self, fault: Fault) -> bool {
        read_bit!(self.0, fault.bit())
    }

    pub fn active(&self) -> impl Iterator<Item = Fault> + '_ {
        Fault::ALL.iter().copied().filter(|fault| self.is_set(*fault))
    }

    pub fn any(&self) -> bool {
        self.active().next().is_some()
    }
}

/// Per-cell balancing state, bit `n` set while cell `n` is being balanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BalanceFlags {
    bitmap: u32,
    cells: u8,
}

impl BalanceFlags {
    /// Cells 0-15 come from `low`; `high` is only consulted when there are more than 16 cells.
    pub fn new(low: u16, high: u16, cells: u8) -> Self {
        let cells = cells.min(MAX_BALANCE_CELLS);
        let mut bitmap = low as u32;
        if cells > 16 {
            bitmap |= (high as u32) << 16;
        }
        Self { bitmap, cells }
    }

    pub fn cells(&self) -> u8 {
        self.cells
    }

    pub fn is_balancing(&self, cell: u8) -> bool {
        cell < self.cells && read_bit!(self.bitmap, cell)
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.cells).map(|cell| read_bit!(self.bitmap, cell))
    }

    pub fn to_vec(&self) -> Vec<bool> {
        self.iter().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FetStatus {
    pub charging: bool,
    pub discharging: bool,
}

impl From<u8> for FetStatus {
    fn from(raw: u8) -> Self {
        Self {
            charging: read_bit!(raw, 0),
            discharging: read_bit!(raw, 1),
        }
    }
}

/// Software version in tenths, `0x17` reads as `2.3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct SoftwareVersion(pub u8);

impl fmt::Display for SoftwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.0 / 10, self.0 % 10)
    }
}

/// Decoded register 0x03.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StatusRecord {
    pub voltage: f32,
    pub current: f32, // positive=charging, negative=discharging
    pub balance_capacity: f32,
    pub full_capacity: f32,
    pub state_of_charge: u8,
    pub charge_cycles: u16,
    pub production_date: Option<NaiveDate>,
    pub balancing: BalanceFlags,
    pub faults: FaultFlags,
    pub software_version: SoftwareVersion,
    pub fet: FetStatus,
    pub cell_count: u8,
    pub temperature_sensor_count: u8,
    pub temperatures: Vec<f32>,
}

impl StatusRecord {
    /// Fixed part of the payload, NTC readings follow.
    pub const MIN_PAYLOAD_LENGTH: usize = REG_NTC_READINGS_U16;

    pub fn decode(frame: &Frame) -> Result<Self, DecodeError> {
        Self::decode_payload(frame.payload())
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, DecodeError> {
        validate_len(Register::Status, payload, Self::MIN_PAYLOAD_LENGTH)?;
        let cell_count = payload[REG_NUMBER_OF_CELLS_U8];
        let temperature_sensor_count = payload[REG_NTC_COUNT_U8];
        validate_len(
            Register::Status,
            payload,
            Self::MIN_PAYLOAD_LENGTH + 2 * temperature_sensor_count as usize,
        )?;

        let temperatures = (0..temperature_sensor_count as usize)
            .map(|i| {
                let temperature =
                    decikelvin_to_celsius(read_u16(payload, REG_NTC_READINGS_U16 + 2 * i));
                log::trace!("NTC #{} °C={}", i, temperature);
                temperature
            })
            .collect();

        Ok(Self {
            voltage: read_u16(payload, REG_VOLTAGE_U16) as f32 / 100.0,
            current: read_u16(payload, REG_CURRENT_S16) as i16 as f32 / 100.0,
            balance_capacity: read_u16(payload, REG_BALANCE_CAPACITY_U16) as f32 / 100.0,
            full_capacity: read_u16(payload, REG_FULL_CAPACITY_U16) as f32 / 100.0,
            state_of_charge: payload[REG_SOC_U8],
            charge_cycles: read_u16(payload, REG_CHARGE_CYCLES_U16),
            production_date: decode_date(read_u16(payload, REG_PRODUCTION_DATE_U16)),
            balancing: BalanceFlags::new(
                read_u16(payload, REG_BALANCE_0_15_U16),
                read_u16(payload, REG_BALANCE_16_31_U16),
                cell_count,
            ),
            faults: FaultFlags::new(read_u16(payload, REG_PROTECTION_U16)),
            software_version: SoftwareVersion(payload[REG_SOFTWARE_VERSION_U8]),
            fet: FetStatus::from(payload[REG_FET_STATUS_U8]),
            cell_count,
            temperature_sensor_count,
            temperatures,
        })
    }
}

/// Decoded register 0x04, one millivolt reading per cell.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CellVoltageRecord {
    pub millivolts: Vec<u16>,
}

impl CellVoltageRecord {
    /// The length byte carries two bytes per cell.
    pub fn decode(frame: &Frame) -> Result<Self, DecodeError> {
        let cell_count = frame.length() as usize / 2;
        let payload = frame.payload();
        validate_len(Register::CellVoltages, payload, cell_count * 2)?;
        let millivolts = (0..cell_count)
            .map(|cell| {
                let mv = read_u16(payload, cell * 2);
                log::trace!("Cell #{} mV={}", cell, mv);
                mv
            })
            .collect();
        Ok(Self { millivolts })
    }

    pub fn min(&self) -> Option<u16> {
        self.millivolts.iter().copied().min()
    }

    pub fn max(&self) -> Option<u16> {
        self.millivolts.iter().copied().max()
    }

    /// Difference between the highest and the lowest cell.
    pub fn spread(&self) -> Option<u16> {
        Some(self.max()? - self.min()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_frame;

    fn status_payload(ntc: &[u16]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1330u16.to_be_bytes()); // 13.30 V
        payload.extend_from_slice(&(-250i16).to_be_bytes()); // -2.50 A
        payload.extend_from_slice(&20000u16.to_be_bytes());
        payload.extend_from_slice(&30400u16.to_be_bytes());
        payload.extend_from_slice(&12u16.to_be_bytes());
        // 2023-05-17
        payload.extend_from_slice(&((23u16 << 9) | (5 << 5) | 17).to_be_bytes());
        payload.extend_from_slice(&0b1001u16.to_be_bytes());
        payload.extend_from_slice(&0u16.to_be_bytes());
        payload.extend_from_slice(&0x1401u16.to_be_bytes());
        payload.extend_from_slice(&[0x17, 66, 0b10, 4, ntc.len() as u8]);
        for raw in ntc {
            payload.extend_from_slice(&raw.to_be_bytes());
        }
        payload
    }

    #[test]
    fn decode_status() {
        let frame = encode_frame(0x03, &status_payload(&[2981, 2931])).unwrap();
        let status = StatusRecord::decode(&frame).unwrap();
        assert!((status.voltage - 13.30).abs() < 0.001);
        assert!((status.current + 2.50).abs() < 0.001);
        assert!((status.balance_capacity - 200.0).abs() < 0.001);
        assert!((status.full_capacity - 304.0).abs() < 0.001);
        assert_eq!(status.state_of_charge, 66);
        assert_eq!(status.charge_cycles, 12);
        assert_eq!(status.production_date, NaiveDate::from_ymd_opt(2023, 5, 17));
        assert_eq!(status.balancing.to_vec(), vec![true, false, false, true]);
        assert_eq!(status.software_version.to_string(), "2.3");
        assert_eq!(
            status.fet,
            FetStatus {
                charging: false,
                discharging: true
            }
        );
        assert_eq!(status.cell_count, 4);
        assert_eq!(status.temperature_sensor_count, 2);
        assert_eq!(status.temperatures, vec![25.0, 20.0]);
        assert_eq!(
            status.faults.active().collect::<Vec<_>>(),
            vec![
                Fault::SingleCellOvervoltage,
                Fault::ShortCircuit,
                Fault::SoftwareMosLock
            ]
        );
    }

    #[test]
    fn fault_accessors_follow_bit_table() {
        for (i, fault) in Fault::ALL.iter().enumerate() {
            assert_eq!(fault.bit() as usize, i);
            assert!(FaultFlags::new(1 << i).is_set(*fault));
        }
        assert_eq!(Fault::ALL.len(), 13);
        let flags = FaultFlags::new(1 << 9);
        assert!(flags.discharge_overcurrent());
        assert!(!flags.charge_overcurrent());
    }

    #[test]
    fn reserved_fault_bits_are_ignored() {
        let flags = FaultFlags::new(0xE000);
        assert!(!flags.any());
    }

    #[test]
    fn balance_flags_use_second_bitmap_above_16_cells() {
        let flags = BalanceFlags::new(0x8001, 0x0003, 18);
        let bits = flags.to_vec();
        assert_eq!(bits.len(), 18);
        assert!(bits[0]);
        assert!(bits[15]);
        assert!(bits[16]);
        assert!(bits[17]);
        assert!(!bits[1]);

        let flags = BalanceFlags::new(0x0001, 0xFFFF, 16);
        assert_eq!(flags.iter().filter(|b| *b).count(), 1);
        assert!(!flags.is_balancing(16));
    }

    #[test]
    fn balance_flags_cap_at_32_cells() {
        let flags = BalanceFlags::new(0xFFFF, 0xFFFF, 40);
        assert_eq!(flags.cells(), 32);
        assert!(flags.iter().all(|b| b));
    }

    #[test]
    fn temperature_conversion() {
        assert_eq!(decikelvin_to_celsius(2731), 0.0);
        assert_eq!(decikelvin_to_celsius(2732), 0.1);
        assert_eq!(decikelvin_to_celsius(2730), -0.1);
        assert_eq!(decikelvin_to_celsius(2582), -14.9);
        assert_eq!(decikelvin_to_celsius(2581), -15.0);
        assert_eq!(decikelvin_to_celsius(2331), -40.0);
        assert_eq!(decikelvin_to_celsius(2981), 25.0);
    }

    #[test]
    fn impossible_date_is_none() {
        assert_eq!(decode_date(0), None);
        assert_eq!(
            decode_date((20 << 9) | (2 << 5) | 29),
            NaiveDate::from_ymd_opt(2020, 2, 29)
        );
    }

    #[test]
    fn short_status_payload_is_reported() {
        let frame = encode_frame(0x03, &[0u8; 10]).unwrap();
        assert_eq!(
            StatusRecord::decode(&frame),
            Err(DecodeError::PayloadTooShort {
                register: 0x03,
                required: 23,
                actual: 10
            })
        );
    }

    #[test]
    fn missing_ntc_readings_are_reported() {
        let mut payload = status_payload(&[2981]);
        payload.truncate(payload.len() - 1);
        let frame = encode_frame(0x03, &payload).unwrap();
        assert!(matches!(
            StatusRecord::decode(&frame),
            Err(DecodeError::PayloadTooShort { required: 25, .. })
        ));
    }

    #[test]
    fn decode_cell_voltages() {
        let frame = encode_frame(
            0x04,
            &[0x0D, 0x05, 0x0D, 0x06, 0x0D, 0x07, 0x0D, 0x08],
        )
        .unwrap();
        let cells = CellVoltageRecord::decode(&frame).unwrap();
        assert_eq!(cells.millivolts, vec![3333, 3334, 3335, 3336]);
        assert_eq!(cells.min(), Some(3333));
        assert_eq!(cells.max(), Some(3336));
        assert_eq!(cells.spread(), Some(3));
    }

    #[test]
    fn empty_cell_voltage_payload() {
        let frame = encode_frame(0x04, &[]).unwrap();
        let cells = CellVoltageRecord::decode(&frame).unwrap();
        assert!(cells.millivolts.is_empty());
        assert_eq!(cells.spread(), None);
    }
}
