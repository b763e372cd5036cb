// Reference: ECHONET-Lite_Ver.1.12_02.pdf
// https://echonet.jp/wp/wp-content/uploads/pdf/General/Standard/ECHONET_lite_V1_12_jp/ECHONET-Lite_Ver.1.12_02.pdf
//
//! ECHONET Lite frame codec: builds Get/SetC request frames and parses the
//! controller-facing low-voltage smart meter properties out of response
//! frames.

use num_enum::{TryFromPrimitive, TryFromPrimitiveError};
use std::convert::TryFrom;

#[derive(Debug)]
pub struct FrameError {
    description: String,
}

impl std::error::Error for FrameError {}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::result::Result<(), std::fmt::Error> {
        f.write_str(&self.description)
    }
}

impl<T: TryFromPrimitive> From<TryFromPrimitiveError<T>> for FrameError {
    fn from(error: TryFromPrimitiveError<T>) -> Self {
        Self {
            description: format!("{:?}", error),
        }
    }
}

pub type FrameResult<T> = std::result::Result<T, FrameError>;

pub type EHD1 = u8;
pub const ECHONET_LITE_HEADER1: EHD1 = 0x10;

#[derive(Clone, Copy, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum EHD2 {
    Format1 = 0x81,
    Format2 = 0x82,
}

pub type TID = u16;

/// Fixed transaction ID; this core keeps one outstanding request at a
/// time, so TIDs need not be disambiguated.
pub const FIXED_TID: TID = 0x0001;

/// Controller EOJ (05FF01), always the frame's SEOJ.
pub const CONTROLLER_EOJ: EOJ = EOJ {
    x1: 0x05,
    x2: 0xFF,
    x3: 0x01,
};

/// Low-voltage smart electricity meter EOJ (028801), always the frame's DEOJ.
pub const METER_EOJ: EOJ = EOJ {
    x1: 0x02,
    x2: 0x88,
    x3: 0x01,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EOJ {
    /// class group code
    pub x1: u8,
    /// class code
    pub x2: u8,
    /// instance code
    pub x3: u8,
}

impl EOJ {
    fn as_bytes(&self) -> [u8; 3] {
        [self.x1, self.x2, self.x3]
    }
}

#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum ESV {
    // Requests
    SetI = 0x60,
    SetC = 0x61,
    Get = 0x62,
    INF_REQ = 0x63,
    SetGet = 0x6E,
    // Responses
    SetCRes = 0x71,
    GetRes = 0x72,
    SetCSNA = 0x51,
    GetSNA = 0x52,
}

#[derive(Debug)]
pub struct EProp {
    /// echonet property code
    pub epc: u8,
    /// property data counter
    pub pdc: u8,
    /// echonet data
    pub edt: Vec<u8>,
}

impl EProp {
    fn as_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![self.epc, self.pdc];
        bytes.extend(self.edt.iter());
        bytes
    }
}

#[derive(Debug)]
pub enum EDATA {
    Format1 {
        /// sender object
        seoj: EOJ,
        /// dest object
        deoj: EOJ,
        /// echonet service
        esv: ESV,
        /// object property counter
        /// `props.len() == opc`
        opc: u8,
        props: Vec<EProp>,
    },
    Format2(Vec<u8>),
}

#[derive(Debug)]
pub struct EFrame {
    pub ehd1: EHD1,
    pub ehd2: EHD2,
    pub tid: TID,
    pub edata: EDATA,
}

impl EFrame {
    /// Builds a Get request frame for a single EPC. This core never
    /// batches properties, so `opc` is always 1.
    pub fn encode_get(epc: u8) -> Self {
        EFrame {
            ehd1: ECHONET_LITE_HEADER1,
            ehd2: EHD2::Format1,
            tid: FIXED_TID,
            edata: EDATA::Format1 {
                seoj: CONTROLLER_EOJ,
                deoj: METER_EOJ,
                esv: ESV::Get,
                opc: 1,
                props: vec![EProp {
                    epc,
                    pdc: 0,
                    edt: Vec::new(),
                }],
            },
        }
    }

    /// Builds a SetC request frame for a single EPC/EDT pair.
    pub fn encode_setc(epc: u8, edt: Vec<u8>) -> Self {
        let pdc = edt.len() as u8;
        EFrame {
            ehd1: ECHONET_LITE_HEADER1,
            ehd2: EHD2::Format1,
            tid: FIXED_TID,
            edata: EDATA::Format1 {
                seoj: CONTROLLER_EOJ,
                deoj: METER_EOJ,
                esv: ESV::SetC,
                opc: 1,
                props: vec![EProp { epc, pdc, edt }],
            },
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> FrameResult<Self> {
        let ehd2 = EHD2::try_from(bytes[1])?;
        let edata: EDATA;
        match ehd2 {
            EHD2::Format1 => {
                let opc = bytes[11];
                let mut props = vec![];
                let mut tail_cursor = 12;
                for _ in 0..opc {
                    let epc = bytes[tail_cursor];
                    tail_cursor += 1;
                    let pdc = bytes[tail_cursor];
                    tail_cursor += 1;
                    let edt = bytes[tail_cursor..tail_cursor + pdc as usize].to_vec();
                    tail_cursor += pdc as usize;
                    props.push(EProp { epc, pdc, edt });
                }

                edata = EDATA::Format1 {
                    seoj: EOJ {
                        x1: bytes[4],
                        x2: bytes[5],
                        x3: bytes[6],
                    },
                    deoj: EOJ {
                        x1: bytes[7],
                        x2: bytes[8],
                        x3: bytes[9],
                    },
                    esv: ESV::try_from(bytes[10])?,
                    opc,
                    props,
                }
            }
            EHD2::Format2 => {
                edata = EDATA::Format2(bytes[4..].into());
            }
        }
        Ok(Self {
            ehd1: bytes[0],
            ehd2,
            tid: TID::from_be_bytes([bytes[2], bytes[3]]),
            edata,
        })
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![self.ehd1, self.ehd2 as u8];
        bytes.extend_from_slice(&self.tid.to_be_bytes());
        match &self.edata {
            EDATA::Format1 {
                seoj,
                deoj,
                esv,
                opc,
                props,
            } => {
                bytes.extend_from_slice(&seoj.as_bytes());
                bytes.extend_from_slice(&deoj.as_bytes());
                bytes.push(*esv as u8);
                bytes.push(*opc);
                for prop in props {
                    bytes.extend(prop.as_bytes());
                }
            }
            EDATA::Format2(data) => {
                bytes.extend(data);
            }
        }
        bytes
    }
}

// --- EPC property codes this core understands ---

pub const EPC_INSTANT_POWER: u8 = 0xE7;
pub const EPC_INSTANT_CURRENT: u8 = 0xE8;
pub const EPC_CUMULATIVE_ENERGY: u8 = 0xE0;
pub const EPC_CUMULATIVE_ENERGY_REVERSE: u8 = 0xE3;
pub const EPC_ENERGY_UNIT: u8 = 0xE1;
pub const EPC_FIXED_ENERGY: u8 = 0xEA;

/// Sentinel raw value for E0/E3 meaning "overflow/unavailable".
pub const CUMULATIVE_ENERGY_UNAVAILABLE: u32 = 0xFFFF_FFFE;

/// A decoded, typed ECHONET Lite property value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    InstantPower(i32),
    /// R-phase / T-phase current, units of 0.1 A.
    Current { r: i16, t: i16 },
    CumulativeEnergy(u32),
    CumulativeEnergyReverse(u32),
    UnitCode(u8),
    FixedEnergy {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        value: u32,
    },
}

/// Maps an E1 unit code to its kWh multiplier. An unknown code falls back
/// to `0.1` and is logged.
pub fn unit_multiplier(code: u8) -> f32 {
    match code {
        0x00 => 1.0,
        0x01 => 0.1,
        0x02 => 0.01,
        0x03 => 0.001,
        0x04 => 0.0001,
        0x0A => 10.0,
        0x0B => 100.0,
        0x0C => 1000.0,
        0x0D => 10000.0,
        other => {
            log::warn!(
                "unknown energy unit code {:#04X}, falling back to multiplier 0.1",
                other
            );
            0.1
        }
    }
}

fn hex_to_bytes(s: &str) -> std::result::Result<Vec<u8>, crate::error::Error> {
    if s.len() % 2 != 0 {
        return Err(crate::error::Error::Decode(format!(
            "odd-length EDT hex: {:?}",
            s
        )));
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    for chunk in s.as_bytes().chunks(2) {
        let byte_str = std::str::from_utf8(chunk)
            .map_err(|_| crate::error::Error::Decode(format!("non-UTF8 EDT hex: {:?}", s)))?;
        out.push(u8::from_str_radix(byte_str, 16)?);
    }
    Ok(out)
}

/// Interprets a decoded EDT hex string for the given EPC. A malformed EDT
/// (wrong length, in particular) is reported as a decode error without
/// tearing down the session.
pub fn interpret(epc: u8, edt_hex: &str) -> std::result::Result<Reading, crate::error::Error> {
    let bytes = hex_to_bytes(edt_hex)?;
    let wrong_length = |want: usize| {
        crate::error::Error::Decode(format!(
            "EPC {:#04X}: expected {} EDT bytes, got {}",
            epc,
            want,
            bytes.len()
        ))
    };
    match epc {
        EPC_INSTANT_POWER => {
            if bytes.len() != 4 {
                return Err(wrong_length(4));
            }
            let mut b = [0u8; 4];
            b.copy_from_slice(&bytes);
            Ok(Reading::InstantPower(i32::from_be_bytes(b)))
        }
        EPC_INSTANT_CURRENT => {
            if bytes.len() != 4 {
                return Err(wrong_length(4));
            }
            let r = i16::from_be_bytes([bytes[0], bytes[1]]);
            let t = i16::from_be_bytes([bytes[2], bytes[3]]);
            Ok(Reading::Current { r, t })
        }
        EPC_CUMULATIVE_ENERGY => {
            if bytes.len() != 4 {
                return Err(wrong_length(4));
            }
            let mut b = [0u8; 4];
            b.copy_from_slice(&bytes);
            Ok(Reading::CumulativeEnergy(u32::from_be_bytes(b)))
        }
        EPC_CUMULATIVE_ENERGY_REVERSE => {
            if bytes.len() != 4 {
                return Err(wrong_length(4));
            }
            let mut b = [0u8; 4];
            b.copy_from_slice(&bytes);
            Ok(Reading::CumulativeEnergyReverse(u32::from_be_bytes(b)))
        }
        EPC_ENERGY_UNIT => {
            if bytes.len() != 1 {
                return Err(wrong_length(1));
            }
            Ok(Reading::UnitCode(bytes[0]))
        }
        EPC_FIXED_ENERGY => {
            if bytes.len() != 11 {
                return Err(wrong_length(11));
            }
            let year = u16::from_be_bytes([bytes[0], bytes[1]]);
            let mut vb = [0u8; 4];
            vb.copy_from_slice(&bytes[7..11]);
            Ok(Reading::FixedEnergy {
                year,
                month: bytes[2],
                day: bytes[3],
                hour: bytes[4],
                minute: bytes[5],
                second: bytes[6],
                value: u32::from_be_bytes(vb),
            })
        }
        other => Err(crate::error::Error::Decode(format!(
            "no interpreter for EPC {:#04X}",
            other
        ))),
    }
}

/// Parses an ERXUDP payload (hex string) into the EDT for `expected_epc`.
/// Returns `None` if the payload isn't a recognizable response to our
/// request (wrong header, wrong ESV, or the property isn't present); this
/// is a data-flow result, not an error, because a stray frame must not
/// disturb the outstanding request.
pub fn decode_response(payload_hex: &str, expected_epc: u8) -> Option<String> {
    let payload_hex = payload_hex.trim();
    if payload_hex.len() < 24 {
        return None;
    }
    if &payload_hex[0..4] != "1081" {
        return None;
    }
    let esv = &payload_hex[20..22];
    if !matches!(esv, "72" | "71" | "52") {
        return None;
    }
    let opc = u8::from_str_radix(&payload_hex[22..24], 16).ok()?;
    let mut pos = 24;
    for _ in 0..opc {
        if pos + 4 > payload_hex.len() {
            return None;
        }
        let epc = u8::from_str_radix(&payload_hex[pos..pos + 2], 16).ok()?;
        let pdc = u8::from_str_radix(&payload_hex[pos + 2..pos + 4], 16).ok()? as usize;
        let edt_start = pos + 4;
        let edt_end = edt_start + pdc * 2;
        if edt_end > payload_hex.len() {
            return None;
        }
        if epc == expected_epc {
            return Some(payload_hex[edt_start..edt_end].to_string());
        }
        pos = edt_end;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synth_response(epc: u8, edt_hex: &str) -> String {
        let pdc = edt_hex.len() / 2;
        format!(
            "10810001028801 05FF01 72 01{:02X}{:02X}{}",
            epc, pdc, edt_hex
        )
        .replace(' ', "")
    }

    #[test]
    fn codec_round_trip_all_epcs() {
        for (epc, edt) in [
            (EPC_CUMULATIVE_ENERGY, "00001234"),
            (EPC_CUMULATIVE_ENERGY_REVERSE, "00000001"),
            (EPC_INSTANT_POWER, "FFFFFED4"),
            (EPC_INSTANT_CURRENT, "00320019"),
            (
                EPC_FIXED_ENERGY,
                "07E90C1F17002A0000ABCD",
            ),
        ] {
            let resp = synth_response(epc, edt);
            let decoded = decode_response(&resp, epc).expect("must decode");
            assert_eq!(decoded.to_uppercase(), edt.to_uppercase());
        }
    }

    #[test]
    fn signed_instant_power() {
        assert_eq!(
            interpret(EPC_INSTANT_POWER, "FFFFFED4").unwrap(),
            Reading::InstantPower(-300)
        );
        assert_eq!(
            interpret(EPC_INSTANT_POWER, "000003E8").unwrap(),
            Reading::InstantPower(1000)
        );
        assert_eq!(
            interpret(EPC_INSTANT_POWER, "7FFFFFFF").unwrap(),
            Reading::InstantPower(2147483647)
        );
    }

    #[test]
    fn current_split() {
        assert_eq!(
            interpret(EPC_INSTANT_CURRENT, "00320019").unwrap(),
            Reading::Current { r: 50, t: 25 }
        );
        assert_eq!(
            interpret(EPC_INSTANT_CURRENT, "FFCE0032").unwrap(),
            Reading::Current { r: -50, t: 50 }
        );
    }

    #[test]
    fn unit_map_exact_and_fallback() {
        assert_eq!(unit_multiplier(0x00), 1.0);
        assert_eq!(unit_multiplier(0x01), 0.1);
        assert_eq!(unit_multiplier(0x02), 0.01);
        assert_eq!(unit_multiplier(0x03), 0.001);
        assert_eq!(unit_multiplier(0x04), 0.0001);
        assert_eq!(unit_multiplier(0x0A), 10.0);
        assert_eq!(unit_multiplier(0x0B), 100.0);
        assert_eq!(unit_multiplier(0x0C), 1000.0);
        assert_eq!(unit_multiplier(0x0D), 10000.0);
        assert_eq!(unit_multiplier(0xFF), 0.1);
    }

    #[test]
    fn non_matching_epc_is_discarded() {
        let resp = synth_response(EPC_CUMULATIVE_ENERGY, "00000001");
        assert!(decode_response(&resp, EPC_INSTANT_POWER).is_none());
    }

    #[test]
    fn rejects_short_or_wrong_header_payloads() {
        assert!(decode_response("1081000102880105FF0172", EPC_INSTANT_POWER).is_none());
        assert!(decode_response(
            &"2081".to_string() + &synth_response(EPC_INSTANT_POWER, "00000001")[4..],
            EPC_INSTANT_POWER
        )
        .is_none());
    }
}
