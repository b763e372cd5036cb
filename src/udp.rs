//! UDP exchange and response demultiplexer: wraps `SKSENDTO`, parses
//! `ERXUDP`/`EVENT 21`/`EVENT 29` lines, and matches a response to the one
//! outstanding ECHONET Lite request.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::cancel::Cancel;
use crate::dispatcher::Dispatcher;
use crate::echonet_lite::{decode_response, EFrame};
use crate::error::Result;
use crate::tty::SerialLine;

/// 3610, the ECHONET Lite UDP port, as the dongle's hex register value.
pub const ECHONET_UDP_PORT_HEX: &str = "0E1A";
pub const UDP_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErxUdp {
    pub dest: String,
    pub rssi_dbm: Option<i16>,
    pub data_hex: String,
}

/// Splits an `ERXUDP` line, handling both the RSSI-bearing layout (`SA2 1`)
/// and the shorter layout emitted when RSSI reporting is disabled.
pub fn parse_erxudp(line: &str) -> Option<ErxUdp> {
    let parts: Vec<&str> = line.split(' ').collect();
    if parts.first().copied() != Some("ERXUDP") {
        return None;
    }
    if parts.len() >= 11 {
        let dest = parts[2].to_string();
        let rssi_dbm = u8::from_str_radix(parts[6], 16)
            .ok()
            .map(|byte| byte as i16 - 107);
        let data_hex = parts[10].to_string();
        Some(ErxUdp {
            dest,
            rssi_dbm,
            data_hex,
        })
    } else if parts.len() >= 10 {
        let dest = parts[2].to_string();
        let data_hex = parts[9].to_string();
        Some(ErxUdp {
            dest,
            rssi_dbm: None,
            data_hex,
        })
    } else {
        None
    }
}

enum LineEvent {
    ErxUdp(ErxUdp),
    SessionLost,
    TransmitResult { ok: bool },
    Other,
}

fn classify_line(line: &str) -> LineEvent {
    if line.starts_with("ERXUDP") {
        match parse_erxudp(line) {
            Some(erx) => LineEvent::ErxUdp(erx),
            None => LineEvent::Other,
        }
    } else if line.contains("EVENT 29") {
        LineEvent::SessionLost
    } else if line.contains("EVENT 21") {
        let ok = line
            .split_whitespace()
            .last()
            .and_then(|r| u8::from_str_radix(r, 16).ok())
            .map(|v| v == 0)
            .unwrap_or(false);
        LineEvent::TransmitResult { ok }
    } else {
        LineEvent::Other
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeResult {
    Matched { edt_hex: String, rssi_dbm: Option<i16> },
    SessionLost,
    TransmitFailed,
    Timeout,
    Cancelled,
}

/// Sends an ECHONET Lite Get for `epc` over `SKSENDTO` and waits up to the
/// default deadline for a matching `ERXUDP`. Never retries; a timeout, a
/// lost session, or a failed local transmit are all handed back for the
/// supervisor to act on.
pub fn request_get<T: SerialLine>(
    dispatcher: &mut Dispatcher<T>,
    ipv6_addr: &str,
    epc: u8,
    cancel: &Cancel,
) -> Result<ExchangeResult> {
    request_get_with_timeout(dispatcher, ipv6_addr, epc, UDP_RESPONSE_TIMEOUT, cancel)
}

pub fn request_get_with_timeout<T: SerialLine>(
    dispatcher: &mut Dispatcher<T>,
    ipv6_addr: &str,
    epc: u8,
    timeout: Duration,
    cancel: &Cancel,
) -> Result<ExchangeResult> {
    let frame = EFrame::encode_get(epc);
    let payload = frame.as_bytes();
    let header = format!(
        "SKSENDTO 1 {} {} 1 0 {:04X} ",
        ipv6_addr,
        ECHONET_UDP_PORT_HEX,
        payload.len()
    );
    dispatcher.write_binary_command(&header, &payload)?;

    let deadline = Instant::now() + timeout;
    loop {
        match dispatcher.read_line_before(deadline, cancel)? {
            None => {
                if cancel.is_set() {
                    return Ok(ExchangeResult::Cancelled);
                }
                return Ok(ExchangeResult::Timeout);
            }
            Some(line) => match classify_line(&line) {
                LineEvent::SessionLost => {
                    warn!("PANA session terminated by peer (EVENT 29)");
                    return Ok(ExchangeResult::SessionLost);
                }
                LineEvent::TransmitResult { ok } => {
                    if !ok {
                        warn!("local SKSENDTO transmit failed (EVENT 21)");
                        return Ok(ExchangeResult::TransmitFailed);
                    }
                    debug!("local transmit acknowledged (EVENT 21, result 00)");
                }
                LineEvent::ErxUdp(erx) => {
                    if erx.dest.starts_with("FF02:") {
                        debug!("discarding multicast ERXUDP to {}", erx.dest);
                        continue;
                    }
                    if !erx.data_hex.starts_with("1081") {
                        debug!("discarding non-ECHONET-Lite ERXUDP payload");
                        continue;
                    }
                    if let Some(edt_hex) = decode_response(&erx.data_hex, epc) {
                        return Ok(ExchangeResult::Matched {
                            edt_hex,
                            rssi_dbm: erx.rssi_dbm,
                        });
                    }
                    debug!("ERXUDP did not carry EPC {:#04X}, still waiting", epc);
                }
                LineEvent::Other => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::tty::ScriptedSerial;

    #[test]
    fn parses_sa2_enabled_erxudp() {
        let line = "ERXUDP FE80::1 FE80::2 0E1A 0E1A 001D129012345678 74 1 1 000E 1081000102880105FF017201E704000003E8";
        let erx = parse_erxudp(line).expect("must parse");
        assert_eq!(erx.dest, "FE80::2");
        assert_eq!(erx.rssi_dbm, Some(0x74 - 107));
        assert_eq!(erx.data_hex, "1081000102880105FF017201E704000003E8");
    }

    #[test]
    fn parses_sa2_disabled_erxudp_without_rssi() {
        let line = "ERXUDP FE80::1 FE80::2 0E1A 0E1A 001D129012345678 1 1 000E 1081000102880105FF017201E704000003E8";
        let erx = parse_erxudp(line).expect("must parse");
        assert_eq!(erx.rssi_dbm, None);
        assert_eq!(erx.data_hex, "1081000102880105FF017201E704000003E8");
    }

    #[test]
    fn multicast_destination_is_discarded_and_request_stays_pending() {
        let mut line = ScriptedSerial::new(vec![
            "ERXUDP FE80::1 FF02::1 0E1A 0E1A 001D129012345678 74 1 0 0014 1081000102880105FF0172020000000000000000",
        ]);
        let mut dispatcher = Dispatcher::new(&mut line);
        let result = request_get_with_timeout(
            &mut dispatcher,
            "FE80::2",
            crate::echonet_lite::EPC_INSTANT_POWER,
            Duration::from_millis(150),
            &Cancel::new(),
        )
        .unwrap();
        assert_eq!(result, ExchangeResult::Timeout);
    }

    #[test]
    fn non_matching_epc_leaves_request_pending() {
        let resp = "1081000102880105FF017201E00400001234";
        let mut line = ScriptedSerial::new(vec![&format!(
            "ERXUDP FE80::1 FE80::2 0E1A 0E1A 001D129012345678 74 1 1 0012 {}",
            resp
        )]);
        let mut dispatcher = Dispatcher::new(&mut line);
        let result = request_get_with_timeout(
            &mut dispatcher,
            "FE80::2",
            crate::echonet_lite::EPC_INSTANT_POWER,
            Duration::from_millis(150),
            &Cancel::new(),
        )
        .unwrap();
        assert_eq!(result, ExchangeResult::Timeout);
    }

    #[test]
    fn event29_returns_immediately_without_waiting_for_deadline() {
        let mut line = ScriptedSerial::new(vec!["EVENT 29 FE80::2"]);
        let mut dispatcher = Dispatcher::new(&mut line);
        let started = Instant::now();
        let result = request_get(
            &mut dispatcher,
            "FE80::2",
            crate::echonet_lite::EPC_INSTANT_POWER,
            &Cancel::new(),
        )
        .unwrap();
        assert_eq!(result, ExchangeResult::SessionLost);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn event21_nonzero_result_is_transmit_failure() {
        let mut line = ScriptedSerial::new(vec!["EVENT 21 FE80::2 0 02"]);
        let mut dispatcher = Dispatcher::new(&mut line);
        let result = request_get(
            &mut dispatcher,
            "FE80::2",
            crate::echonet_lite::EPC_INSTANT_POWER,
            &Cancel::new(),
        )
        .unwrap();
        assert_eq!(result, ExchangeResult::TransmitFailed);
    }

    #[test]
    fn matches_instant_power_and_reports_rssi() {
        let mut line = ScriptedSerial::new(vec![
            "EVENT 21 FE80::2 0 00",
            "ERXUDP FE80::1 FE80::2 0E1A 0E1A 001D129012345678 74 1 1 000E 1081000102880105FF017201E704000003E8",
        ]);
        let mut dispatcher = Dispatcher::new(&mut line);
        let result = request_get(
            &mut dispatcher,
            "FE80::2",
            crate::echonet_lite::EPC_INSTANT_POWER,
            &Cancel::new(),
        )
        .unwrap();
        assert_eq!(
            result,
            ExchangeResult::Matched {
                edt_hex: "000003E8".to_string(),
                rssi_dbm: Some(0x74 - 107),
            }
        );
    }

    #[test]
    fn binary_sendto_header_has_no_trailing_crlf() {
        let mut line = ScriptedSerial::new(vec!["EVENT 29 FE80::2"]);
        let mut dispatcher = Dispatcher::new(&mut line);
        request_get(
            &mut dispatcher,
            "FE80::2",
            crate::echonet_lite::EPC_INSTANT_POWER,
            &Cancel::new(),
        )
        .unwrap();
        let written = String::from_utf8_lossy(&line.written);
        assert!(written.starts_with("SKSENDTO 1 FE80::2 0E1A 1 0 "));
        assert!(!written.contains("\r\n"));
    }

    #[test]
    fn cancelling_returns_before_the_deadline() {
        let mut line = ScriptedSerial::new(vec![]);
        let mut dispatcher = Dispatcher::new(&mut line);
        let cancel = Cancel::new();
        cancel.set();
        let started = Instant::now();
        let result = request_get_with_timeout(
            &mut dispatcher,
            "FE80::2",
            crate::echonet_lite::EPC_INSTANT_POWER,
            Duration::from_secs(5),
            &cancel,
        )
        .unwrap();
        assert_eq!(result, ExchangeResult::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
