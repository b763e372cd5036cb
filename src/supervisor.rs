//! Session supervisor: owns the `Session` record, the pre-request
//! backoff/reconnect decision, and the timeout-retry-once escalation. The
//! initial connect is just the first reconnect, so `reconnect()` below
//! calls straight back into `join::connect`.

use std::time::Duration;

use log::{info, warn};

use crate::cache::ConnectionCache;
use crate::cancel::Cancel;
use crate::credentials::Credentials;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::join::{connect, ConnectOutcome, Joined};
use crate::tty::SerialLine;
use crate::udp::{self, ExchangeResult};

/// Consecutive missing responses before the supervisor forces a reconnect.
pub const TIMEOUT_RECONNECT_THRESHOLD: u8 = 2;
/// Ticks to sit out after a failed reconnect, about a minute at the 5s
/// poll cadence this core assumes.
pub const BACKOFF_TICKS_AFTER_FAILED_RECONNECT: u16 = 12;

const TERM_RESET_WAIT: Duration = Duration::from_secs(1);
const POST_RECONNECT_STABILIZE: Duration = Duration::from_secs(2);

/// Per-session mutable state. Lives for as long as one PANA join;
/// `reconnect()` on success produces a fresh one. The scan fields travel
/// with the session (not the client) because a reconnect re-derives them
/// too, even when it's just replaying the cached values.
#[derive(Debug, Clone)]
pub struct Session {
    pub channel_hex: String,
    pub pan_id_hex: String,
    pub mac_addr: String,
    pub ipv6_addr: String,
    pub last_rssi: Option<i16>,
    /// kWh multiplier from the E1 fetch, fetched once and memoised.
    pub cumulative_multiplier: Option<f32>,
    pub consecutive_timeouts: u8,
    pub needs_reconnect: bool,
    pub reconnect_backoff_ticks: u16,
}

impl Session {
    pub fn from_joined(joined: Joined) -> Self {
        Session {
            channel_hex: joined.scan.channel_hex,
            pan_id_hex: joined.scan.pan_id_hex,
            mac_addr: joined.scan.mac_addr,
            ipv6_addr: joined.ipv6_addr,
            last_rssi: None,
            cumulative_multiplier: None,
            consecutive_timeouts: 0,
            needs_reconnect: false,
            reconnect_backoff_ticks: 0,
        }
    }

    fn adopt(&mut self, joined: Joined) {
        self.channel_hex = joined.scan.channel_hex;
        self.pan_id_hex = joined.scan.pan_id_hex;
        self.mac_addr = joined.scan.mac_addr;
        self.ipv6_addr = joined.ipv6_addr;
        self.consecutive_timeouts = 0;
        self.needs_reconnect = false;
        self.reconnect_backoff_ticks = 0;
    }
}

/// Runs one ECHONET Lite Get for `epc` under full supervision: backoff
/// countdown, pending-reconnect handling, and (on a fresh timeout crossing
/// the threshold) an in-call reconnect-then-retry-once. Returns `Ok(None)`
/// for every non-fatal "no data this tick" outcome; the contract is
/// always a partial record rather than an error.
pub fn request<T: SerialLine>(
    line: &mut T,
    creds: &Credentials,
    cache: &ConnectionCache,
    session: &mut Session,
    epc: u8,
    cancel: &Cancel,
) -> Result<Option<String>> {
    request_with_timeout(
        line,
        creds,
        cache,
        session,
        epc,
        udp::UDP_RESPONSE_TIMEOUT,
        cancel,
    )
}

fn request_with_timeout<T: SerialLine>(
    line: &mut T,
    creds: &Credentials,
    cache: &ConnectionCache,
    session: &mut Session,
    epc: u8,
    udp_timeout: Duration,
    cancel: &Cancel,
) -> Result<Option<String>> {
    if session.reconnect_backoff_ticks > 0 {
        session.reconnect_backoff_ticks -= 1;
        return Ok(None);
    }
    if session.needs_reconnect || session.consecutive_timeouts >= TIMEOUT_RECONNECT_THRESHOLD {
        match reconnect(line, creds, cache, cancel)? {
            Some(joined) => session.adopt(joined),
            None => {
                session.reconnect_backoff_ticks = BACKOFF_TICKS_AFTER_FAILED_RECONNECT;
                return Ok(None);
            }
        }
    }
    request_once(line, creds, cache, session, epc, udp_timeout, true, cancel)
}

fn request_once<T: SerialLine>(
    line: &mut T,
    creds: &Credentials,
    cache: &ConnectionCache,
    session: &mut Session,
    epc: u8,
    udp_timeout: Duration,
    allow_retry: bool,
    cancel: &Cancel,
) -> Result<Option<String>> {
    let outcome = {
        let mut dispatcher = Dispatcher::new(line);
        udp::request_get_with_timeout(&mut dispatcher, &session.ipv6_addr, epc, udp_timeout, cancel)?
    };
    match outcome {
        ExchangeResult::Matched { edt_hex, rssi_dbm } => {
            session.consecutive_timeouts = 0;
            if rssi_dbm.is_some() {
                session.last_rssi = rssi_dbm;
            }
            Ok(Some(edt_hex))
        }
        ExchangeResult::SessionLost | ExchangeResult::TransmitFailed => {
            session.needs_reconnect = true;
            Ok(None)
        }
        ExchangeResult::Cancelled => Ok(None),
        ExchangeResult::Timeout => {
            session.consecutive_timeouts = session.consecutive_timeouts.saturating_add(1);
            if allow_retry && session.consecutive_timeouts >= TIMEOUT_RECONNECT_THRESHOLD {
                match reconnect(line, creds, cache, cancel)? {
                    Some(joined) => {
                        session.adopt(joined);
                        return request_once(
                            line,
                            creds,
                            cache,
                            session,
                            epc,
                            udp_timeout,
                            false,
                            cancel,
                        );
                    }
                    None => {
                        session.reconnect_backoff_ticks = BACKOFF_TICKS_AFTER_FAILED_RECONNECT;
                    }
                }
            }
            Ok(None)
        }
    }
}

/// `SKTERM`/`SKRESET`/drain, then re-runs the full join sequence against
/// the still-cached scan info, then settles for 2s and drains again.
/// Errors here are transport/protocol fatal and propagate to the caller.
fn reconnect<T: SerialLine>(
    line: &mut T,
    creds: &Credentials,
    cache: &ConnectionCache,
    cancel: &Cancel,
) -> Result<Option<Joined>> {
    {
        let mut dispatcher = Dispatcher::new(line);
        let _ = dispatcher.send("SKTERM", "OK", TERM_RESET_WAIT);
        let _ = dispatcher.send("SKRESET", "OK", TERM_RESET_WAIT);
        dispatcher.drain();
    }
    match connect(line, creds, cache, cancel)? {
        ConnectOutcome::Joined(joined) => {
            cancel.sleep(POST_RECONNECT_STABILIZE);
            Dispatcher::new(line).drain();
            info!("reconnect succeeded, rejoined at {}", joined.ipv6_addr);
            Ok(Some(joined))
        }
        ConnectOutcome::AuthFailed => {
            warn!("reconnect failed: authentication rejected, will back off");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedConnection;
    use crate::tty::ScriptedSerial;

    fn temp_cache_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("wisun_supervisor_test_{}_{}", std::process::id(), name));
        let _ = std::fs::remove_file(&p);
        p
    }

    fn test_creds() -> Credentials {
        Credentials::new("/dev/ttyFAKE".to_string(), "0".repeat(32), "1".repeat(12))
    }

    fn test_session(ipv6_addr: &str) -> Session {
        Session {
            channel_hex: "21".to_string(),
            pan_id_hex: "8888".to_string(),
            mac_addr: "001D12345678ABCD".to_string(),
            ipv6_addr: ipv6_addr.to_string(),
            last_rssi: None,
            cumulative_multiplier: None,
            consecutive_timeouts: 0,
            needs_reconnect: false,
            reconnect_backoff_ticks: 0,
        }
    }

    fn cached_for(path: &std::path::Path) -> ConnectionCache {
        let cache = ConnectionCache::new(path);
        cache
            .save(&CachedConnection {
                channel: "21".to_string(),
                pan_id: "8888".to_string(),
                addr: "001D12345678ABCD".to_string(),
                ipv6_addr: Some("FE80:0000:0000:0000:021D:1234:5678:ABCD".to_string()),
            })
            .unwrap();
        cache
    }

    #[test]
    fn matched_response_resets_timeouts_and_records_rssi() {
        let path = temp_cache_path("matched");
        let cache = cached_for(&path);
        let creds = test_creds();
        let mut session = test_session("FE80:0000:0000:0000:021D:1234:5678:ABCD");
        session.consecutive_timeouts = 1;

        let mut line = ScriptedSerial::new(vec![
            "ERXUDP FE80::1 FE80::2 0E1A 0E1A 001D129012345678 74 1 1 000E 1081000102880105FF017201E704000003E8",
        ]);
        let edt = request(
            &mut line,
            &creds,
            &cache,
            &mut session,
            crate::echonet_lite::EPC_INSTANT_POWER,
            &Cancel::new(),
        )
        .unwrap();
        assert_eq!(edt.as_deref(), Some("000003E8"));
        assert_eq!(session.consecutive_timeouts, 0);
        assert_eq!(session.last_rssi, Some(0x74 - 107));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn session_loss_sets_needs_reconnect_without_waiting_full_deadline() {
        let path = temp_cache_path("session_loss");
        let cache = cached_for(&path);
        let creds = test_creds();
        let mut session = test_session("FE80:0000:0000:0000:021D:1234:5678:ABCD");

        let mut line = ScriptedSerial::new(vec!["EVENT 29 FE80::2"]);
        let edt = request(
            &mut line,
            &creds,
            &cache,
            &mut session,
            crate::echonet_lite::EPC_INSTANT_POWER,
            &Cancel::new(),
        )
        .unwrap();
        assert!(edt.is_none());
        assert!(session.needs_reconnect);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn accumulated_timeouts_trigger_preflight_reconnect_and_recover() {
        let path = temp_cache_path("s4_recovery");
        let cache = cached_for(&path);
        let creds = test_creds();
        let mut session = test_session("FE80:0000:0000:0000:021D:1234:5678:ABCD");
        // Two prior misses already happened (e.g. in earlier polls); this
        // call's pre-flight check must reconnect before attempting any
        // further Get.
        session.consecutive_timeouts = TIMEOUT_RECONNECT_THRESHOLD;
        let short_timeout = Duration::from_millis(50);

        // The full reconnect transcript, followed by the reply to the
        // actual request this call goes on to make once rejoined.
        let mut line = ScriptedSerial::new(vec![
            "OK", // SKTERM
            "OK", // SKRESET
            "EVER 1.2.3",
            "OK", // SKVER sentinel
            "OK", // SKSETRBID
            "OK", // SKSETPWD
            "OK", // SKSREG SA2
            "OK", // SKSREG S2
            "OK", // SKSREG S3
            "EVENT 25", // SKJOIN (cache hit, no SKLL64)
            "ERXUDP FE80::1 FE80::2 0E1A 0E1A 001D129012345678 74 1 1 000E 1081000102880105FF017201E704000007D0",
        ]);
        let edt = request_with_timeout(
            &mut line,
            &creds,
            &cache,
            &mut session,
            crate::echonet_lite::EPC_INSTANT_POWER,
            short_timeout,
            &Cancel::new(),
        )
        .unwrap();
        assert_eq!(edt.as_deref(), Some("000007D0"));
        assert!(!session.needs_reconnect);
        assert_eq!(session.consecutive_timeouts, 0);
        assert_eq!(session.reconnect_backoff_ticks, 0);
        assert!(cache.load().is_some());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn backoff_window_counts_down_without_touching_serial_line() {
        let path = temp_cache_path("backoff");
        let cache = cached_for(&path);
        let creds = test_creds();
        let mut session = test_session("FE80:0000:0000:0000:021D:1234:5678:ABCD");
        session.reconnect_backoff_ticks = 3;

        let mut line = ScriptedSerial::new(vec![]);
        for expected_remaining in [2u16, 1, 0] {
            let edt = request(
                &mut line,
                &creds,
                &cache,
                &mut session,
                crate::echonet_lite::EPC_INSTANT_POWER,
                &Cancel::new(),
            )
            .unwrap();
            assert!(edt.is_none());
            assert_eq!(session.reconnect_backoff_ticks, expected_remaining);
        }
        assert!(line.written.is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn failed_reconnect_after_auth_rejection_enters_backoff() {
        let path = temp_cache_path("auth_fail_backoff");
        let cache = cached_for(&path);
        let creds = test_creds();
        let mut session = test_session("FE80:0000:0000:0000:021D:1234:5678:ABCD");
        session.needs_reconnect = true;

        let mut line = ScriptedSerial::new(vec![
            "OK", // SKTERM
            "OK", // SKRESET
            "EVER 1.2.3",
            "OK", // SKVER sentinel
            "OK", // SKSETRBID
            "OK", // SKSETPWD
            "OK", // SKSREG SA2
            "OK", // SKSREG S2
            "OK", // SKSREG S3
            "EVENT 24", // SKJOIN auth failure
        ]);
        let edt = request(
            &mut line,
            &creds,
            &cache,
            &mut session,
            crate::echonet_lite::EPC_INSTANT_POWER,
            &Cancel::new(),
        )
        .unwrap();
        assert!(edt.is_none());
        assert_eq!(session.reconnect_backoff_ticks, BACKOFF_TICKS_AFTER_FAILED_RECONNECT);
        assert!(cache.load().is_none());
        let _ = std::fs::remove_file(&path);
    }
}
