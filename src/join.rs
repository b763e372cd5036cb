//! Scan/join state machine: version check, credential push, scan or
//! cache load, register set, link-local resolution, and PANA join. Shared
//! by both the initial `connect()` and the supervisor's reconnect, since
//! the initial connect is simply the first reconnect.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::cache::{CachedConnection, ConnectionCache};
use crate::cancel::Cancel;
use crate::credentials::Credentials;
use crate::dispatcher::{require_ok, Dispatcher, DEFAULT_COMMAND_TIMEOUT};
use crate::error::{Error, Result};
use crate::tty::SerialLine;

const SCAN_TIMEOUT: Duration = Duration::from_secs(120);
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);
const POST_JOIN_SETTLE: Duration = Duration::from_millis(500);

/// Active-scan result, immutable once captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub channel_hex: String,
    pub pan_id_hex: String,
    pub mac_addr: String,
}

impl ScanResult {
    pub fn channel(&self) -> u8 {
        u8::from_str_radix(&self.channel_hex, 16).unwrap_or(0)
    }

    pub fn pan_id(&self) -> u16 {
        u16::from_str_radix(&self.pan_id_hex, 16).unwrap_or(0)
    }
}

pub struct Joined {
    pub scan: ScanResult,
    pub ipv6_addr: String,
}

pub enum ConnectOutcome {
    Joined(Joined),
    AuthFailed,
}

/// Runs the full connect sequence: version, credentials, scan-or-cache,
/// register set, link-local resolution, and PANA join. Used both for the
/// first connection and for every reconnect attempt.
pub fn connect<T: SerialLine>(
    line: &mut T,
    creds: &Credentials,
    cache: &ConnectionCache,
    cancel: &Cancel,
) -> Result<ConnectOutcome> {
    let mut dispatcher = Dispatcher::new(line);

    // 1. SKVER: dongle must be alive and answer EVER before anything else.
    let version_lines = dispatcher.send("SKVER", "OK", DEFAULT_COMMAND_TIMEOUT)?;
    if !version_lines.iter().any(|l| l.starts_with("EVER ")) {
        return Err(Error::NoVersionResponse);
    }
    info!(
        "dongle version: {}",
        version_lines
            .iter()
            .find(|l| l.starts_with("EVER "))
            .cloned()
            .unwrap_or_default()
    );

    // 2. Credentials.
    require_ok(&dispatcher.send(
        &format!("SKSETRBID {}", creds.broute_id),
        "OK",
        DEFAULT_COMMAND_TIMEOUT,
    )?)?;
    require_ok(&dispatcher.send(
        &format!("SKSETPWD C {}", creds.broute_password),
        "OK",
        DEFAULT_COMMAND_TIMEOUT,
    )?)?;

    // 3. Enable RSSI reporting in ERXUDP.
    require_ok(&dispatcher.send("SKSREG SA2 1", "OK", DEFAULT_COMMAND_TIMEOUT)?)?;

    // 4. Cache or active scan.
    let cached = cache.load();
    let (scan, mut ipv6_addr) = match &cached {
        Some(c) => {
            debug!("using cached connection info: channel={}", c.channel);
            (
                ScanResult {
                    channel_hex: c.channel.clone(),
                    pan_id_hex: c.pan_id.clone(),
                    mac_addr: c.addr.clone(),
                },
                c.ipv6_addr.clone(),
            )
        }
        None => (perform_scan(&mut dispatcher, creds.scan_duration)?, None),
    };

    // 5. Apply channel/PAN ID.
    require_ok(&dispatcher.send(
        &format!("SKSREG S2 {}", scan.channel_hex),
        "OK",
        DEFAULT_COMMAND_TIMEOUT,
    )?)?;
    require_ok(&dispatcher.send(
        &format!("SKSREG S3 {}", scan.pan_id_hex),
        "OK",
        DEFAULT_COMMAND_TIMEOUT,
    )?)?;

    // 6. Resolve link-local address if not already known.
    if ipv6_addr.is_none() {
        ipv6_addr = Some(resolve_link_local(&mut dispatcher, &scan.mac_addr)?);
    }
    let ipv6_addr = ipv6_addr.expect("resolved above");

    // 7. PANA join.
    match join_pana(&mut dispatcher, &ipv6_addr, cancel)? {
        JoinResult::Joined => {}
        JoinResult::AuthFailed => {
            cache.delete();
            return Ok(ConnectOutcome::AuthFailed);
        }
        JoinResult::Timeout => {
            return Err(Error::Fatal("SKJOIN timed out".to_string()));
        }
        JoinResult::Cancelled => {
            return Err(Error::Fatal("connect cancelled during SKJOIN".to_string()));
        }
    }

    // 8. Settle and discard unsolicited notifications emitted during join.
    cancel.sleep(POST_JOIN_SETTLE);
    dispatcher.drain();

    // 9. Persist the cache (write happens only after a successful join).
    cache.save(&CachedConnection {
        channel: scan.channel_hex.clone(),
        pan_id: scan.pan_id_hex.clone(),
        addr: scan.mac_addr.clone(),
        ipv6_addr: Some(ipv6_addr.clone()),
    })
    .unwrap_or_else(|e| warn!("failed to write connection cache: {}", e));

    Ok(ConnectOutcome::Joined(Joined { scan, ipv6_addr }))
}

fn perform_scan<T: SerialLine>(
    dispatcher: &mut Dispatcher<T>,
    scan_duration: u8,
) -> Result<ScanResult> {
    let lines = dispatcher.send(
        &format!("SKSCAN 2 FFFFFFFF {:X} 0", scan_duration),
        "EVENT 22",
        SCAN_TIMEOUT,
    )?;

    let mut channel = None;
    let mut pan_id = None;
    let mut addr = None;
    for line in &lines {
        let trimmed = line.trim_start();
        if let Some(v) = trimmed.strip_prefix("Channel:") {
            channel = Some(v.trim().to_string());
        } else if let Some(v) = trimmed.strip_prefix("Pan ID:") {
            pan_id = Some(v.trim().to_string());
        } else if let Some(v) = trimmed.strip_prefix("Addr:") {
            addr = Some(v.trim().to_string());
        }
    }

    match (channel, pan_id, addr) {
        (Some(channel_hex), Some(pan_id_hex), Some(mac_addr)) => Ok(ScanResult {
            channel_hex,
            pan_id_hex,
            mac_addr,
        }),
        _ => Err(Error::Fatal("active scan found no smart meter".to_string())),
    }
}

fn resolve_link_local<T: SerialLine>(
    dispatcher: &mut Dispatcher<T>,
    mac_addr: &str,
) -> Result<String> {
    let lines = dispatcher.send(
        &format!("SKLL64 {}", mac_addr),
        "FE80:",
        DEFAULT_COMMAND_TIMEOUT,
    )?;
    lines
        .into_iter()
        .find(|l| l.starts_with("FE80:"))
        .ok_or_else(|| Error::Fatal("SKLL64 did not return a link-local address".to_string()))
}

enum JoinResult {
    Joined,
    AuthFailed,
    Timeout,
    Cancelled,
}

fn join_pana<T: SerialLine>(
    dispatcher: &mut Dispatcher<T>,
    ipv6_addr: &str,
    cancel: &Cancel,
) -> Result<JoinResult> {
    dispatcher.write_command(&format!("SKJOIN {}", ipv6_addr))?;
    let deadline = Instant::now() + JOIN_TIMEOUT;
    loop {
        match dispatcher.read_line_before(deadline, cancel)? {
            None => {
                if cancel.is_set() {
                    return Ok(JoinResult::Cancelled);
                }
                return Ok(JoinResult::Timeout);
            }
            Some(line) => {
                if line.contains("EVENT 25") {
                    info!("PANA join succeeded");
                    return Ok(JoinResult::Joined);
                }
                if line.contains("EVENT 24") {
                    warn!("PANA join failed (EVENT 24)");
                    return Ok(JoinResult::AuthFailed);
                }
            }
        }
    }
}
