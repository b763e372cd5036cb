//! Public poll API: the crate's only entry point beyond the codec itself.
//! `WisunClient` owns the serial transport, the credentials, the
//! connection cache, and the supervisor's `Session`. `connect()` turns
//! those into a joined session, then `get_power_data`/`get_energy_data`/
//! `get_connection_info` each drive exactly one supervised request.

use crate::cache::ConnectionCache;
use crate::cancel::Cancel;
use crate::credentials::Credentials;
use crate::echonet_lite::{
    self, EPC_CUMULATIVE_ENERGY, EPC_CUMULATIVE_ENERGY_REVERSE, EPC_ENERGY_UNIT,
    EPC_FIXED_ENERGY, EPC_INSTANT_POWER, Reading,
};
use crate::error::{Error, Result};
use crate::join::{connect as join_connect, ConnectOutcome};
use crate::supervisor::{self, Session};
use crate::tty::{SerialLine, TTYPort};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerData {
    pub instant_power: Option<i32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnergyData {
    pub cumulative_energy: Option<u32>,
    pub cumulative_energy_reverse: Option<u32>,
    pub fixed_energy: Option<u32>,
    pub energy_unit: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RssiQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

/// Buckets a raw RSSI reading into a coarse signal-quality label.
fn rssi_quality(dbm: i16) -> RssiQuality {
    if dbm >= -60 {
        RssiQuality::Excellent
    } else if dbm >= -70 {
        RssiQuality::Good
    } else if dbm >= -80 {
        RssiQuality::Fair
    } else {
        RssiQuality::Poor
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub channel: u8,
    pub pan_id: u16,
    pub mac_addr: String,
    pub ipv6_addr: String,
    pub rssi: Option<i16>,
    pub rssi_quality: Option<RssiQuality>,
}

/// Owns one PANA session against one dongle. Not `Sync`; a caller sharing
/// this across threads is responsible for its own `Arc<Mutex<_>>`.
pub struct WisunClient<T: SerialLine> {
    line: T,
    creds: Credentials,
    cache: ConnectionCache,
    session: Option<Session>,
    cancel: Cancel,
}

impl WisunClient<TTYPort> {
    /// Opens the real dongle at `creds.device_path` and returns a client
    /// that still needs `connect()` called before any poll method works.
    pub fn open(creds: Credentials, cache: ConnectionCache) -> Result<Self> {
        let line = TTYPort::open(
            creds.device_path.clone(),
            creds.baud_rate,
            crate::tty::DEFAULT_READ_TIMEOUT,
        )?;
        Ok(WisunClient::from_line(line, creds, cache))
    }
}

impl<T: SerialLine> WisunClient<T> {
    pub fn from_line(line: T, creds: Credentials, cache: ConnectionCache) -> Self {
        WisunClient {
            line,
            creds,
            cache,
            session: None,
            cancel: Cancel::new(),
        }
    }

    /// Returns a handle that can interrupt an in-progress `connect()` or
    /// poll from another thread.
    pub fn cancel_handle(&self) -> Cancel {
        self.cancel.clone()
    }

    /// Runs the scan-or-cache/join sequence. Returns `Ok(false)` on an
    /// `EVENT 24` auth rejection (the cache has already been deleted);
    /// any other failure is a transport/protocol fatal `Error`.
    pub fn connect(&mut self) -> Result<bool> {
        self.cancel.clear();
        match join_connect(&mut self.line, &self.creds, &self.cache, &self.cancel)? {
            ConnectOutcome::Joined(joined) => {
                self.session = Some(Session::from_joined(joined));
                Ok(true)
            }
            ConnectOutcome::AuthFailed => {
                self.session = None;
                Ok(false)
            }
        }
    }

    /// Tears down the PANA session with `SKTERM` so the dongle is left in
    /// a clean state for the next `connect()`. Best-effort: a dongle that
    /// is already gone shouldn't stop the caller from dropping this client.
    pub fn close(&mut self) {
        let mut dispatcher = crate::dispatcher::Dispatcher::new(&mut self.line);
        let _ = dispatcher.send("SKTERM", "OK", std::time::Duration::from_secs(1));
        self.session = None;
    }

    fn session_mut(&mut self) -> Result<&mut Session> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::Fatal("not connected".to_string()))
    }

    /// One supervised Get for `epc`, decoded via [`echonet_lite::interpret`].
    /// A decode failure is logged and folded into `None` rather than
    /// propagated; a malformed EDT must not tear down the session.
    fn poll(&mut self, epc: u8) -> Result<Option<Reading>> {
        self.cancel.clear();
        let cancel = self.cancel.clone();
        let session = self.session_mut()?;
        let edt_hex =
            supervisor::request(&mut self.line, &self.creds, &self.cache, session, epc, &cancel)?;
        let edt_hex = match edt_hex {
            Some(hex) => hex,
            None => return Ok(None),
        };
        match echonet_lite::interpret(epc, &edt_hex) {
            Ok(reading) => Ok(Some(reading)),
            Err(e) => {
                log::warn!("discarding malformed EDT for EPC {:#04X}: {}", epc, e);
                Ok(None)
            }
        }
    }

    /// `{instant_power: i32 | null}`.
    pub fn get_power_data(&mut self) -> Result<PowerData> {
        let instant_power = match self.poll(EPC_INSTANT_POWER)? {
            Some(Reading::InstantPower(v)) => Some(v),
            _ => None,
        };
        Ok(PowerData { instant_power })
    }

    /// `{cumulative_energy, cumulative_energy_reverse, fixed_energy,
    /// energy_unit}`, all nullable. `E1` is fetched once per session and
    /// memoised on the `Session`. The `0xFFFFFFFE` overflow sentinel on
    /// `E0`/`E3` maps to `null` here, not in the codec, which reports the
    /// raw value faithfully.
    pub fn get_energy_data(&mut self) -> Result<EnergyData> {
        let cumulative_energy = match self.poll(EPC_CUMULATIVE_ENERGY)? {
            Some(Reading::CumulativeEnergy(v))
                if v != echonet_lite::CUMULATIVE_ENERGY_UNAVAILABLE =>
            {
                Some(v)
            }
            _ => None,
        };
        let cumulative_energy_reverse = match self.poll(EPC_CUMULATIVE_ENERGY_REVERSE)? {
            Some(Reading::CumulativeEnergyReverse(v))
                if v != echonet_lite::CUMULATIVE_ENERGY_UNAVAILABLE =>
            {
                Some(v)
            }
            _ => None,
        };
        let fixed_energy = match self.poll(EPC_FIXED_ENERGY)? {
            Some(Reading::FixedEnergy { value, .. }) => Some(value),
            _ => None,
        };

        if self.session_mut()?.cumulative_multiplier.is_none() {
            if let Some(Reading::UnitCode(code)) = self.poll(EPC_ENERGY_UNIT)? {
                let multiplier = echonet_lite::unit_multiplier(code);
                self.session_mut()?.cumulative_multiplier = Some(multiplier);
            }
        }
        let energy_unit = self.session.as_ref().and_then(|s| s.cumulative_multiplier);

        Ok(EnergyData {
            cumulative_energy,
            cumulative_energy_reverse,
            fixed_energy,
            energy_unit,
        })
    }

    /// `{channel, pan_id, mac_addr, ipv6_addr, rssi, rssi_quality}`.
    /// Pulled straight off the `Session`; this never issues a serial
    /// command of its own.
    pub fn get_connection_info(&mut self) -> Result<ConnectionInfo> {
        let session = self.session_mut()?;
        let channel = u8::from_str_radix(&session.channel_hex, 16).unwrap_or(0);
        let pan_id = u16::from_str_radix(&session.pan_id_hex, 16).unwrap_or(0);
        Ok(ConnectionInfo {
            channel,
            pan_id,
            mac_addr: session.mac_addr.clone(),
            ipv6_addr: session.ipv6_addr.clone(),
            rssi: session.last_rssi,
            rssi_quality: session.last_rssi.map(rssi_quality),
        })
    }
}
