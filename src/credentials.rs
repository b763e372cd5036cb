//! Static-per-process configuration: the serial device, the dongle's
//! baud rate, and the B-route credentials issued by the utility.

use log::warn;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub device_path: String,
    pub baud_rate: u32,
    pub broute_id: String,
    pub broute_password: String,
    /// `SKSCAN` duration parameter. `7` takes roughly two minutes and is
    /// a safe default; exposed as configuration for a differently tuned
    /// dongle.
    pub scan_duration: u8,
}

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_SCAN_DURATION: u8 = 7;

impl Credentials {
    pub fn new(device_path: String, broute_id: String, broute_password: String) -> Self {
        if broute_id.len() != 32 {
            warn!("B-route ID is {} chars, expected 32", broute_id.len());
        }
        if broute_password.len() != 12 {
            warn!(
                "B-route password is {} chars, expected 12",
                broute_password.len()
            );
        }
        Credentials {
            device_path,
            baud_rate: DEFAULT_BAUD_RATE,
            broute_id,
            broute_password,
            scan_duration: DEFAULT_SCAN_DURATION,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_scan_duration(mut self, scan_duration: u8) -> Self {
        self.scan_duration = scan_duration;
        self
    }
}
