//! Wi-SUN B-route bridge core: drives a Tessera/BP35 dongle over a serial
//! line, carries a PANA session against a low-voltage smart electricity
//! meter, and exposes three synchronous poll calls over ECHONET Lite.
//!
//! `WisunClient` is the only entry point most callers need; the
//! remaining modules are public so a caller can script an alternate
//! transport or reuse the codec directly.

pub mod cache;
pub mod cancel;
pub mod client;
pub mod credentials;
pub mod dispatcher;
pub mod echonet_lite;
pub mod error;
pub mod join;
pub mod supervisor;
pub mod tty;
pub mod udp;

pub use cache::{CachedConnection, ConnectionCache};
pub use cancel::Cancel;
pub use client::{ConnectionInfo, EnergyData, PowerData, RssiQuality, WisunClient};
pub use credentials::Credentials;
pub use echonet_lite::Reading;
pub use error::{Error, Result};
pub use tty::TTYPort;
