//! Second manual smoke-test. Calls the public `WisunClient` poll API
//! directly rather than building ECHONET Lite frames by hand; all the
//! frame plumbing and retry/reconnect logic lives in the crate.

use anyhow::{Context, Result};
use log::debug;

use wisun_echonet_bridge::{ConnectionCache, Credentials, WisunClient};

fn main() -> Result<()> {
    env_logger::init();
    let device_path = std::env::var("DEVICE_PATH").context("DEVICE_PATH not set")?;
    let routeb_id = std::env::var("ROUTEB_ID").context("ROUTEB_ID not set")?;
    let routeb_password = std::env::var("ROUTEB_PASSWORD").context("ROUTEB_PASSWORD not set")?;

    let creds = Credentials::new(device_path, routeb_id, routeb_password);
    let cache = ConnectionCache::new("wisun_cache.json");
    let mut client = WisunClient::open(creds, cache)?;

    if !client.connect()? {
        anyhow::bail!("authentication rejected by the meter (EVENT 24)");
    }
    debug!("joined: {:?}", client.get_connection_info()?);

    loop {
        let power = client.get_power_data()?;
        if let Some(value) = power.instant_power {
            println!("instantaneous electric power: {}", value);
        }
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
}
