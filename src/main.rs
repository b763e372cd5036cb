//! Manual smoke-test harness: connects to a real dongle and prints
//! readings in a loop. Not a server, just a human-operated poll loop
//! driving the public `WisunClient` API.

use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};

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

    let info = client.get_connection_info()?;
    log::info!(
        "joined: channel={:#04X} pan_id={:#06X} mac={} ipv6={}",
        info.channel,
        info.pan_id,
        info.mac_addr,
        info.ipv6_addr
    );

    loop {
        let power = client.get_power_data()?;
        match power.instant_power {
            Some(watts) => println!("instantaneous power: {} W", watts),
            None => println!("instantaneous power: (no data this tick)"),
        }
        sleep(Duration::from_secs(5));
    }
}
