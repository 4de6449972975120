//! airlockd: drives the STA and soft-AP connection cores over nl80211.

mod config;
mod eventloop;
mod logging;
mod timers;

use anyhow::Result;

use crate::config::DaemonConfig;
use crate::eventloop::Daemon;

fn main() -> Result<()> {
    let config = DaemonConfig::from_env();
    logging::init(&config.log_filter)?;

    tracing::info!(
        "starting airlockd (interfaces: {:?}, blocked: {:?})",
        config.interface_allow,
        config.interface_block
    );

    Daemon::new(config)?.run()
}
