//! Environment-driven daemon configuration.

use std::env;
use std::path::PathBuf;

pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Interface name patterns the daemon may manage; empty means all.
    pub interface_allow: Vec<String>,
    /// Interface name patterns the daemon must not touch.
    pub interface_block: Vec<String>,
    /// Directory holding network profile files (`<ssid>.psk`).
    pub profile_dir: Option<PathBuf>,
    /// Arm the kernel RSSI monitor after connecting: threshold dBm.
    pub rssi_threshold: Option<i32>,
    /// Offload group rekeys to the kernel when the 4-way completes.
    pub rekey_offload: bool,
    pub log_filter: String,
}

fn env_patterns(name: &str) -> Vec<String> {
    env::var(name)
        .map(|v| v.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect())
        .unwrap_or_default()
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(default)
}

impl DaemonConfig {
    pub fn from_env() -> DaemonConfig {
        DaemonConfig {
            interface_allow: env_patterns("AIRLOCKD_INTERFACES"),
            interface_block: env_patterns("AIRLOCKD_BLOCK_INTERFACES"),
            profile_dir: env::var("AIRLOCKD_PROFILE_DIR").ok().map(PathBuf::from),
            rssi_threshold: env::var("AIRLOCKD_RSSI_THRESHOLD")
                .ok()
                .and_then(|v| v.parse::<i32>().ok()),
            rekey_offload: env_bool("AIRLOCKD_REKEY_OFFLOAD", false),
            log_filter: env::var("AIRLOCKD_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_splitting() {
        std::env::set_var("AIRLOCKD_TEST_PATTERNS", "wlan*, wlp2s0 ,");
        let patterns = env_patterns("AIRLOCKD_TEST_PATTERNS");
        assert_eq!(patterns, vec!["wlan*".to_string(), "wlp2s0".to_string()]);
        std::env::remove_var("AIRLOCKD_TEST_PATTERNS");
    }
}
