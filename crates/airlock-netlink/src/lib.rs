//! Kernel plumbing: the nl80211 generic-netlink transport with
//! per-command cancellation, route-netlink link and address helpers, and
//! the PF_PACKET socket that carries EAPoL frames.

use thiserror::Error;

pub mod eapol_socket;
pub mod genl;
pub mod nl80211;
pub mod rtnl;

pub use genl::{CommandId, CommandOutcome, GenlCmd, GenlResponse, GenlTransport};

#[derive(Error, Debug)]
pub enum NetlinkError {
    #[error("failed to connect netlink socket: {reason}")]
    ConnectionFailed { reason: String },

    #[error("failed to resolve {what}: {reason}")]
    ResolveFailed { what: &'static str, reason: String },

    #[error("failed to send {operation}: {reason}")]
    SendFailed { operation: &'static str, reason: String },

    #[error("kernel returned error {errno} for {operation}")]
    Kernel { operation: &'static str, errno: i32 },

    #[error("interface '{name}' not found")]
    InterfaceNotFound { name: String },

    #[error("IO error during {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, NetlinkError>;

impl NetlinkError {
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        NetlinkError::Io { operation, source }
    }
}
