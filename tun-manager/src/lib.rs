//! One TUN device's lifecycle, end to end.
//!
//! A manager validates its settings, creates the device, programs the host
//! (addresses, routes, DNS, MTU, netfilter) in a fixed order and hands the
//! device to the caller. Any failure after device creation, or an explicit
//! [`TunManager::dispose_devices`], reverses every installed piece in the
//! exact opposite order, best-effort, and reports what could not be undone.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::net::SocketAddr;
use std::sync::Arc;

pub mod settings;

mod client;
mod factory;
mod server;

pub use client::ClientTunManager;
pub use factory::{PlatformOpener, client_manager, platform_network, server_manager};
pub use server::ServerTunManager;
pub use settings::{Config, ConfigError, FamilyAddress, PeerEndpoint, Protocol, TunnelSettings};

/// The lifecycle contract shared by client and server managers.
pub trait TunManager: Send + Sync {
    /// Creates the device and programs the host to route through it.
    fn create_device(&self) -> Result<Arc<dyn tun::Tun>>;

    /// Undoes everything [`TunManager::create_device`] installed, in
    /// reverse order, and closes devices still owned by the manager.
    fn dispose_devices(&self) -> Result<()>;

    /// Injects an already-resolved peer address so the manager installs the
    /// host route to it instead of resolving the configured host again.
    fn set_route_endpoint(&self, endpoint: SocketAddr);
}

/// Creates the platform TUN device for a manager.
///
/// A seam so lifecycle logic can be driven against fakes.
pub trait DeviceOpener: Send + Sync {
    fn open(&self, if_name: &str) -> tun::Result<Arc<dyn tun::Tun>>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("TUN device error: {0}")]
    Device(#[from] tun::Error),

    #[error(transparent)]
    HostState(#[from] hostnet::Error),

    #[error("failed to resolve peer `{host}`: {detail}")]
    Resolve { host: String, detail: String },

    /// `create_device` failed at `step`; the listed rollback errors are the
    /// pieces the compensating dispose pass could not undo.
    #[error("{step} failed: {source}{}", format_rollback(.rollback))]
    CreateFailed {
        step: &'static str,
        #[source]
        source: Box<Error>,
        rollback: Vec<String>,
    },

    #[error("dispose completed with errors: {}", .0.join("; "))]
    Dispose(Vec<String>),
}

impl Error {
    /// The create step that failed, when this is a create failure.
    pub fn failed_step(&self) -> Option<&'static str> {
        match self {
            Error::CreateFailed { step, .. } => Some(step),
            Error::Config(_)
            | Error::Device(_)
            | Error::HostState(_)
            | Error::Resolve { .. }
            | Error::Dispose(_) => None,
        }
    }
}

fn format_rollback(rollback: &[String]) -> String {
    if rollback.is_empty() {
        String::new()
    } else {
        format!(" (rollback errors: {})", rollback.join("; "))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
