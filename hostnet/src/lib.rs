//! Host-network programming: addresses, routes, DNS, MTU, NAT and
//! forwarding, behind one platform-agnostic contract.
//!
//! Every operation is idempotent: it either brings the host to the requested
//! state or fails with a typed error carrying whatever the underlying
//! command or API reported. Implementations hold no per-device state; the
//! lifecycle bookkeeping lives with the manager that drives them.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::net::IpAddr;

use ip_network::{IpNetwork, Ipv4Network, Ipv6Network};

pub mod exec;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as platform;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as platform;

#[cfg(target_os = "windows")]
pub mod windows;
#[cfg(target_os = "windows")]
pub use windows as platform;

pub use exec::{CommandRunner, ExecError, SystemRunner};

/// Address family of a tunnel, with the constants that differ between the
/// two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// The smallest MTU the family permits.
    pub fn min_mtu(self) -> u32 {
        match self {
            Family::V4 => 576,
            Family::V6 => 1280,
        }
    }

    /// The two half-routes that together cover the default route without
    /// touching the pre-existing one.
    pub fn split_default(self) -> [IpNetwork; 2] {
        match self {
            Family::V4 => [
                IpNetwork::V4(
                    Ipv4Network::new("0.0.0.0".parse().expect("valid literal"), 1)
                        .expect("/1 is a valid IPv4 prefix"),
                ),
                IpNetwork::V4(
                    Ipv4Network::new("128.0.0.0".parse().expect("valid literal"), 1)
                        .expect("/1 is a valid IPv4 prefix"),
                ),
            ],
            Family::V6 => [
                IpNetwork::V6(
                    Ipv6Network::new("::".parse().expect("valid literal"), 1)
                        .expect("/1 is a valid IPv6 prefix"),
                ),
                IpNetwork::V6(
                    Ipv6Network::new("8000::".parse().expect("valid literal"), 1)
                        .expect("/1 is a valid IPv6 prefix"),
                ),
            ],
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}

/// What the kernel would currently do with a packet for some destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Next hop, absent for on-link destinations.
    pub gateway: Option<IpAddr>,
    pub if_name: String,
    pub if_index: u32,
    /// Effective metric (route plus interface where the platform has both).
    pub metric: u32,
}

/// The platform-agnostic host-state mutation contract.
///
/// "Add" operations called twice leave a single rule/route/address behind;
/// "delete" operations succeed on absent objects.
pub trait HostNetwork: Send + Sync {
    /// Binds `addr/prefix_len` to the interface. On macOS this also programs
    /// the point-to-point peer equal to the local address.
    fn assign_address(&self, if_name: &str, addr: IpAddr, prefix_len: u8) -> Result<()>;

    /// Removes one bound address.
    fn delete_address(&self, if_name: &str, addr: IpAddr, prefix_len: u8) -> Result<()>;

    /// Fails without touching the host if `mtu` is below the family minimum.
    fn set_mtu(&self, if_name: &str, family: Family, mtu: u32) -> Result<()>;

    fn set_interface_up(&self, if_name: &str) -> Result<()>;

    fn delete_interface(&self, if_name: &str) -> Result<()>;

    /// Installs `dest` reachable via the interface with no next-hop.
    fn add_route_on_link(&self, dest: IpNetwork, if_name: &str, metric: u32) -> Result<()>;

    /// Installs `dest` via `gateway`.
    fn add_route_via_gateway(
        &self,
        dest: IpNetwork,
        if_name: &str,
        gateway: IpAddr,
        metric: u32,
    ) -> Result<()>;

    fn delete_route(&self, dest: IpNetwork) -> Result<()>;

    fn delete_route_on_interface(&self, dest: IpNetwork, if_name: &str) -> Result<()>;

    /// Installs the family's two half-routes on the interface.
    fn add_default_split_routes(&self, if_name: &str, family: Family, metric: u32) -> Result<()>;

    fn delete_default_split_routes(&self, if_name: &str, family: Family) -> Result<()>;

    /// The route the kernel currently selects for `dest`: longest prefix
    /// first, then lowest effective metric.
    fn best_route(&self, dest: IpAddr) -> Result<Route>;

    /// Replaces the interface's resolver list. An empty list clears it so
    /// DHCP-provided values apply again.
    fn set_dns(&self, if_name: &str, resolvers: &[IpAddr]) -> Result<()>;

    fn flush_dns(&self) -> Result<()>;

    /// Turns on kernel IP forwarding if it is not already on.
    fn enable_ip_forwarding(&self) -> Result<()>;

    /// Installs source-NAT on the external interface. With `best_effort`
    /// (used for IPv6, whose NAT support may be absent) a failure is logged
    /// and swallowed.
    fn enable_masquerade(&self, ext_if: &str, family: Family, best_effort: bool) -> Result<()>;

    fn disable_masquerade(&self, ext_if: &str, family: Family, best_effort: bool) -> Result<()>;

    /// Accepts forwarded traffic from `in_if` to `out_if`.
    fn accept_forward(&self, in_if: &str, out_if: &str) -> Result<()>;

    fn delete_accept_forward(&self, in_if: &str, out_if: &str) -> Result<()>;

    /// Accepts forwarded traffic from `in_if` to `out_if` restricted to
    /// established/related connections (the return direction of
    /// [`HostNetwork::accept_forward`]).
    fn accept_forward_established(&self, in_if: &str, out_if: &str) -> Result<()>;

    fn delete_accept_forward_established(&self, in_if: &str, out_if: &str) -> Result<()>;

    /// Clamps TCP MSS to path MTU on traffic entering and leaving the
    /// tunnel, both families.
    fn install_mss_clamp(&self, tun_name: &str) -> Result<()>;

    fn remove_mss_clamp(&self, tun_name: &str) -> Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A host-state mutation failed; `detail` carries the captured command
    /// output or API error.
    #[error("{op} failed: {detail}")]
    HostState { op: String, detail: String },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("no netfilter backend available: {0}")]
    BackendUnavailable(String),

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("MTU {mtu} is below the {family} minimum of {min}")]
    MtuBelowMinimum { mtu: u32, family: Family, min: u32 },

    #[error("no route to {0}")]
    NoRoute(IpAddr),
}

impl Error {
    pub fn host_state(op: impl std::fmt::Display, detail: impl std::fmt::Display) -> Self {
        Error::HostState {
            op: op.to_string(),
            detail: detail.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
