//! The immutable configuration snapshot a manager is built from.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use hostnet::Family;
use ip_network::{Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};

/// Substituted when the configured MTU is zero.
pub const DEFAULT_MTU: u32 = 1400;

const DEFAULT_DIAL_TIMEOUT_MS: u64 = 5_000;

/// Longest interface name the kernels we target accept (IFNAMSIZ - 1).
const MAX_IF_NAME: usize = 15;

/// Transport the tunnel will run over. The manager only uses this to pick
/// the matching settings bundle; dialing is the transport layer's problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
    Ws,
    Wss,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Ws => write!(f, "ws"),
            Protocol::Wss => write!(f, "wss"),
        }
    }
}

/// The remote peer: a host name or literal, with optional per-family
/// literals when the caller already knows them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub host: String,
    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default)]
    pub ipv6: Option<Ipv6Addr>,
}

/// Interface addressing for one family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyAddress {
    pub address: IpAddr,
    pub prefix: u8,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub dns: Vec<IpAddr>,
}

/// One protocol's tunnel settings bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    pub interface_name: String,
    #[serde(default)]
    pub ipv4: Option<FamilyAddress>,
    #[serde(default)]
    pub ipv6: Option<FamilyAddress>,
    pub peer: PeerEndpoint,
    /// Zero means "use [`DEFAULT_MTU`]".
    #[serde(default)]
    pub mtu: u32,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
}

fn default_dial_timeout_ms() -> u64 {
    DEFAULT_DIAL_TIMEOUT_MS
}

/// Top-level configuration: one bundle per transport, one of them active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub protocol: Protocol,
    #[serde(default)]
    pub udp: Option<TunnelSettings>,
    #[serde(default)]
    pub tcp: Option<TunnelSettings>,
    #[serde(default)]
    pub ws: Option<TunnelSettings>,
}

impl Config {
    /// The bundle selected by `protocol`. WS and WSS share one bundle.
    pub fn active(&self) -> Result<&TunnelSettings, ConfigError> {
        let bundle = match self.protocol {
            Protocol::Udp => self.udp.as_ref(),
            Protocol::Tcp => self.tcp.as_ref(),
            Protocol::Ws | Protocol::Wss => self.ws.as_ref(),
        };

        bundle.ok_or(ConfigError::MissingBundle(self.protocol))
    }
}

impl TunnelSettings {
    /// Checks every invariant and returns the configured family.
    pub fn validate(&self) -> Result<Family, ConfigError> {
        validate_interface_name(&self.interface_name)?;

        let family = match (&self.ipv4, &self.ipv6) {
            (Some(_), Some(_)) => return Err(ConfigError::MultipleFamilies),
            (None, None) => return Err(ConfigError::NoFamily),
            (Some(v4), None) => {
                validate_family_address(v4, Family::V4)?;
                Family::V4
            }
            (None, Some(v6)) => {
                validate_family_address(v6, Family::V6)?;
                Family::V6
            }
        };

        if self.peer.host.trim().is_empty() {
            return Err(ConfigError::MissingPeerHost);
        }

        // A literal peer must be of the configured family.
        if let Ok(literal) = self.peer.host.parse::<IpAddr>()
            && Family::of(literal) != family
        {
            return Err(ConfigError::PeerFamilyMismatch {
                peer: literal,
                family,
            });
        }

        let mtu = self.effective_mtu();
        if mtu < family.min_mtu() {
            return Err(ConfigError::MtuBelowMinimum {
                mtu,
                family,
                min: family.min_mtu(),
            });
        }

        Ok(family)
    }

    /// The family's addressing; call only after [`TunnelSettings::validate`].
    pub fn family_address(&self) -> Option<&FamilyAddress> {
        self.ipv4.as_ref().or(self.ipv6.as_ref())
    }

    pub fn effective_mtu(&self) -> u32 {
        if self.mtu == 0 { DEFAULT_MTU } else { self.mtu }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

fn validate_interface_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_IF_NAME
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if !valid {
        return Err(ConfigError::InvalidInterfaceName(name.to_owned()));
    }

    Ok(())
}

fn validate_family_address(addr: &FamilyAddress, family: Family) -> Result<(), ConfigError> {
    if Family::of(addr.address) != family {
        return Err(ConfigError::AddressFamilyMismatch {
            address: addr.address,
            family,
        });
    }

    match addr.address {
        IpAddr::V4(v4) => {
            if v4.is_unspecified() {
                return Err(ConfigError::AddressUnspecified);
            }
            let network = Ipv4Network::new_truncate(v4, addr.prefix)
                .map_err(|_| ConfigError::InvalidPrefix(addr.prefix))?;
            // The address must be a *host* within its subnet, not the
            // network or broadcast address.
            if addr.prefix < 31
                && (v4 == network.network_address() || v4 == network.broadcast_address())
            {
                return Err(ConfigError::AddressNotInSubnet {
                    address: addr.address,
                    prefix: addr.prefix,
                });
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_unspecified() {
                return Err(ConfigError::AddressUnspecified);
            }
            let network = Ipv6Network::new_truncate(v6, addr.prefix)
                .map_err(|_| ConfigError::InvalidPrefix(addr.prefix))?;
            if addr.prefix < 127 && v6 == network.network_address() {
                return Err(ConfigError::AddressNotInSubnet {
                    address: addr.address,
                    prefix: addr.prefix,
                });
            }
        }
    }

    if let Some(gateway) = addr.gateway
        && Family::of(gateway) != family
    {
        return Err(ConfigError::GatewayFamilyMismatch { gateway, family });
    }

    Ok(())
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no settings bundle configured for protocol `{0}`")]
    MissingBundle(Protocol),

    #[error("no interface family configured")]
    NoFamily,

    #[error("both IPv4 and IPv6 configured; exactly one family is supported per manager")]
    MultipleFamilies,

    #[error("`{0}` is not a valid interface name")]
    InvalidInterfaceName(String),

    #[error("interface address is unspecified")]
    AddressUnspecified,

    #[error("address {address} does not match the configured {family} family")]
    AddressFamilyMismatch { address: IpAddr, family: Family },

    #[error("/{0} is not a valid prefix length")]
    InvalidPrefix(u8),

    #[error("address {address} does not lie within its /{prefix} subnet")]
    AddressNotInSubnet { address: IpAddr, prefix: u8 },

    #[error("gateway {gateway} does not match the configured {family} family")]
    GatewayFamilyMismatch { gateway: IpAddr, family: Family },

    #[error("peer host is empty")]
    MissingPeerHost,

    #[error("peer {peer} does not match the configured {family} family")]
    PeerFamilyMismatch { peer: IpAddr, family: Family },

    #[error("MTU {mtu} is below the {family} minimum of {min}")]
    MtuBelowMinimum { mtu: u32, family: Family, min: u32 },
}
