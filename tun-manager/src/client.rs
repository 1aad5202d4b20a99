//! Client-side lifecycle: steer all host traffic through the tunnel.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hostnet::{Family, HostNetwork};
use ip_network::{IpNetwork, Ipv4Network, Ipv6Network};
use parking_lot::Mutex;
use tun::Tun as _;

use crate::settings::TunnelSettings;
use crate::{DeviceOpener, Error, Result, TunManager};

/// How long to keep retrying interface bring-up while the kernel link
/// settles after creation.
const BRING_UP_ATTEMPTS: u32 = 5;
const BRING_UP_DELAY: Duration = Duration::from_millis(50);

/// Everything `create_device` installed, so dispose undoes precisely that.
#[derive(Default)]
struct Receipt {
    device: bool,
    address: bool,
    /// The peer host-route and the interface it was installed on.
    peer_route: Option<(IpNetwork, Option<String>)>,
    split_default: bool,
    dns: bool,
    mss: bool,
}

pub struct ClientTunManager {
    settings: TunnelSettings,
    family: Family,
    net: Arc<dyn HostNetwork>,
    opener: Arc<dyn DeviceOpener>,
    route_endpoint: Mutex<Option<SocketAddr>>,
    devices: Mutex<Vec<Arc<dyn tun::Tun>>>,
    receipt: Mutex<Receipt>,
}

impl ClientTunManager {
    /// Validates `settings` and builds a manager around the given host
    /// programmer and device opener.
    pub fn new(
        settings: TunnelSettings,
        net: Arc<dyn HostNetwork>,
        opener: Arc<dyn DeviceOpener>,
    ) -> Result<Self> {
        let family = settings.validate()?;

        Ok(Self {
            settings,
            family,
            net,
            opener,
            route_endpoint: Mutex::new(None),
            devices: Mutex::new(Vec::new()),
            receipt: Mutex::new(Receipt::default()),
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    fn try_create(&self) -> std::result::Result<Arc<dyn tun::Tun>, (&'static str, Error)> {
        let if_name = self.settings.interface_name.clone();
        let addr = self
            .settings
            .family_address()
            .expect("settings were validated at construction");

        let device = self
            .opener
            .open(&if_name)
            .map_err(|e| ("create TUN device", Error::Device(e)))?;
        self.devices.lock().push(device.clone());
        self.receipt.lock().device = true;

        self.bring_up(&if_name)
            .map_err(|e| ("bring interface up", e))?;

        self.net
            .assign_address(&if_name, addr.address, addr.prefix)
            .map_err(|e| ("assign interface address", e.into()))?;
        self.receipt.lock().address = true;

        self.install_peer_route(&if_name)
            .map_err(|e| ("install peer host route", e))?;

        self.net
            .add_default_split_routes(&if_name, self.family, 0)
            .map_err(|e| ("install split-default routes", e.into()))?;
        self.receipt.lock().split_default = true;

        self.net
            .set_mtu(&if_name, self.family, self.settings.effective_mtu())
            .map_err(|e| ("set MTU", e.into()))?;

        if !addr.dns.is_empty() {
            self.net
                .set_dns(&if_name, &addr.dns)
                .map_err(|e| ("set DNS resolvers", e.into()))?;
            self.receipt.lock().dns = true;
            self.net
                .flush_dns()
                .map_err(|e| ("flush DNS cache", e.into()))?;
        }

        self.net
            .install_mss_clamp(&if_name)
            .map_err(|e| ("install MSS clamping", e.into()))?;
        self.receipt.lock().mss = true;

        tracing::debug!(%if_name, family = %self.family, "Tunnel device ready");

        Ok(device)
    }

    /// The kernel link may lag the device fd by a beat; retry briefly.
    fn bring_up(&self, if_name: &str) -> Result<()> {
        let mut attempt = 0;

        loop {
            match self.net.set_interface_up(if_name) {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < BRING_UP_ATTEMPTS => {
                    tracing::debug!(%if_name, "Interface not up yet, retrying: {e}");
                    attempt += 1;
                    std::thread::sleep(BRING_UP_DELAY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Resolves the peer and routes it via the current best non-tunnel
    /// path, so tunnel transport traffic never loops into the tunnel.
    fn install_peer_route(&self, if_name: &str) -> Result<()> {
        let peer_ip = self.resolve_peer()?;
        let host_route = host_network(peer_ip);

        // A previous run may have left a stale host route behind.
        self.net.delete_route(host_route)?;

        let best = self.net.best_route(peer_ip)?;

        if best.if_name == if_name {
            return Err(Error::HostState(hostnet::Error::host_state(
                "install peer host route",
                format!("best route to {peer_ip} already points at {if_name}"),
            )));
        }

        match best.gateway {
            Some(gateway) => {
                self.net
                    .add_route_via_gateway(host_route, &best.if_name, gateway, 0)?
            }
            None => self.net.add_route_on_link(host_route, &best.if_name, 0)?,
        }

        self.receipt.lock().peer_route = Some((host_route, Some(best.if_name)));

        Ok(())
    }

    /// The peer address to route to: the transport's cached endpoint wins,
    /// then configured per-family literals, then the host itself.
    fn resolve_peer(&self) -> Result<IpAddr> {
        if let Some(cached) = *self.route_endpoint.lock()
            && Family::of(cached.ip()) == self.family
        {
            return Ok(cached.ip());
        }

        match self.family {
            Family::V4 => {
                if let Some(ip) = self.settings.peer.ipv4 {
                    return Ok(IpAddr::V4(ip));
                }
            }
            Family::V6 => {
                if let Some(ip) = self.settings.peer.ipv6 {
                    return Ok(IpAddr::V6(ip));
                }
            }
        }

        let host = &self.settings.peer.host;

        if let Ok(literal) = host.parse::<IpAddr>() {
            if Family::of(literal) == self.family {
                return Ok(literal);
            }

            return Err(Error::Resolve {
                host: host.clone(),
                detail: format!("literal is not {}", self.family),
            });
        }

        let addresses = dns_lookup::lookup_host(host).map_err(|e| Error::Resolve {
            host: host.clone(),
            detail: e.to_string(),
        })?;

        addresses
            .into_iter()
            .find(|ip| Family::of(*ip) == self.family)
            .ok_or_else(|| Error::Resolve {
                host: host.clone(),
                detail: format!("no {} address", self.family),
            })
    }

    /// Reverses installed state in the exact opposite order of
    /// `create_device`. Every step is attempted; failures are collected.
    fn dispose_errors(&self) -> Vec<String> {
        let if_name = &self.settings.interface_name;
        let mut errors = Vec::new();

        let receipt = {
            let mut guard = self.receipt.lock();
            std::mem::take(&mut *guard)
        };

        if receipt.mss
            && let Err(e) = self.net.remove_mss_clamp(if_name)
        {
            errors.push(format!("remove MSS clamping: {e}"));
        }

        if receipt.dns {
            if let Err(e) = self.net.set_dns(if_name, &[]) {
                errors.push(format!("clear DNS resolvers: {e}"));
            }
            if let Err(e) = self.net.flush_dns() {
                errors.push(format!("flush DNS cache: {e}"));
            }
        }

        if receipt.split_default
            && let Err(e) = self.net.delete_default_split_routes(if_name, self.family)
        {
            errors.push(format!("delete split-default routes: {e}"));
        }

        if let Some((host_route, via)) = receipt.peer_route {
            let result = match &via {
                Some(via_if) => self.net.delete_route_on_interface(host_route, via_if),
                None => self.net.delete_route(host_route),
            };
            if let Err(e) = result {
                errors.push(format!("delete peer host route: {e}"));
            }
        }

        if receipt.address {
            let addr = self
                .settings
                .family_address()
                .expect("settings were validated at construction");
            if let Err(e) = self.net.delete_address(if_name, addr.address, addr.prefix) {
                errors.push(format!("delete interface address: {e}"));
            }
        }

        if receipt.device
            && let Err(e) = self.net.delete_interface(if_name)
        {
            errors.push(format!("delete interface: {e}"));
        }

        for device in self.devices.lock().drain(..) {
            if let Err(e) = device.close() {
                errors.push(format!("close device: {e}"));
            }
        }

        errors
    }
}

impl TunManager for ClientTunManager {
    fn create_device(&self) -> Result<Arc<dyn tun::Tun>> {
        match self.try_create() {
            Ok(device) => Ok(device),
            Err((step, source)) => {
                tracing::warn!(%step, "Tunnel bring-up failed, rolling back: {source}");

                let rollback = self.dispose_errors();

                Err(Error::CreateFailed {
                    step,
                    source: Box::new(source),
                    rollback,
                })
            }
        }
    }

    fn dispose_devices(&self) -> Result<()> {
        let errors = self.dispose_errors();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Dispose(errors))
        }
    }

    fn set_route_endpoint(&self, endpoint: SocketAddr) {
        *self.route_endpoint.lock() = Some(endpoint);
    }
}

impl Drop for ClientTunManager {
    fn drop(&mut self) {
        let errors = self.dispose_errors();

        for error in errors {
            tracing::debug!("Error while disposing tunnel on drop: {error}");
        }
    }
}

/// The `/32` (or `/128`) network covering exactly `ip`.
pub(crate) fn host_network(ip: IpAddr) -> IpNetwork {
    match ip {
        IpAddr::V4(v4) => IpNetwork::V4(
            Ipv4Network::new(v4, 32).expect("/32 is always a valid IPv4 prefix"),
        ),
        IpAddr::V6(v6) => IpNetwork::V6(
            Ipv6Network::new(v6, 128).expect("/128 is always a valid IPv6 prefix"),
        ),
    }
}
