//! Server-side lifecycle: terminate tunnels and NAT them to the world.
//!
//! No split-default and no DNS here; instead the manager turns on kernel
//! forwarding, discovers the default external interface and installs
//! masquerading plus the forward-accept pair for it.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hostnet::{Family, HostNetwork};
use parking_lot::Mutex;
use tun::Tun as _;

use crate::settings::TunnelSettings;
use crate::{DeviceOpener, Error, Result, TunManager};

/// Anycast addresses whose best route identifies the external interface.
const PROBE_V4: &str = "8.8.8.8";
const PROBE_V6: &str = "2001:4860:4860::8888";

#[derive(Default)]
struct Receipt {
    device: bool,
    address: bool,
    /// External interface the NAT rules were installed for.
    nat: Option<String>,
    forward: bool,
    established: bool,
    mss: bool,
}

pub struct ServerTunManager {
    settings: TunnelSettings,
    family: Family,
    net: Arc<dyn HostNetwork>,
    opener: Arc<dyn DeviceOpener>,
    devices: Mutex<Vec<Arc<dyn tun::Tun>>>,
    receipt: Mutex<Receipt>,
}

impl ServerTunManager {
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
            devices: Mutex::new(Vec::new()),
            receipt: Mutex::new(Receipt::default()),
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    fn probe_address(&self) -> IpAddr {
        match self.family {
            Family::V4 => PROBE_V4.parse().expect("valid literal"),
            Family::V6 => PROBE_V6.parse().expect("valid literal"),
        }
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

        self.net
            .set_interface_up(&if_name)
            .map_err(|e| ("bring interface up", e.into()))?;

        self.net
            .assign_address(&if_name, addr.address, addr.prefix)
            .map_err(|e| ("assign interface address", e.into()))?;
        self.receipt.lock().address = true;

        self.net
            .set_mtu(&if_name, self.family, self.settings.effective_mtu())
            .map_err(|e| ("set MTU", e.into()))?;

        self.net
            .enable_ip_forwarding()
            .map_err(|e| ("enable IP forwarding", e.into()))?;

        let external = self
            .net
            .best_route(self.probe_address())
            .map_err(|e| ("discover external interface", e.into()))?;

        // IPv6 NAT may be missing from the kernel entirely; treat that as
        // best-effort, IPv4 NAT failures as fatal.
        let best_effort = self.family == Family::V6;

        self.net
            .enable_masquerade(&external.if_name, self.family, best_effort)
            .map_err(|e| ("enable masquerade", e.into()))?;
        self.receipt.lock().nat = Some(external.if_name.clone());

        self.net
            .accept_forward(&if_name, &external.if_name)
            .map_err(|e| ("accept forwarded traffic", e.into()))?;
        self.receipt.lock().forward = true;

        self.net
            .accept_forward_established(&external.if_name, &if_name)
            .map_err(|e| ("accept return traffic", e.into()))?;
        self.receipt.lock().established = true;

        self.net
            .install_mss_clamp(&if_name)
            .map_err(|e| ("install MSS clamping", e.into()))?;
        self.receipt.lock().mss = true;

        tracing::debug!(%if_name, external = %external.if_name, "Server tunnel ready");

        Ok(device)
    }

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

        if let Some(external) = &receipt.nat {
            if receipt.established
                && let Err(e) = self.net.delete_accept_forward_established(external, if_name)
            {
                errors.push(format!("delete return-traffic rule: {e}"));
            }

            if receipt.forward
                && let Err(e) = self.net.delete_accept_forward(if_name, external)
            {
                errors.push(format!("delete forward rule: {e}"));
            }

            let best_effort = self.family == Family::V6;
            if let Err(e) = self
                .net
                .disable_masquerade(external, self.family, best_effort)
            {
                errors.push(format!("disable masquerade: {e}"));
            }
        }

        // Kernel forwarding is host-owned; it stays on.

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

impl TunManager for ServerTunManager {
    fn create_device(&self) -> Result<Arc<dyn tun::Tun>> {
        match self.try_create() {
            Ok(device) => Ok(device),
            Err((step, source)) => {
                tracing::warn!(%step, "Server bring-up failed, rolling back: {source}");

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

    fn set_route_endpoint(&self, _endpoint: SocketAddr) {
        // Servers don't route to a peer; nothing to cache.
    }
}

impl Drop for ServerTunManager {
    fn drop(&mut self) {
        let errors = self.dispose_errors();

        for error in errors {
            tracing::debug!("Error while disposing server tunnel on drop: {error}");
        }
    }
}
