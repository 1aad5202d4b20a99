//! Wires managers to the platform device and host programmer.

use std::sync::Arc;

use hostnet::HostNetwork;

use crate::settings::Config;
use crate::{ClientTunManager, DeviceOpener, Result, ServerTunManager};

/// Opens the real platform TUN device.
pub struct PlatformOpener;

impl DeviceOpener for PlatformOpener {
    fn open(&self, if_name: &str) -> tun::Result<Arc<dyn tun::Tun>> {
        Ok(Arc::new(tun::platform::Tun::new(if_name)?))
    }
}

/// The host programmer for this build target.
pub fn platform_network() -> Arc<dyn HostNetwork> {
    #[cfg(target_os = "linux")]
    return Arc::new(hostnet::linux::LinuxNetwork::new());

    #[cfg(target_os = "macos")]
    return Arc::new(hostnet::macos::MacosNetwork::new());

    #[cfg(target_os = "windows")]
    return Arc::new(hostnet::windows::WindowsNetwork::new());
}

/// Builds the family-specific client manager for the active settings
/// bundle. Family and peer mismatches are rejected here, before any host
/// state is touched.
pub fn client_manager(config: &Config) -> Result<ClientTunManager> {
    let settings = config.active()?.clone();

    ClientTunManager::new(settings, platform_network(), Arc::new(PlatformOpener))
}

/// Builds the server manager for the active settings bundle.
pub fn server_manager(config: &Config) -> Result<ServerTunManager> {
    let settings = config.active()?.clone();

    ServerTunManager::new(settings, platform_network(), Arc::new(PlatformOpener))
}
