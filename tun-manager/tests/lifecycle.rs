//! Lifecycle ordering and rollback, driven against recording fakes.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use hostnet::{Error as HostError, Family, HostNetwork, Route};
use ip_network::IpNetwork;
use tun_manager::settings::{FamilyAddress, PeerEndpoint, TunnelSettings};
use tun_manager::{ClientTunManager, DeviceOpener, ServerTunManager, TunManager};

/// Records every operation; optionally fails one of them by name.
struct RecordingNetwork {
    ops: Mutex<Vec<String>>,
    best_route: Route,
    fail_op: Option<&'static str>,
}

impl RecordingNetwork {
    fn new(gateway: Option<IpAddr>) -> Self {
        Self {
            ops: Mutex::new(Vec::new()),
            best_route: Route {
                gateway,
                if_name: "eth0".to_owned(),
                if_index: 2,
                metric: 100,
            },
            fail_op: None,
        }
    }

    fn failing(gateway: Option<IpAddr>, op: &'static str) -> Self {
        Self {
            fail_op: Some(op),
            ..Self::new(gateway)
        }
    }

    fn record(&self, op: &str) -> hostnet::Result<()> {
        self.ops.lock().unwrap().push(op.to_owned());

        let name = op.split(' ').next().unwrap_or(op);
        if self.fail_op == Some(name) {
            return Err(HostError::host_state(name, "injected failure"));
        }

        Ok(())
    }

    fn recorded(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }
}

impl HostNetwork for RecordingNetwork {
    fn assign_address(&self, if_name: &str, addr: IpAddr, prefix_len: u8) -> hostnet::Result<()> {
        self.record(&format!("assign_address {if_name} {addr}/{prefix_len}"))
    }

    fn delete_address(&self, if_name: &str, addr: IpAddr, prefix_len: u8) -> hostnet::Result<()> {
        self.record(&format!("delete_address {if_name} {addr}/{prefix_len}"))
    }

    fn set_mtu(&self, if_name: &str, _family: Family, mtu: u32) -> hostnet::Result<()> {
        self.record(&format!("set_mtu {if_name} {mtu}"))
    }

    fn set_interface_up(&self, if_name: &str) -> hostnet::Result<()> {
        self.record(&format!("set_interface_up {if_name}"))
    }

    fn delete_interface(&self, if_name: &str) -> hostnet::Result<()> {
        self.record(&format!("delete_interface {if_name}"))
    }

    fn add_route_on_link(
        &self,
        dest: IpNetwork,
        if_name: &str,
        _metric: u32,
    ) -> hostnet::Result<()> {
        self.record(&format!("add_route_on_link {dest} dev {if_name}"))
    }

    fn add_route_via_gateway(
        &self,
        dest: IpNetwork,
        if_name: &str,
        gateway: IpAddr,
        _metric: u32,
    ) -> hostnet::Result<()> {
        self.record(&format!("add_route_via_gateway {dest} via {gateway} dev {if_name}"))
    }

    fn delete_route(&self, dest: IpNetwork) -> hostnet::Result<()> {
        self.record(&format!("delete_route {dest}"))
    }

    fn delete_route_on_interface(&self, dest: IpNetwork, if_name: &str) -> hostnet::Result<()> {
        self.record(&format!("delete_route_on_interface {dest} dev {if_name}"))
    }

    fn add_default_split_routes(
        &self,
        if_name: &str,
        family: Family,
        _metric: u32,
    ) -> hostnet::Result<()> {
        self.record(&format!("add_default_split_routes {if_name} {family}"))
    }

    fn delete_default_split_routes(&self, if_name: &str, family: Family) -> hostnet::Result<()> {
        self.record(&format!("delete_default_split_routes {if_name} {family}"))
    }

    fn best_route(&self, dest: IpAddr) -> hostnet::Result<Route> {
        self.record(&format!("best_route {dest}"))?;

        Ok(self.best_route.clone())
    }

    fn set_dns(&self, if_name: &str, resolvers: &[IpAddr]) -> hostnet::Result<()> {
        let list = resolvers
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.record(&format!("set_dns {if_name} [{list}]"))
    }

    fn flush_dns(&self) -> hostnet::Result<()> {
        self.record("flush_dns")
    }

    fn enable_ip_forwarding(&self) -> hostnet::Result<()> {
        self.record("enable_ip_forwarding")
    }

    fn enable_masquerade(
        &self,
        ext_if: &str,
        family: Family,
        _best_effort: bool,
    ) -> hostnet::Result<()> {
        self.record(&format!("enable_masquerade {ext_if} {family}"))
    }

    fn disable_masquerade(
        &self,
        ext_if: &str,
        family: Family,
        _best_effort: bool,
    ) -> hostnet::Result<()> {
        self.record(&format!("disable_masquerade {ext_if} {family}"))
    }

    fn accept_forward(&self, in_if: &str, out_if: &str) -> hostnet::Result<()> {
        self.record(&format!("accept_forward {in_if} {out_if}"))
    }

    fn delete_accept_forward(&self, in_if: &str, out_if: &str) -> hostnet::Result<()> {
        self.record(&format!("delete_accept_forward {in_if} {out_if}"))
    }

    fn accept_forward_established(&self, in_if: &str, out_if: &str) -> hostnet::Result<()> {
        self.record(&format!("accept_forward_established {in_if} {out_if}"))
    }

    fn delete_accept_forward_established(&self, in_if: &str, out_if: &str) -> hostnet::Result<()> {
        self.record(&format!("delete_accept_forward_established {in_if} {out_if}"))
    }

    fn install_mss_clamp(&self, tun_name: &str) -> hostnet::Result<()> {
        self.record(&format!("install_mss_clamp {tun_name}"))
    }

    fn remove_mss_clamp(&self, tun_name: &str) -> hostnet::Result<()> {
        self.record(&format!("remove_mss_clamp {tun_name}"))
    }
}

#[derive(Debug)]
struct FakeTun {
    name: String,
    closed: AtomicBool,
}

impl tun::Tun for FakeTun {
    fn read(&self, _buf: &mut [u8]) -> tun::Result<usize> {
        Err(tun::Error::Closed)
    }

    fn write(&self, packet: &[u8]) -> tun::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(tun::Error::Closed);
        }

        Ok(packet.len())
    }

    fn close(&self) -> tun::Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Default)]
struct FakeOpener {
    opened: Mutex<Vec<Arc<FakeTun>>>,
    fail: bool,
}

impl DeviceOpener for FakeOpener {
    fn open(&self, if_name: &str) -> tun::Result<Arc<dyn tun::Tun>> {
        if self.fail {
            return Err(tun::Error::Device("injected device failure".to_owned()));
        }

        let device = Arc::new(FakeTun {
            name: if_name.to_owned(),
            closed: AtomicBool::new(false),
        });
        self.opened.lock().unwrap().push(device.clone());

        Ok(device)
    }
}

fn client_settings() -> TunnelSettings {
    TunnelSettings {
        interface_name: "tun0".to_owned(),
        ipv4: Some(FamilyAddress {
            address: "10.0.0.2".parse().unwrap(),
            prefix: 30,
            gateway: None,
            dns: Vec::new(),
        }),
        ipv6: None,
        peer: PeerEndpoint {
            host: "198.51.100.10".to_owned(),
            ipv4: None,
            ipv6: None,
        },
        mtu: 1400,
        dial_timeout_ms: 5_000,
    }
}

fn server_settings() -> TunnelSettings {
    TunnelSettings {
        interface_name: "tun0".to_owned(),
        ipv4: Some(FamilyAddress {
            address: "10.0.0.1".parse().unwrap(),
            prefix: 24,
            gateway: None,
            dns: Vec::new(),
        }),
        ipv6: None,
        peer: PeerEndpoint {
            host: "server".to_owned(),
            ipv4: None,
            ipv6: None,
        },
        mtu: 1400,
        dial_timeout_ms: 5_000,
    }
}

#[test]
fn client_create_programs_host_in_order_with_gateway_peer() {
    let net = Arc::new(RecordingNetwork::new(Some("192.0.2.1".parse().unwrap())));
    let opener = Arc::new(FakeOpener::default());
    let manager = ClientTunManager::new(client_settings(), net.clone(), opener.clone()).unwrap();

    manager.create_device().unwrap();

    assert_eq!(
        net.recorded(),
        vec![
            "set_interface_up tun0",
            "assign_address tun0 10.0.0.2/30",
            "delete_route 198.51.100.10/32",
            "best_route 198.51.100.10",
            "add_route_via_gateway 198.51.100.10/32 via 192.0.2.1 dev eth0",
            "add_default_split_routes tun0 IPv4",
            "set_mtu tun0 1400",
            "install_mss_clamp tun0",
        ]
    );
}

#[test]
fn client_create_uses_on_link_route_when_no_gateway() {
    let net = Arc::new(RecordingNetwork::new(None));
    let opener = Arc::new(FakeOpener::default());
    let manager = ClientTunManager::new(client_settings(), net.clone(), opener).unwrap();

    manager.create_device().unwrap();

    assert!(
        net.recorded()
            .contains(&"add_route_on_link 198.51.100.10/32 dev eth0".to_owned())
    );
}

#[test]
fn client_dispose_reverses_create_exactly() {
    let net = Arc::new(RecordingNetwork::new(Some("192.0.2.1".parse().unwrap())));
    let opener = Arc::new(FakeOpener::default());
    let manager = ClientTunManager::new(client_settings(), net.clone(), opener.clone()).unwrap();

    manager.create_device().unwrap();
    net.ops.lock().unwrap().clear();

    manager.dispose_devices().unwrap();

    assert_eq!(
        net.recorded(),
        vec![
            "remove_mss_clamp tun0",
            "delete_default_split_routes tun0 IPv4",
            "delete_route_on_interface 198.51.100.10/32 dev eth0",
            "delete_address tun0 10.0.0.2/30",
            "delete_interface tun0",
        ]
    );

    let devices = opener.opened.lock().unwrap();
    assert!(devices[0].closed.load(Ordering::Acquire));
}

#[test]
fn dns_is_set_when_configured_and_cleared_on_dispose() {
    let mut settings = client_settings();
    settings.ipv4.as_mut().unwrap().dns = vec!["10.0.0.1".parse().unwrap()];

    let net = Arc::new(RecordingNetwork::new(Some("192.0.2.1".parse().unwrap())));
    let opener = Arc::new(FakeOpener::default());
    let manager = ClientTunManager::new(settings, net.clone(), opener).unwrap();

    manager.create_device().unwrap();

    let ops = net.recorded();
    let dns_at = ops.iter().position(|op| op == "set_dns tun0 [10.0.0.1]").unwrap();
    let mtu_at = ops.iter().position(|op| op == "set_mtu tun0 1400").unwrap();
    let mss_at = ops.iter().position(|op| op == "install_mss_clamp tun0").unwrap();

    // DNS goes in after the MTU and before MSS clamping.
    assert!(mtu_at < dns_at && dns_at < mss_at);
    assert!(ops.contains(&"flush_dns".to_owned()));

    net.ops.lock().unwrap().clear();
    manager.dispose_devices().unwrap();

    let ops = net.recorded();
    assert!(ops.contains(&"set_dns tun0 []".to_owned()));
}

#[test]
fn failed_step_triggers_full_rollback() {
    let net = Arc::new(RecordingNetwork::failing(
        Some("192.0.2.1".parse().unwrap()),
        "set_mtu",
    ));
    let opener = Arc::new(FakeOpener::default());
    let manager = ClientTunManager::new(client_settings(), net.clone(), opener.clone()).unwrap();

    let err = manager.create_device().unwrap_err();

    assert_eq!(err.failed_step(), Some("set MTU"));

    let ops = net.recorded();
    let failure_at = ops.iter().position(|op| op == "set_mtu tun0 1400").unwrap();
    let rollback = &ops[failure_at + 1..];

    // MSS was never installed, so rollback starts at the split routes.
    assert_eq!(
        rollback,
        [
            "delete_default_split_routes tun0 IPv4",
            "delete_route_on_interface 198.51.100.10/32 dev eth0",
            "delete_address tun0 10.0.0.2/30",
            "delete_interface tun0",
        ]
    );

    let devices = opener.opened.lock().unwrap();
    assert!(devices[0].closed.load(Ordering::Acquire));
}

#[test]
fn device_failure_reports_without_touching_host() {
    let net = Arc::new(RecordingNetwork::new(None));
    let opener = Arc::new(FakeOpener {
        fail: true,
        ..Default::default()
    });
    let manager = ClientTunManager::new(client_settings(), net.clone(), opener).unwrap();

    let err = manager.create_device().unwrap_err();

    assert_eq!(err.failed_step(), Some("create TUN device"));
    assert!(net.recorded().is_empty());
}

#[test]
fn cached_route_endpoint_skips_resolution() {
    let mut settings = client_settings();
    // A name that cannot resolve proves the cache was used.
    settings.peer.host = "peer.invalid".to_owned();

    let net = Arc::new(RecordingNetwork::new(Some("192.0.2.1".parse().unwrap())));
    let opener = Arc::new(FakeOpener::default());
    let manager = ClientTunManager::new(settings, net.clone(), opener).unwrap();

    manager.set_route_endpoint("198.51.100.99:51820".parse().unwrap());
    manager.create_device().unwrap();

    let ops = net.recorded();
    assert!(ops.contains(&"delete_route 198.51.100.99/32".to_owned()));
    assert!(ops.contains(&"best_route 198.51.100.99".to_owned()));
}

#[test]
fn mismatched_route_endpoint_family_is_ignored() {
    let net = Arc::new(RecordingNetwork::new(Some("192.0.2.1".parse().unwrap())));
    let opener = Arc::new(FakeOpener::default());
    let manager = ClientTunManager::new(client_settings(), net.clone(), opener).unwrap();

    manager.set_route_endpoint("[2001:db8::1]:51820".parse().unwrap());
    manager.create_device().unwrap();

    // Fell back to the configured peer literal.
    assert!(
        net.recorded()
            .contains(&"best_route 198.51.100.10".to_owned())
    );
}

#[test]
fn peer_route_through_own_tunnel_is_rejected() {
    let net = Arc::new(RecordingNetwork {
        ops: Mutex::new(Vec::new()),
        best_route: Route {
            gateway: None,
            if_name: "tun0".to_owned(),
            if_index: 7,
            metric: 0,
        },
        fail_op: None,
    });
    let opener = Arc::new(FakeOpener::default());
    let manager = ClientTunManager::new(client_settings(), net, opener).unwrap();

    let err = manager.create_device().unwrap_err();

    assert_eq!(err.failed_step(), Some("install peer host route"));
}

#[test]
fn server_create_and_dispose_mirror_each_other() {
    let net = Arc::new(RecordingNetwork::new(Some("192.0.2.1".parse().unwrap())));
    let opener = Arc::new(FakeOpener::default());
    let manager = ServerTunManager::new(server_settings(), net.clone(), opener.clone()).unwrap();

    manager.create_device().unwrap();

    assert_eq!(
        net.recorded(),
        vec![
            "set_interface_up tun0",
            "assign_address tun0 10.0.0.1/24",
            "set_mtu tun0 1400",
            "enable_ip_forwarding",
            "best_route 8.8.8.8",
            "enable_masquerade eth0 IPv4",
            "accept_forward tun0 eth0",
            "accept_forward_established eth0 tun0",
            "install_mss_clamp tun0",
        ]
    );

    net.ops.lock().unwrap().clear();
    manager.dispose_devices().unwrap();

    assert_eq!(
        net.recorded(),
        vec![
            "remove_mss_clamp tun0",
            "delete_accept_forward_established eth0 tun0",
            "delete_accept_forward tun0 eth0",
            "disable_masquerade eth0 IPv4",
            "delete_address tun0 10.0.0.1/24",
            "delete_interface tun0",
        ]
    );

    let devices = opener.opened.lock().unwrap();
    assert!(devices[0].closed.load(Ordering::Acquire));
}

#[test]
fn dispose_twice_is_idempotent() {
    let net = Arc::new(RecordingNetwork::new(Some("192.0.2.1".parse().unwrap())));
    let opener = Arc::new(FakeOpener::default());
    let manager = ClientTunManager::new(client_settings(), net.clone(), opener).unwrap();

    manager.create_device().unwrap();
    manager.dispose_devices().unwrap();

    net.ops.lock().unwrap().clear();
    manager.dispose_devices().unwrap();

    assert!(net.recorded().is_empty());
}
