//! Host-network programming on macOS, via `ifconfig` and `route`.
//!
//! utun interfaces are point-to-point: assigning an address also programs
//! the peer, equal to the local address. DNS is applied per network service
//! with `networksetup`, best-effort, because macOS has no per-interface
//! resolver list for third parties.

use std::net::IpAddr;
use std::sync::Arc;

use ip_network::IpNetwork;

use crate::exec::{CommandRunner, ExecError, SystemRunner};
use crate::{Error, Family, HostNetwork, Result, Route};

pub struct MacosNetwork {
    runner: Arc<dyn CommandRunner>,
}

impl MacosNetwork {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemRunner))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn route_cmd(&self, op: &str, args: &[&str], tolerate: &[&str]) -> Result<()> {
        match self.runner.run_status("route", args) {
            Ok(()) => Ok(()),
            Err(e) if is_tolerable(&e, tolerate) => {
                tracing::debug!("{op}: already in desired state ({e})");
                Ok(())
            }
            Err(e) => Err(Error::host_state(op, e)),
        }
    }

    fn add_route(&self, dest: IpNetwork, target: &[&str]) -> Result<()> {
        let mut args = vec!["-n", "add"];
        if matches!(dest, IpNetwork::V6(_)) {
            args.push("-inet6");
        }
        let dest = dest.to_string();
        args.extend_from_slice(&["-net", &dest]);
        args.extend_from_slice(target);

        self.route_cmd("add route", &args, &["File exists", "exists"])
    }

    fn delete_route_args(&self, dest: IpNetwork, target: &[&str]) -> Result<()> {
        let mut args = vec!["-n", "delete"];
        if matches!(dest, IpNetwork::V6(_)) {
            args.push("-inet6");
        }
        let dest = dest.to_string();
        args.extend_from_slice(&["-net", &dest]);
        args.extend_from_slice(target);

        self.route_cmd("delete route", &args, &["not in table"])
    }

    /// Network services eligible for DNS programming: every enabled service
    /// from `networksetup -listallnetworkservices`.
    fn network_services(&self) -> Result<Vec<String>> {
        let listing = self
            .runner
            .run_stdout("networksetup", &["-listallnetworkservices"])
            .map_err(|e| Error::host_state("list network services", e))?;

        Ok(listing
            .lines()
            .skip(1) // "An asterisk (*) denotes that a network service is disabled."
            .filter(|line| !line.starts_with('*') && !line.trim().is_empty())
            .map(str::to_owned)
            .collect())
    }
}

impl Default for MacosNetwork {
    fn default() -> Self {
        Self::new()
    }
}

fn is_tolerable(err: &ExecError, needles: &[&str]) -> bool {
    if !err.is_exit() {
        return false;
    }

    let text = err.to_string();
    needles.iter().any(|needle| text.contains(needle))
}

impl HostNetwork for MacosNetwork {
    fn assign_address(&self, if_name: &str, addr: IpAddr, prefix_len: u8) -> Result<()> {
        let result = match addr {
            IpAddr::V4(_) => {
                let cidr = format!("{addr}/{prefix_len}");
                let peer = addr.to_string();
                // Point-to-point: the peer is our own address.
                self.runner
                    .run_status("ifconfig", &[if_name, "inet", &cidr, &peer, "up"])
            }
            IpAddr::V6(_) => {
                let addr = addr.to_string();
                let prefix = prefix_len.to_string();
                self.runner.run_status(
                    "ifconfig",
                    &[if_name, "inet6", &addr, "prefixlen", &prefix, "up"],
                )
            }
        };

        result.map_err(|e| Error::host_state("assign address", e))
    }

    fn delete_address(&self, if_name: &str, addr: IpAddr, _prefix_len: u8) -> Result<()> {
        let family = match addr {
            IpAddr::V4(_) => "inet",
            IpAddr::V6(_) => "inet6",
        };
        let addr = addr.to_string();

        match self
            .runner
            .run_status("ifconfig", &[if_name, family, &addr, "delete"])
        {
            Ok(()) => Ok(()),
            Err(e) if is_tolerable(&e, &["Can't assign requested address", "not found"]) => {
                tracing::debug!("delete address: already absent ({e})");
                Ok(())
            }
            Err(e) => Err(Error::host_state("delete address", e)),
        }
    }

    fn set_mtu(&self, if_name: &str, family: Family, mtu: u32) -> Result<()> {
        if mtu < family.min_mtu() {
            return Err(Error::MtuBelowMinimum {
                mtu,
                family,
                min: family.min_mtu(),
            });
        }

        self.runner
            .run_status("ifconfig", &[if_name, "mtu", &mtu.to_string()])
            .map_err(|e| Error::host_state("set MTU", e))
    }

    fn set_interface_up(&self, if_name: &str) -> Result<()> {
        self.runner
            .run_status("ifconfig", &[if_name, "up"])
            .map_err(|e| Error::host_state("set interface up", e))
    }

    fn delete_interface(&self, if_name: &str) -> Result<()> {
        // utun interfaces disappear when their control socket closes;
        // `destroy` only works for cloned interfaces.
        if let Err(e) = self.runner.run_status("ifconfig", &[if_name, "destroy"]) {
            tracing::debug!("Could not destroy {if_name}, it will vanish with its fd: {e}");
        }

        Ok(())
    }

    fn add_route_on_link(&self, dest: IpNetwork, if_name: &str, _metric: u32) -> Result<()> {
        self.add_route(dest, &["-interface", if_name])
    }

    fn add_route_via_gateway(
        &self,
        dest: IpNetwork,
        _if_name: &str,
        gateway: IpAddr,
        _metric: u32,
    ) -> Result<()> {
        let gateway = gateway.to_string();
        self.add_route(dest, &[gateway.as_str()])
    }

    fn delete_route(&self, dest: IpNetwork) -> Result<()> {
        self.delete_route_args(dest, &[])
    }

    fn delete_route_on_interface(&self, dest: IpNetwork, if_name: &str) -> Result<()> {
        self.delete_route_args(dest, &["-interface", if_name])
    }

    fn add_default_split_routes(&self, if_name: &str, family: Family, metric: u32) -> Result<()> {
        for half in family.split_default() {
            self.add_route_on_link(half, if_name, metric)?;
        }

        Ok(())
    }

    fn delete_default_split_routes(&self, if_name: &str, family: Family) -> Result<()> {
        for half in family.split_default() {
            self.delete_route_on_interface(half, if_name)?;
        }

        Ok(())
    }

    fn best_route(&self, dest: IpAddr) -> Result<Route> {
        let mut args = vec!["-n", "get"];
        if dest.is_ipv6() {
            args.push("-inet6");
        }
        let dest_text = dest.to_string();
        args.push(&dest_text);

        let output = self
            .runner
            .run_stdout("route", &args)
            .map_err(|e| Error::host_state("best route", e))?;

        let mut route = parse_route_get(&output).ok_or(Error::NoRoute(dest))?;

        // A loopback next-hop can never carry peer traffic; fall back to the
        // system default route's choice.
        if gateway_is_loopback(&route) {
            let output = self
                .runner
                .run_stdout("route", &["-n", "get", "default"])
                .map_err(|e| Error::host_state("best route (default)", e))?;

            route = parse_route_get(&output).ok_or(Error::NoRoute(dest))?;
        }

        Ok(route)
    }

    fn set_dns(&self, _if_name: &str, resolvers: &[IpAddr]) -> Result<()> {
        let services = self.network_services()?;

        let addresses = resolvers.iter().map(|ip| ip.to_string()).collect::<Vec<_>>();

        for service in &services {
            let mut args = vec!["-setdnsservers", service.as_str()];
            if addresses.is_empty() {
                args.push("Empty");
            } else {
                args.extend(addresses.iter().map(String::as_str));
            }

            if let Err(e) = self.runner.run_status("networksetup", &args) {
                tracing::warn!(%service, "Failed to set DNS servers: {e}");
            }
        }

        Ok(())
    }

    fn flush_dns(&self) -> Result<()> {
        if let Err(e) = self.runner.run_status("dscacheutil", &["-flushcache"]) {
            tracing::debug!("Failed to flush DNS cache: {e}");
        }
        if let Err(e) = self
            .runner
            .run_status("killall", &["-HUP", "mDNSResponder"])
        {
            tracing::debug!("Failed to signal mDNSResponder: {e}");
        }

        Ok(())
    }

    fn enable_ip_forwarding(&self) -> Result<()> {
        Err(Error::Unsupported("IP forwarding control"))
    }

    fn enable_masquerade(&self, _ext_if: &str, _family: Family, _best_effort: bool) -> Result<()> {
        Err(Error::Unsupported("masquerade"))
    }

    fn disable_masquerade(&self, _ext_if: &str, _family: Family, _best_effort: bool) -> Result<()> {
        Err(Error::Unsupported("masquerade"))
    }

    fn accept_forward(&self, _in_if: &str, _out_if: &str) -> Result<()> {
        Err(Error::Unsupported("forward filtering"))
    }

    fn delete_accept_forward(&self, _in_if: &str, _out_if: &str) -> Result<()> {
        Err(Error::Unsupported("forward filtering"))
    }

    fn accept_forward_established(&self, _in_if: &str, _out_if: &str) -> Result<()> {
        Err(Error::Unsupported("forward filtering"))
    }

    fn delete_accept_forward_established(&self, _in_if: &str, _out_if: &str) -> Result<()> {
        Err(Error::Unsupported("forward filtering"))
    }

    fn install_mss_clamp(&self, _tun_name: &str) -> Result<()> {
        // No netfilter here; the reduced MTU plus PMTU discovery has to do.
        tracing::debug!("MSS clamping is not available on macOS, skipping");
        Ok(())
    }

    fn remove_mss_clamp(&self, _tun_name: &str) -> Result<()> {
        Ok(())
    }
}

fn gateway_is_loopback(route: &Route) -> bool {
    match route.gateway {
        Some(IpAddr::V4(v4)) => v4.octets()[0] == 127,
        Some(IpAddr::V6(v6)) => v6.is_loopback(),
        None => false,
    }
}

/// Parses `route -n get` output:
///
/// ```text
///    route to: 198.51.100.10
///     gateway: 192.0.2.1
///   interface: en0
/// ```
fn parse_route_get(output: &str) -> Option<Route> {
    let mut gateway = None;
    let mut if_name = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };

        match key.trim() {
            // A `link#N` gateway means on-link; it fails the parse and
            // stays `None`.
            "gateway" => gateway = value.trim().parse::<IpAddr>().ok(),
            "interface" => if_name = Some(value.trim().to_owned()),
            _ => {}
        }
    }

    let if_name = if_name?;

    Some(Route {
        gateway,
        if_index: if_index_for(&if_name),
        if_name,
        metric: 0,
    })
}

fn if_index_for(name: &str) -> u32 {
    let Ok(name) = std::ffi::CString::new(name) else {
        return 0;
    };

    // Safety: `name` is a valid NUL-terminated string.
    unsafe { libc::if_nametoindex(name.as_ptr()) }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::exec::command_line;

    use super::*;

    struct ScriptedRunner {
        outputs: HashMap<String, String>,
        commands: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(outputs: &[(&str, &str)]) -> Self {
            Self {
                outputs: outputs
                    .iter()
                    .map(|(cmd, out)| ((*cmd).to_owned(), (*out).to_owned()))
                    .collect(),
                commands: Mutex::new(Vec::new()),
            }
        }

        fn recorded(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, program: &str, args: &[&str]) -> std::result::Result<String, ExecError> {
            let command = command_line(program, args);
            self.commands.lock().unwrap().push(command.clone());

            Ok(self.outputs.get(&command).cloned().unwrap_or_default())
        }

        fn run_stdout(&self, program: &str, args: &[&str]) -> std::result::Result<String, ExecError> {
            self.run(program, args)
        }
    }

    #[test]
    fn assign_v4_address_programs_point_to_point_peer() {
        let runner = Arc::new(ScriptedRunner::new(&[]));
        let net = MacosNetwork::with_runner(runner.clone());

        net.assign_address("utun7", "10.0.0.2".parse().unwrap(), 30)
            .unwrap();

        assert_eq!(
            runner.recorded(),
            vec!["ifconfig utun7 inet 10.0.0.2/30 10.0.0.2 up"]
        );
    }

    #[test]
    fn split_default_routes_use_interface_target() {
        let runner = Arc::new(ScriptedRunner::new(&[]));
        let net = MacosNetwork::with_runner(runner.clone());

        net.add_default_split_routes("utun7", Family::V4, 0).unwrap();

        assert_eq!(
            runner.recorded(),
            vec![
                "route -n add -net 0.0.0.0/1 -interface utun7",
                "route -n add -net 128.0.0.0/1 -interface utun7",
            ]
        );
    }

    #[test]
    fn loopback_gateway_falls_back_to_system_default() {
        let runner = Arc::new(ScriptedRunner::new(&[
            (
                "route -n get 198.51.100.10",
                "    gateway: 127.0.0.1\n  interface: lo0\n",
            ),
            (
                "route -n get default",
                "    gateway: 192.0.2.1\n  interface: en0\n",
            ),
        ]));
        let net = MacosNetwork::with_runner(runner.clone());

        let route = net.best_route("198.51.100.10".parse().unwrap()).unwrap();

        assert_eq!(route.gateway, Some("192.0.2.1".parse().unwrap()));
        assert_eq!(route.if_name, "en0");
    }

    const GATEWAY_OUTPUT: &str = "   route to: 198.51.100.10\ndestination: default\n       mask: default\n    gateway: 192.0.2.1\n  interface: en0\n      flags: <UP,GATEWAY,DONE,STATIC>\n";

    const ON_LINK_OUTPUT: &str =
        "   route to: 198.51.100.10\n    gateway: link#4\n  interface: en0\n";

    #[test]
    fn parses_gateway_route() {
        let route = parse_route_get(GATEWAY_OUTPUT).unwrap();

        assert_eq!(route.gateway, Some("192.0.2.1".parse().unwrap()));
        assert_eq!(route.if_name, "en0");
    }

    #[test]
    fn link_gateway_is_on_link() {
        let route = parse_route_get(ON_LINK_OUTPUT).unwrap();

        assert_eq!(route.gateway, None);
        assert_eq!(route.if_name, "en0");
    }

    #[test]
    fn missing_interface_fails_the_parse() {
        assert!(parse_route_get("route: writing to routing socket: not in table\n").is_none());
    }

    #[test]
    fn loopback_gateway_detected() {
        let route = Route {
            gateway: Some("127.0.0.1".parse().unwrap()),
            if_name: "lo0".to_owned(),
            if_index: 1,
            metric: 0,
        };

        assert!(gateway_is_loopback(&route));
    }
}
