//! Host-network programming on Linux.
//!
//! Mutations go through the `ip` and `sysctl` binaries; route-table reads
//! prefer rtnetlink and fall back to `ip route get` where the netlink
//! socket cannot be opened. Netfilter state goes through whichever backend
//! [`netfilter`] detects.

mod dns;
mod mss;
mod netfilter;
mod netlink;

use std::net::IpAddr;
use std::sync::{Arc, OnceLock};

use ip_network::IpNetwork;

use crate::exec::{CommandRunner, ExecError, SystemRunner};
use crate::{Error, Family, HostNetwork, Result, Route};

pub use netfilter::{LockedNetfilter, NetfilterBackend, detect_backend};

pub struct LinuxNetwork {
    runner: Arc<dyn CommandRunner>,
    netlink: OnceLock<Option<netlink::RouteReader>>,
    netfilter: OnceLock<std::result::Result<LockedNetfilter, String>>,
    mss: mss::MssClamp,
    dns: dns::DnsControl,
}

impl LinuxNetwork {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemRunner))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner: runner.clone(),
            netlink: OnceLock::new(),
            netfilter: OnceLock::new(),
            mss: mss::MssClamp::new(runner.clone()),
            dns: dns::DnsControl::new(runner),
        }
    }

    fn netlink(&self) -> Option<&netlink::RouteReader> {
        self.netlink
            .get_or_init(|| match netlink::RouteReader::new() {
                Ok(reader) => Some(reader),
                Err(e) => {
                    tracing::debug!(
                        "No netlink route socket, falling back to `ip route get`: {e:#}"
                    );
                    None
                }
            })
            .as_ref()
    }

    /// The netfilter backend, detected at first use and cached.
    fn netfilter(&self) -> Result<&LockedNetfilter> {
        self.netfilter
            .get_or_init(|| {
                netfilter::detect_backend(self.runner.clone()).map_err(|e| e.to_string())
            })
            .as_ref()
            .map_err(|e| Error::BackendUnavailable(e.clone()))
    }

    fn ip(&self, op: &str, args: &[&str]) -> Result<()> {
        self.runner
            .run_status("ip", args)
            .map_err(|e| Error::host_state(op, e))
    }

    /// Like [`LinuxNetwork::ip`] but treats any of `tolerate` in the failure
    /// output as the desired state already holding.
    fn ip_tolerant(&self, op: &str, args: &[&str], tolerate: &[&str]) -> Result<()> {
        match self.runner.run_status("ip", args) {
            Ok(()) => Ok(()),
            Err(e) if is_tolerable(&e, tolerate) => {
                tracing::debug!("{op}: already in desired state ({e})");
                Ok(())
            }
            Err(e) => Err(Error::host_state(op, e)),
        }
    }
}

impl Default for LinuxNetwork {
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

const ROUTE_MISSING: &[&str] = &[
    "No such process",
    "No such file or directory",
    "Cannot find device",
];

impl HostNetwork for LinuxNetwork {
    fn assign_address(&self, if_name: &str, addr: IpAddr, prefix_len: u8) -> Result<()> {
        let cidr = format!("{addr}/{prefix_len}");

        self.ip_tolerant(
            "assign address",
            &["addr", "add", &cidr, "dev", if_name],
            &["File exists"],
        )
    }

    fn delete_address(&self, if_name: &str, addr: IpAddr, prefix_len: u8) -> Result<()> {
        let cidr = format!("{addr}/{prefix_len}");

        self.ip_tolerant(
            "delete address",
            &["addr", "del", &cidr, "dev", if_name],
            &["Cannot assign requested address", "Cannot find device"],
        )
    }

    fn set_mtu(&self, if_name: &str, family: Family, mtu: u32) -> Result<()> {
        if mtu < family.min_mtu() {
            return Err(Error::MtuBelowMinimum {
                mtu,
                family,
                min: family.min_mtu(),
            });
        }

        self.ip(
            "set MTU",
            &["link", "set", "dev", if_name, "mtu", &mtu.to_string()],
        )
    }

    fn set_interface_up(&self, if_name: &str) -> Result<()> {
        self.ip("set interface up", &["link", "set", "dev", if_name, "up"])?;

        // A deeper TX queue absorbs bursts the tunnel would otherwise drop.
        if let Err(e) = self.runner.run_status(
            "ip",
            &["link", "set", "dev", if_name, "txqueuelen", "10000"],
        ) {
            tracing::debug!("Failed to set TX queue length: {e}");
        }

        Ok(())
    }

    fn delete_interface(&self, if_name: &str) -> Result<()> {
        self.ip_tolerant(
            "delete interface",
            &["link", "del", if_name],
            &["Cannot find device"],
        )
    }

    fn add_route_on_link(&self, dest: IpNetwork, if_name: &str, metric: u32) -> Result<()> {
        self.ip_tolerant(
            "add on-link route",
            &[
                "route",
                "add",
                &dest.to_string(),
                "dev",
                if_name,
                "metric",
                &metric.to_string(),
            ],
            &["File exists"],
        )
    }

    fn add_route_via_gateway(
        &self,
        dest: IpNetwork,
        if_name: &str,
        gateway: IpAddr,
        metric: u32,
    ) -> Result<()> {
        self.ip_tolerant(
            "add route via gateway",
            &[
                "route",
                "add",
                &dest.to_string(),
                "via",
                &gateway.to_string(),
                "dev",
                if_name,
                "metric",
                &metric.to_string(),
            ],
            &["File exists"],
        )
    }

    fn delete_route(&self, dest: IpNetwork) -> Result<()> {
        self.ip_tolerant(
            "delete route",
            &["route", "del", &dest.to_string()],
            ROUTE_MISSING,
        )
    }

    fn delete_route_on_interface(&self, dest: IpNetwork, if_name: &str) -> Result<()> {
        self.ip_tolerant(
            "delete route",
            &["route", "del", &dest.to_string(), "dev", if_name],
            ROUTE_MISSING,
        )
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
        if let Some(reader) = self.netlink() {
            match reader.best_route(dest) {
                Ok(Some(route)) => return Ok(route),
                Ok(None) => return Err(Error::NoRoute(dest)),
                Err(e) => {
                    tracing::debug!(
                        "Netlink best-route lookup failed, falling back to `ip route get`: {e:#}"
                    );
                }
            }
        }

        let output = self
            .runner
            .run_stdout("ip", &["route", "get", &dest.to_string()])
            .map_err(|e| Error::host_state("best route", e))?;

        netlink::parse_route_get(&output, dest).ok_or(Error::NoRoute(dest))
    }

    fn set_dns(&self, if_name: &str, resolvers: &[IpAddr]) -> Result<()> {
        self.dns.set(if_name, resolvers)
    }

    fn flush_dns(&self) -> Result<()> {
        self.dns.flush();
        Ok(())
    }

    fn enable_ip_forwarding(&self) -> Result<()> {
        let already_on = self
            .runner
            .run_stdout("sysctl", &["-n", "net.ipv4.ip_forward"])
            .map(|v| v.trim() == "1")
            .unwrap_or(false);

        if !already_on {
            let write = || {
                self.runner
                    .run_status("sysctl", &["-w", "net.ipv4.ip_forward=1"])
            };

            // One retry: the first write can lose against sysctl remounts
            // during early boot.
            if let Err(first) = write() {
                tracing::debug!("Enabling IPv4 forwarding failed once, retrying: {first}");
                write().map_err(|e| Error::host_state("enable IPv4 forwarding", e))?;
            }
        }

        // Advisory: helps TCP survive the reduced tunnel MTU.
        if let Err(e) = self
            .runner
            .run_status("sysctl", &["-w", "net.ipv4.tcp_mtu_probing=1"])
        {
            tracing::debug!("Failed to enable TCP MTU probing: {e}");
        }

        Ok(())
    }

    fn enable_masquerade(&self, ext_if: &str, family: Family, best_effort: bool) -> Result<()> {
        self.netfilter()?.enable_masquerade(ext_if, family, best_effort)
    }

    fn disable_masquerade(&self, ext_if: &str, family: Family, best_effort: bool) -> Result<()> {
        self.netfilter()?.disable_masquerade(ext_if, family, best_effort)
    }

    fn accept_forward(&self, in_if: &str, out_if: &str) -> Result<()> {
        self.netfilter()?.accept_forward(in_if, out_if)
    }

    fn delete_accept_forward(&self, in_if: &str, out_if: &str) -> Result<()> {
        self.netfilter()?.delete_accept_forward(in_if, out_if)
    }

    fn accept_forward_established(&self, in_if: &str, out_if: &str) -> Result<()> {
        self.netfilter()?.accept_forward_established(in_if, out_if)
    }

    fn delete_accept_forward_established(&self, in_if: &str, out_if: &str) -> Result<()> {
        self.netfilter()?
            .delete_accept_forward_established(in_if, out_if)
    }

    fn install_mss_clamp(&self, tun_name: &str) -> Result<()> {
        self.mss.install(tun_name)
    }

    fn remove_mss_clamp(&self, tun_name: &str) -> Result<()> {
        self.mss.remove(tun_name)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::exec::command_line;

    use super::*;

    /// Succeeds for everything except commands scripted to fail.
    struct ScriptedRunner {
        failing: HashMap<String, (i32, String)>,
        commands: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(failing: &[(&str, i32, &str)]) -> Self {
            Self {
                failing: failing
                    .iter()
                    .map(|(cmd, code, output)| {
                        ((*cmd).to_owned(), (*code, (*output).to_owned()))
                    })
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

            match self.failing.get(&command) {
                Some((code, output)) => Err(ExecError::Failed {
                    command,
                    code: Some(*code),
                    output: output.clone(),
                }),
                None => Ok(String::new()),
            }
        }

        fn run_stdout(&self, program: &str, args: &[&str]) -> std::result::Result<String, ExecError> {
            self.run(program, args)
        }
    }

    fn network(runner: &Arc<ScriptedRunner>) -> LinuxNetwork {
        LinuxNetwork::with_runner(runner.clone() as Arc<dyn CommandRunner>)
    }

    #[test]
    fn assign_address_emits_ip_addr_add() {
        let runner = Arc::new(ScriptedRunner::new(&[]));
        let net = network(&runner);

        net.assign_address("tun0", "10.0.0.2".parse().unwrap(), 30)
            .unwrap();

        assert_eq!(runner.recorded(), vec!["ip addr add 10.0.0.2/30 dev tun0"]);
    }

    #[test]
    fn existing_address_is_tolerated() {
        let runner = Arc::new(ScriptedRunner::new(&[(
            "ip addr add 10.0.0.2/30 dev tun0",
            2,
            "RTNETLINK answers: File exists",
        )]));
        let net = network(&runner);

        net.assign_address("tun0", "10.0.0.2".parse().unwrap(), 30)
            .unwrap();
    }

    #[test]
    fn missing_route_deletion_succeeds() {
        let runner = Arc::new(ScriptedRunner::new(&[(
            "ip route del 198.51.100.10/32",
            2,
            "RTNETLINK answers: No such process",
        )]));
        let net = network(&runner);

        net.delete_route("198.51.100.10/32".parse().unwrap()).unwrap();
    }

    #[test]
    fn split_default_routes_install_both_halves() {
        let runner = Arc::new(ScriptedRunner::new(&[]));
        let net = network(&runner);

        net.add_default_split_routes("tun0", Family::V4, 0).unwrap();

        assert_eq!(
            runner.recorded(),
            vec![
                "ip route add 0.0.0.0/1 dev tun0 metric 0",
                "ip route add 128.0.0.0/1 dev tun0 metric 0",
            ]
        );
    }

    #[test]
    fn mtu_below_family_minimum_never_reaches_the_host() {
        let runner = Arc::new(ScriptedRunner::new(&[]));
        let net = network(&runner);

        let err = net.set_mtu("tun0", Family::V6, 1000).unwrap_err();

        assert!(matches!(err, Error::MtuBelowMinimum { .. }));
        assert!(runner.recorded().is_empty());
    }

    #[test]
    fn forwarding_write_is_skipped_when_already_on() {
        let runner = Arc::new(ScriptedRunner::new(&[]));
        let net = network(&runner);

        // The scripted runner returns "" for the read, which is not "1",
        // so a write follows.
        net.enable_ip_forwarding().unwrap();

        assert!(
            runner
                .recorded()
                .contains(&"sysctl -w net.ipv4.ip_forward=1".to_owned())
        );
    }

    #[test]
    fn forwarding_write_retries_once() {
        let runner = Arc::new(ScriptedRunner::new(&[(
            "sysctl -w net.ipv4.ip_forward=1",
            1,
            "permission denied",
        )]));
        let net = network(&runner);

        let err = net.enable_ip_forwarding().unwrap_err();

        assert!(err.to_string().contains("enable IPv4 forwarding"));
        let writes = runner
            .recorded()
            .iter()
            .filter(|c| c.as_str() == "sysctl -w net.ipv4.ip_forward=1")
            .count();
        assert_eq!(writes, 2);
    }
}
