//! TCP MSS clamping for the tunnel interface.
//!
//! Classic mangle-table rules in three placements (`OUTPUT -o tun`,
//! `FORWARD -o tun`, `FORWARD -i tun`) for each family. Whether an IPv6
//! companion binary exists is probed once and cached; when `iptables` is
//! missing entirely, a dedicated `inet tungo_mss` nft table takes over.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::exec::CommandRunner;
use crate::{Error, Result};

const NFT_TABLE: &[&str] = &["inet", "tungo_mss"];

pub(crate) struct MssClamp {
    runner: Arc<dyn CommandRunner>,
    /// Outcome of the `ip6tables` probe; `None` until first probed.
    v6_available: Mutex<Option<bool>>,
}

impl MssClamp {
    pub(crate) fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            v6_available: Mutex::new(None),
        }
    }

    pub(crate) fn install(&self, tun_name: &str) -> Result<()> {
        if self.iptables_usable() {
            self.apply_iptables(tun_name, "-A")
        } else {
            self.install_nft(tun_name)
        }
    }

    pub(crate) fn remove(&self, tun_name: &str) -> Result<()> {
        if self.iptables_usable() {
            self.apply_iptables(tun_name, "-D")
        } else {
            self.remove_nft()
        }
    }

    fn iptables_usable(&self) -> bool {
        self.runner.run("iptables", &["--version"]).is_ok()
    }

    fn apply_iptables(&self, tun_name: &str, action: &str) -> Result<()> {
        for placement in placements(tun_name) {
            self.clamp_rule("iptables", action, &placement)?;
        }

        if self.v6_usable() {
            for placement in placements(tun_name) {
                self.clamp_rule("ip6tables", action, &placement)?;
            }
        }

        Ok(())
    }

    fn clamp_rule(&self, binary: &str, action: &str, placement: &[&str; 3]) -> Result<()> {
        let mut args = vec!["-t", "mangle", action];
        args.extend_from_slice(placement);
        args.extend_from_slice(&[
            "-p",
            "tcp",
            "--tcp-flags",
            "SYN,RST",
            "SYN",
            "-j",
            "TCPMSS",
            "--clamp-mss-to-pmtu",
        ]);

        match self.runner.run_status(binary, &args) {
            Ok(()) => Ok(()),
            // Deleting a rule that is not there is the desired end state.
            Err(e) if action == "-D" && e.is_exit() => {
                tracing::debug!("MSS clamp rule already absent ({e})");
                Ok(())
            }
            Err(e) => Err(Error::host_state("MSS clamping", e)),
        }
    }

    fn v6_usable(&self) -> bool {
        let mut cached = self.v6_available.lock();

        if let Some(usable) = *cached {
            return usable;
        }

        let usable = self
            .runner
            .run("ip6tables", &["-t", "mangle", "-L", "-n"])
            .is_ok();
        *cached = Some(usable);

        if !usable {
            tracing::debug!("No usable ip6tables, IPv6 MSS clamping disabled");
        }

        usable
    }

    fn install_nft(&self, tun_name: &str) -> Result<()> {
        let nft = |args: &[&str]| {
            self.runner
                .run_status("nft", args)
                .map_err(|e| Error::host_state("MSS clamping (nft)", e))
        };

        let mut add_table = vec!["add", "table"];
        add_table.extend_from_slice(NFT_TABLE);
        nft(&add_table)?;

        for (chain, kind, hook) in [("output", "route", "output"), ("forward", "filter", "forward")]
        {
            let mut add_chain = vec!["add", "chain"];
            add_chain.extend_from_slice(NFT_TABLE);
            add_chain.extend_from_slice(&[
                chain, "{", "type", kind, "hook", hook, "priority", "-150", ";", "}",
            ]);
            nft(&add_chain)?;
        }

        // Flushing before re-adding keeps repeated installs at one rule per
        // placement.
        let mut flush = vec!["flush", "table"];
        flush.extend_from_slice(NFT_TABLE);
        nft(&flush)?;

        for (chain, direction) in [
            ("output", "oifname"),
            ("forward", "oifname"),
            ("forward", "iifname"),
        ] {
            let mut add_rule = vec!["add", "rule"];
            add_rule.extend_from_slice(NFT_TABLE);
            add_rule.extend_from_slice(&[
                chain, direction, tun_name, "tcp", "flags", "syn", "tcp", "option", "maxseg",
                "size", "set", "rt", "mtu",
            ]);
            nft(&add_rule)?;
        }

        Ok(())
    }

    fn remove_nft(&self) -> Result<()> {
        let mut delete = vec!["delete", "table"];
        delete.extend_from_slice(NFT_TABLE);

        match self.runner.run_status("nft", &delete) {
            Ok(()) => Ok(()),
            // The table never existing is a clean teardown too.
            Err(e) if e.is_exit() => {
                tracing::debug!("MSS nft table already absent ({e})");
                Ok(())
            }
            Err(e) => Err(Error::host_state("MSS clamping removal (nft)", e)),
        }
    }
}

fn placements(tun_name: &str) -> [[&str; 3]; 3] {
    [
        ["OUTPUT", "-o", tun_name],
        ["FORWARD", "-o", tun_name],
        ["FORWARD", "-i", tun_name],
    ]
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use crate::exec::{ExecError, command_line};

    use super::*;

    /// Succeeds for every command except the ones listed as failing;
    /// commands whose program is listed as missing fail to spawn.
    struct ScriptedRunner {
        failing: HashMap<String, i32>,
        missing: Vec<&'static str>,
        commands: StdMutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(failing: &[(&str, i32)], missing: &[&'static str]) -> Self {
            Self {
                failing: failing
                    .iter()
                    .map(|(cmd, code)| ((*cmd).to_owned(), *code))
                    .collect(),
                missing: missing.to_vec(),
                commands: StdMutex::new(Vec::new()),
            }
        }

        fn recorded(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, program: &str, args: &[&str]) -> std::result::Result<String, ExecError> {
            let command = command_line(program, args);

            if self.missing.contains(&program) {
                return Err(ExecError::Spawn {
                    command,
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }

            self.commands.lock().unwrap().push(command.clone());

            match self.failing.get(&command) {
                Some(code) => Err(ExecError::Failed {
                    command,
                    code: Some(*code),
                    output: String::new(),
                }),
                None => Ok("ok".to_owned()),
            }
        }

        fn run_stdout(&self, program: &str, args: &[&str]) -> std::result::Result<String, ExecError> {
            self.run(program, args)
        }
    }

    const V4_INSTALL: [&str; 3] = [
        "iptables -t mangle -A OUTPUT -o tun0 -p tcp --tcp-flags SYN,RST SYN -j TCPMSS --clamp-mss-to-pmtu",
        "iptables -t mangle -A FORWARD -o tun0 -p tcp --tcp-flags SYN,RST SYN -j TCPMSS --clamp-mss-to-pmtu",
        "iptables -t mangle -A FORWARD -i tun0 -p tcp --tcp-flags SYN,RST SYN -j TCPMSS --clamp-mss-to-pmtu",
    ];

    #[test]
    fn install_emits_probe_then_v4_then_v6() {
        let runner = Arc::new(ScriptedRunner::new(&[], &[]));
        let clamp = MssClamp::new(runner.clone());

        clamp.install("tun0").unwrap();

        let mut expected = vec!["iptables --version".to_owned()];
        expected.extend(V4_INSTALL.iter().map(|s| (*s).to_owned()));
        expected.push("ip6tables -t mangle -L -n".to_owned());
        expected.extend(
            V4_INSTALL
                .iter()
                .map(|s| s.replace("iptables", "ip6tables")),
        );

        assert_eq!(runner.recorded(), expected);
    }

    #[test]
    fn remove_mirrors_install_and_skips_cached_failed_v6() {
        let runner = Arc::new(ScriptedRunner::new(
            &[("ip6tables -t mangle -L -n", 3)],
            &[],
        ));
        let clamp = MssClamp::new(runner.clone());

        clamp.install("tun0").unwrap();
        runner.commands.lock().unwrap().clear();

        clamp.remove("tun0").unwrap();

        let mut expected = vec!["iptables --version".to_owned()];
        expected.extend(V4_INSTALL.iter().map(|s| s.replace("-A", "-D")));

        // No v6 probe re-run, no v6 deletions: the failed probe is cached.
        assert_eq!(runner.recorded(), expected);
    }

    #[test]
    fn cached_successful_v6_probe_is_not_rerun() {
        let runner = Arc::new(ScriptedRunner::new(&[], &[]));
        let clamp = MssClamp::new(runner.clone());

        clamp.install("tun0").unwrap();
        runner.commands.lock().unwrap().clear();

        clamp.remove("tun0").unwrap();

        let recorded = runner.recorded();
        assert!(!recorded.contains(&"ip6tables -t mangle -L -n".to_owned()));
        assert!(
            recorded.contains(
                &"ip6tables -t mangle -D OUTPUT -o tun0 -p tcp --tcp-flags SYN,RST SYN -j TCPMSS --clamp-mss-to-pmtu"
                    .to_owned()
            )
        );
    }

    #[test]
    fn missing_iptables_falls_back_to_nft() {
        let runner = Arc::new(ScriptedRunner::new(&[], &["iptables"]));
        let clamp = MssClamp::new(runner.clone());

        clamp.install("tun0").unwrap();

        let recorded = runner.recorded();
        assert_eq!(recorded[0], "nft add table inet tungo_mss");
        assert!(
            recorded
                .iter()
                .any(|c| c.contains("tcp option maxseg size set rt mtu"))
        );
    }

    #[test]
    fn nft_teardown_tolerates_missing_table() {
        let runner = Arc::new(ScriptedRunner::new(
            &[("nft delete table inet tungo_mss", 1)],
            &["iptables"],
        ));
        let clamp = MssClamp::new(runner.clone());

        clamp.remove("tun0").unwrap();
    }
}
