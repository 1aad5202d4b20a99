//! Per-interface DNS on Linux.
//!
//! systemd-resolved gets first pick (`resolvectl dns` + a `~.` routing
//! domain so the tunnel resolver wins). Hosts without it fall back to
//! rewriting `/etc/resolv.conf` in place, with the original backed up next
//! to it and a magic header so a crashed run is detected and reverted on
//! the next start.

use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, bail};

use crate::exec::CommandRunner;
use crate::{Error, Result};

const ETC_RESOLV_CONF: &str = "/etc/resolv.conf";
const ETC_RESOLV_CONF_BACKUP: &str = "/etc/resolv.conf.before-tungo";
const SYSTEMD_RESOLVE_DIR: &str = "/run/systemd/resolve";

/// Used to figure out whether we crashed on our last run or not.
///
/// If we did crash, the system-wide DNS is restored from the backup file
/// before being overwritten again.
const MAGIC_HEADER: &str = "# BEGIN TunGo DNS configuration";

#[derive(Clone)]
pub(crate) struct ResolvPaths {
    resolv: PathBuf,
    backup: PathBuf,
}

impl Default for ResolvPaths {
    fn default() -> Self {
        Self {
            resolv: PathBuf::from(ETC_RESOLV_CONF),
            backup: PathBuf::from(ETC_RESOLV_CONF_BACKUP),
        }
    }
}

pub(crate) struct DnsControl {
    runner: std::sync::Arc<dyn CommandRunner>,
    paths: ResolvPaths,
}

impl DnsControl {
    pub(crate) fn new(runner: std::sync::Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            paths: ResolvPaths::default(),
        }
    }

    pub(crate) fn set(&self, if_name: &str, resolvers: &[IpAddr]) -> Result<()> {
        if Path::new(SYSTEMD_RESOLVE_DIR).exists() {
            return self.set_resolved(if_name, resolvers);
        }

        if resolvers.is_empty() {
            revert_at_paths(&self.paths)
                .map_err(|e| Error::host_state("clear DNS", format!("{e:#}")))
        } else {
            configure_at_paths(resolvers, &self.paths)
                .map_err(|e| Error::host_state("set DNS", format!("{e:#}")))
        }
    }

    fn set_resolved(&self, if_name: &str, resolvers: &[IpAddr]) -> Result<()> {
        if resolvers.is_empty() {
            return self
                .runner
                .run_status("resolvectl", &["revert", if_name])
                .map_err(|e| Error::host_state("clear DNS", e));
        }

        let addresses = resolvers.iter().map(|ip| ip.to_string()).collect::<Vec<_>>();

        let mut args = vec!["dns", if_name];
        args.extend(addresses.iter().map(String::as_str));
        self.runner
            .run_status("resolvectl", &args)
            .map_err(|e| Error::host_state("set DNS", e))?;

        // `~.` routes every lookup to this interface's servers.
        self.runner
            .run_status("resolvectl", &["domain", if_name, "~."])
            .map_err(|e| Error::host_state("set DNS routing domain", e))
    }

    pub(crate) fn flush(&self) {
        if let Err(e) = self.runner.run_status("resolvectl", &["flush-caches"]) {
            tracing::debug!("Failed to flush resolver caches: {e}");
        }
    }
}

fn configure_at_paths(resolvers: &[IpAddr], paths: &ResolvPaths) -> anyhow::Result<()> {
    ensure_regular_file(&paths.resolv)?;

    let text = fs::read_to_string(&paths.resolv).context("Failed to read `resolv.conf`")?;
    let text = if text.starts_with(MAGIC_HEADER) {
        tracing::info!(
            "The last run crashed before reverting `/etc/resolv.conf`. Reverting it now before re-writing it."
        );
        revert_at_paths(paths).context("Failed to revert `resolv.conf`")?;
        fs::read_to_string(&paths.resolv)
            .context("Failed to re-read `resolv.conf` after reverting it")?
    } else {
        text
    };

    let parsed = resolv_conf::Config::parse(&text).context("Failed to parse `resolv.conf`")?;

    fs::write(&paths.backup, &text).context("Failed to back up `resolv.conf`")?;

    let mut new_resolv_conf = parsed;
    new_resolv_conf.nameservers = resolvers.iter().map(|addr| (*addr).into()).collect();

    // The file may be bind-mounted (containers), so rewrite in place rather
    // than rename into place.
    let new_text = format!(
        r"{MAGIC_HEADER}
# If you modify this file, delete the above magic header line so that TunGo
# will obey your new default DNS config.
# The original `resolv.conf` is backed up at {}
{}
",
        paths.backup.display(),
        new_resolv_conf,
    );

    fs::write(&paths.resolv, new_text).context("Failed to rewrite `resolv.conf`")?;

    Ok(())
}

fn revert_at_paths(paths: &ResolvPaths) -> anyhow::Result<()> {
    match fs::copy(&paths.backup, &paths.resolv) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("Didn't revert `/etc/resolv.conf`, no backup file found");
            Ok(())
        }
        Err(e) => Err(e).context("Failed to restore `/etc/resolv.conf` backup"),
        Ok(_) => Ok(()),
    }
}

fn ensure_regular_file(path: &Path) -> anyhow::Result<()> {
    let file_type = fs::symlink_metadata(path)?.file_type();
    if !file_type.is_file() {
        bail!("File `{path:?}` is not a regular file, cannot use it to control DNS");
    }
    Ok(())
}
