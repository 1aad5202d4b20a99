//! Netfilter backend selection and programming.
//!
//! One backend is picked at first use and cached for the process lifetime:
//! native nftables when the kernel accepts it, otherwise a legacy iptables
//! binary. All write paths are serialized through [`LockedNetfilter`]:
//! nft transactions and concurrent `iptables` invocations corrupt each
//! other, so the underlying backend sees at most one writer at a time.

use std::borrow::Cow;
use std::sync::Arc;

use nftables::batch::Batch;
use nftables::expr::{CT, Expression, Meta, MetaKey, NamedExpression};
use nftables::helper::{apply_ruleset, get_current_ruleset};
use nftables::schema::{Chain, NfListObject, NfObject, Rule, Table};
use nftables::stmt::{Match, Operator, Statement};
use nftables::types::{NfChainType, NfFamily, NfHook};
use parking_lot::Mutex;

use crate::exec::CommandRunner;
use crate::{Error, Family, Result};

const NAT_TABLE: &str = "tungo_nat";
const NAT_CHAIN: &str = "postrouting";
const NAT_PRIORITY: i32 = 100;
const FILTER_TABLE: &str = "tungo_filter";
const FILTER_CHAIN: &str = "forward";
const FILTER_PRIORITY: i32 = -100;

const FORWARD_CHAIN: &str = "IPTABLES-TUNGO-FWD";

/// The programming surface both backends implement. Methods take `&mut
/// self`; exclusivity comes from the decorator.
pub trait NetfilterBackend: Send {
    fn enable_masquerade(&mut self, ext_if: &str, family: Family, best_effort: bool)
    -> Result<()>;
    fn disable_masquerade(
        &mut self,
        ext_if: &str,
        family: Family,
        best_effort: bool,
    ) -> Result<()>;
    fn accept_forward(&mut self, in_if: &str, out_if: &str) -> Result<()>;
    fn delete_accept_forward(&mut self, in_if: &str, out_if: &str) -> Result<()>;
    fn accept_forward_established(&mut self, in_if: &str, out_if: &str) -> Result<()>;
    fn delete_accept_forward_established(&mut self, in_if: &str, out_if: &str) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Decorator serializing every mutation against the chosen backend.
pub struct LockedNetfilter {
    inner: Mutex<Box<dyn NetfilterBackend>>,
}

impl std::fmt::Debug for LockedNetfilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedNetfilter").finish_non_exhaustive()
    }
}

impl LockedNetfilter {
    pub fn new(backend: Box<dyn NetfilterBackend>) -> Self {
        Self {
            inner: Mutex::new(backend),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.lock().name()
    }

    pub fn enable_masquerade(&self, ext_if: &str, family: Family, best_effort: bool) -> Result<()> {
        self.inner.lock().enable_masquerade(ext_if, family, best_effort)
    }

    pub fn disable_masquerade(
        &self,
        ext_if: &str,
        family: Family,
        best_effort: bool,
    ) -> Result<()> {
        self.inner.lock().disable_masquerade(ext_if, family, best_effort)
    }

    pub fn accept_forward(&self, in_if: &str, out_if: &str) -> Result<()> {
        self.inner.lock().accept_forward(in_if, out_if)
    }

    pub fn delete_accept_forward(&self, in_if: &str, out_if: &str) -> Result<()> {
        self.inner.lock().delete_accept_forward(in_if, out_if)
    }

    pub fn accept_forward_established(&self, in_if: &str, out_if: &str) -> Result<()> {
        self.inner.lock().accept_forward_established(in_if, out_if)
    }

    pub fn delete_accept_forward_established(&self, in_if: &str, out_if: &str) -> Result<()> {
        self.inner
            .lock()
            .delete_accept_forward_established(in_if, out_if)
    }
}

/// Picks the netfilter backend for this host.
pub fn detect_backend(runner: Arc<dyn CommandRunner>) -> Result<LockedNetfilter> {
    detect_with(runner, nftables_usable())
}

/// Probe: the kernel speaks nftables iff listing the ruleset succeeds.
fn nftables_usable() -> bool {
    get_current_ruleset().is_ok()
}

pub(crate) fn detect_with(
    runner: Arc<dyn CommandRunner>,
    nftables_usable: bool,
) -> Result<LockedNetfilter> {
    if nftables_usable {
        tracing::debug!("Using nftables netfilter backend");
        return Ok(LockedNetfilter::new(Box::new(NftBackend)));
    }

    // A working iptables-legacy pair beats guessing at the plain binary.
    if let Ok(version) = runner.run("iptables-legacy", &["-V"])
        && !version.trim().is_empty()
    {
        let v6 = runner
            .run("ip6tables-legacy", &["-V"])
            .is_ok()
            .then_some("ip6tables-legacy");

        tracing::debug!(v6 = v6.is_some(), "Using iptables-legacy netfilter backend");

        return Ok(LockedNetfilter::new(Box::new(IptablesBackend {
            runner,
            v4: "iptables-legacy",
            v6,
        })));
    }

    match runner.run("iptables", &["-V"]) {
        Ok(version) if version.contains("legacy") => {
            let v6 = runner
                .run("ip6tables", &["-V"])
                .map(|v| v.contains("legacy"))
                .unwrap_or(false)
                .then_some("ip6tables");

            tracing::debug!(v6 = v6.is_some(), "Using legacy-mode iptables netfilter backend");

            Ok(LockedNetfilter::new(Box::new(IptablesBackend {
                runner,
                v4: "iptables",
                v6,
            })))
        }
        Ok(version) if version.contains("nf_tables") => Err(Error::BackendUnavailable(
            "iptables is in nf_tables mode but native nftables is unusable; \
             install iptables-legacy or enable nf_tables"
                .to_owned(),
        )),
        Ok(_) | Err(_) => Err(Error::BackendUnavailable(
            "neither nftables nor a legacy iptables binary is usable on this host".to_owned(),
        )),
    }
}

/// Native nftables backend.
///
/// Every rule carries a stable `tungo:<purpose> <keys>` comment; add and
/// delete scan the chain for that tag instead of trusting any local state.
struct NftBackend;

impl NftBackend {
    fn nat_table(family: NfFamily) -> Table<'static> {
        Table {
            family,
            name: Cow::Borrowed(NAT_TABLE),
            ..Default::default()
        }
    }

    fn nat_chain(family: NfFamily) -> Chain<'static> {
        Chain {
            family,
            table: Cow::Borrowed(NAT_TABLE),
            name: Cow::Borrowed(NAT_CHAIN),
            _type: Some(NfChainType::NAT),
            hook: Some(NfHook::Postrouting),
            prio: Some(NAT_PRIORITY),
            ..Default::default()
        }
    }

    fn filter_table() -> Table<'static> {
        Table {
            family: NfFamily::INet,
            name: Cow::Borrowed(FILTER_TABLE),
            ..Default::default()
        }
    }

    fn filter_chain() -> Chain<'static> {
        Chain {
            family: NfFamily::INet,
            table: Cow::Borrowed(FILTER_TABLE),
            name: Cow::Borrowed(FILTER_CHAIN),
            _type: Some(NfChainType::Filter),
            hook: Some(NfHook::Forward),
            prio: Some(FILTER_PRIORITY),
            ..Default::default()
        }
    }

    /// Looks up the kernel handle of the tagged rule, if installed.
    fn find_rule_handle(
        family: NfFamily,
        table: &str,
        chain: &str,
        tag: &str,
    ) -> Result<Option<u32>> {
        let ruleset = get_current_ruleset()
            .map_err(|e| Error::host_state("list nftables ruleset", e))?;

        for object in ruleset.objects.iter() {
            let NfObject::ListObject(NfListObject::Rule(rule)) = object else {
                continue;
            };

            if rule.family == family
                && rule.table == table
                && rule.chain == chain
                && rule.comment.as_deref() == Some(tag)
            {
                return Ok(rule.handle);
            }
        }

        Ok(None)
    }

    fn add_rule(
        &self,
        table: Table<'static>,
        chain: Chain<'static>,
        expr: Vec<Statement<'static>>,
        tag: String,
        op: &str,
    ) -> Result<()> {
        if Self::find_rule_handle(table.family, &table.name, &chain.name, &tag)?.is_some() {
            tracing::debug!(%tag, "nftables rule already installed");
            return Ok(());
        }

        let rule = Rule {
            family: table.family,
            table: table.name.clone(),
            chain: chain.name.clone(),
            expr: Cow::Owned(expr),
            comment: Some(Cow::Owned(tag)),
            ..Default::default()
        };

        // `add table`/`add chain` are no-ops when the object exists, so the
        // whole batch stays idempotent.
        let mut batch = Batch::new();
        batch.add(NfListObject::Table(table));
        batch.add(NfListObject::Chain(chain));
        batch.add(NfListObject::Rule(rule));

        apply_ruleset(&batch.to_nftables()).map_err(|e| Error::host_state(op, e))
    }

    fn delete_rule(
        &self,
        family: NfFamily,
        table: &'static str,
        chain: &'static str,
        tag: &str,
        op: &str,
    ) -> Result<()> {
        let Some(handle) = Self::find_rule_handle(family, table, chain, tag)? else {
            tracing::debug!(%tag, "nftables rule already absent");
            return Ok(());
        };

        let mut batch = Batch::new();
        batch.delete(NfListObject::Rule(Rule {
            family,
            table: Cow::Borrowed(table),
            chain: Cow::Borrowed(chain),
            handle: Some(handle),
            ..Default::default()
        }));

        apply_ruleset(&batch.to_nftables()).map_err(|e| Error::host_state(op, e))
    }
}

fn oifname_is(name: &str) -> Statement<'static> {
    Statement::Match(Match {
        left: Expression::Named(NamedExpression::Meta(Meta {
            key: MetaKey::Oifname,
        })),
        right: Expression::String(Cow::Owned(name.to_owned())),
        op: Operator::EQ,
    })
}

fn iifname_is(name: &str) -> Statement<'static> {
    Statement::Match(Match {
        left: Expression::Named(NamedExpression::Meta(Meta {
            key: MetaKey::Iifname,
        })),
        right: Expression::String(Cow::Owned(name.to_owned())),
        op: Operator::EQ,
    })
}

fn ct_state_established() -> Statement<'static> {
    Statement::Match(Match {
        left: Expression::Named(NamedExpression::CT(CT {
            key: Cow::Borrowed("state"),
            family: None,
            dir: None,
        })),
        right: Expression::List(vec![
            Expression::String(Cow::Borrowed("established")),
            Expression::String(Cow::Borrowed("related")),
        ]),
        op: Operator::IN,
    })
}

fn nft_family(family: Family) -> NfFamily {
    match family {
        Family::V4 => NfFamily::IP,
        Family::V6 => NfFamily::IP6,
    }
}

impl NetfilterBackend for NftBackend {
    fn enable_masquerade(
        &mut self,
        ext_if: &str,
        family: Family,
        best_effort: bool,
    ) -> Result<()> {
        let nf_family = nft_family(family);
        let result = self.add_rule(
            Self::nat_table(nf_family),
            Self::nat_chain(nf_family),
            vec![oifname_is(ext_if), Statement::Masquerade(None)],
            format!("tungo:masq {ext_if}"),
            "enable masquerade",
        );

        match result {
            Ok(()) => Ok(()),
            // NAT support for this family may simply be missing from the
            // kernel.
            Err(e) if best_effort => {
                tracing::warn!(%family, "Skipping masquerade: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn disable_masquerade(
        &mut self,
        ext_if: &str,
        family: Family,
        best_effort: bool,
    ) -> Result<()> {
        let result = self.delete_rule(
            nft_family(family),
            NAT_TABLE,
            NAT_CHAIN,
            &format!("tungo:masq {ext_if}"),
            "disable masquerade",
        );

        match result {
            Ok(()) => Ok(()),
            Err(e) if best_effort => {
                tracing::warn!(%family, "Skipping masquerade removal: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn accept_forward(&mut self, in_if: &str, out_if: &str) -> Result<()> {
        self.add_rule(
            Self::filter_table(),
            Self::filter_chain(),
            vec![
                iifname_is(in_if),
                oifname_is(out_if),
                Statement::Accept(None),
            ],
            format!("tungo:fwd {in_if} {out_if}"),
            "accept forward",
        )
    }

    fn delete_accept_forward(&mut self, in_if: &str, out_if: &str) -> Result<()> {
        self.delete_rule(
            NfFamily::INet,
            FILTER_TABLE,
            FILTER_CHAIN,
            &format!("tungo:fwd {in_if} {out_if}"),
            "delete accept forward",
        )
    }

    fn accept_forward_established(&mut self, in_if: &str, out_if: &str) -> Result<()> {
        self.add_rule(
            Self::filter_table(),
            Self::filter_chain(),
            vec![
                iifname_is(in_if),
                oifname_is(out_if),
                ct_state_established(),
                Statement::Accept(None),
            ],
            format!("tungo:fwd-est {in_if} {out_if}"),
            "accept established forward",
        )
    }

    fn delete_accept_forward_established(&mut self, in_if: &str, out_if: &str) -> Result<()> {
        self.delete_rule(
            NfFamily::INet,
            FILTER_TABLE,
            FILTER_CHAIN,
            &format!("tungo:fwd-est {in_if} {out_if}"),
            "delete established forward",
        )
    }

    fn name(&self) -> &'static str {
        "nftables"
    }
}

/// Legacy iptables backend.
///
/// Forward-accept rules live in the custom `IPTABLES-TUNGO-FWD` chain
/// hooked from `FORWARD`; NAT goes straight into `POSTROUTING`. Every add
/// is guarded by `-C`, so re-running never duplicates a rule.
struct IptablesBackend {
    runner: Arc<dyn CommandRunner>,
    v4: &'static str,
    v6: Option<&'static str>,
}

impl IptablesBackend {
    fn binary(&self, family: Family, best_effort: bool) -> Result<Option<&'static str>> {
        match family {
            Family::V4 => Ok(Some(self.v4)),
            Family::V6 => match self.v6 {
                Some(binary) => Ok(Some(binary)),
                None if best_effort => {
                    tracing::warn!("No IPv6 iptables binary, skipping IPv6 rule");
                    Ok(None)
                }
                None => Err(Error::host_state(
                    "IPv6 netfilter programming",
                    "no IPv6 iptables binary available",
                )),
            },
        }
    }

    fn rule_present(&self, binary: &str, args: &[&str]) -> Result<bool> {
        let mut check = vec!["-C"];
        check.extend_from_slice(args);

        match prepend_table(&self.runner, binary, None, &check) {
            Ok(()) => Ok(true),
            Err(e) if e.is_exit() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn rule_present_in_table(&self, binary: &str, table: &str, args: &[&str]) -> Result<bool> {
        let mut check = vec!["-C"];
        check.extend_from_slice(args);

        match prepend_table(&self.runner, binary, Some(table), &check) {
            Ok(()) => Ok(true),
            Err(e) if e.is_exit() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn ensure_rule(
        &self,
        binary: &str,
        table: Option<&str>,
        args: &[&str],
        op: &str,
    ) -> Result<()> {
        let present = match table {
            Some(table) => self.rule_present_in_table(binary, table, args)?,
            None => self.rule_present(binary, args)?,
        };

        if present {
            tracing::debug!(%op, "iptables rule already installed");
            return Ok(());
        }

        let mut add = vec!["-A"];
        add.extend_from_slice(args);

        prepend_table(&self.runner, binary, table, &add).map_err(|e| Error::host_state(op, e))
    }

    fn remove_rule(
        &self,
        binary: &str,
        table: Option<&str>,
        args: &[&str],
        op: &str,
    ) -> Result<()> {
        let present = match table {
            Some(table) => self.rule_present_in_table(binary, table, args)?,
            None => self.rule_present(binary, args)?,
        };

        if !present {
            tracing::debug!(%op, "iptables rule already absent");
            return Ok(());
        }

        let mut delete = vec!["-D"];
        delete.extend_from_slice(args);

        prepend_table(&self.runner, binary, table, &delete).map_err(|e| Error::host_state(op, e))
    }

    /// Creates the custom forward chain and hooks it from `FORWARD`.
    fn ensure_forward_chain(&self, binary: &str) -> Result<()> {
        match self.runner.run_status(binary, &["-N", FORWARD_CHAIN]) {
            Ok(()) => {}
            Err(e) if is_chain_exists(&e) => {}
            Err(e) => return Err(Error::host_state("create forward chain", e)),
        }

        self.ensure_rule(
            binary,
            None,
            &["FORWARD", "-j", FORWARD_CHAIN],
            "hook forward chain",
        )
    }

    /// Unhooks and deletes the custom chain once it holds no rules.
    fn cleanup_forward_chain(&self, binary: &str) {
        let Ok(listing) = self.runner.run_stdout(binary, &["-S", FORWARD_CHAIN]) else {
            return;
        };

        let has_rules = listing.lines().any(|line| line.starts_with("-A"));
        if has_rules {
            return;
        }

        if let Err(e) = self.remove_rule(
            binary,
            None,
            &["FORWARD", "-j", FORWARD_CHAIN],
            "unhook forward chain",
        ) {
            tracing::debug!("Failed to unhook {FORWARD_CHAIN}: {e}");
            return;
        }

        if let Err(e) = self.runner.run_status(binary, &["-X", FORWARD_CHAIN]) {
            tracing::debug!("Failed to delete {FORWARD_CHAIN}: {e}");
        }
    }
}

fn prepend_table(
    runner: &Arc<dyn CommandRunner>,
    binary: &str,
    table: Option<&str>,
    args: &[&str],
) -> std::result::Result<(), crate::ExecError> {
    match table {
        Some(table) => {
            let mut full = vec!["-t", table];
            full.extend_from_slice(args);
            runner.run_status(binary, &full)
        }
        None => runner.run_status(binary, args),
    }
}

fn is_chain_exists(err: &crate::ExecError) -> bool {
    err.is_exit() && err.to_string().contains("Chain already exists")
}

impl NetfilterBackend for IptablesBackend {
    fn enable_masquerade(
        &mut self,
        ext_if: &str,
        family: Family,
        best_effort: bool,
    ) -> Result<()> {
        let Some(binary) = self.binary(family, best_effort)? else {
            return Ok(());
        };

        let result = self.ensure_rule(
            binary,
            Some("nat"),
            &["POSTROUTING", "-o", ext_if, "-j", "MASQUERADE"],
            "enable masquerade",
        );

        match result {
            Ok(()) => Ok(()),
            Err(e) if best_effort => {
                tracing::warn!(%family, "Skipping masquerade: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn disable_masquerade(
        &mut self,
        ext_if: &str,
        family: Family,
        best_effort: bool,
    ) -> Result<()> {
        let Some(binary) = self.binary(family, best_effort)? else {
            return Ok(());
        };

        let result = self.remove_rule(
            binary,
            Some("nat"),
            &["POSTROUTING", "-o", ext_if, "-j", "MASQUERADE"],
            "disable masquerade",
        );

        match result {
            Ok(()) => Ok(()),
            Err(e) if best_effort => {
                tracing::warn!(%family, "Skipping masquerade removal: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn accept_forward(&mut self, in_if: &str, out_if: &str) -> Result<()> {
        self.ensure_forward_chain(self.v4)?;
        self.ensure_rule(
            self.v4,
            None,
            &[FORWARD_CHAIN, "-i", in_if, "-o", out_if, "-j", "ACCEPT"],
            "accept forward",
        )
    }

    fn delete_accept_forward(&mut self, in_if: &str, out_if: &str) -> Result<()> {
        self.remove_rule(
            self.v4,
            None,
            &[FORWARD_CHAIN, "-i", in_if, "-o", out_if, "-j", "ACCEPT"],
            "delete accept forward",
        )?;
        self.cleanup_forward_chain(self.v4);

        Ok(())
    }

    fn accept_forward_established(&mut self, in_if: &str, out_if: &str) -> Result<()> {
        self.ensure_forward_chain(self.v4)?;
        self.ensure_rule(
            self.v4,
            None,
            &[
                FORWARD_CHAIN,
                "-i",
                in_if,
                "-o",
                out_if,
                "-m",
                "conntrack",
                "--ctstate",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ],
            "accept established forward",
        )
    }

    fn delete_accept_forward_established(&mut self, in_if: &str, out_if: &str) -> Result<()> {
        self.remove_rule(
            self.v4,
            None,
            &[
                FORWARD_CHAIN,
                "-i",
                in_if,
                "-o",
                out_if,
                "-m",
                "conntrack",
                "--ctstate",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ],
            "delete established forward",
        )?;
        self.cleanup_forward_chain(self.v4);

        Ok(())
    }

    fn name(&self) -> &'static str {
        if self.v4 == "iptables-legacy" {
            "iptables-legacy"
        } else {
            "iptables"
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::exec::ExecError;

    use super::*;

    /// Answers probe commands from a fixed table and records everything.
    struct ScriptedRunner {
        responses: HashMap<String, std::result::Result<String, i32>>,
        commands: StdMutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(responses: &[(&str, std::result::Result<&str, i32>)]) -> Self {
            Self {
                responses: responses
                    .iter()
                    .map(|(cmd, res)| {
                        (
                            (*cmd).to_owned(),
                            res.map(str::to_owned),
                        )
                    })
                    .collect(),
                commands: StdMutex::new(Vec::new()),
            }
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, program: &str, args: &[&str]) -> std::result::Result<String, ExecError> {
            let command = crate::exec::command_line(program, args);
            self.commands.lock().unwrap().push(command.clone());

            match self.responses.get(&command) {
                Some(Ok(output)) => Ok(output.clone()),
                Some(Err(code)) => Err(ExecError::Failed {
                    command,
                    code: Some(*code),
                    output: String::new(),
                }),
                None => Err(ExecError::Spawn {
                    command,
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                }),
            }
        }

        fn run_stdout(&self, program: &str, args: &[&str]) -> std::result::Result<String, ExecError> {
            self.run(program, args)
        }
    }

    #[test]
    fn usable_nftables_wins() {
        let runner = Arc::new(ScriptedRunner::new(&[]));

        let backend = detect_with(runner, true).unwrap();

        assert_eq!(backend.backend_name(), "nftables");
    }

    #[test]
    fn falls_back_to_iptables_legacy_with_v6_companion() {
        let runner = Arc::new(ScriptedRunner::new(&[
            ("iptables-legacy -V", Ok("iptables v1.8.9 (legacy)")),
            ("ip6tables-legacy -V", Ok("ip6tables v1.8.9 (legacy)")),
        ]));

        let backend = detect_with(runner, false).unwrap();

        assert_eq!(backend.backend_name(), "iptables-legacy");
    }

    #[test]
    fn iptables_legacy_without_v6_is_still_chosen() {
        let runner = Arc::new(ScriptedRunner::new(&[(
            "iptables-legacy -V",
            Ok("iptables v1.8.9 (legacy)"),
        )]));

        let backend = detect_with(runner, false).unwrap();

        assert_eq!(backend.backend_name(), "iptables-legacy");
    }

    #[test]
    fn plain_iptables_in_legacy_mode_is_accepted() {
        let runner = Arc::new(ScriptedRunner::new(&[
            ("iptables -V", Ok("iptables v1.8.7 (legacy)")),
            ("ip6tables -V", Ok("ip6tables v1.8.7 (legacy)")),
        ]));

        let backend = detect_with(runner, false).unwrap();

        assert_eq!(backend.backend_name(), "iptables");
    }

    #[test]
    fn nf_tables_mode_without_nftables_is_diagnosed() {
        let runner = Arc::new(ScriptedRunner::new(&[(
            "iptables -V",
            Ok("iptables v1.8.7 (nf_tables)"),
        )]));

        let err = detect_with(runner, false).unwrap_err();

        assert!(err.to_string().contains("iptables-legacy"));
    }

    #[test]
    fn nothing_usable_reports_no_backend() {
        let runner = Arc::new(ScriptedRunner::new(&[]));

        let err = detect_with(runner, false).unwrap_err();

        assert!(matches!(err, Error::BackendUnavailable(_)));
    }

    #[test]
    fn iptables_adds_are_guarded_by_check() {
        let runner = Arc::new(ScriptedRunner::new(&[
            // Chain creation succeeds, hook and rule are absent then added.
            ("iptables-legacy -N IPTABLES-TUNGO-FWD", Ok("")),
            ("iptables-legacy -C FORWARD -j IPTABLES-TUNGO-FWD", Err(1)),
            ("iptables-legacy -A FORWARD -j IPTABLES-TUNGO-FWD", Ok("")),
            (
                "iptables-legacy -C IPTABLES-TUNGO-FWD -i tun0 -o eth0 -j ACCEPT",
                Err(1),
            ),
            (
                "iptables-legacy -A IPTABLES-TUNGO-FWD -i tun0 -o eth0 -j ACCEPT",
                Ok(""),
            ),
        ]));

        let mut backend = IptablesBackend {
            runner: runner.clone(),
            v4: "iptables-legacy",
            v6: None,
        };

        backend.accept_forward("tun0", "eth0").unwrap();

        let commands = runner.commands.lock().unwrap().clone();
        assert_eq!(
            commands,
            vec![
                "iptables-legacy -N IPTABLES-TUNGO-FWD",
                "iptables-legacy -C FORWARD -j IPTABLES-TUNGO-FWD",
                "iptables-legacy -A FORWARD -j IPTABLES-TUNGO-FWD",
                "iptables-legacy -C IPTABLES-TUNGO-FWD -i tun0 -o eth0 -j ACCEPT",
                "iptables-legacy -A IPTABLES-TUNGO-FWD -i tun0 -o eth0 -j ACCEPT",
            ]
        );
    }

    #[test]
    fn present_rule_is_not_added_twice() {
        let runner = Arc::new(ScriptedRunner::new(&[(
            "iptables-legacy -t nat -C POSTROUTING -o eth0 -j MASQUERADE",
            Ok(""),
        )]));

        let mut backend = IptablesBackend {
            runner: runner.clone(),
            v4: "iptables-legacy",
            v6: None,
        };

        backend
            .enable_masquerade("eth0", Family::V4, false)
            .unwrap();

        let commands = runner.commands.lock().unwrap().clone();
        assert_eq!(
            commands,
            vec!["iptables-legacy -t nat -C POSTROUTING -o eth0 -j MASQUERADE"]
        );
    }

    #[test]
    fn deleting_absent_rule_succeeds() {
        let runner = Arc::new(ScriptedRunner::new(&[(
            "iptables-legacy -t nat -C POSTROUTING -o eth0 -j MASQUERADE",
            Err(1),
        )]));

        let mut backend = IptablesBackend {
            runner,
            v4: "iptables-legacy",
            v6: None,
        };

        backend
            .disable_masquerade("eth0", Family::V4, false)
            .unwrap();
    }

    #[test]
    fn missing_v6_binary_is_best_effort_for_masquerade() {
        let runner = Arc::new(ScriptedRunner::new(&[]));

        let mut backend = IptablesBackend {
            runner,
            v4: "iptables-legacy",
            v6: None,
        };

        backend.enable_masquerade("eth0", Family::V6, true).unwrap();
        assert!(
            backend
                .enable_masquerade("eth0", Family::V6, false)
                .is_err()
        );
    }

    /// Counts how many callers are inside the backend at once.
    struct ConcurrencyProbe {
        current: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
    }

    impl ConcurrencyProbe {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl NetfilterBackend for ConcurrencyProbe {
        fn enable_masquerade(&mut self, _: &str, _: Family, _: bool) -> Result<()> {
            self.enter();
            Ok(())
        }
        fn disable_masquerade(&mut self, _: &str, _: Family, _: bool) -> Result<()> {
            self.enter();
            Ok(())
        }
        fn accept_forward(&mut self, _: &str, _: &str) -> Result<()> {
            self.enter();
            Ok(())
        }
        fn delete_accept_forward(&mut self, _: &str, _: &str) -> Result<()> {
            self.enter();
            Ok(())
        }
        fn accept_forward_established(&mut self, _: &str, _: &str) -> Result<()> {
            self.enter();
            Ok(())
        }
        fn delete_accept_forward_established(&mut self, _: &str, _: &str) -> Result<()> {
            self.enter();
            Ok(())
        }
        fn name(&self) -> &'static str {
            "probe"
        }
    }

    #[test]
    fn decorator_serializes_concurrent_writers() {
        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let locked = Arc::new(LockedNetfilter::new(Box::new(ConcurrencyProbe {
            current: current.clone(),
            max_seen: max_seen.clone(),
        })));

        let handles = (0..8)
            .map(|i| {
                let locked = locked.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        locked.accept_forward("tun0", "eth0").unwrap();
                    } else {
                        locked.enable_masquerade("eth0", Family::V4, false).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
