//! Declarative packet-filter rules and their backends.
//!
//! Callers describe rules as [`Rule`] values; a [`Netfilter`] backend turns
//! them into host state. [`IptablesBackend`] renders argv for `iptables`,
//! [`MemoryNetfilter`] keeps chains in memory for tests.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use raind_common::{CommandRunner, RaindError, RaindResult};
use serde::{Deserialize, Serialize};

use crate::portmap::Protocol;

/// Packet-filter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    /// `filter`.
    Filter,
    /// `nat`.
    Nat,
}

impl Table {
    /// Table name as passed to `-t`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
        }
    }
}

/// A match clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Match {
    /// `-p <proto>`.
    Protocol(Protocol),
    /// `--dport <port>`; requires a preceding [`Match::Protocol`].
    DestinationPort(u16),
    /// `--sport <port>`; requires a preceding [`Match::Protocol`].
    SourcePort(u16),
    /// `-s <addr>`.
    Source(String),
    /// `-d <addr>`.
    Destination(String),
    /// `-i <iface>`.
    InInterface(String),
    /// `-o <iface>`.
    OutInterface(String),
    /// `-m physdev [--physdev-in <port>] [--physdev-out <port>]`.
    Physdev {
        /// Bridge port the packet entered on.
        input: Option<String>,
        /// Bridge port the packet leaves on.
        output: Option<String>,
    },
    /// `-m conntrack --ctstate <states>`.
    ConntrackState(Vec<&'static str>),
    /// `-m statistic --mode random --probability <p>`.
    RandomProbability(f64),
}

/// Rule target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `ACCEPT`.
    Accept,
    /// `DROP`.
    Drop,
    /// `RETURN`.
    Return,
    /// Jump to a user chain.
    Jump(String),
    /// `NFLOG` to a netlink group.
    Nflog {
        /// Netlink group.
        group: u16,
        /// Log prefix.
        prefix: String,
    },
    /// `DNAT --to-destination <addr:port>`.
    Dnat(String),
    /// `MASQUERADE`.
    Masquerade,
}

/// A fully specified rule in a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// Table the chain lives in.
    pub table: Table,
    /// Chain name.
    pub chain: String,
    /// Match clauses, rendered in order.
    pub matches: Vec<Match>,
    /// Target.
    pub target: Target,
    /// Optional comment (`-m comment`).
    pub comment: Option<String>,
}

impl Rule {
    /// A rule in the `filter` table.
    pub fn filter(chain: impl Into<String>, target: Target) -> Self {
        Self {
            table: Table::Filter,
            chain: chain.into(),
            matches: Vec::new(),
            target,
            comment: None,
        }
    }

    /// A rule in the `nat` table.
    pub fn nat(chain: impl Into<String>, target: Target) -> Self {
        Self {
            table: Table::Nat,
            ..Self::filter(chain, target)
        }
    }

    /// Add a match clause.
    #[must_use]
    pub fn with(mut self, clause: Match) -> Self {
        self.matches.push(clause);
        self
    }

    /// Add a match clause when present.
    #[must_use]
    pub fn with_opt(self, clause: Option<Match>) -> Self {
        match clause {
            Some(clause) => self.with(clause),
            None => self,
        }
    }

    /// Set the comment.
    #[must_use]
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Rule specification (everything after the chain name).
    #[must_use]
    pub fn spec(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |parts: &[&str]| args.extend(parts.iter().map(|part| (*part).to_string()));
        for clause in &self.matches {
            match clause {
                Match::Protocol(proto) => push(&["-p", proto.as_str()]),
                Match::DestinationPort(port) => push(&["--dport", &port.to_string()]),
                Match::SourcePort(port) => push(&["--sport", &port.to_string()]),
                Match::Source(addr) => push(&["-s", addr]),
                Match::Destination(addr) => push(&["-d", addr]),
                Match::InInterface(iface) => push(&["-i", iface]),
                Match::OutInterface(iface) => push(&["-o", iface]),
                Match::Physdev { input, output } => {
                    push(&["-m", "physdev"]);
                    if let Some(port) = input {
                        push(&["--physdev-in", port]);
                    }
                    if let Some(port) = output {
                        push(&["--physdev-out", port]);
                    }
                }
                Match::ConntrackState(states) => {
                    push(&["-m", "conntrack", "--ctstate", &states.join(",")]);
                }
                Match::RandomProbability(p) => push(&[
                    "-m",
                    "statistic",
                    "--mode",
                    "random",
                    "--probability",
                    &format!("{p:.8}"),
                ]),
            }
        }
        if let Some(comment) = &self.comment {
            push(&["-m", "comment", "--comment", comment]);
        }
        match &self.target {
            Target::Accept => push(&["-j", "ACCEPT"]),
            Target::Drop => push(&["-j", "DROP"]),
            Target::Return => push(&["-j", "RETURN"]),
            Target::Jump(chain) => push(&["-j", chain]),
            Target::Nflog { group, prefix } => push(&[
                "-j",
                "NFLOG",
                "--nflog-group",
                &group.to_string(),
                "--nflog-prefix",
                prefix,
            ]),
            Target::Dnat(to) => push(&["-j", "DNAT", "--to-destination", to]),
            Target::Masquerade => push(&["-j", "MASQUERADE"]),
        }
        args
    }

    /// Full argv for `iptables` with the given operation (`-A`, `-C`, `-D`,
    /// or `-I` with a position).
    #[must_use]
    pub fn argv(&self, operation: &str, position: Option<u32>) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.as_str().to_string(),
            operation.to_string(),
            self.chain.clone(),
        ];
        if let Some(position) = position {
            args.push(position.to_string());
        }
        args.extend(self.spec());
        args
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-A {} {}", self.chain, self.spec().join(" "))
    }
}

/// Where to place a rule in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    /// At the end.
    Append,
    /// At a 1-based index.
    Insert(u32),
}

/// A packet-filter backend.
#[async_trait]
pub trait Netfilter: Send + Sync {
    /// Whether `chain` exists in `table`.
    async fn chain_exists(&self, table: Table, chain: &str) -> RaindResult<bool>;

    /// Create `chain` if it does not exist.
    async fn create_chain(&self, table: Table, chain: &str) -> RaindResult<()>;

    /// Remove every rule from `chain`.
    async fn flush_chain(&self, table: Table, chain: &str) -> RaindResult<()>;

    /// Flush and delete `chain`; a missing chain is not an error.
    async fn delete_chain(&self, table: Table, chain: &str) -> RaindResult<()>;

    /// Whether an identical rule is present.
    async fn rule_exists(&self, rule: &Rule) -> RaindResult<bool>;

    /// Add a rule unconditionally.
    async fn add_rule(&self, rule: &Rule, position: Position) -> RaindResult<()>;

    /// Delete one instance of a rule.
    async fn delete_rule(&self, rule: &Rule) -> RaindResult<()>;

    /// Rendered rules of a chain, in order.
    async fn list_rules(&self, table: Table, chain: &str) -> RaindResult<Vec<String>>;

    /// Create the chain if needed, then flush it.
    async fn reset_chain(&self, table: Table, chain: &str) -> RaindResult<()> {
        self.create_chain(table, chain).await?;
        self.flush_chain(table, chain).await
    }

    /// Add `rule` unless an identical rule is already present.
    async fn ensure_rule(&self, rule: &Rule, position: Position) -> RaindResult<()> {
        if self.rule_exists(rule).await? {
            return Ok(());
        }
        self.add_rule(rule, position).await
    }

    /// Delete `rule` if present.
    async fn remove_rule(&self, rule: &Rule) -> RaindResult<()> {
        if self.rule_exists(rule).await? {
            self.delete_rule(rule).await?;
        }
        Ok(())
    }
}

/// Drives `iptables` through a [`CommandRunner`].
pub struct IptablesBackend {
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl IptablesBackend {
    /// Backend invoking `iptables` from `$PATH`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self::with_program(runner, "iptables")
    }

    /// Backend invoking a specific binary.
    pub fn with_program(runner: Arc<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    fn table_args(table: Table, op: &str, chain: &str) -> Vec<String> {
        vec![
            "-t".to_string(),
            table.as_str().to_string(),
            op.to_string(),
            chain.to_string(),
        ]
    }
}

#[async_trait]
impl Netfilter for IptablesBackend {
    async fn chain_exists(&self, table: Table, chain: &str) -> RaindResult<bool> {
        let args = Self::table_args(table, "-S", chain);
        Ok(self.runner.output(&self.program, &args).await?.success)
    }

    async fn create_chain(&self, table: Table, chain: &str) -> RaindResult<()> {
        if self.chain_exists(table, chain).await? {
            return Ok(());
        }
        tracing::debug!(table = table.as_str(), chain, "Creating chain");
        self.runner
            .run(&self.program, &Self::table_args(table, "-N", chain))
            .await
            .map(drop)
    }

    async fn flush_chain(&self, table: Table, chain: &str) -> RaindResult<()> {
        self.runner
            .run(&self.program, &Self::table_args(table, "-F", chain))
            .await
            .map(drop)
    }

    async fn delete_chain(&self, table: Table, chain: &str) -> RaindResult<()> {
        if !self.chain_exists(table, chain).await? {
            return Ok(());
        }
        tracing::debug!(table = table.as_str(), chain, "Deleting chain");
        self.flush_chain(table, chain).await?;
        self.runner
            .run(&self.program, &Self::table_args(table, "-X", chain))
            .await
            .map(drop)
    }

    async fn rule_exists(&self, rule: &Rule) -> RaindResult<bool> {
        Ok(self
            .runner
            .output(&self.program, &rule.argv("-C", None))
            .await?
            .success)
    }

    async fn add_rule(&self, rule: &Rule, position: Position) -> RaindResult<()> {
        let args = match position {
            Position::Append => rule.argv("-A", None),
            Position::Insert(index) => rule.argv("-I", Some(index)),
        };
        self.runner.run(&self.program, &args).await.map(drop)
    }

    async fn delete_rule(&self, rule: &Rule) -> RaindResult<()> {
        self.runner
            .run(&self.program, &rule.argv("-D", None))
            .await
            .map(drop)
    }

    async fn list_rules(&self, table: Table, chain: &str) -> RaindResult<Vec<String>> {
        let output = self
            .runner
            .run(&self.program, &Self::table_args(table, "-S", chain))
            .await?;
        Ok(output
            .lines()
            .filter(|line| line.starts_with("-A "))
            .map(ToString::to_string)
            .collect())
    }
}

/// Chains held in memory.
///
/// Built-in chains (`FORWARD`, `PREROUTING`, `OUTPUT`, `POSTROUTING`) exist
/// from the start.
#[derive(Debug)]
pub struct MemoryNetfilter {
    chains: Mutex<BTreeMap<(Table, String), Vec<Rule>>>,
    broken: Mutex<BTreeSet<String>>,
}

impl Default for MemoryNetfilter {
    fn default() -> Self {
        let mut chains = BTreeMap::new();
        for chain in ["INPUT", "FORWARD", "OUTPUT"] {
            chains.insert((Table::Filter, chain.to_string()), Vec::new());
        }
        for chain in ["PREROUTING", "OUTPUT", "POSTROUTING"] {
            chains.insert((Table::Nat, chain.to_string()), Vec::new());
        }
        Self {
            chains: Mutex::new(chains),
            broken: Mutex::new(BTreeSet::new()),
        }
    }
}

impl MemoryNetfilter {
    /// Empty tables with the built-in chains.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every chain and its rules, rendered. Two equal dumps mean identical
    /// packet-filter state.
    #[must_use]
    pub fn dump(&self) -> Vec<String> {
        let chains = self.chains.lock();
        let mut lines = Vec::new();
        for ((table, chain), rules) in chains.iter() {
            lines.push(format!("*{} -N {chain}", table.as_str()));
            lines.extend(rules.iter().map(|rule| format!("*{} {rule}", table.as_str())));
        }
        lines
    }

    /// Rules of one chain.
    #[must_use]
    pub fn rules(&self, table: Table, chain: &str) -> Vec<Rule> {
        self.chains
            .lock()
            .get(&(table, chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `chain` exists.
    #[must_use]
    pub fn has_chain(&self, table: Table, chain: &str) -> bool {
        self.chains.lock().contains_key(&(table, chain.to_string()))
    }

    /// Fail every change to `chain` until [`MemoryNetfilter::repair`].
    pub fn break_chain(&self, chain: impl Into<String>) {
        self.broken.lock().insert(chain.into());
    }

    /// Let changes to `chain` succeed again.
    pub fn repair(&self, chain: &str) {
        self.broken.lock().remove(chain);
    }

    fn check(&self, table: Table, chain: &str) -> RaindResult<()> {
        if self.broken.lock().contains(chain) {
            return Err(RaindError::Command {
                program: "iptables".to_string(),
                args: format!("-t {} {chain}", table.as_str()),
                output: "Resource temporarily unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn missing(table: Table, chain: &str) -> RaindError {
        RaindError::Command {
            program: "iptables".to_string(),
            args: format!("-t {} {chain}", table.as_str()),
            output: "No chain/target/match by that name.".to_string(),
        }
    }
}

#[async_trait]
impl Netfilter for MemoryNetfilter {
    async fn chain_exists(&self, table: Table, chain: &str) -> RaindResult<bool> {
        Ok(self.has_chain(table, chain))
    }

    async fn create_chain(&self, table: Table, chain: &str) -> RaindResult<()> {
        self.check(table, chain)?;
        self.chains
            .lock()
            .entry((table, chain.to_string()))
            .or_default();
        Ok(())
    }

    async fn flush_chain(&self, table: Table, chain: &str) -> RaindResult<()> {
        self.check(table, chain)?;
        self.chains
            .lock()
            .get_mut(&(table, chain.to_string()))
            .ok_or_else(|| Self::missing(table, chain))?
            .clear();
        Ok(())
    }

    async fn delete_chain(&self, table: Table, chain: &str) -> RaindResult<()> {
        self.check(table, chain)?;
        self.chains.lock().remove(&(table, chain.to_string()));
        Ok(())
    }

    async fn rule_exists(&self, rule: &Rule) -> RaindResult<bool> {
        Ok(self
            .chains
            .lock()
            .get(&(rule.table, rule.chain.clone()))
            .is_some_and(|rules| rules.contains(rule)))
    }

    async fn add_rule(&self, rule: &Rule, position: Position) -> RaindResult<()> {
        self.check(rule.table, &rule.chain)?;
        let mut chains = self.chains.lock();
        if let Target::Jump(target) = &rule.target {
            if !chains.contains_key(&(rule.table, target.clone())) {
                return Err(Self::missing(rule.table, target));
            }
        }
        let rules = chains
            .get_mut(&(rule.table, rule.chain.clone()))
            .ok_or_else(|| Self::missing(rule.table, &rule.chain))?;
        match position {
            Position::Append => rules.push(rule.clone()),
            Position::Insert(index) => {
                let index = usize::try_from(index.saturating_sub(1)).unwrap_or(0).min(rules.len());
                rules.insert(index, rule.clone());
            }
        }
        Ok(())
    }

    async fn delete_rule(&self, rule: &Rule) -> RaindResult<()> {
        self.check(rule.table, &rule.chain)?;
        let mut chains = self.chains.lock();
        let rules = chains
            .get_mut(&(rule.table, rule.chain.clone()))
            .ok_or_else(|| Self::missing(rule.table, &rule.chain))?;
        let index = rules
            .iter()
            .position(|r| r == rule)
            .ok_or_else(|| Self::missing(rule.table, &rule.chain))?;
        rules.remove(index);
        Ok(())
    }

    async fn list_rules(&self, table: Table, chain: &str) -> RaindResult<Vec<String>> {
        Ok(self
            .chains
            .lock()
            .get(&(table, chain.to_string()))
            .ok_or_else(|| Self::missing(table, chain))?
            .iter()
            .map(ToString::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use raind_common::RecordingRunner;

    use super::*;

    fn accept_web() -> Rule {
        Rule::filter("RAIND-EW", Target::Accept)
            .with(Match::Physdev {
                input: Some("rd_a".into()),
                output: Some("rd_b".into()),
            })
            .with(Match::Protocol(Protocol::Tcp))
            .with(Match::DestinationPort(80))
            .comment("p1")
    }

    #[test]
    fn rule_renders_argv() {
        let rule = accept_web();
        assert_eq!(
            rule.argv("-I", Some(1)).join(" "),
            "-t filter -I RAIND-EW 1 -m physdev --physdev-in rd_a --physdev-out rd_b \
             -p tcp --dport 80 -m comment --comment p1 -j ACCEPT"
        );
    }

    #[tokio::test]
    async fn iptables_backend_checks_before_adding() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail_on("-C RAIND-EW");
        let backend = IptablesBackend::new(runner.clone());

        backend.ensure_rule(&accept_web(), Position::Insert(1)).await.unwrap();

        let lines = runner.command_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("iptables -t filter -C RAIND-EW"));
        assert!(lines[1].starts_with("iptables -t filter -I RAIND-EW 1"));
    }

    #[tokio::test]
    async fn iptables_backend_skips_existing_rule() {
        let runner = Arc::new(RecordingRunner::new());
        let backend = IptablesBackend::new(runner.clone());

        backend.ensure_rule(&accept_web(), Position::Append).await.unwrap();
        assert_eq!(runner.command_lines().len(), 1);
    }

    #[tokio::test]
    async fn memory_backend_inserts_and_deletes() {
        let nf = MemoryNetfilter::new();
        nf.reset_chain(Table::Filter, "RAIND-EW").await.unwrap();
        nf.add_rule(&Rule::filter("RAIND-EW", Target::Return), Position::Append)
            .await
            .unwrap();
        nf.ensure_rule(&accept_web(), Position::Insert(1)).await.unwrap();
        nf.ensure_rule(&accept_web(), Position::Insert(1)).await.unwrap();

        let rules = nf.rules(Table::Filter, "RAIND-EW");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0], accept_web());

        nf.remove_rule(&accept_web()).await.unwrap();
        assert_eq!(nf.rules(Table::Filter, "RAIND-EW").len(), 1);
    }

    #[tokio::test]
    async fn memory_backend_rejects_jump_to_missing_chain() {
        let nf = MemoryNetfilter::new();
        let jump = Rule::filter("FORWARD", Target::Jump("RAIND-ROOT".into()));
        assert!(nf.add_rule(&jump, Position::Insert(1)).await.is_err());
    }
}
