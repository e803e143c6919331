//! Compiles the policy document into packet-filter chains.
//!
//! Chain topology:
//!
//! ```text
//! FORWARD (pos 1) -> RAIND-ROOT -> established/related ACCEPT
//!                               -> RAIND-EW
//!                               -> RAIND-NS-ENF | RAIND-NS-OBS
//!                               -> RETURN
//! ```
//!
//! User rules are inserted at the top of their chain, ahead of the per-bridge
//! defaults. Every build starts from flushed chains, so compiling the same
//! document twice yields the same rules.

use std::sync::Arc;

use raind_common::{ErrorKind, RaindError, RaindResult};
use serde::Serialize;
use tokio::sync::Mutex;

use super::model::{
    Defaults, EastWestMode, NorthSouthMode, Policy, PolicyDocument, PolicyKind, PolicyRequest,
    PolicyStatus,
};
use super::store::{Outcome, PolicyStore};
use crate::ipam::{Assignment, IpamStore};
use crate::netfilter::{Match, Netfilter, Position, Rule, Table, Target};

/// Top-level dispatcher chain.
pub const ROOT_CHAIN: &str = "RAIND-ROOT";
/// East-west chain.
pub const EAST_WEST_CHAIN: &str = "RAIND-EW";
/// North-south observe chain.
pub const NS_OBSERVE_CHAIN: &str = "RAIND-NS-OBS";
/// North-south enforce chain.
pub const NS_ENFORCE_CHAIN: &str = "RAIND-NS-ENF";

const CHAINS: [&str; 4] = [ROOT_CHAIN, EAST_WEST_CHAIN, NS_OBSERVE_CHAIN, NS_ENFORCE_CHAIN];

/// Chain holding the rules of a policy kind.
#[must_use]
pub const fn chain_for(kind: PolicyKind) -> &'static str {
    match kind {
        PolicyKind::EastWest => EAST_WEST_CHAIN,
        PolicyKind::NorthSouthObserve => NS_OBSERVE_CHAIN,
        PolicyKind::NorthSouthEnforce => NS_ENFORCE_CHAIN,
    }
}

/// Maps container names to ids.
pub trait ContainerResolver: Send + Sync {
    /// Id of the live container called `name`.
    ///
    /// # Errors
    ///
    /// Returns a not-found error (`container: <name> not found`) for unknown
    /// names.
    fn container_id(&self, name: &str) -> RaindResult<String>;
}

/// Host-specific compiler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerSettings {
    /// Outbound host interface for north-south rules.
    pub host_interface: String,
    /// NFLOG group for logging rules.
    pub nflog_group: u16,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            host_interface: "eth0".to_string(),
            nflog_group: 100,
        }
    }
}

/// Counts from one compile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    /// Policies installed.
    pub applied: usize,
    /// Policies left unresolved.
    pub unresolved: usize,
    /// Policies dropped.
    pub removed: usize,
}

impl CommitReport {
    fn from_outcomes(outcomes: &[Outcome]) -> Self {
        let mut report = Self::default();
        for outcome in outcomes {
            match outcome.status {
                PolicyStatus::Applied => report.applied += 1,
                PolicyStatus::Unresolved => report.unresolved += 1,
                PolicyStatus::RemoveNextCommit => report.removed += 1,
                PolicyStatus::BeforeCommit => {}
            }
        }
        report
    }
}

/// The network policy compiler.
pub struct PolicyCompiler {
    store: Arc<PolicyStore>,
    ipam: Arc<IpamStore>,
    netfilter: Arc<dyn Netfilter>,
    resolver: Arc<dyn ContainerResolver>,
    settings: CompilerSettings,
    lock: Mutex<()>,
}

impl PolicyCompiler {
    /// Create a compiler.
    pub fn new(
        store: Arc<PolicyStore>,
        ipam: Arc<IpamStore>,
        netfilter: Arc<dyn Netfilter>,
        resolver: Arc<dyn ContainerResolver>,
        settings: CompilerSettings,
    ) -> Self {
        Self {
            store,
            ipam,
            netfilter,
            resolver,
            settings,
            lock: Mutex::new(()),
        }
    }

    /// The policy store.
    #[must_use]
    pub const fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Add a policy; it takes effect at the next commit.
    ///
    /// # Errors
    ///
    /// Returns validation or store errors.
    pub async fn add(&self, request: PolicyRequest) -> RaindResult<Policy> {
        let _guard = self.lock.lock().await;
        self.store.add(request)
    }

    /// Remove a policy; applied rules go away at the next commit.
    ///
    /// # Errors
    ///
    /// Returns not-found or store errors.
    pub async fn remove(&self, id: &str) -> RaindResult<()> {
        let _guard = self.lock.lock().await;
        self.store.remove(id)
    }

    /// Rebuild every chain from the document, install pending policies,
    /// back up the pre-commit document and record the outcomes.
    ///
    /// Unresolvable policies are marked `unresolved` without failing the
    /// commit.
    ///
    /// # Errors
    ///
    /// Returns store or packet-filter errors.
    pub async fn commit(&self) -> RaindResult<CommitReport> {
        let _guard = self.lock.lock().await;
        self.commit_locked().await
    }

    /// Switch the north-south mode and commit.
    ///
    /// # Errors
    ///
    /// See [`PolicyCompiler::commit`].
    pub async fn set_north_south_mode(&self, mode: NorthSouthMode) -> RaindResult<CommitReport> {
        let _guard = self.lock.lock().await;
        self.store.set_north_south_mode(mode)?;
        tracing::info!(mode = ?mode, "North-south mode changed");
        self.commit_locked().await
    }

    /// Return to the document backed up by the most recent commit and
    /// reinstall the rules it had active.
    ///
    /// # Errors
    ///
    /// Returns not-found when nothing was committed, or store and
    /// packet-filter errors.
    pub async fn revert(&self) -> RaindResult<CommitReport> {
        let _guard = self.lock.lock().await;
        self.store.revert()?;
        let document = self.store.restore_committed()?;
        self.build_chains(&document.defaults).await?;
        let outcomes = self.install(&document).await?;
        self.store.record(&outcomes)?;
        let report = CommitReport::from_outcomes(&outcomes);
        tracing::info!(?report, "Policies reverted");
        Ok(report)
    }

    /// Reinstall the chains and the policies recorded as applied, without
    /// touching the store. Used at daemon start.
    ///
    /// # Errors
    ///
    /// Returns store or packet-filter errors.
    pub async fn restore(&self) -> RaindResult<()> {
        let _guard = self.lock.lock().await;
        let document = self.store.snapshot()?;
        self.build_chains(&document.defaults).await?;
        let mut restored = 0usize;
        for (kind, policy) in Self::ordered(&document) {
            if policy.status != PolicyStatus::Applied {
                continue;
            }
            match self.rule_for(kind, policy) {
                Ok(rule) => {
                    self.netfilter.ensure_rule(&rule, Position::Insert(1)).await?;
                    restored += 1;
                }
                Err(err) => {
                    tracing::warn!(id = %policy.id, error = %err, "Applied policy no longer resolves");
                }
            }
        }
        tracing::info!(restored, "Policy chains restored");
        Ok(())
    }

    async fn commit_locked(&self) -> RaindResult<CommitReport> {
        let document = self.store.snapshot()?;
        self.build_chains(&document.defaults).await?;
        let outcomes = self.install(&document).await?;
        self.store.backup()?;
        self.store.record(&outcomes)?;
        let report = CommitReport::from_outcomes(&outcomes);
        tracing::info!(?report, "Policies committed");
        Ok(report)
    }

    /// Policies in reverse declaration order per chain, so that inserting
    /// each at position 1 leaves the first-declared rule on top.
    fn ordered(document: &PolicyDocument) -> Vec<(PolicyKind, &Policy)> {
        let mut policies: Vec<_> = document.policies.iter().collect();
        policies.reverse();
        policies
    }

    async fn install(&self, document: &PolicyDocument) -> RaindResult<Vec<Outcome>> {
        let mut outcomes = Vec::new();
        for (kind, policy) in Self::ordered(document) {
            if !policy.is_pending_apply() {
                tracing::debug!(id = %policy.id, "Dropping removed policy");
                outcomes.push(Outcome {
                    id: policy.id.clone(),
                    status: PolicyStatus::RemoveNextCommit,
                    reason: None,
                });
                continue;
            }
            let outcome = match self.rule_for(kind, policy) {
                Ok(rule) => {
                    self.netfilter.ensure_rule(&rule, Position::Insert(1)).await?;
                    tracing::debug!(id = %policy.id, chain = %rule.chain, "Policy applied");
                    Outcome {
                        id: policy.id.clone(),
                        status: PolicyStatus::Applied,
                        reason: None,
                    }
                }
                Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::Validation) => {
                    tracing::warn!(id = %policy.id, reason = %err, "Policy unresolved");
                    Outcome {
                        id: policy.id.clone(),
                        status: PolicyStatus::Unresolved,
                        reason: Some(err.to_string()),
                    }
                }
                Err(err) => return Err(err),
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn rule_for(&self, kind: PolicyKind, policy: &Policy) -> RaindResult<Rule> {
        let source = self.attachment(policy.source.container_name.as_deref())?;
        let rule = match kind {
            PolicyKind::EastWest => {
                let destination = self.attachment(policy.destination.container_name.as_deref())?;
                Rule::filter(EAST_WEST_CHAIN, Target::Accept).with(Match::Physdev {
                    input: Some(source.veth_name),
                    output: Some(destination.veth_name),
                })
            }
            PolicyKind::NorthSouthObserve | PolicyKind::NorthSouthEnforce => {
                let destination = policy.destination.address.clone().ok_or_else(|| {
                    RaindError::validation(
                        "policy destination",
                        "north-south policies require an IP or CIDR destination",
                    )
                })?;
                // Observe holds explicit denies, enforce holds explicit allows.
                let target = if kind == PolicyKind::NorthSouthObserve {
                    Target::Drop
                } else {
                    Target::Accept
                };
                Rule::filter(chain_for(kind), target)
                    .with(Match::InInterface(source.bridge))
                    .with(Match::Source(source.address.to_string()))
                    .with(Match::Destination(destination))
                    .with(Match::OutInterface(self.settings.host_interface.clone()))
            }
        };
        Ok(rule
            .with_opt(policy.protocol.map(Match::Protocol))
            .with_opt(policy.dport.map(Match::DestinationPort))
            .comment(policy.id.clone()))
    }

    fn attachment(&self, name: Option<&str>) -> RaindResult<Assignment> {
        let name = name.ok_or_else(|| {
            RaindError::validation("policy endpoint", "missing container name")
        })?;
        let id = self.resolver.container_id(name)?;
        self.ipam.lookup(&id)
    }

    async fn build_chains(&self, defaults: &Defaults) -> RaindResult<()> {
        for chain in CHAINS {
            self.netfilter.reset_chain(Table::Filter, chain).await?;
        }
        self.netfilter
            .ensure_rule(
                &Rule::filter("FORWARD", Target::Jump(ROOT_CHAIN.to_string())),
                Position::Insert(1),
            )
            .await?;

        let north_south = match defaults.north_south.mode {
            NorthSouthMode::Enforce => NS_ENFORCE_CHAIN,
            NorthSouthMode::Observe => NS_OBSERVE_CHAIN,
        };
        let root = [
            Rule::filter(ROOT_CHAIN, Target::Accept)
                .with(Match::ConntrackState(vec!["ESTABLISHED", "RELATED"])),
            Rule::filter(ROOT_CHAIN, Target::Jump(EAST_WEST_CHAIN.to_string())),
            Rule::filter(ROOT_CHAIN, Target::Jump(north_south.to_string())),
            Rule::filter(ROOT_CHAIN, Target::Return),
        ];
        for rule in &root {
            self.netfilter.add_rule(rule, Position::Append).await?;
        }

        let host = self.settings.host_interface.as_str();
        for bridge in self.ipam.bridges()? {
            if defaults.east_west.mode == EastWestMode::Deny {
                let lane = |target| {
                    Rule::filter(EAST_WEST_CHAIN, target)
                        .with(Match::InInterface(bridge.clone()))
                        .with(Match::OutInterface(bridge.clone()))
                };
                if defaults.east_west.logging {
                    self.append(lane(self.nflog("RAIND-EW-DROP")).with(Self::new_connections()))
                        .await?;
                }
                self.append(lane(Target::Drop)).await?;
            }

            let outbound = |chain: &str, target| {
                Rule::filter(chain, target)
                    .with(Match::InInterface(bridge.clone()))
                    .with(Match::OutInterface(host.to_string()))
            };
            if defaults.north_south.logging {
                self.append(outbound(NS_OBSERVE_CHAIN, self.nflog("RAIND-NS-OBS")).with(Self::new_connections()))
                    .await?;
                self.append(outbound(NS_ENFORCE_CHAIN, self.nflog("RAIND-NS-ENF")).with(Self::new_connections()))
                    .await?;
            }
            self.append(outbound(NS_OBSERVE_CHAIN, Target::Accept)).await?;
            self.append(outbound(NS_ENFORCE_CHAIN, Target::Drop)).await?;
        }

        for chain in [EAST_WEST_CHAIN, NS_OBSERVE_CHAIN, NS_ENFORCE_CHAIN] {
            self.append(Rule::filter(chain, Target::Return)).await?;
        }
        tracing::debug!(north_south, "Predefined chains built");
        Ok(())
    }

    async fn append(&self, rule: Rule) -> RaindResult<()> {
        self.netfilter.add_rule(&rule, Position::Append).await
    }

    fn nflog(&self, prefix: &str) -> Target {
        Target::Nflog {
            group: self.settings.nflog_group,
            prefix: format!("{prefix} "),
        }
    }

    fn new_connections() -> Match {
        Match::ConntrackState(vec!["NEW"])
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use super::*;
    use crate::netfilter::MemoryNetfilter;
    use crate::policy::model::Endpoint;
    use crate::portmap::Protocol;

    struct Names(HashMap<String, String>);

    impl ContainerResolver for Names {
        fn container_id(&self, name: &str) -> RaindResult<String> {
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| RaindError::not_found("container", name))
        }
    }

    struct Fixture {
        _dir: TempDir,
        netfilter: Arc<MemoryNetfilter>,
        compiler: PolicyCompiler,
    }

    fn fixture(containers: &[(&str, &str)]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let ipam = Arc::new(IpamStore::new(dir.path().join("ipam.json")));
        ipam.bootstrap().unwrap();
        let mut names = HashMap::new();
        for (name, id) in containers {
            ipam.allocate("raind0", id).unwrap();
            names.insert((*name).to_string(), (*id).to_string());
        }
        let netfilter = Arc::new(MemoryNetfilter::new());
        let compiler = PolicyCompiler::new(
            Arc::new(PolicyStore::new(dir.path().join("npm.json"))),
            ipam,
            netfilter.clone(),
            Arc::new(Names(names)),
            CompilerSettings::default(),
        );
        Fixture {
            _dir: dir,
            netfilter,
            compiler,
        }
    }

    fn east_west(src: &str, dst: &str) -> PolicyRequest {
        PolicyRequest {
            kind: PolicyKind::EastWest,
            source: Endpoint::container(src),
            destination: Endpoint::container(dst),
            protocol: Some(Protocol::Tcp),
            dport: Some(80),
            comment: None,
        }
    }

    fn has_physdev(netfilter: &MemoryNetfilter, src: &str, dst: &str) -> bool {
        netfilter.rules(Table::Filter, EAST_WEST_CHAIN).iter().any(|rule| {
            rule.matches.contains(&Match::Physdev {
                input: Some(src.to_string()),
                output: Some(dst.to_string()),
            })
        })
    }

    #[tokio::test]
    async fn predefined_chains_are_wired() {
        let f = fixture(&[]);
        f.compiler.commit().await.unwrap();

        let forward = f.netfilter.rules(Table::Filter, "FORWARD");
        assert_eq!(forward[0].target, Target::Jump(ROOT_CHAIN.into()));

        let root: Vec<_> = f
            .netfilter
            .rules(Table::Filter, ROOT_CHAIN)
            .into_iter()
            .map(|rule| rule.target)
            .collect();
        assert_eq!(
            root,
            vec![
                Target::Accept,
                Target::Jump(EAST_WEST_CHAIN.into()),
                Target::Jump(NS_OBSERVE_CHAIN.into()),
                Target::Return,
            ]
        );

        let east_west = f.netfilter.rules(Table::Filter, EAST_WEST_CHAIN);
        assert_eq!(east_west.first().map(|r| r.target.clone()), Some(Target::Drop));
        assert_eq!(east_west.last().map(|r| r.target.clone()), Some(Target::Return));
    }

    #[tokio::test]
    async fn commit_revert_cycle() {
        let f = fixture(&[("a", "aaaaaaaaaaaa"), ("b", "bbbbbbbbbbbb")]);
        let policy = f.compiler.add(east_west("a", "b")).await.unwrap();

        let report = f.compiler.commit().await.unwrap();
        assert_eq!(report.applied, 1);
        let (_, stored) = f.compiler.store().get(&policy.id).unwrap();
        assert_eq!(stored.status, PolicyStatus::Applied);
        assert!(has_physdev(&f.netfilter, "rd_aaaaaaaaaaaa", "rd_bbbbbbbbbbbb"));
        let active = f.netfilter.dump();

        f.compiler.remove(&policy.id).await.unwrap();
        let report = f.compiler.commit().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(!has_physdev(&f.netfilter, "rd_aaaaaaaaaaaa", "rd_bbbbbbbbbbbb"));
        assert!(f.compiler.store().get(&policy.id).is_err());

        f.compiler.revert().await.unwrap();
        assert!(has_physdev(&f.netfilter, "rd_aaaaaaaaaaaa", "rd_bbbbbbbbbbbb"));
        assert_eq!(f.netfilter.dump(), active);

        f.compiler.commit().await.unwrap();
        assert_eq!(f.netfilter.dump(), active);
    }

    #[tokio::test]
    async fn commit_is_idempotent() {
        let f = fixture(&[("a", "aaaaaaaaaaaa"), ("b", "bbbbbbbbbbbb")]);
        f.compiler.add(east_west("a", "b")).await.unwrap();
        f.compiler.add(east_west("b", "a")).await.unwrap();

        f.compiler.commit().await.unwrap();
        let first = f.netfilter.dump();
        f.compiler.commit().await.unwrap();
        assert_eq!(f.netfilter.dump(), first);
    }

    #[tokio::test]
    async fn declaration_order_is_rule_order() {
        let f = fixture(&[("a", "aaaaaaaaaaaa"), ("b", "bbbbbbbbbbbb")]);
        let first = f.compiler.add(east_west("a", "b")).await.unwrap();
        let second = f.compiler.add(east_west("b", "a")).await.unwrap();
        f.compiler.commit().await.unwrap();

        let rules = f.netfilter.rules(Table::Filter, EAST_WEST_CHAIN);
        assert_eq!(rules[0].comment.as_deref(), Some(first.id.as_str()));
        assert_eq!(rules[1].comment.as_deref(), Some(second.id.as_str()));
    }

    #[tokio::test]
    async fn unknown_containers_stay_unresolved() {
        let f = fixture(&[]);
        let policy = f.compiler.add(east_west("ghost-a", "ghost-b")).await.unwrap();

        let report = f.compiler.commit().await.unwrap();
        assert_eq!(report.unresolved, 1);

        let (_, stored) = f.compiler.store().get(&policy.id).unwrap();
        assert_eq!(stored.status, PolicyStatus::Unresolved);
        assert!(
            stored
                .reason
                .as_deref()
                .is_some_and(|reason| reason.contains("container: ghost-a not found"))
        );
    }

    #[tokio::test]
    async fn enforce_mode_routes_root_to_enforce_chain() {
        let f = fixture(&[("web", "cccccccccccc")]);
        f.compiler
            .add(PolicyRequest {
                kind: PolicyKind::NorthSouthEnforce,
                source: Endpoint::container("web"),
                destination: Endpoint::address("1.1.1.1"),
                protocol: Some(Protocol::Udp),
                dport: Some(53),
                comment: None,
            })
            .await
            .unwrap();

        f.compiler
            .set_north_south_mode(NorthSouthMode::Enforce)
            .await
            .unwrap();

        let root = f.netfilter.rules(Table::Filter, ROOT_CHAIN);
        assert_eq!(root[2].target, Target::Jump(NS_ENFORCE_CHAIN.into()));

        let enforce = f.netfilter.rules(Table::Filter, NS_ENFORCE_CHAIN);
        assert_eq!(enforce[0].target, Target::Accept);
        assert!(enforce[0].matches.contains(&Match::Source("10.166.0.1".into())));
        assert!(enforce[0].matches.contains(&Match::Destination("1.1.1.1".into())));
        assert!(enforce[0].matches.contains(&Match::OutInterface("eth0".into())));
    }

    #[tokio::test]
    async fn logging_adds_nflog_ahead_of_verdicts() {
        let f = fixture(&[]);
        f.compiler.commit().await.unwrap();
        assert!(
            !f.netfilter
                .rules(Table::Filter, EAST_WEST_CHAIN)
                .iter()
                .any(|rule| matches!(rule.target, Target::Nflog { .. }))
        );

        f.compiler.store().set_logging(true, true).unwrap();
        f.compiler.commit().await.unwrap();
        let east_west = f.netfilter.rules(Table::Filter, EAST_WEST_CHAIN);
        assert!(matches!(east_west[0].target, Target::Nflog { group: 100, .. }));
        assert_eq!(east_west[1].target, Target::Drop);
        let observe = f.netfilter.rules(Table::Filter, NS_OBSERVE_CHAIN);
        assert!(matches!(observe[0].target, Target::Nflog { .. }));
        assert_eq!(observe[1].target, Target::Accept);
    }
}
