//! Pod reconciler.
//!
//! Each tick converges replica sets to their desired counts and brings
//! pods that are degraded, stopped or never started back, unless a user
//! stopped them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use raind_common::RaindResult;
use tokio_util::sync::CancellationToken;

use super::model::{Pod, PodState};
use super::service::{InfraState, PodService};

/// What one tick changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Pods created for replica sets.
    pub created: Vec<String>,
    /// Excess pods removed.
    pub removed: Vec<String>,
    /// Pods started in place.
    pub started: Vec<String>,
    /// Pods torn down and recreated from their template.
    pub recreated: Vec<String>,
    /// Per-pod failures; the tick carried on past them.
    pub failures: Vec<String>,
}

/// Converges pods toward their templates and replica sets.
pub struct Reconciler {
    pods: Arc<PodService>,
    interval: Duration,
}

impl Reconciler {
    /// Create a reconciler ticking every `interval`.
    pub const fn new(pods: Arc<PodService>, interval: Duration) -> Self {
        Self { pods, interval }
    }

    /// Run one pass.
    ///
    /// # Errors
    ///
    /// Returns store errors reading replica sets and pods; failures of
    /// individual pods are collected in the report.
    pub async fn tick(&self) -> RaindResult<ReconcileReport> {
        let store = self.pods.store();
        let mut report = ReconcileReport::default();
        let mut governed = BTreeSet::new();

        for replicaset in store.replicasets()? {
            let template_id = replicaset.spec.template_id.clone();
            governed.insert(template_id.clone());
            let desired = usize::try_from(replicaset.spec.replicas).unwrap_or(usize::MAX);
            let bound = store.pods_of_template(&template_id)?;

            if bound.len() < desired {
                for _ in bound.len()..desired {
                    match self.pods.create_from_template(&template_id) {
                        Ok(pod) => {
                            report.created.push(pod.pod_id.clone());
                            if let Err(err) = self.pods.start(&pod.pod_id).await {
                                failed(&mut report, &pod, "start", &err);
                            }
                        }
                        Err(err) => {
                            tracing::warn!(replicaset = %replicaset.spec.name, error = %err, "Creating replica failed");
                            report.failures.push(format!("{}: {err}", replicaset.spec.name));
                        }
                    }
                }
            } else if bound.len() > desired {
                // newest first
                for pod in bound.iter().rev().take(bound.len() - desired) {
                    match self.pods.remove(&pod.pod_id).await {
                        Ok(()) => report.removed.push(pod.pod_id.clone()),
                        Err(err) => failed(&mut report, pod, "remove", &err),
                    }
                }
            }

            for pod in store.pods_of_template(&template_id)? {
                if report.created.contains(&pod.pod_id) {
                    continue;
                }
                self.recover(&pod, &mut report).await;
            }
        }

        let mut orphaned: Vec<String> = store
            .pods()?
            .into_iter()
            .filter_map(|pod| pod.template_id)
            .filter(|template_id| !governed.contains(template_id))
            .collect();
        orphaned.sort();
        orphaned.dedup();
        for template_id in orphaned {
            let bound = store.pods_of_template(&template_id)?;
            if bound.iter().all(|pod| pod.stopped_by_user) {
                continue;
            }
            for pod in &bound {
                if pod.stopped_by_user {
                    continue;
                }
                if self.recover(pod, &mut report).await {
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Bring one pod back if it needs it; returns whether anything was done.
    async fn recover(&self, pod: &Pod, report: &mut ReconcileReport) -> bool {
        if pod.stopped_by_user {
            return false;
        }
        let pod = match self.pods.refresh(&pod.pod_id) {
            Ok(pod) => pod,
            Err(err) => {
                failed(report, pod, "refresh", &err);
                return false;
            }
        };
        match pod.state {
            PodState::Degraded => match self.pods.infra_state(&pod.pod_id) {
                Ok(InfraState::Running) => self.start(&pod, report).await,
                Ok(InfraState::Missing | InfraState::Stopped) => {
                    match self.pods.recreate(&pod).await {
                        Ok(fresh) => report.recreated.push(fresh.pod_id),
                        Err(err) => failed(report, &pod, "recreate", &err),
                    }
                }
                Err(err) => failed(report, &pod, "probe infra", &err),
            },
            // a created pod whose first start failed is retried
            PodState::Created | PodState::Stopped => self.start(&pod, report).await,
            PodState::Running => return false,
        }
        true
    }

    async fn start(&self, pod: &Pod, report: &mut ReconcileReport) {
        match self.pods.start(&pod.pod_id).await {
            Ok(_) => report.started.push(pod.pod_id.clone()),
            Err(err) => failed(report, pod, "start", &err),
        }
    }

    /// Reconcile at the configured interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::debug!(interval = ?self.interval, "Pod reconciler started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => match self.tick().await {
                    Ok(report) if report != ReconcileReport::default() => {
                        tracing::info!(
                            created = report.created.len(),
                            removed = report.removed.len(),
                            started = report.started.len(),
                            recreated = report.recreated.len(),
                            failures = report.failures.len(),
                            "Pods reconciled"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "Pod reconcile tick failed"),
                },
            }
        }
        tracing::debug!("Pod reconciler stopped");
    }
}

fn failed(report: &mut ReconcileReport, pod: &Pod, step: &str, err: &raind_common::RaindError) {
    tracing::warn!(pod_id = %pod.pod_id, name = %pod.name, step, error = %err, "Pod reconcile step failed");
    report.failures.push(format!("{} {step}: {err}", pod.name));
}
