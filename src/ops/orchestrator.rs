//! Batch orchestration: resolve an install plan, run one pipeline per
//! descriptor, and aggregate the results.
//!
//! Validation and resolution failures abort the batch before any side
//! effect. Once pipelines are running, a failure is scoped to its own
//! descriptor: siblings with no dependency on it keep going, dependents
//! are failed with `DependencyFailed` through the gate channels.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::descriptor::{Descriptor, DescriptorError};
use crate::core::resolver::{self, InstallPlan};
use crate::ops::error::{InstallError, exit_code};
use crate::ops::pipeline::{DepGate, GateState, Pipeline, PipelineContext, PipelineReport};
use crate::types::PackageName;

/// An immutable, validated set of descriptors, keyed by name.
#[derive(Debug, Default)]
pub struct DescriptorSet {
    descriptors: BTreeMap<PackageName, Arc<Descriptor>>,
}

impl DescriptorSet {
    /// Load and validate every `*.toml` descriptor under `dir`.
    ///
    /// Any invalid descriptor aborts the load; a batch over a broken
    /// set never starts.
    pub fn load_dir(dir: &Path) -> Result<Self, DescriptorError> {
        let mut set = Self::default();
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        entries.sort();

        for path in entries {
            let descriptor = Descriptor::from_file(&path)?;
            set.insert(descriptor);
        }
        Ok(set)
    }

    pub fn insert(&mut self, descriptor: Descriptor) {
        self.descriptors
            .insert(descriptor.name().clone(), Arc::new(descriptor));
    }

    pub fn get(&self, name: &PackageName) -> Option<&Arc<Descriptor>> {
        self.descriptors.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &PackageName> {
        self.descriptors.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Descriptor>> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Aggregated per-descriptor results for one batch, in plan order.
#[derive(Debug)]
pub struct BatchReport {
    pub reports: Vec<PipelineReport>,
}

impl BatchReport {
    pub fn all_complete(&self) -> bool {
        self.reports.iter().all(PipelineReport::is_complete)
    }

    /// Exit code for the batch: success, or the code of the first
    /// failed descriptor in plan order.
    pub fn exit_code(&self) -> u8 {
        self.reports
            .iter()
            .find(|r| !r.is_complete())
            .map_or(exit_code::SUCCESS, PipelineReport::exit_code)
    }
}

/// Drives resolver and pipelines across one requested root set.
pub struct Orchestrator {
    set: DescriptorSet,
    ctx: Arc<PipelineContext>,
}

impl Orchestrator {
    pub fn new(set: DescriptorSet, ctx: Arc<PipelineContext>) -> Self {
        Self { set, ctx }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn descriptors(&self) -> &DescriptorSet {
        &self.set
    }

    /// Resolve the install plan for `roots` without executing anything.
    pub fn plan(&self, roots: &[PackageName]) -> Result<InstallPlan, InstallError> {
        Ok(resolver::resolve(roots, |name| {
            self.set.get(name).map(|d| &**d)
        })?)
    }

    /// Resolve and execute. Every pipeline is spawned up front; gate
    /// channels enforce that no descriptor configures before its
    /// dependencies are complete, while earlier stages overlap freely.
    pub async fn install(
        &self,
        roots: &[PackageName],
        cancel: &CancellationToken,
    ) -> Result<BatchReport, InstallError> {
        let plan = self.plan(roots)?;

        let mut senders: BTreeMap<PackageName, watch::Sender<GateState>> = BTreeMap::new();
        let mut receivers: BTreeMap<PackageName, watch::Receiver<GateState>> = BTreeMap::new();
        for name in &plan {
            let (tx, rx) = watch::channel(GateState::Pending);
            senders.insert(name.clone(), tx);
            receivers.insert(name.clone(), rx);
        }

        let mut tasks: JoinSet<(usize, PipelineReport)> = JoinSet::new();
        for (index, name) in plan.order().iter().enumerate() {
            // The plan only contains resolvable names.
            let Some(descriptor) = self.set.get(name) else {
                continue;
            };
            let gates: Vec<DepGate> = descriptor
                .dependency_names()
                .into_iter()
                .filter_map(|dep| {
                    receivers.get(&dep).map(|rx| DepGate {
                        name: dep,
                        rx: rx.clone(),
                    })
                })
                .collect();

            let pipeline = Pipeline::new(descriptor.clone(), self.ctx.clone(), cancel.child_token());
            // The task owns its package's sender; if it dies without
            // reporting, dependents observe a closed gate as a failure.
            let tx = senders.remove(name);
            tasks.spawn(async move {
                let report = pipeline.run(gates).await;
                if let Some(tx) = tx {
                    let state = if report.is_complete() {
                        GateState::Complete
                    } else {
                        GateState::Failed
                    };
                    let _ = tx.send(state);
                }
                (index, report)
            });
        }
        drop(senders);

        let mut indexed: Vec<(usize, PipelineReport)> = Vec::with_capacity(plan.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => indexed.push(entry),
                Err(e) => tracing::error!(error = %e, "pipeline task panicked"),
            }
        }
        indexed.sort_by_key(|(index, _)| *index);

        Ok(BatchReport {
            reports: indexed.into_iter().map(|(_, report)| report).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resolver::ResolveError;
    use crate::ops::error::StageError;
    use crate::ops::pipeline::{PipelineStatus, Stage};
    use crate::ops::testutil::{ScriptedRunner, map_fetcher, test_context};

    fn meta_descriptor(name: &str, runtime: &[&str]) -> Descriptor {
        let deps = runtime
            .iter()
            .map(|d| format!("\"{d}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let toml = format!(
            r#"
[package]
name = "{name}"
version = "1.0"

[dependencies]
runtime = [{deps}]

[stages]
configure = [{{ program = "configure-{name}" }}]
install = [{{ program = "install-{name}" }}]
"#
        );
        Descriptor::from_str(&toml).unwrap()
    }

    fn orchestrator(descriptors: Vec<Descriptor>, runner: ScriptedRunner) -> (Orchestrator, tempfile::TempDir) {
        let home = tempfile::tempdir().unwrap();
        let ctx = test_context(home.path(), map_fetcher(&[]), runner);
        let mut set = DescriptorSet::default();
        for d in descriptors {
            set.insert(d);
        }
        (Orchestrator::new(set, ctx), home)
    }

    #[tokio::test]
    async fn dependent_configures_only_after_dependency_completes() {
        let runner = ScriptedRunner::default();
        let (orchestrator, _home) = orchestrator(
            vec![meta_descriptor("a", &["b"]), meta_descriptor("b", &[])],
            runner.clone(),
        );

        let plan = orchestrator.plan(&["a".into()]).unwrap();
        assert_eq!(
            plan.order(),
            &[PackageName::new("b"), PackageName::new("a")]
        );

        let report = orchestrator
            .install(&["a".into()], &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.all_complete());

        let programs = runner.programs();
        let b_install = programs.iter().position(|p| p == "install-b").unwrap();
        let a_configure = programs.iter().position(|p| p == "configure-a").unwrap();
        assert!(b_install < a_configure);
    }

    #[tokio::test]
    async fn sibling_continues_when_unrelated_package_fails() {
        let runner = ScriptedRunner::default();
        runner.fail_program("configure-broken");
        let (orchestrator, _home) = orchestrator(
            vec![
                meta_descriptor("broken", &[]),
                meta_descriptor("dependent", &["broken"]),
                meta_descriptor("independent", &[]),
            ],
            runner.clone(),
        );

        let roots: Vec<PackageName> =
            vec!["broken".into(), "dependent".into(), "independent".into()];
        let report = orchestrator
            .install(&roots, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!report.all_complete());
        let by_name = |name: &str| {
            report
                .reports
                .iter()
                .find(|r| r.name == PackageName::new(name))
                .unwrap()
        };

        match &by_name("broken").status {
            PipelineStatus::Failed { stage, error } => {
                assert_eq!(*stage, Stage::Configuring);
                assert!(matches!(error, StageError::Command { .. }));
            }
            other => panic!("unexpected status: {other:?}"),
        }
        match &by_name("dependent").status {
            PipelineStatus::Failed { error, .. } => {
                assert!(matches!(
                    error,
                    StageError::DependencyFailed { dependency } if *dependency == "broken"
                ));
            }
            other => panic!("unexpected status: {other:?}"),
        }
        assert!(by_name("independent").is_complete());
    }

    #[tokio::test]
    async fn reports_come_back_in_plan_order() {
        let runner = ScriptedRunner::default();
        let (orchestrator, _home) = orchestrator(
            vec![
                meta_descriptor("zeta", &[]),
                meta_descriptor("alpha", &[]),
                meta_descriptor("mid", &["zeta"]),
            ],
            runner,
        );

        let roots: Vec<PackageName> = vec!["zeta".into(), "alpha".into(), "mid".into()];
        let report = orchestrator
            .install(&roots, &CancellationToken::new())
            .await
            .unwrap();
        let names: Vec<&str> = report.reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta", "mid"]);
    }

    #[tokio::test]
    async fn cycle_aborts_before_any_pipeline_runs() {
        let runner = ScriptedRunner::default();
        let (orchestrator, _home) = orchestrator(
            vec![meta_descriptor("a", &["b"]), meta_descriptor("b", &["a"])],
            runner.clone(),
        );

        let err = orchestrator
            .install(&["a".into()], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InstallError::Resolve(ResolveError::Cycle { .. })
        ));
        assert!(runner.programs().is_empty());
    }

    #[tokio::test]
    async fn unresolved_dependency_aborts_the_batch() {
        let runner = ScriptedRunner::default();
        let (orchestrator, _home) =
            orchestrator(vec![meta_descriptor("a", &["ghost"])], runner.clone());

        let err = orchestrator
            .install(&["a".into()], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InstallError::Resolve(ResolveError::Unresolved { .. })
        ));
        assert!(runner.programs().is_empty());
    }

    #[tokio::test]
    async fn cancellation_does_not_run_commands() {
        let runner = ScriptedRunner::default();
        let (orchestrator, _home) =
            orchestrator(vec![meta_descriptor("a", &[])], runner.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = orchestrator.install(&["a".into()], &cancel).await.unwrap();
        assert!(!report.all_complete());
        assert_eq!(report.exit_code(), crate::ops::error::exit_code::CANCELLED);
        assert!(runner.programs().is_empty());
    }

    #[tokio::test]
    async fn batch_exit_code_reflects_first_failure() {
        let runner = ScriptedRunner::default();
        runner.fail_program("install-bad");
        let (orchestrator, _home) = orchestrator(
            vec![meta_descriptor("bad", &[]), meta_descriptor("good", &[])],
            runner,
        );

        let roots: Vec<PackageName> = vec!["bad".into(), "good".into()];
        let report = orchestrator
            .install(&roots, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            report.exit_code(),
            crate::ops::error::exit_code::COMMAND_FAILED
        );
    }
}
