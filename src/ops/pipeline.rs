//! The per-package build pipeline state machine.
//!
//! One pipeline instance processes exactly one descriptor through
//! `Pending → Fetching → Verifying → Unpacking → Configuring → Building
//! → Installing → Testing → Complete`, with `Failed(stage, cause)` as
//! the absorbing state. Stages before Configuring may run while the
//! package's dependencies are still installing; the dependency gate is
//! awaited exactly once, at entry to Configuring.
//!
//! Install writes go to a per-descriptor staging prefix and are moved
//! into the store in one rename after the install stage succeeds, so an
//! interrupted or failed sibling can never leave the store partially
//! written.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::Layout;
use crate::core::descriptor::{CommandSpec, Descriptor};
use crate::core::platform::{PlatformFacts, ResolvedEffects, resolve_effects};
use crate::core::verify;
use crate::io::command::{CommandError, CommandRunner, ResolvedCommand, substitute};
use crate::io::extract;
use crate::io::fetch::{Fetch, FetchError, MirrorPolicy, fetch_first};
use crate::ops::error::StageError;
use crate::types::{PackageName, Version};

/// Marker file recording a completed install.
pub const RECEIPT_FILE: &str = ".keg-receipt.json";

/// Pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Pending,
    Fetching,
    Verifying,
    Unpacking,
    Configuring,
    Building,
    Installing,
    Testing,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Fetching => "fetching",
            Stage::Verifying => "verifying",
            Stage::Unpacking => "unpacking",
            Stage::Configuring => "configuring",
            Stage::Building => "building",
            Stage::Installing => "installing",
            Stage::Testing => "testing",
            Stage::Complete => "complete",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one pipeline run.
#[derive(Debug)]
pub enum PipelineStatus {
    Complete { already_installed: bool },
    Failed { stage: Stage, error: StageError },
}

/// Per-descriptor result handed back to the orchestrator.
#[derive(Debug)]
pub struct PipelineReport {
    pub name: PackageName,
    pub version: Version,
    pub revision: u32,
    pub status: PipelineStatus,
}

impl PipelineReport {
    pub fn is_complete(&self) -> bool {
        matches!(self.status, PipelineStatus::Complete { .. })
    }

    pub fn exit_code(&self) -> u8 {
        match &self.status {
            PipelineStatus::Complete { .. } => crate::ops::error::exit_code::SUCCESS,
            PipelineStatus::Failed { error, .. } => error.exit_code(),
        }
    }
}

/// Completion signal published by each pipeline for its dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Pending,
    Complete,
    Failed,
}

/// One dependency's completion channel.
pub struct DepGate {
    pub name: PackageName,
    pub rx: watch::Receiver<GateState>,
}

/// Shared, read-only execution environment for a batch of pipelines.
pub struct PipelineContext {
    pub fetcher: Arc<dyn Fetch>,
    pub runner: Arc<dyn CommandRunner>,
    pub layout: Layout,
    pub facts: PlatformFacts,
    pub mirror_policy: MirrorPolicy,
    pub jobs: usize,
}

/// Install record written into the store on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub name: PackageName,
    pub version: Version,
    pub revision: u32,
    pub checksum: Option<String>,
    pub size_bytes: u64,
    pub installed_at: String,
}

impl Receipt {
    pub fn read(store_path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(store_path.join(RECEIPT_FILE))?;
        serde_json::from_str(&content).map_err(io::Error::other)
    }

    fn write(&self, store_path: &Path) -> io::Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(store_path.join(RECEIPT_FILE), content)
    }
}

/// Drives one descriptor through the staged state machine.
pub struct Pipeline {
    descriptor: Arc<Descriptor>,
    ctx: Arc<PipelineContext>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(
        descriptor: Arc<Descriptor>,
        ctx: Arc<PipelineContext>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            descriptor,
            ctx,
            cancel,
        }
    }

    /// Run to a terminal state. Never panics, never retries; whatever
    /// happens is in the report.
    pub async fn run(&self, gates: Vec<DepGate>) -> PipelineReport {
        let status = match self.execute(gates).await {
            Ok(already_installed) => PipelineStatus::Complete { already_installed },
            Err((stage, error)) => {
                tracing::warn!(
                    package = %self.descriptor.name(),
                    %stage,
                    error = %error,
                    "pipeline failed"
                );
                PipelineStatus::Failed { stage, error }
            }
        };
        PipelineReport {
            name: self.descriptor.name().clone(),
            version: self.descriptor.version().clone(),
            revision: self.descriptor.revision(),
            status,
        }
    }

    async fn execute(&self, mut gates: Vec<DepGate>) -> Result<bool, (Stage, StageError)> {
        let d = &*self.descriptor;
        let store_path = self
            .ctx
            .layout
            .store_path(d.name(), d.version(), d.revision());

        // Idempotence: an intact receipt means this exact build identity
        // is already installed.
        if store_path.join(RECEIPT_FILE).is_file() {
            tracing::debug!(package = %d.name(), "already installed, short-circuiting");
            return Ok(true);
        }

        // A dependency that failed before we started prevents the
        // pipeline from starting at all.
        for gate in &gates {
            if *gate.rx.borrow() == GateState::Failed {
                return Err((
                    Stage::Pending,
                    StageError::DependencyFailed {
                        dependency: gate.name.clone(),
                    },
                ));
            }
        }
        self.check_cancelled(Stage::Pending)?;

        // Fetching + Verifying. Descriptors without a source URL (pure
        // metapackages) skip straight to the command stages.
        let candidates = d.fetch_candidates();
        let archive = if candidates.is_empty() {
            None
        } else {
            let bytes = tokio::select! {
                result = fetch_first(&*self.ctx.fetcher, &candidates, self.ctx.mirror_policy) => {
                    result.map_err(|e| (Stage::Fetching, fetch_stage_error(e)))?
                }
                () = self.cancel.cancelled() => {
                    return Err((Stage::Fetching, StageError::Cancelled));
                }
            };

            self.check_cancelled(Stage::Verifying)?;
            if let Some(checksum) = d.checksum() {
                verify::verify(&bytes, checksum).map_err(|e| (Stage::Verifying, e.into()))?;
            }
            Some(bytes)
        };

        // Per-descriptor staging: src/ for the build tree, prefix/ for
        // install output. Same volume as the store, so the final move is
        // a rename.
        let io_err = |e: io::Error| (Stage::Unpacking, StageError::Io(e));
        fs::create_dir_all(self.ctx.layout.tmp_dir()).map_err(io_err)?;
        let staging = tempfile::Builder::new()
            .prefix("keg-")
            .tempdir_in(self.ctx.layout.tmp_dir())
            .map_err(io_err)?;
        let src_dir = staging.path().join("src");
        let stage_prefix = staging.path().join("prefix");
        fs::create_dir_all(&src_dir).map_err(io_err)?;
        fs::create_dir_all(&stage_prefix).map_err(io_err)?;

        let mut archive_path = PathBuf::new();
        if let Some(bytes) = &archive {
            let filename = match crate::filename_from_url(&d.source().url) {
                "" => "archive",
                name => name,
            };
            archive_path = staging.path().join(filename);
            fs::write(&archive_path, bytes).map_err(io_err)?;
        }

        let mut log = Vec::new();
        let build_vars = vec![
            ("prefix", stage_prefix.display().to_string()),
            ("jobs", self.ctx.jobs.to_string()),
            ("version", d.version().to_string()),
            ("archive", archive_path.display().to_string()),
        ];

        // Unpacking: declared commands win; otherwise the built-in
        // extractor handles the archive.
        self.check_cancelled(Stage::Unpacking)?;
        if !d.stages().unpack.is_empty() {
            self.run_commands(
                Stage::Unpacking,
                &d.stages().unpack,
                &[],
                &[],
                &src_dir,
                &build_vars,
                &mut log,
            )
            .await?;
        } else if let Some(bytes) = archive {
            let url = d.source().url.clone();
            let strip = d.source().strip_components;
            let dest = src_dir.clone();
            tokio::task::spawn_blocking(move || extract::unpack(&bytes, &url, &dest, strip))
                .await
                .map_err(|e| (Stage::Unpacking, StageError::Io(io::Error::other(e))))?
                .map_err(|e| (Stage::Unpacking, e.into()))?;
        }

        // The only required synchronization point: every dependency must
        // be Complete before this pipeline configures against it.
        for gate in &mut gates {
            let state = tokio::select! {
                result = gate.rx.wait_for(|s| *s != GateState::Pending) => {
                    result.map(|s| *s).unwrap_or(GateState::Failed)
                }
                () = self.cancel.cancelled() => {
                    return Err((Stage::Configuring, StageError::Cancelled));
                }
            };
            if state == GateState::Failed {
                return Err((
                    Stage::Configuring,
                    StageError::DependencyFailed {
                        dependency: gate.name.clone(),
                    },
                ));
            }
        }

        // Platform conditionals resolve once, here, and stay fixed for
        // the rest of the run.
        let effects: ResolvedEffects = resolve_effects(d.conditionals(), self.ctx.facts)
            .map_err(|e| (Stage::Configuring, StageError::Conditional(e)))?;

        self.run_commands(
            Stage::Configuring,
            &d.stages().configure,
            &effects.configure_args,
            &effects.env,
            &src_dir,
            &build_vars,
            &mut log,
        )
        .await?;

        self.run_commands(
            Stage::Building,
            &d.stages().build,
            &[],
            &effects.env,
            &src_dir,
            &build_vars,
            &mut log,
        )
        .await?;

        self.run_commands(
            Stage::Installing,
            &d.stages().install,
            &[],
            &effects.env,
            &src_dir,
            &build_vars,
            &mut log,
        )
        .await?;

        // Commit: one rename from staging into the store, then the
        // receipt. Nothing before this point touched the store.
        let size_bytes = self
            .commit_install(&stage_prefix, &store_path)
            .map_err(|e| (Stage::Installing, StageError::Io(e)))?;
        let receipt = Receipt {
            name: d.name().clone(),
            version: d.version().clone(),
            revision: d.revision(),
            checksum: d.checksum().map(|c| c.to_string()),
            size_bytes,
            installed_at: chrono::Utc::now().to_rfc3339(),
        };
        receipt
            .write(&store_path)
            .map_err(|e| (Stage::Installing, StageError::Io(e)))?;

        // Testing: a failure here is reported but installed artifacts
        // stay on disk. "Built but unverified" is not "failed to build".
        if let Some(test) = d.test() {
            let test_vars = vec![
                ("prefix", store_path.display().to_string()),
                ("jobs", self.ctx.jobs.to_string()),
                ("version", d.version().to_string()),
            ];
            self.run_test(test, &effects.env, &store_path, &test_vars, &mut log)
                .await?;
        }

        self.flush_log(&log);
        Ok(false)
    }

    /// Run only the test stage against an already-installed package.
    ///
    /// Used by `keg test`; requires an intact receipt in the store.
    /// A descriptor without a test block trivially passes.
    pub async fn test_installed(&self) -> Result<(), (Stage, StageError)> {
        let d = &*self.descriptor;
        let store_path = self
            .ctx
            .layout
            .store_path(d.name(), d.version(), d.revision());
        Receipt::read(&store_path).map_err(|e| (Stage::Testing, StageError::Io(e)))?;

        let Some(test) = d.test() else {
            return Ok(());
        };

        let effects = resolve_effects(d.conditionals(), self.ctx.facts)
            .map_err(|e| (Stage::Testing, StageError::Conditional(e)))?;
        let test_vars = vec![
            ("prefix", store_path.display().to_string()),
            ("jobs", self.ctx.jobs.to_string()),
            ("version", d.version().to_string()),
        ];
        let mut log = Vec::new();
        self.run_test(test, &effects.env, &store_path, &test_vars, &mut log)
            .await?;
        self.flush_log(&log);
        Ok(())
    }

    fn check_cancelled(&self, stage: Stage) -> Result<(), (Stage, StageError)> {
        if self.cancel.is_cancelled() {
            Err((stage, StageError::Cancelled))
        } else {
            Ok(())
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_commands(
        &self,
        stage: Stage,
        commands: &[CommandSpec],
        extra_args: &[String],
        env: &[(String, String)],
        cwd: &Path,
        vars: &[(&str, String)],
        log: &mut Vec<String>,
    ) -> Result<(), (Stage, StageError)> {
        for spec in commands {
            self.check_cancelled(stage)?;
            let command = resolve_command(spec, extra_args, env, cwd, vars);
            let rendered = command.to_string();
            tracing::debug!(package = %self.descriptor.name(), %stage, command = %rendered, "running");

            let output = match self.ctx.runner.run(&command, &self.cancel).await {
                Ok(output) => output,
                Err(CommandError::Cancelled) => return Err((stage, StageError::Cancelled)),
                Err(e @ CommandError::Spawn { .. }) => {
                    return Err((
                        stage,
                        StageError::Command {
                            command: rendered,
                            status: None,
                            stderr: e.to_string(),
                        },
                    ));
                }
            };

            log.push(format!(
                "[{stage}] $ {rendered}\n{}{}",
                output.stdout, output.stderr
            ));

            if !output.success() {
                self.flush_log(log);
                return Err((
                    stage,
                    StageError::Command {
                        command: rendered,
                        status: output.status,
                        stderr: output.stderr,
                    },
                ));
            }
        }
        Ok(())
    }

    async fn run_test(
        &self,
        spec: &CommandSpec,
        env: &[(String, String)],
        store_path: &Path,
        vars: &[(&str, String)],
        log: &mut Vec<String>,
    ) -> Result<(), (Stage, StageError)> {
        self.check_cancelled(Stage::Testing)?;
        let command = resolve_command(spec, &[], env, store_path, vars);
        let rendered = command.to_string();

        let output = match self.ctx.runner.run(&command, &self.cancel).await {
            Ok(output) => output,
            Err(CommandError::Cancelled) => return Err((Stage::Testing, StageError::Cancelled)),
            Err(e @ CommandError::Spawn { .. }) => {
                return Err((
                    Stage::Testing,
                    StageError::TestFailed {
                        command: rendered,
                        status: None,
                        stderr: e.to_string(),
                    },
                ));
            }
        };

        log.push(format!(
            "[testing] $ {rendered}\n{}{}",
            output.stdout, output.stderr
        ));

        if !output.success() {
            self.flush_log(log);
            return Err((
                Stage::Testing,
                StageError::TestFailed {
                    command: rendered,
                    status: output.status,
                    stderr: output.stderr,
                },
            ));
        }
        Ok(())
    }

    /// Move the staged prefix into the store and return the installed
    /// size. Rename first; recursive copy as the cross-volume fallback.
    fn commit_install(&self, stage_prefix: &Path, store_path: &Path) -> io::Result<u64> {
        if store_path.exists() {
            // Stale partial from an interrupted earlier run (no receipt).
            fs::remove_dir_all(store_path)?;
        }
        if let Some(parent) = store_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if fs::rename(stage_prefix, store_path).is_err() {
            fs::create_dir_all(store_path)?;
            fs_extra::dir::copy(
                stage_prefix,
                store_path,
                &fs_extra::dir::CopyOptions::new().content_only(true),
            )
            .map_err(io::Error::other)?;
        }

        Ok(dir_size(store_path))
    }

    /// Append captured command output to the build log. Best effort.
    fn flush_log(&self, log: &[String]) {
        if log.is_empty() {
            return;
        }
        let path = self
            .ctx
            .layout
            .build_log_path(self.descriptor.name(), self.descriptor.version());
        let write = || -> io::Result<()> {
            fs::create_dir_all(self.ctx.layout.log_dir())?;
            fs::write(&path, log.join("\n"))
        };
        if let Err(e) = write() {
            tracing::debug!(path = %path.display(), error = %e, "could not write build log");
        }
    }
}

fn fetch_stage_error(e: FetchError) -> StageError {
    match e {
        FetchError::Exhausted { attempts } => StageError::FetchExhausted { attempts },
        other => StageError::FetchExhausted {
            attempts: vec![other.to_string()],
        },
    }
}

fn resolve_command(
    spec: &CommandSpec,
    extra_args: &[String],
    env: &[(String, String)],
    cwd: &Path,
    vars: &[(&str, String)],
) -> ResolvedCommand {
    let mut args: Vec<String> = spec.args.iter().map(|a| substitute(a, vars)).collect();
    args.extend(extra_args.iter().map(|a| substitute(a, vars)));

    let mut resolved_env: Vec<(String, String)> = vars
        .iter()
        .filter(|(name, _)| *name != "archive")
        .map(|(name, value)| (name.to_uppercase(), value.clone()))
        .collect();
    resolved_env.extend(
        env.iter()
            .map(|(k, v)| (k.clone(), substitute(v, vars))),
    );

    ResolvedCommand {
        program: substitute(&spec.program, vars),
        args,
        env: resolved_env,
        cwd: cwd.to_path_buf(),
    }
}

fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .flatten()
        .filter_map(|e| e.metadata().ok())
        .filter(std::fs::Metadata::is_file)
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::testutil::{
        ScriptedRunner, failed_gate, map_fetcher, pending_gate, sample_tar_gz, test_context,
    };
    use crate::types::Algorithm;

    fn archive_descriptor(extra: &str) -> Arc<Descriptor> {
        let archive = sample_tar_gz();
        let digest = crate::core::verify::compute(Algorithm::Sha256, &archive);
        let toml = format!(
            r#"
[package]
name = "pkg"
version = "1.0"

[source]
url = "https://example.com/pkg-1.0.tar.gz"
checksum = "sha256:{digest}"

[stages]
configure = [{{ program = "cfg" }}]
build = [{{ program = "bld" }}]
install = [{{ program = "inst" }}]
{extra}
"#
        );
        Arc::new(Descriptor::from_str(&toml).unwrap())
    }

    #[tokio::test]
    async fn full_pipeline_reaches_complete() {
        let home = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default();
        let fetcher = map_fetcher(&[("https://example.com/pkg-1.0.tar.gz", sample_tar_gz())]);
        let ctx = test_context(home.path(), fetcher, runner.clone());

        let descriptor = archive_descriptor("");
        let pipeline = Pipeline::new(descriptor.clone(), ctx.clone(), CancellationToken::new());
        let report = pipeline.run(vec![]).await;

        assert!(report.is_complete(), "status: {:?}", report.status);
        assert_eq!(runner.programs(), vec!["cfg", "bld", "inst"]);

        let store_path = ctx.layout.store_path(descriptor.name(), descriptor.version(), 0);
        assert!(store_path.join(RECEIPT_FILE).is_file());
        let receipt = Receipt::read(&store_path).unwrap();
        assert_eq!(receipt.name, *descriptor.name());
    }

    #[tokio::test]
    async fn second_run_short_circuits() {
        let home = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default();
        let fetcher = map_fetcher(&[("https://example.com/pkg-1.0.tar.gz", sample_tar_gz())]);
        let ctx = test_context(home.path(), fetcher, runner.clone());
        let descriptor = archive_descriptor("");

        let first = Pipeline::new(descriptor.clone(), ctx.clone(), CancellationToken::new())
            .run(vec![])
            .await;
        assert!(matches!(
            first.status,
            PipelineStatus::Complete {
                already_installed: false
            }
        ));

        let second = Pipeline::new(descriptor, ctx, CancellationToken::new())
            .run(vec![])
            .await;
        assert!(matches!(
            second.status,
            PipelineStatus::Complete {
                already_installed: true
            }
        ));
        // No stage re-ran.
        assert_eq!(runner.programs().len(), 3);
    }

    #[tokio::test]
    async fn integrity_mismatch_leaves_store_untouched() {
        let home = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default();
        // Payload differs from the declared checksum.
        let fetcher = map_fetcher(&[(
            "https://example.com/pkg-1.0.tar.gz",
            b"corrupted payload".to_vec(),
        )]);
        let ctx = test_context(home.path(), fetcher, runner.clone());
        let descriptor = archive_descriptor("");

        let report = Pipeline::new(descriptor.clone(), ctx.clone(), CancellationToken::new())
            .run(vec![])
            .await;

        match report.status {
            PipelineStatus::Failed { stage, error } => {
                assert_eq!(stage, Stage::Verifying);
                assert!(matches!(error, StageError::Integrity(_)));
            }
            other => panic!("unexpected status: {other:?}"),
        }
        assert!(runner.programs().is_empty());
        assert!(!ctx
            .layout
            .store_path(descriptor.name(), descriptor.version(), 0)
            .exists());
    }

    #[tokio::test]
    async fn exhausted_sources_fail_fetching() {
        let home = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default();
        let ctx = test_context(home.path(), map_fetcher(&[]), runner.clone());

        let toml = format!(
            r#"
[package]
name = "pkg"
version = "1.0"

[source]
url = "https://example.com/pkg-1.0.tar.gz"
mirrors = ["https://mirror.example.org/pkg-1.0.tar.gz"]
checksum = "sha256:{}"
"#,
            "0".repeat(64)
        );
        let descriptor = Arc::new(Descriptor::from_str(&toml).unwrap());

        let report = Pipeline::new(descriptor, ctx, CancellationToken::new())
            .run(vec![])
            .await;
        match report.status {
            PipelineStatus::Failed { stage, error } => {
                assert_eq!(stage, Stage::Fetching);
                match error {
                    StageError::FetchExhausted { attempts } => assert_eq!(attempts.len(), 2),
                    other => panic!("unexpected error: {other}"),
                }
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_command_reports_stage_and_output() {
        let home = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default();
        runner.fail_program("bld");
        let fetcher = map_fetcher(&[("https://example.com/pkg-1.0.tar.gz", sample_tar_gz())]);
        let ctx = test_context(home.path(), fetcher, runner.clone());
        let descriptor = archive_descriptor("");

        let report = Pipeline::new(descriptor.clone(), ctx.clone(), CancellationToken::new())
            .run(vec![])
            .await;
        match report.status {
            PipelineStatus::Failed { stage, error } => {
                assert_eq!(stage, Stage::Building);
                match error {
                    StageError::Command {
                        command,
                        status,
                        stderr,
                    } => {
                        assert_eq!(command, "bld");
                        assert_eq!(status, Some(1));
                        assert!(!stderr.is_empty());
                    }
                    other => panic!("unexpected error: {other}"),
                }
            }
            other => panic!("unexpected status: {other:?}"),
        }
        // Install never ran; store untouched.
        assert!(!ctx
            .layout
            .store_path(descriptor.name(), descriptor.version(), 0)
            .exists());
    }

    #[tokio::test]
    async fn test_failure_keeps_installed_artifacts() {
        let home = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default();
        runner.fail_program("self-check");
        let fetcher = map_fetcher(&[("https://example.com/pkg-1.0.tar.gz", sample_tar_gz())]);
        let ctx = test_context(home.path(), fetcher, runner.clone());
        let descriptor = archive_descriptor("\n[test]\nprogram = \"self-check\"\n");

        let report = Pipeline::new(descriptor.clone(), ctx.clone(), CancellationToken::new())
            .run(vec![])
            .await;
        match report.status {
            PipelineStatus::Failed { stage, error } => {
                assert_eq!(stage, Stage::Testing);
                assert!(matches!(error, StageError::TestFailed { .. }));
            }
            other => panic!("unexpected status: {other:?}"),
        }
        // Not rolled back.
        let store_path = ctx
            .layout
            .store_path(descriptor.name(), descriptor.version(), 0);
        assert!(store_path.join(RECEIPT_FILE).is_file());
    }

    #[tokio::test]
    async fn metapackage_without_source_skips_fetch() {
        let home = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default();
        let ctx = test_context(home.path(), map_fetcher(&[]), runner.clone());

        let toml = r#"
[package]
name = "meta"
version = "1.0"

[stages]
install = [{ program = "link-things" }]
"#;
        let descriptor = Arc::new(Descriptor::from_str(toml).unwrap());
        let report = Pipeline::new(descriptor, ctx, CancellationToken::new())
            .run(vec![])
            .await;
        assert!(report.is_complete(), "status: {:?}", report.status);
        assert_eq!(runner.programs(), vec!["link-things"]);
    }

    #[tokio::test]
    async fn declared_unpack_commands_replace_builtin_extraction() {
        let home = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default();
        // The .tar.bz2 suffix would be rejected by the built-in
        // extractor; declared commands take over instead.
        let fetcher = map_fetcher(&[(
            "https://example.com/pkg-1.0.tar.bz2",
            b"opaque bytes".to_vec(),
        )]);
        let ctx = test_context(home.path(), fetcher, runner.clone());

        let digest = crate::core::verify::compute(Algorithm::Sha256, b"opaque bytes");
        let toml = format!(
            r#"
[package]
name = "pkg"
version = "1.0"

[source]
url = "https://example.com/pkg-1.0.tar.bz2"
checksum = "sha256:{digest}"

[stages]
unpack = [{{ program = "tar", args = ["xf", "${{archive}}"] }}]
install = [{{ program = "inst" }}]
"#
        );
        let descriptor = Arc::new(Descriptor::from_str(&toml).unwrap());
        let report = Pipeline::new(descriptor, ctx, CancellationToken::new())
            .run(vec![])
            .await;
        assert!(report.is_complete(), "status: {:?}", report.status);

        let commands = runner.commands();
        assert_eq!(commands[0].program, "tar");
        assert_eq!(commands[0].args[0], "xf");
        assert!(commands[0].args[1].ends_with("pkg-1.0.tar.bz2"));
    }

    #[tokio::test]
    async fn conditional_effects_reach_configure() {
        let home = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default();
        let fetcher = map_fetcher(&[("https://example.com/pkg-1.0.tar.gz", sample_tar_gz())]);
        let ctx = test_context(home.path(), fetcher, runner.clone());

        let extra = r#"
[[conditionals]]
name = "cpu"
[[conditionals.case]]
when = { arch = "aarch64" }
configure_args = ["--with-cpu=aarch64"]
[[conditionals.case]]
when = { arch = "x86_64" }
configure_args = ["--with-cpu=x86-64"]
"#;
        let descriptor = archive_descriptor(extra);
        let report = Pipeline::new(descriptor, ctx, CancellationToken::new())
            .run(vec![])
            .await;
        assert!(report.is_complete(), "status: {:?}", report.status);

        // test_context pins facts to linux/x86_64.
        let commands = runner.commands();
        let configure = commands.iter().find(|c| c.program == "cfg").unwrap();
        assert_eq!(configure.args, vec!["--with-cpu=x86-64"]);
    }

    #[tokio::test]
    async fn already_failed_dependency_prevents_start() {
        let home = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default();
        let fetcher = map_fetcher(&[("https://example.com/pkg-1.0.tar.gz", sample_tar_gz())]);
        let ctx = test_context(home.path(), fetcher, runner.clone());
        let descriptor = archive_descriptor("");

        let report = Pipeline::new(descriptor, ctx, CancellationToken::new())
            .run(vec![failed_gate("dep")])
            .await;
        match report.status {
            PipelineStatus::Failed { stage, error } => {
                assert_eq!(stage, Stage::Pending);
                assert!(matches!(
                    error,
                    StageError::DependencyFailed { dependency } if dependency == "dep"
                ));
            }
            other => panic!("unexpected status: {other:?}"),
        }
        assert!(runner.programs().is_empty());
    }

    #[tokio::test]
    async fn configure_waits_for_dependency_gate() {
        let home = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default();
        let fetcher = map_fetcher(&[("https://example.com/pkg-1.0.tar.gz", sample_tar_gz())]);
        let ctx = test_context(home.path(), fetcher, runner.clone());
        let descriptor = archive_descriptor("");

        let (gate, tx) = pending_gate("dep");
        let pipeline_task = tokio::spawn({
            let pipeline = Pipeline::new(descriptor, ctx, CancellationToken::new());
            async move { pipeline.run(vec![gate]).await }
        });

        // Let fetch/verify/unpack proceed speculatively, then release.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(runner.programs().is_empty());
        tx.send(GateState::Complete).unwrap();

        let report = pipeline_task.await.unwrap();
        assert!(report.is_complete(), "status: {:?}", report.status);
    }

    #[tokio::test]
    async fn dependency_failure_at_gate_fails_configuring() {
        let home = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default();
        let fetcher = map_fetcher(&[("https://example.com/pkg-1.0.tar.gz", sample_tar_gz())]);
        let ctx = test_context(home.path(), fetcher, runner.clone());
        let descriptor = archive_descriptor("");

        let (gate, tx) = pending_gate("dep");
        let pipeline_task = tokio::spawn({
            let pipeline = Pipeline::new(descriptor, ctx, CancellationToken::new());
            async move { pipeline.run(vec![gate]).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send(GateState::Failed).unwrap();

        let report = pipeline_task.await.unwrap();
        match report.status {
            PipelineStatus::Failed { stage, error } => {
                assert_eq!(stage, Stage::Configuring);
                assert!(matches!(error, StageError::DependencyFailed { .. }));
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_installed_reruns_the_test_stage() {
        let home = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default();
        let fetcher = map_fetcher(&[("https://example.com/pkg-1.0.tar.gz", sample_tar_gz())]);
        let ctx = test_context(home.path(), fetcher, runner.clone());
        let descriptor = archive_descriptor("\n[test]\nprogram = \"self-check\"\n");

        let report = Pipeline::new(descriptor.clone(), ctx.clone(), CancellationToken::new())
            .run(vec![])
            .await;
        assert!(report.is_complete(), "status: {:?}", report.status);

        Pipeline::new(descriptor, ctx, CancellationToken::new())
            .test_installed()
            .await
            .unwrap();
        let self_checks = runner
            .programs()
            .iter()
            .filter(|p| *p == "self-check")
            .count();
        assert_eq!(self_checks, 2);
    }

    #[tokio::test]
    async fn test_installed_requires_a_receipt() {
        let home = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default();
        let ctx = test_context(home.path(), map_fetcher(&[]), runner.clone());
        let descriptor = archive_descriptor("\n[test]\nprogram = \"self-check\"\n");

        let (stage, error) = Pipeline::new(descriptor, ctx, CancellationToken::new())
            .test_installed()
            .await
            .unwrap_err();
        assert_eq!(stage, Stage::Testing);
        assert!(matches!(error, StageError::Io(_)));
        assert!(runner.programs().is_empty());
    }

    #[tokio::test]
    async fn cancellation_is_terminal() {
        let home = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default();
        let fetcher = map_fetcher(&[("https://example.com/pkg-1.0.tar.gz", sample_tar_gz())]);
        let ctx = test_context(home.path(), fetcher, runner.clone());
        let descriptor = archive_descriptor("");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = Pipeline::new(descriptor, ctx, cancel).run(vec![]).await;
        match report.status {
            PipelineStatus::Failed { stage, error } => {
                assert_eq!(stage, Stage::Pending);
                assert!(matches!(error, StageError::Cancelled));
            }
            other => panic!("unexpected status: {other:?}"),
        }
        assert!(runner.programs().is_empty());
    }
}
