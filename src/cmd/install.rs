//! `keg install` - resolve, build and install packages.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::Layout;
use crate::core::platform::PlatformFacts;
use crate::io::command::ProcessRunner;
use crate::io::fetch::{MirrorPolicy, UrlFetcher};
use crate::ops::error::exit_code;
use crate::ops::orchestrator::{DescriptorSet, Orchestrator};
use crate::ops::pipeline::{PipelineContext, PipelineStatus};
use crate::types::PackageName;
use crate::ui::Reporter;

#[allow(clippy::too_many_arguments)]
pub async fn install(
    reporter: &dyn Reporter,
    packages: &[String],
    dir: &Path,
    layout: Layout,
    dry_run: bool,
    race_mirrors: bool,
    jobs: Option<usize>,
) -> u8 {
    let set = match DescriptorSet::load_dir(dir) {
        Ok(set) => set,
        Err(e) => {
            reporter.error(&e.to_string());
            return crate::ops::InstallError::from(e).exit_code();
        }
    };

    let fetcher = match UrlFetcher::new() {
        Ok(fetcher) => fetcher,
        Err(e) => {
            reporter.error(&e.to_string());
            return exit_code::GENERIC;
        }
    };

    let ctx = Arc::new(PipelineContext {
        fetcher: Arc::new(fetcher),
        runner: Arc::new(ProcessRunner),
        layout,
        facts: PlatformFacts::host(),
        mirror_policy: if race_mirrors {
            MirrorPolicy::Race
        } else {
            MirrorPolicy::Sequential
        },
        jobs: jobs.unwrap_or_else(num_cpus::get),
    });
    let orchestrator = Orchestrator::new(set, ctx);

    let roots: Vec<PackageName> = packages.iter().map(|p| PackageName::new(p)).collect();

    if dry_run {
        return match orchestrator.plan(&roots) {
            Ok(plan) => {
                reporter.info("install plan:");
                for name in &plan {
                    if let Some(d) = orchestrator.descriptors().get(name) {
                        reporter.info(&format!("  {} {}", d.name(), d.version()));
                    }
                }
                exit_code::SUCCESS
            }
            Err(e) => {
                reporter.error(&e.to_string());
                e.exit_code()
            }
        };
    }

    // Ctrl-C cancels in-flight pipelines; active build commands are
    // killed and their packages report as cancelled.
    let cancel = CancellationToken::new();
    let ctrlc = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            ctrlc.cancel();
        }
    });

    let start = Instant::now();
    let report = match orchestrator.install(&roots, &cancel).await {
        Ok(report) => report,
        Err(e) => {
            reporter.error(&e.to_string());
            return e.exit_code();
        }
    };

    let mut installed = 0usize;
    for item in &report.reports {
        match &item.status {
            PipelineStatus::Complete { already_installed } => {
                let detail = if *already_installed {
                    "already installed"
                } else {
                    installed += 1;
                    "installed"
                };
                reporter.done(&item.name, &item.version, detail);
                if !*already_installed {
                    if let Some(d) = orchestrator.descriptors().get(&item.name) {
                        let hint = &d.hints().post_install;
                        if !hint.is_empty() {
                            reporter.info(hint);
                        }
                    }
                }
            }
            PipelineStatus::Failed { stage, error } => {
                reporter.failed(&item.name, &item.version, &format!("[{stage}] {error}"));
            }
        }
    }
    if installed > 0 {
        reporter.summary(installed, "installed", start.elapsed().as_secs_f64());
    }

    report.exit_code()
}
