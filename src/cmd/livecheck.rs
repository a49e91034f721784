//! `keg livecheck` - poll upstreams for newer versions.
//!
//! Runs outside the install path; a failing probe never affects any
//! install, but the exit code reflects the first failure kind.

use std::path::Path;

use crate::core::version::is_newer;
use crate::io::fetch::UrlFetcher;
use crate::ops::error::exit_code;
use crate::ops::livecheck;
use crate::ops::orchestrator::DescriptorSet;
use crate::types::PackageName;
use crate::ui::Reporter;

pub async fn livecheck(reporter: &dyn Reporter, packages: &[String], dir: &Path) -> u8 {
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

    let requested: Vec<PackageName> = packages.iter().map(|p| PackageName::new(p)).collect();
    let mut code = exit_code::SUCCESS;
    let mut checked = 0usize;

    for descriptor in set.iter() {
        if !requested.is_empty() && !requested.contains(descriptor.name()) {
            continue;
        }
        let Some(spec) = descriptor.livecheck() else {
            if !requested.is_empty() {
                reporter.warning(&format!("{}: no livecheck block", descriptor.name()));
            }
            continue;
        };
        checked += 1;

        match livecheck::check(spec, &fetcher).await {
            Ok(latest) => {
                let current = descriptor.version();
                if is_newer(current, &latest) {
                    reporter.info(&format!(
                        "{}: {current} -> {latest} (newer upstream)",
                        descriptor.name()
                    ));
                } else {
                    reporter.info(&format!("{}: {current} is up to date", descriptor.name()));
                }
            }
            Err(e) => {
                reporter.warning(&format!("{}: {e}", descriptor.name()));
                if code == exit_code::SUCCESS {
                    code = e.exit_code();
                }
            }
        }
    }

    if checked == 0 {
        reporter.info("no packages with a livecheck block");
    }
    code
}
