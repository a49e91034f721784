//! keg - a declarative package build pipeline CLI

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use keg::Layout;
use keg::cmd;
use keg::ops::error::exit_code;
use keg::ui::{Console, Reporter};

#[derive(Parser)]
#[command(name = "keg")]
#[command(version, about = "keg - a declarative package build pipeline")]
struct Cli {
    /// Descriptor directory
    #[arg(long, global = true, env = "KEG_DIR", default_value = "packages")]
    dir: PathBuf,

    /// keg home (store, staging, logs); defaults to ~/.keg
    #[arg(long, global = true, env = "KEG_HOME")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve, build and install packages
    Install {
        /// Package name(s)
        #[arg(required = true)]
        packages: Vec<String>,
        /// Print the install plan without executing it
        #[arg(long)]
        dry_run: bool,
        /// Race mirrors instead of trying them sequentially
        #[arg(long)]
        race_mirrors: bool,
        /// Parallel jobs passed to build commands (default: CPU count)
        #[arg(long)]
        jobs: Option<usize>,
    },
    /// Poll upstreams for newer versions
    Livecheck {
        /// Package name(s); all descriptors with a livecheck block if empty
        packages: Vec<String>,
    },
    /// Run the test stage for an already-installed package
    Test {
        /// Package name
        package: String,
    },
    /// Validate a descriptor file
    Check {
        /// Descriptor file to check
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let reporter = Console;

    let layout = match cli.home.map(Layout::at).or_else(Layout::discover) {
        Some(layout) => layout,
        None => {
            reporter.error("could not determine keg home; set KEG_HOME or --home");
            return ExitCode::from(exit_code::GENERIC);
        }
    };

    let code = match cli.command {
        Commands::Install {
            packages,
            dry_run,
            race_mirrors,
            jobs,
        } => {
            cmd::install::install(
                &reporter,
                &packages,
                &cli.dir,
                layout,
                dry_run,
                race_mirrors,
                jobs,
            )
            .await
        }
        Commands::Livecheck { packages } => {
            cmd::livecheck::livecheck(&reporter, &packages, &cli.dir).await
        }
        Commands::Test { package } => cmd::test::test(&reporter, &package, &cli.dir, layout).await,
        Commands::Check { path } => cmd::check::check(&reporter, &path),
    };

    ExitCode::from(code)
}
