use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};

use bundlefix::commands;
use bundlefix::fix::DEFAULT_ATTEMPTS;
use bundlefix::manager::apt::AptManager;

/// bundlefix - offline package bundle repair
///
/// Checks whether every package in an offline bundle tarball can be
/// installed on this machine, and repairs the bundle when one cannot:
/// missing dependencies are backfilled from packages already in the bundle,
/// and packages that do not require an exact version are replaced with the
/// latest installable one.
#[derive(Parser, Debug)]
#[command(author, version = env!("BUNDLEFIX_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Repair a bundle so its packages install without network access
    Repair(RepairArgs),

    /// Print the dependency tree of a bundle
    Show(ShowArgs),
}

#[derive(clap::Args, Debug)]
pub struct RepairArgs {
    /// Path to the bundle tarball (.tar.gz)
    #[arg(value_name = "BUNDLE")]
    pub bundle: PathBuf,

    /// Where to write the repaired bundle (defaults to repaired-<BUNDLE>)
    #[arg(long = "output", short = 'o', value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Maximum number of simulate/repair cycles per package
    #[arg(long = "attempts", value_name = "N", default_value_t = DEFAULT_ATTEMPTS)]
    pub attempts: u32,
}

#[derive(clap::Args, Debug)]
pub struct ShowArgs {
    /// Path to the bundle tarball (.tar.gz)
    #[arg(value_name = "BUNDLE")]
    pub bundle: PathBuf,
}

fn default_output(bundle: &Path) -> PathBuf {
    let file_name = bundle
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bundle.tar.gz".to_string());
    bundle.with_file_name(format!("repaired-{file_name}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Repair(args) => {
            let manager = AptManager::new()?;
            let output = args
                .output
                .unwrap_or_else(|| default_output(&args.bundle));
            commands::repair(&manager, &args.bundle, &output, args.attempts).await?
        }
        Commands::Show(args) => {
            let manager = AptManager::new()?;
            commands::show(&manager, &args.bundle)?
        }
    }
    Ok(())
}
