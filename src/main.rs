use clap::Parser;
use log::warn;
use pkgenv::cleanup::{self, SharedCleanupContext};
use pkgenv::http::HttpClient;
use pkgenv::runtime::RealRuntime;
use pkgenv::{Config, ConfigOverrides, InstallError, Installer, Manifest};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// pkgenv - isolated environment installer
///
/// Installs a package and its pinned dependencies into a dedicated
/// environment, links its entry points onto the search path and verifies
/// the result.
///
/// Examples:
///   pkgenv install respec-ai.json   # Install from a manifest
///   pkgenv status respec-ai         # Show the install record
///   pkgenv uninstall respec-ai      # Remove the environment and its links
#[derive(Parser, Debug)]
#[command(author, version = env!("PKGENV_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding one environment per package (also via PKGENV_ROOT)
    #[arg(
        long = "root",
        short = 'r',
        env = "PKGENV_ROOT",
        value_name = "PATH",
        global = true
    )]
    pub install_root: Option<PathBuf>,

    /// Directory that receives entry point links (also via PKGENV_LINK_DIR)
    #[arg(long, env = "PKGENV_LINK_DIR", value_name = "PATH", global = true)]
    pub link_dir: Option<PathBuf>,

    /// Shared artifact cache (also via PKGENV_CACHE_DIR)
    #[arg(long, env = "PKGENV_CACHE_DIR", value_name = "PATH", global = true)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Install a package from a manifest
    Install(InstallArgs),

    /// Remove an environment and the links it owns
    Uninstall(NameArgs),

    /// Show the install record of an environment
    Status(NameArgs),
}

#[derive(clap::Args, Debug)]
pub struct InstallArgs {
    /// Path to the JSON manifest
    #[arg(value_name = "MANIFEST")]
    pub manifest: PathBuf,

    /// Use this interpreter instead of searching PATH
    #[arg(long, value_name = "PATH")]
    pub interpreter: Option<PathBuf>,

    /// Maximum concurrent fetches and install steps
    #[arg(long, short = 'j', value_name = "N")]
    pub jobs: Option<usize>,

    /// Download attempts per artifact
    #[arg(long, value_name = "N")]
    pub retries: Option<usize>,

    /// Seconds the entry point may take to report its version
    #[arg(long, value_name = "SECS")]
    pub verify_timeout: Option<u64>,

    /// Seconds a download may spend connecting or waiting for data
    #[arg(long, value_name = "SECS")]
    pub fetch_timeout: Option<u64>,
}

#[derive(clap::Args, Debug)]
pub struct NameArgs {
    /// Package name
    #[arg(value_name = "NAME")]
    pub name: String,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides {
            install_root: self.install_root.clone(),
            link_dir: self.link_dir.clone(),
            cache_dir: self.cache_dir.clone(),
            ..Default::default()
        };
        if let Commands::Install(args) = &self.command {
            overrides.interpreter = args.interpreter.clone();
            overrides.jobs = args.jobs;
            overrides.retries = args.retries;
            overrides.verify_timeout = args.verify_timeout.map(Duration::from_secs);
            overrides.fetch_timeout = args.fetch_timeout.map(Duration::from_secs);
        }
        overrides
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let cleanup_ctx = cleanup::new_shared();
    let ctrl_c_handler = tokio::spawn(handle_interrupts(cancel.clone(), cleanup_ctx.clone()));

    let result = run(cli, cancel, cleanup_ctx.clone()).await;
    ctrl_c_handler.abort();

    let code = match result {
        Ok(()) => 0,
        Err(e) => {
            cleanup::lock(&cleanup_ctx).cleanup();
            eprintln!("error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

/// The first interrupt lets running steps finish and records the
/// cancellation; a second one removes partial files and exits at once.
async fn handle_interrupts(cancel: CancellationToken, cleanup_ctx: SharedCleanupContext) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    eprintln!("\nInterrupted, finishing the current step (press Ctrl-C again to abort)...");
    cancel.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        eprintln!("\nAborting, cleaning up...");
        cleanup::lock(&cleanup_ctx).cleanup();
        std::process::exit(130);
    }
}

async fn run(
    cli: Cli,
    cancel: CancellationToken,
    cleanup_ctx: SharedCleanupContext,
) -> Result<(), InstallError> {
    let runtime = RealRuntime;
    let config = Config::resolve(&runtime, cli.overrides())?;
    let http = HttpClient::build(config.retry, config.fetch_timeout)?;
    let installer = Installer::new(&runtime, config, http)
        .with_cancellation(cancel)
        .with_cleanup(cleanup_ctx);

    match cli.command {
        Commands::Install(args) => {
            let manifest = Manifest::load(&runtime, &args.manifest)?;
            println!(
                "Installing {} {} into {:?}",
                manifest.package.name,
                manifest.package.version,
                installer.config().env_root(&manifest.package.name)
            );
            let outcome = installer.install(&manifest).await?;
            for name in &outcome.skipped {
                println!("  {} already installed", name);
            }
            for name in &outcome.installed {
                println!("  installed {}", name);
            }
            for link in &outcome.links {
                println!("  linked {}", link.display());
            }
            println!("Verified: {}", outcome.version_output);
        }
        Commands::Uninstall(args) => {
            let removed = installer.uninstall(&args.name).await?;
            for link in &removed {
                println!("  unlinked {}", link.display());
            }
            println!("Uninstalled {}", args.name);
        }
        Commands::Status(args) => match installer.status(&args.name)? {
            Some(record) => {
                println!("{} {}", record.package, record.version);
                println!("  state: {}", record.state);
                println!("  verified: {}", record.verified);
                for entry in &record.entries {
                    println!("  package: {} {} ({})", entry.name, entry.version, entry.hash.short());
                }
                for link in &record.links {
                    println!("  link: {}", link.display());
                }
                if let Some(error) = &record.last_error {
                    println!("  last error: {}", error);
                }
            }
            None => {
                warn!("No install record for {}", args.name);
                println!("{} is not installed", args.name);
            }
        },
    }
    Ok(())
}
