mod api;
mod conflicts;
mod config;
mod daemon;
mod engine;
mod hash;
mod logging;
mod scan;
mod state;
mod telemetry;
mod uploader;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{Config, ConfigOverrides};
use engine::SyncEngine;

#[derive(Parser, Debug)]
#[command(name = "wpdrive", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a `.wpdrive/config.json` under `--root` and validate it against
    /// the target WordPress site.
    Init {
        /// Directory to sync (defaults to the current directory)
        #[arg(long = "root")]
        root: Option<PathBuf>,

        /// Base URL of the WordPress site, e.g. https://example.com
        #[arg(long = "url")]
        url: String,

        /// WordPress username
        #[arg(long = "user")]
        user: String,

        /// WordPress application password
        #[arg(long = "app-password")]
        app_password: String,

        /// Upload chunk size in MiB
        #[arg(long = "chunk-size-mb")]
        chunk_size_mb: Option<u64>,
    },

    /// Run one pull-then-push reconciliation cycle.
    Sync {
        /// Directory to sync (defaults to walking up from the current directory)
        #[arg(long = "root")]
        root: Option<PathBuf>,
    },

    /// Run reconciliation cycles forever, sleeping `--interval` between them.
    Daemon {
        /// Directory to sync (defaults to walking up from the current directory)
        #[arg(long = "root")]
        root: Option<PathBuf>,

        /// Seconds between cycles (floored at 3)
        #[arg(long = "interval", default_value_t = 10)]
        interval: u64,
    },
}

/// Distinct from other failures so `main` can map it to exit code 2.
struct ConfigNotFound(PathBuf);

impl std::fmt::Display for ConfigNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "no .wpdrive/config.json found in {} or any parent; run `wpdrive init` first",
            self.0.display()
        )
    }
}

impl std::fmt::Debug for ConfigNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for ConfigNotFound {}

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Init {
            root,
            url,
            user,
            app_password,
            chunk_size_mb,
        } => run_init(root, url, user, app_password, chunk_size_mb),
        Commands::Sync { root } => run_sync(root),
        Commands::Daemon { root, interval } => run_daemon(root, interval),
    };

    if let Err(err) = result {
        eprintln!("wpdrive: {err:#}");
        let code = if err.downcast_ref::<ConfigNotFound>().is_some() {
            2
        } else {
            1
        };
        std::process::exit(code);
    }
}

fn resolve_root(explicit: Option<PathBuf>) -> Result<PathBuf> {
    explicit
        .map(Ok)
        .unwrap_or_else(|| std::env::current_dir().context("determine current directory"))
}

fn run_init(
    root: Option<PathBuf>,
    url: String,
    user: String,
    app_password: String,
    chunk_size_mb: Option<u64>,
) -> Result<()> {
    let root = resolve_root(root)?;
    std::fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;
    let config_path = root.join(config::CONTROL_DIR_NAME).join("config.json");

    let mut cfg = Config::init(&config_path, &root, &url, &user, &app_password)?;
    if let Some(mb) = chunk_size_mb {
        cfg.chunk_size_mb = mb;
        cfg.save()?;
    }

    println!("wrote {}", config_path.display());
    Ok(())
}

fn load_config(root: Option<PathBuf>) -> Result<Config> {
    let start_dir = resolve_root(root.clone())?;
    let config_path = match root {
        Some(r) => r.join(config::CONTROL_DIR_NAME).join("config.json"),
        None => Config::find_config(&start_dir).ok_or_else(|| ConfigNotFound(start_dir.clone()))?,
    };
    Config::load_with_overrides(&config_path, ConfigOverrides::default())
}

fn run_sync(root: Option<PathBuf>) -> Result<()> {
    let cfg = load_config(root)?;
    crate::logging::init_log_file(&cfg.log_file_path())?;
    let engine = SyncEngine::new(&cfg)?;
    engine.sync_once()
}

fn run_daemon(root: Option<PathBuf>, interval: u64) -> Result<()> {
    let cfg = load_config(root)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(async move {
        let shutdown = std::sync::Arc::new(tokio::sync::Notify::new());
        let shutdown_signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown_signal.notify_waiters();
            }
        });
        daemon::run(cfg, Duration::from_secs(interval), shutdown).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_cli_parses_required_flags() {
        let cli = Cli::try_parse_from([
            "wpdrive",
            "init",
            "--url",
            "https://example.com",
            "--user",
            "alice",
            "--app-password",
            "secret",
        ])
        .unwrap();
        match cli.command {
            Commands::Init { url, user, app_password, .. } => {
                assert_eq!(url, "https://example.com");
                assert_eq!(user, "alice");
                assert_eq!(app_password, "secret");
            }
            _ => panic!("expected init command"),
        }
    }

    #[test]
    fn daemon_cli_defaults_interval_to_ten_seconds() {
        let cli = Cli::try_parse_from(["wpdrive", "daemon"]).unwrap();
        match cli.command {
            Commands::Daemon { interval, .. } => assert_eq!(interval, 10),
            _ => panic!("expected daemon command"),
        }
    }

    #[test]
    fn sync_cli_accepts_explicit_root() {
        let cli = Cli::try_parse_from(["wpdrive", "sync", "--root", "/tmp/site"]).unwrap();
        match cli.command {
            Commands::Sync { root } => assert_eq!(root, Some(PathBuf::from("/tmp/site"))),
            _ => panic!("expected sync command"),
        }
    }
}
