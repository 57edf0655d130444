//! dirwatch - print debounced directory changes as JSON lines

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dirwatch::{Backend, DirectoryWatcher, WatchResult, WatcherConfig};
use tracing::{info, warn};

mod logging;

/// Watch directory trees and print one JSON line per change
#[derive(Parser, Debug)]
#[command(name = "dirwatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directories to watch
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Quiescence window in milliseconds
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Poll the filesystem instead of using native notifications
    #[arg(long)]
    poll: bool,

    /// Poll interval in milliseconds (with --poll)
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Glob pattern to ignore (repeatable)
    #[arg(long = "exclude", value_name = "PATTERN")]
    excludes: Vec<String>,

    /// Log the watched paths every N seconds (0 disables)
    #[arg(long, default_value = "1")]
    list_interval_secs: u64,
}

impl Cli {
    fn watcher_config(&self) -> Result<WatcherConfig> {
        let mut config = match &self.config {
            Some(path) => WatcherConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => WatcherConfig::default(),
        };

        if let Some(ms) = self.debounce_ms {
            config = config.with_debounce_ms(ms);
        }
        if self.poll {
            config = config.with_backend(Backend::Poll);
        }
        if let Some(ms) = self.poll_interval_ms {
            config = config.with_poll_interval_ms(ms);
        }
        for pattern in &self.excludes {
            config = config.exclude(pattern.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

fn print_event(root: &str, json: &str) -> Result<()> {
    let event: serde_json::Value = serde_json::from_str(json)?;
    let line = serde_json::json!({ "root": root, "event": event });

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let cli = Cli::parse();
    let config = cli.watcher_config()?;
    let watcher = DirectoryWatcher::with_config(print_event, config)?;

    for path in &cli.paths {
        match watcher.watch(path).await {
            Ok(WatchResult::Watching) => {}
            Ok(WatchResult::AlreadyWatching) => info!("{} listed twice", path.display()),
            Err(e) => warn!("Skipping {}: {e}", path.display()),
        }
    }

    if watcher.watched_paths().await.is_empty() {
        watcher.close().await;
        anyhow::bail!("nothing to watch");
    }

    let mut listing = (cli.list_interval_secs > 0)
        .then(|| tokio::time::interval(Duration::from_secs(cli.list_interval_secs)));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("failed to listen for Ctrl-C")?;
                break;
            }
            _ = async {
                match listing.as_mut() {
                    Some(interval) => interval.tick().await,
                    None => std::future::pending().await,
                }
            } => {
                let paths = watcher.watched_paths().await;
                info!("Watching {}", serde_json::to_string(&paths)?);
            }
        }
    }

    info!("Shutting down");
    watcher.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "dirwatch",
            "--debounce-ms",
            "250",
            "--poll",
            "--exclude",
            "*.tmp",
            "--exclude",
            "**/target/**",
            "/tmp/a",
        ]);

        let config = cli.watcher_config().unwrap();
        assert_eq!(config.debounce_ms, 250);
        assert_eq!(config.backend, Backend::Poll);
        assert_eq!(
            config.exclude_patterns,
            vec!["*.tmp".to_string(), "**/target/**".to_string()]
        );
        assert_eq!(cli.paths, vec![PathBuf::from("/tmp/a")]);
    }

    #[test]
    fn test_rejects_zero_debounce() {
        let cli = Cli::parse_from(["dirwatch", "--debounce-ms", "0", "/tmp/a"]);
        assert!(cli.watcher_config().is_err());
    }

    #[test]
    fn test_paths_are_required() {
        assert!(Cli::try_parse_from(["dirwatch"]).is_err());
    }
}
