//! poolctl
//!
//! Command-line front end for the account pools:
//! 1. Loads service config and discovers pool definitions
//! 2. Opens the account store when one is configured
//! 3. Runs one command against the manager and prints JSON
//! 4. Closes every pool it opened

mod config;
mod metrics;

use std::path::PathBuf;

use account_pool::{Backends, CancellationToken, PoolManager};
use account_store::{AccountStore, ManagedStorage};
use anyhow::{Context, Result, bail};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, StoreConfig};

const USAGE: &str = "usage: poolctl [--config PATH] [--metrics] <command>

commands:
  list              list pool definitions
  show NAME         print a pool definition
  stats NAME        open a pool and print its stats
  refresh NAME      open a pool, re-run discovery and print its stats
  test NAME         dry-run a pool definition without caching it
  checkout NAME     check out one account, print it and return it";

#[derive(Debug, PartialEq)]
enum Command {
    List,
    Show(String),
    Stats(String),
    Refresh(String),
    Test(String),
    Checkout(String),
}

#[derive(Debug, PartialEq)]
struct Cli {
    config: Option<String>,
    metrics: bool,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut config = None;
    let mut metrics = false;
    let mut positional = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().context("--config needs a path")?;
                config = Some(path.clone());
            }
            "--metrics" => metrics = true,
            flag if flag.starts_with("--") => bail!("unknown flag {flag}\n\n{USAGE}"),
            _ => positional.push(arg.clone()),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("list") => Command::List,
        Some(verb @ ("show" | "stats" | "refresh" | "test" | "checkout")) => {
            let name = positional
                .next()
                .with_context(|| format!("{verb} needs a pool name\n\n{USAGE}"))?;
            match verb {
                "show" => Command::Show(name),
                "stats" => Command::Stats(name),
                "refresh" => Command::Refresh(name),
                "test" => Command::Test(name),
                _ => Command::Checkout(name),
            }
        }
        Some(other) => bail!("unknown command {other}\n\n{USAGE}"),
        None => bail!("{USAGE}"),
    };
    if let Some(extra) = positional.next() {
        bail!("unexpected argument {extra}\n\n{USAGE}");
    }

    Ok(Cli {
        config,
        metrics,
        command,
    })
}

async fn open_backends(store: &StoreConfig) -> Result<Option<Backends>> {
    let Some(database) = &store.database else {
        return Ok(None);
    };
    let storage_dir: PathBuf = store
        .storage_dir
        .clone()
        .context("storage_dir is required when a database is configured")?;

    let account_store = AccountStore::connect(database)
        .await
        .with_context(|| format!("failed to open account store {}", database.display()))?;
    account_store
        .ensure_schema()
        .await
        .context("failed to prepare account store schema")?;

    Ok(Some(
        Backends::new(account_store, ManagedStorage::new(storage_dir))
            .with_query_timeout(store.query_timeout()),
    ))
}

async fn run(manager: &PoolManager, command: Command) -> Result<serde_json::Value> {
    let output = match command {
        Command::List => {
            let mut pools = Vec::new();
            for name in manager.list_pools().await {
                let definition = manager.definition(&name).await?;
                pools.push(json!({ "name": name, "type": definition.kind.label() }));
            }
            json!(pools)
        }
        Command::Show(name) => {
            let definition = manager.definition(&name).await?;
            json!({
                "name": name,
                "type": definition.kind.label(),
                "definition": definition.to_toml()?,
            })
        }
        Command::Stats(name) => {
            let pool = manager.get_pool(&name).await?;
            serde_json::to_value(pool.stats().await)?
        }
        Command::Refresh(name) => {
            let pool = manager.get_pool(&name).await?;
            pool.refresh().await?;
            serde_json::to_value(pool.stats().await)?
        }
        Command::Test(name) => {
            let definition = manager.definition(&name).await?;
            serde_json::to_value(manager.test_pool(&definition).await?)?
        }
        Command::Checkout(name) => {
            let pool = manager.get_pool(&name).await?;

            let cancel = CancellationToken::new();
            let interrupt = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                })
            };
            let checked_out = pool.get_next(1, &cancel).await;
            interrupt.abort();

            let account = checked_out?;
            pool.return_account(&account.id).await?;
            serde_json::to_value(&account)?
        }
    };
    Ok(output)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs on stderr; stdout carries command output
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_args(&args)?;

    // Install before any pool emits metrics
    let prometheus = if cli.metrics {
        Some(metrics::install_recorder()?)
    } else {
        None
    };

    let config_path = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let backends = open_backends(&config.store).await?;
    info!(
        definitions_dir = %config.pools.definitions_dir.display(),
        store = backends.is_some(),
        "configuration loaded"
    );

    let manager = PoolManager::new(&config.pools.definitions_dir, backends);
    manager
        .discover_pools()
        .await
        .context("failed to discover pool definitions")?;

    let result = run(&manager, cli.command).await;
    manager.close_all().await?;
    let output = result?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    if let Some(handle) = prometheus {
        print!("{}", handle.render());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_pool::{FilePoolConfig, PoolConfig, PoolDefinition, PoolKind};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_flags_and_commands() {
        let cli = parse_args(&args(&["--config", "/etc/p.toml", "--metrics", "stats", "main"])).unwrap();
        assert_eq!(
            cli,
            Cli {
                config: Some("/etc/p.toml".into()),
                metrics: true,
                command: Command::Stats("main".into()),
            }
        );

        let cli = parse_args(&args(&["list"])).unwrap();
        assert_eq!(cli.command, Command::List);
        assert!(!cli.metrics);
        assert_eq!(cli.config, None);

        let cli = parse_args(&args(&["checkout", "main", "--metrics"])).unwrap();
        assert_eq!(cli.command, Command::Checkout("main".into()));
        assert!(cli.metrics);
    }

    #[test]
    fn rejects_bad_invocations() {
        for bad in [
            vec![],
            vec!["stats"],
            vec!["fly", "main"],
            vec!["list", "extra"],
            vec!["--config"],
            vec!["--verbose", "list"],
        ] {
            assert!(parse_args(&args(&bad)).is_err(), "{bad:?} should fail");
        }
    }

    #[tokio::test]
    async fn no_database_means_no_backends() {
        let store = StoreConfig::default();
        assert!(open_backends(&store).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn database_opens_backends() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreConfig {
            database: Some(dir.path().join("accounts.db")),
            storage_dir: Some(dir.path().join("storage")),
            query_timeout_secs: 7,
        };
        let backends = open_backends(&store).await.unwrap().unwrap();
        assert_eq!(backends.query_timeout, std::time::Duration::from_secs(7));
        assert!(dir.path().join("accounts.db").exists());
    }

    #[tokio::test]
    async fn commands_against_a_file_pool() {
        let dir = tempfile::tempdir().unwrap();
        let accounts = dir.path().join("accounts");
        tokio::fs::create_dir_all(&accounts).await.unwrap();
        tokio::fs::write(accounts.join("acct1.xml"), b"<map/>").await.unwrap();
        tokio::fs::write(accounts.join("acct2.xml"), b"<map/>").await.unwrap();

        let manager = PoolManager::new(dir.path().join("pools"), None);
        manager
            .create_pool(PoolDefinition::new(
                "main",
                PoolKind::File(FilePoolConfig {
                    directory: accounts,
                    config: PoolConfig::default(),
                }),
            ))
            .await
            .unwrap();

        let listed = run(&manager, Command::List).await.unwrap();
        assert_eq!(listed, json!([{ "name": "main", "type": "file" }]));

        let stats = run(&manager, Command::Stats("main".into())).await.unwrap();
        assert_eq!(stats["total"], 2);
        assert_eq!(stats["available"], 2);

        let account = run(&manager, Command::Checkout("main".into())).await.unwrap();
        assert_eq!(account["status"], "in_use");
        let stats = run(&manager, Command::Refresh("main".into())).await.unwrap();
        assert_eq!(stats["available"], 2, "checkout returns the account");

        let report = run(&manager, Command::Test("main".into())).await.unwrap();
        assert_eq!(report["stats"]["total"], 2);

        let shown = run(&manager, Command::Show("main".into())).await.unwrap();
        assert!(shown["definition"].as_str().unwrap().contains("type = \"file\""));

        assert!(run(&manager, Command::Stats("missing".into())).await.is_err());
        manager.close_all().await.unwrap();
    }
}
