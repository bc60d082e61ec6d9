//! Glacis gateway entry point.
//!
//! `serve` runs the proxy core: per-proxy-IP SSH and RDP listeners, the
//! policy engine, the session registry, the expiry ticker and the
//! transcode worker pool. The remaining verbs are one-shot operations
//! against the policy store.

mod cli;
mod config;
mod duration;
mod hostkey;
mod serve;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use glacis_core::Store;
use tracing::{error, info};

use crate::cli::{Cli, Command};
use crate::config::Config;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to create runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(cli::exit_code_for(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve => {
            info!("glacis starting");
            serve::serve(config).await
        }
        Command::Bind { proxy_ip, backend } => {
            let store = ops_store(&config)?;
            cli::bind(&store, proxy_ip, backend).await
        }
        Command::Unbind { proxy_ip } => {
            let store = ops_store(&config)?;
            cli::unbind(&store, proxy_ip).await
        }
        Command::Grant(args) => {
            cli::validate_grant_args(&args)?;
            let store = ops_store(&config)?;
            cli::grant(&store, args).await
        }
        Command::Revoke { policy_id } => {
            let store = ops_store(&config)?;
            cli::revoke(&store, policy_id).await
        }
        Command::Stays { active } => {
            let store = ops_store(&config)?;
            cli::stays(&store, active).await
        }
    }
}

/// One-connection pool for the one-shot verbs.
fn ops_store(config: &Config) -> Result<Store> {
    let pool = glacis_store::db::create_pool_sized(&config.db_url, 1)?;
    Ok(Store::new(pool))
}
