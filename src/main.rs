// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::Result;
use clap::{Parser, Subcommand};
use kube::Client;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use driftwood::commands::{self, CommandOutcome, SyncRequest};
use driftwood::config::Config;
use driftwood::kubernetes::wait_for_application_crd;
use driftwood::reconcilers::ApplicationReconciler;
use driftwood::source::{GitSource, SourceTracker};
use driftwood::sync::SyncManager;

#[derive(Parser)]
#[command(name = "driftwood", version)]
#[command(about = "Reconciles Kubernetes clusters toward manifests kept in Git")]
struct Cli {
    /// Namespace holding Application resources and cluster secrets
    #[arg(long, global = true, env = "APPLICATION_NAMESPACE")]
    namespace: Option<String>,
    /// Directory for repository mirrors and checkouts
    #[arg(long, global = true, env = "REPO_CACHE_DIR")]
    repo_cache_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the operator until terminated
    Run,
    /// Show the sync and health status of an Application
    Get {
        name: String,
        /// Compare against Git and the cluster instead of reading the recorded status
        #[arg(long)]
        refresh: bool,
    },
    /// Sync an Application now
    Sync {
        name: String,
        /// Delete live resources that are no longer in Git
        #[arg(long)]
        prune: bool,
        /// Validate every change with the API server without persisting it
        #[arg(long)]
        dry_run: bool,
        /// Sync even if another sync is recorded as running
        #[arg(long)]
        force: bool,
        /// Wait until the Application is healthy
        #[arg(long)]
        wait: bool,
        /// Seconds to wait for health with --wait
        #[arg(long, default_value_t = 300, env = "SYNC_WAIT_TIMEOUT_SECS")]
        timeout: u64,
    },
    /// Delete an Application
    Delete {
        name: String,
        /// Also delete the resources it manages
        #[arg(long)]
        cascade: bool,
    },
    /// Print the Application CustomResourceDefinition
    Crd,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so command output stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match execute(cli).await {
        Ok(outcome) => {
            print!("{}", outcome.summary);
            if outcome.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<CommandOutcome> {
    let mut config = Config::from_env()?;
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    if let Some(dir) = cli.repo_cache_dir {
        config.repo_cache_dir = dir;
    }

    if let Commands::Crd = cli.command {
        return commands::crd();
    }

    let client = Client::try_default().await?;

    match cli.command {
        Commands::Run => {
            run_operator(client, config).await?;
            Ok(CommandOutcome {
                summary: String::new(),
                success: true,
            })
        }
        Commands::Get { name, refresh } => commands::get(&client, &config, &name, refresh).await,
        Commands::Sync {
            name,
            prune,
            dry_run,
            force,
            wait,
            timeout,
        } => {
            let request = SyncRequest {
                prune,
                dry_run,
                force,
                wait,
                timeout: Duration::from_secs(timeout),
            };
            commands::sync_application(&client, &config, &name, &request).await
        }
        Commands::Delete { name, cascade } => {
            commands::delete_application(&client, &config, &name, cascade).await
        }
        Commands::Crd => commands::crd(),
    }
}

async fn run_operator(client: Client, config: Config) -> Result<()> {
    info!("Starting Driftwood operator");
    info!(
        "Configuration loaded: namespace={}, repo_cache_dir={}",
        config.namespace,
        config.repo_cache_dir.display()
    );

    // Wait for the Application CRD before starting the reconciler
    info!("Waiting for Application CRD to become available...");
    wait_for_application_crd(&client).await?;

    let git = Arc::new(
        GitSource::new(&config.repo_cache_dir, config.git_timeout)
            .with_retained_checkouts(config.retained_checkouts),
    );

    // The manager receives events from both the reconciler and the tracker
    let (sync_manager, sync_handle) = SyncManager::new(client.clone(), config.clone(), git.clone());
    let (source_tracker, tracker_handle) =
        SourceTracker::new(git, config.git_poll_interval, sync_handle.clone());
    let sync_manager = sync_manager.with_tracker(tracker_handle);

    let application_reconciler =
        ApplicationReconciler::new(client.clone(), &config.namespace, sync_handle);

    info!("Starting reconciler...");

    tokio::try_join!(
        sync_manager.run(),
        source_tracker.run(),
        application_reconciler.run()
    )?;

    // This should never be reached as the reconciler runs forever
    warn!("Reconciler stopped unexpectedly");
    Ok(())
}
