//! Detached-job service
//!
//! Runs on a provisioned VM, accepts code payloads over HTTP and executes
//! them under redirected I/O. Started by cloud-init on detached-service VMs.

use clap::Parser;
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use tracing::{info, warn};

mod config;
mod identity;
mod shutdown;

use azure_rest::{AzureClient, RetryPolicy, StaticTokenSession};
use config::Config;
use domain_detached::{router, AppState, JobRunner};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "detached-server")]
#[command(about = "Run detached jobs on this VM over HTTP")]
struct Cli {
    /// Port to listen on (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Interpreter to run jobs under (overrides DETACHED_RUNNER)
    #[arg(long)]
    runner: Option<String>,

    /// VM name; discovered from instance metadata when omitted
    #[arg(long)]
    vm_name: Option<String>,

    /// Subscription id; discovered from instance metadata when omitted
    #[arg(long)]
    subscription: Option<String>,

    /// Resource group; discovered from instance metadata when omitted
    #[arg(long)]
    resource_group: Option<String>,

    /// Advertised IP; discovered from instance metadata when omitted
    #[arg(long)]
    ip: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();

    let mut config = Config::from_env()?;
    let environment = Environment::from_env();
    init_tracing(&environment);

    let cli = Cli::parse();
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(runner) = cli.runner {
        config.runner_program = runner;
    }

    let vm = identity::resolve(
        cli.vm_name,
        cli.subscription,
        cli.resource_group,
        cli.ip,
    )
    .await;
    info!(vm = %vm.name, ip = %vm.ip, "Serving detached jobs for this VM");

    let runner = JobRunner {
        program: config.runner_program.clone(),
        args: vec![],
    };
    let mut state = AppState::new(vm, runner, config.work_dir.clone());

    match &config.arm_token {
        Some(token) => {
            let client = AzureClient::new(
                Arc::new(StaticTokenSession::new(token.clone())),
                RetryPolicy::default(),
            )
            .wrap_err("Failed to build the ARM client")?;
            state = state.with_arm_client(client);
        }
        None => {
            warn!("AZURE_TOKEN not set; persist=false jobs cannot delete this VM");
        }
    }

    let app = router(state);
    let address = config.server.address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .wrap_err_with(|| format!("Failed to bind {address}"))?;
    info!(%address, "Detached service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::shutdown_signal())
        .await
        .wrap_err("HTTP server failed")?;

    info!("Detached service stopped");
    Ok(())
}
