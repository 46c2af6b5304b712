use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing_subscriber::prelude::*;

mod catalogue;
mod config;
mod control_loop;
mod handler;
mod store;
mod supervisor;

use catalogue::Catalogue;
use control_loop::ControlLoop;
use handler::Handler;
use store::Store;
use supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Agent logs go to stdout and a daily file under the log dir; the
    // dir also holds the per-instance logs.
    let log_dir = config::log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "agent.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::from_default_env();
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    let _file_guard = file_guard;

    let settings = config::load_agent_settings(&config::agent_config_path())
        .context("load agent config")?;
    let templates =
        config::load_templates(&config::templates_path()).context("load templates config")?;

    let store = Store::new(config::instances_path());
    let instances = store.load().await.context("load instances")?;

    let supervisor = Arc::new(Supervisor::new());
    let catalogue = Arc::new(Catalogue::new(
        supervisor.clone(),
        templates,
        instances,
        store,
        config::instances_dir(),
        log_dir,
    ));

    let (list_changed_tx, list_changed_rx) = mpsc::unbounded_channel();
    let handler = Arc::new(Handler::new(
        settings.agent_id.clone(),
        catalogue,
        supervisor,
        list_changed_tx,
    ));

    tracing::info!(
        agent_id = %settings.agent_id,
        server = %settings.command_server_addr,
        "agent starting"
    );

    tokio::spawn(
        ControlLoop::new(
            settings.agent_id,
            settings.command_server_addr,
            handler,
            list_changed_rx,
        )
        .run(),
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down; running instances keep running until stopped via the control plane");
    Ok(())
}
