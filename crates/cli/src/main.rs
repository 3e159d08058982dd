mod cli;
mod demo;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{error, info, warn};

use weft_client::Client;
use weft_core::Config;
use weft_server::{NodeEvent, RecoveredTask, Server, Submission};

use crate::cli::{CliArgs, Command, ServeArgs, WorkArgs};
use crate::demo::Tally;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    weft_core::config::load_dotenv();
    let args = CliArgs::parse();
    let config = Config::for_profile(&args.profile);

    match args.command {
        Command::Serve(serve_args) => serve(config, serve_args).await,
        Command::Work(work_args) => work(config, work_args).await,
    }
}

async fn serve(mut config: Config, args: ServeArgs) -> Result<()> {
    args.apply(&mut config.server);
    config.log_summary();

    let registry = demo::registry().context("failed to build task registry")?;
    let server = Arc::new(Server::new(config.server.clone(), registry));
    let (handle, feeds) = server.serve().await.context("failed to start sync server")?;

    tokio::spawn(log_node_events(feeds.nodes));
    tokio::spawn(resubmit_recovered(Arc::clone(&server), feeds.recovered));

    for _ in 0..args.demo_tasks {
        let task = Tally {
            current: 0,
            target: args.demo_target,
            step_delay_ms: args.demo_step_ms,
        };
        let submission = server.submit(task, false).await;
        tokio::spawn(watch(submission));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    handle.shutdown().await.context("sync server did not stop cleanly")?;
    Ok(())
}

async fn work(mut config: Config, args: WorkArgs) -> Result<()> {
    args.apply(&mut config.client);
    config.log_summary();

    let registry = demo::registry().context("failed to build task registry")?;
    let client = Client::new(config.client, Arc::new(registry));

    let stop = Arc::new(Notify::new());
    let signal = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal.notify_one();
        }
    });

    match client.run(Some(stop)).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_upgrade_required() => {
            error!(error = %e, "this node is out of date");
            bail!("upgrade required: {e}")
        }
        Err(e) => Err(e).context("sync loop failed"),
    }
}

/// Log checkpoints of one submitted task until it finishes or is cancelled.
async fn watch(submission: Submission) {
    let Submission {
        id, mut checkpoints, ..
    } = submission;
    while let Some(checkpoint) = checkpoints.next().await {
        match checkpoint.downcast_ref::<Tally>() {
            Some(tally) => info!(task_id = %id, current = tally.current, target = tally.target, "checkpoint"),
            None => info!(task_id = %id, kind = checkpoint.kind(), "checkpoint"),
        }
    }
    info!(task_id = %id, "task stream closed");
}

async fn log_node_events(mut events: broadcast::Receiver<NodeEvent>) {
    loop {
        match events.recv().await {
            Ok(NodeEvent::Joined { node_id, capabilities, .. }) => info!(
                node_id = %node_id,
                cpus = capabilities.cpus,
                memory_mb = capabilities.memory_mb,
                "node joined pool"
            ),
            Ok(NodeEvent::Lost { node_id, task_id, .. }) => {
                info!(node_id = %node_id, task_id = ?task_id.map(|t| t.0), "node left pool")
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "node event log fell behind")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Tasks carried over from a previous server run start again under new ids.
async fn resubmit_recovered(server: Arc<Server>, mut recovered: mpsc::Receiver<RecoveredTask>) {
    while let Some(RecoveredTask {
        node_id,
        previous_task_id,
        task,
    }) = recovered.recv().await
    {
        let submission = server.submit_ref(task, false).await;
        info!(
            node_id = %node_id,
            previous_task_id = ?previous_task_id.map(|t| t.0),
            task_id = %submission.id,
            "resubmitted recovered task"
        );
        tokio::spawn(watch(submission));
    }
}
