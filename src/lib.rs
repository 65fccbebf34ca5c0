// src/lib.rs

pub mod build;
pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod flow;
pub mod fs;
pub mod logging;
pub mod run;
pub mod store;
pub mod task;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::build::CppBuild;
use crate::cli::{CliArgs, Command};
use crate::config::{ConfigFile, SchedulerConfig, load_and_validate};
use crate::engine::{Scheduler, SchedulerEvent};
use crate::exec::LocalExecutor;
use crate::flow::Flow;
use crate::fs::{FileSystem, RealFileSystem};
use crate::run::{RunId, RunStatus};
use crate::store::MemoryStateStore;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - flow construction
/// - scheduler + local executor
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)?;

    match args.command {
        Command::Build {
            dir,
            output,
            jobs,
            dry_run,
        } => {
            let mut build = CppBuild::new(&dir);
            build.output = dir.join(output);

            let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
            let mut flow = build.flow(Arc::clone(&fs))?;
            flow.activate()?;

            if dry_run {
                print_dry_run(&flow, &cfg);
                return Ok(());
            }

            fs.create_dir_all(&build.obj_dir)?;
            let mut config = cfg.scheduler_config();
            if let Some(jobs) = jobs {
                config = config.with_max_concurrent(jobs.max(1));
            }
            run_to_completion(config, flow).await
        }
    }
}

/// Run one flow once and report its task statuses on stdout.
async fn run_to_completion(config: SchedulerConfig, flow: Flow) -> Result<()> {
    let name = flow.name().to_string();
    let mut scheduler = Scheduler::new(config, Arc::new(MemoryStateStore::new()), Arc::new(LocalExecutor));
    scheduler.register_flow(flow)?;
    let mut events = scheduler.subscribe();
    let (handle, mut join) = scheduler.spawn();

    // Ctrl-C → stop immediately; running commands are killed.
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            info!("interrupt received; stopping");
            if let Err(err) = handle.shutdown(false).await {
                debug!(error = %err, "scheduler already stopped");
            }
        });
    }

    let run = handle.trigger_run(&name).await?;
    let status = tokio::select! {
        status = wait_for_run(&mut events, &run) => status,
        result = &mut join => {
            result.context("scheduler task panicked")??;
            bail!("scheduler stopped before run {run} finished");
        }
    };

    let view = handle.run_status(&run).await?;
    handle.shutdown(true).await?;
    join.await.context("scheduler task panicked")??;

    println!("run {run}:");
    for task in &view.tasks {
        match &task.error {
            Some(err) => println!("  {:<40} {:?} ({err})", task.task.as_str(), task.status),
            None => println!("  {:<40} {:?}", task.task.as_str(), task.status),
        }
    }

    match status {
        Some(RunStatus::Succeeded) => Ok(()),
        Some(other) => bail!("run {run} finished as {other:?}"),
        None => bail!("lost track of run {run}"),
    }
}

async fn wait_for_run(events: &mut broadcast::Receiver<SchedulerEvent>, run: &RunId) -> Option<RunStatus> {
    loop {
        match events.recv().await {
            Ok(SchedulerEvent::RunFinished { run: id, status }) if &id == run => return Some(status),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
            Err(RecvError::Closed) => return None,
        }
    }
}

/// Simple dry-run output: print tasks in dependency order with their
/// requirements and behaviour.
fn print_dry_run(flow: &Flow, cfg: &ConfigFile) {
    println!("dagflow dry-run");
    println!("  scheduler.max_concurrent = {}", cfg.scheduler.max_concurrent);
    println!("  defaults.retries = {}", cfg.defaults.retry.max_retries);
    println!();

    let order = match flow.graph().topological_order() {
        Ok(order) => order,
        Err(err) => {
            println!("invalid flow: {err}");
            return;
        }
    };

    println!("tasks ({}):", order.len());
    for id in &order {
        println!("  - {id}");
        let Some(task) = flow.task(id) else {
            continue;
        };
        if !task.requires().is_empty() {
            let deps: Vec<&str> = task.requires().iter().map(|d| d.as_str()).collect();
            println!("      requires: {deps:?}");
        }
        for (key, value) in task.params().iter() {
            println!("      {key}: {value}");
        }
        println!("      behavior: {:?}", task.behavior());
    }

    debug!("dry-run complete (no execution)");
}
