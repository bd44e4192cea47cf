//! Subcommand implementations: `check` and `run`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};

use crate::config::{job_requirement, Config, RunnerKind};
use crate::job::Job;
use crate::provider::Runtime;
use crate::task::{Task, TaskReport};

pub fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("loading {}", path.display()))
}

/// Parent chain of `image`, the image itself first.
fn image_chain(config: &Config, image: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = Some(image.to_string());
    while let Some(name) = current {
        current = config.image(&name).and_then(|i| i.parent.clone());
        chain.push(name);
    }
    chain
}

/// Human-readable overview of what a configuration declares.
pub fn summary(config: &Config) -> Vec<String> {
    let mut lines = vec![
        format!(
            "provider: {:?} storage at {}",
            config.provider.storage, config.provider.storage_root
        ),
        format!(
            "hosts: {}",
            config
                .hosts
                .iter()
                .map(|h| h.destination())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        format!(
            "nodes: {} ({} sessions each)",
            config.nodes.node.len(),
            config.nodes.sessions_per_node
        ),
    ];
    for image in &config.images {
        lines.push(format!("image {}: {}", image.name, image_chain(config, &image.name).join(" <- ")));
    }
    for job in &config.jobs {
        match job.runner {
            RunnerKind::Virsh => {
                let (memory_kib, vcpus) = job_requirement(config, job);
                let vms: Vec<&str> = job.vms.iter().map(|v| v.vm.as_str()).collect();
                lines.push(format!(
                    "job {}: virsh, vms [{}], {} MiB / {} vcpus",
                    job.name,
                    vms.join(", "),
                    memory_kib / 1024,
                    vcpus
                ));
            }
            RunnerKind::Nodes => lines.push(format!(
                "job {}: nodes, scripts [{}]",
                job.name,
                job.scripts.join(", ")
            )),
        }
    }
    lines
}

/// Run `rallyci check`: the configuration already loaded and validated.
pub fn run_check(config: &Config) -> Result<()> {
    for line in summary(config) {
        println!("{}", line);
    }
    println!("\nConfiguration OK.");
    Ok(())
}

/// Resolves when the process is asked to stop.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, cancelling task"),
            _ = sigterm.recv() => info!("received SIGTERM, cancelling task"),
        },
        Err(e) => {
            warn!(error = %e, "failed to register SIGTERM handler");
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received SIGINT, cancelling task");
            } else {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Run `rallyci run`: one task holding the named jobs.
pub async fn run_task(config: Arc<Config>, project: &str, jobs: &[String]) -> Result<TaskReport> {
    let runtime = Runtime::new(config.clone());
    let mut task = Task::new(project);
    for name in jobs {
        let job = config
            .job(name)
            .ok_or_else(|| anyhow!("unknown job '{}'", name))?;
        let runner = runtime.runner(job)?;
        task.spawn_job(Job::new(job.clone(), task.id(), project), runner);
    }

    let report = tokio::select! {
        report = task.wait() => report,
        _ = shutdown_signal() => {
            eprintln!("Interrupted! Cancelling {} job(s)...", task.outstanding());
            task.cancel().await;
            task.report()
        }
    };
    runtime.close().await;
    Ok(report)
}
