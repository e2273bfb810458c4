use crate::cli::Commands;
use crate::cluster::LoopbackNetwork;
use crate::config::PgConfig;
use crate::discovery::ServiceWaiter;
use crate::pg::PgDirectory;
use crate::runtime::ProcessTable;
use crate::types::{Member, NodeId};
use anyhow::Context;
use colored::*;
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub fn execute_command(command: Commands, config_path: Option<PathBuf>, verbose: bool) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => PgConfig::from_file(&path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => PgConfig::default(),
    };

    match command {
        Commands::Smoke { scope, group, workers, min_count, timeout_ms, json } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(execute_smoke(
                config,
                SmokeOptions { scope, group, workers, min_count, timeout: Duration::from_millis(timeout_ms) },
                json,
                verbose,
            ))
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

/// Parameters of the smoke scenario
#[derive(Debug, Clone)]
pub struct SmokeOptions {
    pub scope: String,
    pub group: String,
    pub workers: usize,
    pub min_count: usize,
    pub timeout: Duration,
}

/// Outcome of the smoke scenario
#[derive(Debug, Clone)]
pub struct SmokeReport {
    pub control: NodeId,
    pub members: Vec<Member>,
    pub elapsed: Duration,
}

/// Control node plus worker nodes on one loopback network
pub struct SmokeCluster {
    pub network: LoopbackNetwork,
    pub control: PgDirectory,
    pub workers: Vec<PgDirectory>,
}

impl SmokeCluster {
    /// Start the control node and `workers` worker nodes, all connected
    pub fn start(mut config: PgConfig, options: &SmokeOptions) -> Self {
        if !config.scopes.contains(&options.scope) {
            config.scopes.push(options.scope.clone());
        }
        let network = LoopbackNetwork::new();

        let control_node = NodeId::new();
        let control = PgDirectory::start(
            ProcessTable::new(control_node),
            config.clone(),
            network.add_node(control_node),
        );

        let mut workers = Vec::with_capacity(options.workers);
        for _ in 0..options.workers {
            let node = NodeId::new();
            let directory = PgDirectory::start(ProcessTable::new(node), config.clone(), network.add_node(node));
            workers.push(directory);
        }
        network.connect_all();

        Self { network, control, workers }
    }

    /// Each worker joins one process to the group; the control node waits
    /// until it sees `min_count` of them.
    pub async fn run(&self, options: &SmokeOptions) -> anyhow::Result<SmokeReport> {
        for worker in &self.workers {
            let member = worker.processes().spawn_named("smoke-worker");
            worker.scope(&options.scope)?.join(&options.group, member).await?;
        }

        let started = Instant::now();
        let waiter = ServiceWaiter::new(self.control.clone());
        let members = waiter
            .wait(&options.scope, &options.group, options.min_count, options.timeout)
            .await?;

        Ok(SmokeReport { control: self.control.node(), members, elapsed: started.elapsed() })
    }

    /// Stop every scope on every node
    pub async fn shutdown(&self) {
        self.control.shutdown().await;
        for worker in &self.workers {
            worker.shutdown().await;
        }
    }
}

/// Run the smoke scenario on a fresh cluster. The cluster is shut down
/// whether or not the scenario succeeds.
pub async fn run_smoke(config: PgConfig, options: &SmokeOptions) -> anyhow::Result<SmokeReport> {
    let cluster = SmokeCluster::start(config, options);
    let result = cluster.run(options).await;
    cluster.shutdown().await;
    result
}

async fn execute_smoke(config: PgConfig, options: SmokeOptions, json: bool, verbose: bool) -> anyhow::Result<()> {
    if verbose {
        println!(
            "{} {} worker(s), scope '{}', group '{}', waiting for {}",
            "Starting".bright_blue().bold(),
            options.workers,
            options.scope,
            options.group,
            options.min_count
        );
    }

    let report = run_smoke(config, &options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report.members)?);
        return Ok(());
    }

    println!(
        "{} group '{}' reached {} member(s) in {:.2?}",
        "✓".bright_green().bold(),
        options.group,
        report.members.len(),
        report.elapsed
    );
    for member in &report.members {
        println!("  {} {}", "•".bright_cyan(), member);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PgError;

    fn options(workers: usize, min_count: usize, timeout: Duration) -> SmokeOptions {
        SmokeOptions {
            scope: "spg".to_string(),
            group: "smoke".to_string(),
            workers,
            min_count,
            timeout,
        }
    }

    #[tokio::test]
    async fn test_smoke_scenario_reaches_quorum() {
        let report = run_smoke(PgConfig::default(), &options(2, 2, Duration::from_secs(30)))
            .await
            .unwrap();

        assert_eq!(report.members.len(), 2);
        assert!(report.members.iter().all(|m| m.node != report.control));
    }

    #[tokio::test]
    async fn test_failed_smoke_run_still_shuts_down() {
        let options = options(1, 3, Duration::from_millis(100));
        let cluster = SmokeCluster::start(PgConfig::default(), &options);

        let err = cluster.run(&options).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<PgError>(), Some(PgError::Timeout { wanted: 3, .. })));

        cluster.shutdown().await;
        assert!(cluster.control.scopes().is_empty());
        assert!(cluster.workers.iter().all(|worker| worker.scopes().is_empty()));
    }

    #[tokio::test]
    async fn test_run_smoke_reports_timeout() {
        let err = run_smoke(PgConfig::default(), &options(1, 2, Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Timed out"));
    }
}
