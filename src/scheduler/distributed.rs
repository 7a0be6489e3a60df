//! Distributed coordinator
//!
//! Keeps a registry of remote workers, partitions a task list across them
//! and hands each worker its share. A worker that does not acknowledge in
//! time is excluded for the round and its tasks move to the others.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::WorkerStore;
use crate::models::{Task, WorkerInfo};

/// Bucket used when no registered worker accepts the target
pub const LOCAL_WORKER: &str = "local";

const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Delivers an assignment to a remote worker.
///
/// Returning `Ok` is the worker's acknowledgement.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn assign(&self, worker: &WorkerInfo, target: &str, tasks: &[Task]) -> Result<()>;
}

/// POSTs `{target, tasks}` to `http://<address>/assign`
#[derive(Clone, Debug)]
pub struct HttpWorkerTransport {
    client: reqwest::Client,
}

impl HttpWorkerTransport {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WorkerTransport for HttpWorkerTransport {
    async fn assign(&self, worker: &WorkerInfo, target: &str, tasks: &[Task]) -> Result<()> {
        let url = format!("http://{}/assign", worker.address);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "target": target, "tasks": tasks }))
            .send()
            .await
            .with_context(|| format!("Failed to reach worker {}", worker.id))?;

        if !response.status().is_success() {
            anyhow::bail!("Worker {} rejected assignment: {}", worker.id, response.status());
        }
        Ok(())
    }
}

/// Where every task of a dispatch ended up
#[derive(Clone, Debug, Default)]
pub struct DispatchReport {
    /// Acknowledged assignments per worker
    pub assigned: BTreeMap<String, Vec<Task>>,
    /// Tasks no remote worker could take; the caller runs them locally
    pub local: Vec<Task>,
    /// Workers that failed to acknowledge
    pub excluded: Vec<String>,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.assigned.values().map(Vec::len).sum::<usize>() + self.local.len()
    }
}

/// Health of one registered worker
#[derive(Clone, Debug, Serialize)]
pub struct WorkerStatus {
    pub id: String,
    pub address: String,
    pub healthy: bool,
    pub capabilities: Vec<String>,
    pub max_parallel: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct ClusterStatus {
    pub total_workers: usize,
    pub workers: Vec<WorkerStatus>,
}

impl ClusterStatus {
    pub fn healthy_count(&self) -> usize {
        self.workers.iter().filter(|w| w.healthy).count()
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Workers: {} ({} healthy)",
            self.total_workers,
            self.healthy_count()
        )?;
        writeln!(f, "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━")?;
        for worker in &self.workers {
            let caps = if worker.capabilities.is_empty() {
                "*".to_string()
            } else {
                worker.capabilities.join(",")
            };
            writeln!(
                f,
                "  {} {:<16} {:<22} max {} [{}]",
                if worker.healthy { "✓" } else { "✗" },
                worker.id,
                worker.address,
                worker.max_parallel,
                caps
            )?;
        }
        Ok(())
    }
}

/// Registry of remote workers
#[derive(Debug, Default)]
pub struct DistributedCoordinator {
    /// Registration order is the round-robin order
    workers: Vec<WorkerInfo>,
    store: Option<WorkerStore>,
    ack_timeout: Option<Duration>,
}

impl DistributedCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: WorkerStore) -> Result<Self> {
        let workers = store.load()?;
        debug!("Loaded {} worker(s) from {}", workers.len(), store.path().display());
        Ok(Self {
            workers,
            store: Some(store),
            ack_timeout: None,
        })
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = Some(ack_timeout);
        self
    }

    fn ack_timeout(&self) -> Duration {
        self.ack_timeout.unwrap_or(DEFAULT_ACK_TIMEOUT)
    }

    fn persist(&self) -> Result<()> {
        match &self.store {
            Some(store) => store.save(&self.workers),
            None => Ok(()),
        }
    }

    /// Register or replace (by id) a worker
    pub fn register_worker(&mut self, worker: WorkerInfo) -> Result<()> {
        info!("Registered worker {} at {}", worker.id, worker.address);
        match self.workers.iter_mut().find(|w| w.id == worker.id) {
            Some(existing) => *existing = worker,
            None => self.workers.push(worker),
        }
        self.persist()
    }

    pub fn unregister_worker(&mut self, id: &str) -> Result<bool> {
        let before = self.workers.len();
        self.workers.retain(|w| w.id != id);
        if self.workers.len() == before {
            return Ok(false);
        }
        info!("Unregistered worker {}", id);
        self.persist()?;
        Ok(true)
    }

    pub fn list_workers(&self) -> &[WorkerInfo] {
        &self.workers
    }

    pub fn get_worker(&self, id: &str) -> Option<&WorkerInfo> {
        self.workers.iter().find(|w| w.id == id)
    }

    /// Workers whose capabilities accept `target`
    pub fn workers_for(&self, target: &str) -> Vec<&WorkerInfo> {
        self.workers.iter().filter(|w| w.accepts(target)).collect()
    }

    /// Round-robin partition over the workers accepting `target`.
    ///
    /// Pure: depends only on the task list and the registry. With no
    /// eligible worker everything lands in the [`LOCAL_WORKER`] bucket.
    pub fn distribute_tasks(&self, tasks: &[Task], target: &str) -> BTreeMap<String, Vec<Task>> {
        let workers = self.workers_for(target);
        if workers.is_empty() {
            return BTreeMap::from([(LOCAL_WORKER.to_string(), tasks.to_vec())]);
        }
        let ids: Vec<&str> = workers.iter().map(|w| w.id.as_str()).collect();
        round_robin(tasks, &ids)
    }

    /// Like [`distribute_tasks`](Self::distribute_tasks), but tasks named in
    /// `assignment` go to their pinned worker when it is registered and
    /// accepts `target`.
    pub fn plan(
        &self,
        tasks: &[Task],
        target: &str,
        assignment: Option<&BTreeMap<String, Vec<String>>>,
    ) -> BTreeMap<String, Vec<Task>> {
        let Some(assignment) = assignment else {
            return self.distribute_tasks(tasks, target);
        };

        let eligible: HashSet<&str> = self
            .workers_for(target)
            .into_iter()
            .map(|w| w.id.as_str())
            .collect();

        let mut pinned_to: BTreeMap<&str, &str> = BTreeMap::new();
        for (worker_id, task_ids) in assignment {
            if !eligible.contains(worker_id.as_str()) {
                warn!("Ignoring static assignment to unknown worker {}", worker_id);
                continue;
            }
            for task_id in task_ids {
                pinned_to.insert(task_id.as_str(), worker_id.as_str());
            }
        }

        let mut plan: BTreeMap<String, Vec<Task>> = BTreeMap::new();
        let mut rest = Vec::new();
        for task in tasks {
            match pinned_to.get(task.id.as_str()) {
                Some(worker_id) => plan.entry(worker_id.to_string()).or_default().push(task.clone()),
                None => rest.push(task.clone()),
            }
        }

        for (worker_id, share) in self.distribute_tasks(&rest, target) {
            if !share.is_empty() {
                plan.entry(worker_id).or_default().extend(share);
            }
        }
        plan
    }

    /// Partition and deliver `tasks`
    pub async fn dispatch(
        &self,
        tasks: &[Task],
        target: &str,
        transport: &dyn WorkerTransport,
    ) -> DispatchReport {
        self.dispatch_plan(self.distribute_tasks(tasks, target), target, transport)
            .await
    }

    /// Deliver a precomputed plan, reassigning the shares of workers that
    /// fail to acknowledge within the ack timeout. Tasks that no worker
    /// accepts end up in [`DispatchReport::local`].
    pub async fn dispatch_plan(
        &self,
        mut plan: BTreeMap<String, Vec<Task>>,
        target: &str,
        transport: &dyn WorkerTransport,
    ) -> DispatchReport {
        let mut report = DispatchReport {
            local: plan.remove(LOCAL_WORKER).unwrap_or_default(),
            ..DispatchReport::default()
        };
        let ack_timeout = self.ack_timeout();

        let mut pending = plan;
        let mut round = 0;
        while !pending.is_empty() {
            round += 1;
            let mut orphans = Vec::new();

            let deliveries = pending.into_iter().filter_map(|(worker_id, share)| {
                if share.is_empty() {
                    return None;
                }
                match self.get_worker(&worker_id) {
                    Some(worker) => Some((worker, share)),
                    None => {
                        warn!("Worker {} is not registered, reassigning its tasks", worker_id);
                        orphans.extend(share);
                        None
                    }
                }
            });
            let deliveries: Vec<_> = deliveries.collect();

            let results = join_all(deliveries.iter().map(|(worker, share)| async move {
                timeout(ack_timeout, transport.assign(worker, target, share)).await
            }))
            .await;

            for ((worker, share), result) in deliveries.into_iter().zip(results) {
                match result {
                    Ok(Ok(())) => {
                        debug!("Worker {} acknowledged {} task(s)", worker.id, share.len());
                        report.assigned.entry(worker.id.clone()).or_default().extend(share);
                    }
                    Ok(Err(e)) => {
                        warn!("Worker {} failed to accept assignment: {:#}", worker.id, e);
                        report.excluded.push(worker.id.clone());
                        orphans.extend(share);
                    }
                    Err(_) => {
                        warn!(
                            "Worker {} did not acknowledge within {}ms",
                            worker.id,
                            ack_timeout.as_millis()
                        );
                        report.excluded.push(worker.id.clone());
                        orphans.extend(share);
                    }
                }
            }

            if orphans.is_empty() {
                break;
            }

            let remaining: Vec<&str> = self
                .workers_for(target)
                .into_iter()
                .map(|w| w.id.as_str())
                .filter(|id| !report.excluded.iter().any(|e| e == id))
                .collect();

            if remaining.is_empty() {
                warn!(
                    "No worker left for {} task(s), keeping them for local execution",
                    orphans.len()
                );
                report.local.extend(orphans);
                break;
            }

            info!(
                "Round {}: reassigning {} task(s) across {} worker(s)",
                round,
                orphans.len(),
                remaining.len()
            );
            pending = round_robin(&orphans, &remaining);
        }

        report
    }

    /// TCP reachability of a registered worker
    pub async fn check_worker_health(&self, id: &str) -> bool {
        match self.get_worker(id) {
            Some(worker) => probe(&worker.address).await,
            None => false,
        }
    }

    pub async fn cluster_status(&self) -> ClusterStatus {
        let health = join_all(self.workers.iter().map(|w| probe(&w.address))).await;

        ClusterStatus {
            total_workers: self.workers.len(),
            workers: self
                .workers
                .iter()
                .zip(health)
                .map(|(w, healthy)| WorkerStatus {
                    id: w.id.clone(),
                    address: w.address.clone(),
                    healthy,
                    capabilities: w.capabilities.clone(),
                    max_parallel: w.max_parallel,
                })
                .collect(),
        }
    }
}

fn round_robin(tasks: &[Task], worker_ids: &[&str]) -> BTreeMap<String, Vec<Task>> {
    let mut plan: BTreeMap<String, Vec<Task>> = worker_ids
        .iter()
        .map(|id| (id.to_string(), Vec::new()))
        .collect();
    for (i, task) in tasks.iter().enumerate() {
        if let Some(bucket) = plan.get_mut(worker_ids[i % worker_ids.len()]) {
            bucket.push(task.clone());
        }
    }
    plan
}

async fn probe(address: &str) -> bool {
    matches!(
        timeout(HEALTH_TIMEOUT, TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}
