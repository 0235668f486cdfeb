//! Execution engine - runs a provisioning graph on a bounded worker pool
//!
//! A coordinator on the calling thread owns all scheduling state. Ready
//! nodes are handed to a rayon pool one job at a time and results come back
//! over a channel, so progress callbacks never cross threads.

use crate::context::{ActionContext, CancelToken, NoProgress, ProgressCallback};
use crate::error::{ActionError, ProvisionError};
use crate::graph::ProvisionGraph;
use crate::node::{ProvisionAction, ResourceNode};
use crate::retry::RetryConfig;
use crate::types::{ExecuteOptions, GraphReport, NodeOutcome, NodeStatus, SkipReason};
use chrono::{DateTime, Utc};
use statekit::{LockHandle, LockManager, StateStore};
use std::collections::{HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::time::{Duration, Instant};

/// Runs provisioning graphs against a state store
#[derive(Clone)]
pub struct GraphExecutor {
    store: Arc<dyn StateStore>,
    locks: LockManager,
    opts: ExecuteOptions,
}

impl GraphExecutor {
    pub fn new(store: Arc<dyn StateStore>, locks: LockManager, opts: ExecuteOptions) -> Self {
        Self { store, locks, opts }
    }

    pub fn options(&self) -> &ExecuteOptions {
        &self.opts
    }

    /// Validate and execute `nodes`
    ///
    /// An invalid graph is rejected before any lock, state read or action.
    pub fn run<P: ProgressCallback>(
        &self,
        nodes: Vec<ResourceNode>,
        cancel: &CancelToken,
        progress: &mut P,
    ) -> Result<GraphReport, ProvisionError> {
        let graph = ProvisionGraph::build(nodes)?;
        self.run_graph(graph, cancel, progress)
    }

    /// Execute an already validated graph
    pub fn run_graph<P: ProgressCallback>(
        &self,
        graph: ProvisionGraph,
        cancel: &CancelToken,
        progress: &mut P,
    ) -> Result<GraphReport, ProvisionError> {
        let order = graph.topological_order();
        progress.on_run_start(graph.len());

        if self.opts.dry_run {
            log::info!("Dry run: {} resources planned", order.len());
            let outcomes = order
                .iter()
                .map(|name| NodeOutcome {
                    status: NodeStatus::Pending,
                    finished_at: None,
                    ..NodeOutcome::skipped(name.as_str(), SkipReason::DryRun)
                })
                .collect();
            return Ok(GraphReport {
                order,
                outcomes,
                dry_run: true,
                ..GraphReport::default()
            });
        }

        let jobs = self.opts.jobs.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|i| format!("provision-{i}"))
            .build()
            .map_err(|e| ProvisionError::ThreadPool(e.to_string()))?;

        let mut run = Scheduler::new(graph, jobs, progress);
        let (tx, rx) = mpsc::channel();

        loop {
            if run.halt.is_none() && cancel.is_cancelled() {
                log::warn!("Cancellation requested; waiting for running resources");
                run.halt = Some(SkipReason::Cancelled);
            }

            match run.halt.clone() {
                Some(reason) => run.skip_pending(&reason),
                None => {
                    for job in run.dispatch(self, cancel) {
                        let tx = tx.clone();
                        pool.spawn(move || job.execute(&tx));
                    }
                }
            }

            if run.in_flight.is_empty() {
                break;
            }
            let Ok(result) = rx.recv() else {
                break;
            };
            run.complete(result);
        }

        Ok(run.finish(order))
    }

    /// Execute without progress reporting
    pub fn run_simple(
        &self,
        nodes: Vec<ResourceNode>,
        cancel: &CancelToken,
    ) -> Result<GraphReport, ProvisionError> {
        self.run(nodes, cancel, &mut NoProgress)
    }

    fn job_for(&self, node: &ResourceNode, index: usize, cancel: &CancelToken) -> NodeJob {
        NodeJob {
            index,
            name: node.name.clone(),
            lock_key: node.lock_key(&self.opts.global_lock_key).to_string(),
            holder_id: self.opts.holder_id.clone(),
            action: Arc::clone(&node.action),
            store: Arc::clone(&self.store),
            locks: self.locks.clone(),
            lock_ttl: self.opts.lock_ttl,
            timeout: self.opts.action_timeout,
            retry: self.opts.retry.clone(),
            cancel: cancel.clone(),
        }
    }
}

/// Coordinator state for one run
struct Scheduler<'p, P> {
    graph: ProvisionGraph,
    jobs: usize,
    progress: &'p mut P,
    /// Unfinished dependency count per node
    waiting_on: Vec<usize>,
    terminal: Vec<bool>,
    ready: VecDeque<usize>,
    in_flight: HashSet<usize>,
    busy_keys: HashSet<String>,
    outcomes: Vec<NodeOutcome>,
    halt: Option<SkipReason>,
    aborted_by: Option<String>,
}

impl<'p, P: ProgressCallback> Scheduler<'p, P> {
    fn new(graph: ProvisionGraph, jobs: usize, progress: &'p mut P) -> Self {
        let waiting_on: Vec<usize> = (0..graph.len()).map(|i| graph.dependency_count(i)).collect();
        let ready = (0..graph.len()).filter(|&i| waiting_on[i] == 0).collect();
        Self {
            terminal: vec![false; graph.len()],
            outcomes: Vec::with_capacity(graph.len()),
            graph,
            jobs,
            progress,
            waiting_on,
            ready,
            in_flight: HashSet::new(),
            busy_keys: HashSet::new(),
            halt: None,
            aborted_by: None,
        }
    }

    /// Hand out as many ready nodes as the pool and lock keys allow
    fn dispatch(&mut self, executor: &GraphExecutor, cancel: &CancelToken) -> Vec<NodeJob> {
        let mut jobs = Vec::new();
        let mut deferred = VecDeque::new();

        while let Some(i) = self.ready.pop_front() {
            if self.in_flight.len() >= self.jobs {
                deferred.push_back(i);
                continue;
            }
            let node = self.graph.node_at(i);
            let key = node.lock_key(&executor.opts.global_lock_key).to_string();
            if self.busy_keys.contains(&key) {
                log::debug!("{} waits for lock key '{}'", node.name, key);
                deferred.push_back(i);
                continue;
            }

            log::debug!("Dispatching {}", node.name);
            self.progress.on_node_start(&node.name, &node.description());
            jobs.push(executor.job_for(node, i, cancel));
            self.graph.node_at_mut(i).status = NodeStatus::Running;
            self.busy_keys.insert(key);
            self.in_flight.insert(i);
        }

        self.ready = deferred;
        jobs
    }

    fn complete(&mut self, result: NodeResult) {
        let i = result.index;
        self.in_flight.remove(&i);
        self.busy_keys.remove(&result.lock_key);

        let outcome = result.outcome;
        let name = outcome.name.clone();
        let status = outcome.status;
        let cancelled = outcome.skip_reason == Some(SkipReason::Cancelled);
        match status {
            NodeStatus::Succeeded => log::info!("{name}: succeeded"),
            NodeStatus::Failed => log::error!(
                "{name}: failed: {}",
                outcome.error.as_deref().unwrap_or("unknown error")
            ),
            _ => log::warn!("{name}: skipped"),
        }
        self.record(i, outcome);

        if status == NodeStatus::Succeeded {
            let mut newly_ready = Vec::new();
            for &d in self.graph.dependent_indices(i) {
                self.waiting_on[d] -= 1;
                if self.waiting_on[d] == 0 && !self.terminal[d] {
                    newly_ready.push(d);
                }
            }
            newly_ready.sort_unstable();
            self.ready.extend(newly_ready);
            return;
        }

        let downstream = self.graph.transitive_dependent_indices(i);
        if cancelled {
            for &d in &downstream {
                if !self.terminal[d] {
                    self.skip(d, SkipReason::Cancelled);
                }
            }
            if self.halt.is_none() {
                log::warn!("{name} was cancelled; no further resources start");
                self.halt = Some(SkipReason::Cancelled);
            }
            return;
        }

        let critical = self.graph.node_at(i).critical
            || downstream.iter().any(|&d| self.graph.node_at(d).critical);

        for &d in &downstream {
            if !self.terminal[d] {
                let reason = SkipReason::UpstreamFailure { node: name.clone() };
                self.skip(d, reason);
            }
        }

        if status == NodeStatus::Failed && critical && self.halt.is_none() {
            log::error!("Critical failure in {name}; aborting run");
            self.aborted_by = Some(name.clone());
            self.halt = Some(SkipReason::Aborted {
                critical_failure: name,
            });
        }
    }

    /// Skip every node that has not started
    fn skip_pending(&mut self, reason: &SkipReason) {
        self.ready.clear();
        for i in 0..self.graph.len() {
            if !self.terminal[i] && !self.in_flight.contains(&i) {
                self.skip(i, reason.clone());
            }
        }
    }

    fn skip(&mut self, i: usize, reason: SkipReason) {
        let name = self.graph.node_at(i).name.clone();
        log::debug!("{name}: skipped ({reason})");
        self.record(i, NodeOutcome::skipped(name, reason));
    }

    fn record(&mut self, i: usize, outcome: NodeOutcome) {
        self.terminal[i] = true;
        self.graph.node_at_mut(i).status = outcome.status;
        self.progress.on_node_complete(&outcome);
        self.outcomes.push(outcome);
    }

    fn finish(self, order: Vec<String>) -> GraphReport {
        GraphReport {
            order,
            outcomes: self.outcomes,
            cancelled: self.halt == Some(SkipReason::Cancelled),
            aborted_by: self.aborted_by,
            dry_run: false,
        }
    }
}

/// Message from a worker back to the coordinator
struct NodeResult {
    index: usize,
    lock_key: String,
    outcome: NodeOutcome,
}

/// Everything a worker needs to converge one node
struct NodeJob {
    index: usize,
    name: String,
    lock_key: String,
    holder_id: String,
    action: Arc<dyn ProvisionAction>,
    store: Arc<dyn StateStore>,
    locks: LockManager,
    lock_ttl: Duration,
    timeout: Option<Duration>,
    retry: RetryConfig,
    cancel: CancelToken,
}

/// Why a node did not succeed
enum NodeFailure {
    State(statekit::Error),
    Action(ActionError),
    Panicked(String),
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::State(e) => write!(f, "state error: {e}"),
            Self::Action(e) => write!(f, "{e}"),
            Self::Panicked(msg) => write!(f, "action panicked: {msg}"),
        }
    }
}

impl NodeJob {
    fn execute(self, tx: &Sender<NodeResult>) {
        let started_at = Utc::now();
        let outcome = if self.cancel.is_cancelled() {
            NodeOutcome::skipped(self.name.as_str(), SkipReason::Cancelled)
        } else {
            self.converge(started_at)
        };
        // The coordinator only drops its receiver after every job reported.
        let _ = tx.send(NodeResult {
            index: self.index,
            lock_key: self.lock_key,
            outcome,
        });
    }

    fn converge(&self, started_at: DateTime<Utc>) -> NodeOutcome {
        let lease = match self.locks.acquire(&self.lock_key, &self.holder_id, self.lock_ttl) {
            Ok(lease) => lease,
            Err(e) => {
                return NodeOutcome::failed(
                    self.name.as_str(),
                    NodeFailure::State(e).to_string(),
                    None,
                    started_at,
                );
            }
        };

        let result = self.converge_locked(&lease);

        if let Err(e) = self.locks.release(&lease) {
            log::warn!("{}: failed to release lock '{}': {e}", self.name, self.lock_key);
        }

        match result {
            Ok((version, changed)) => {
                NodeOutcome::succeeded(self.name.as_str(), version, changed, started_at)
            }
            Err((NodeFailure::Action(ActionError::Cancelled), _)) => NodeOutcome {
                started_at: Some(started_at),
                ..NodeOutcome::skipped(self.name.as_str(), SkipReason::Cancelled)
            },
            Err((failure, version)) => {
                NodeOutcome::failed(self.name.as_str(), failure.to_string(), version, started_at)
            }
        }
    }

    /// Returns the resulting version and whether it was newly written; on
    /// failure, the version that is still current
    fn converge_locked(
        &self,
        lease: &LockHandle,
    ) -> Result<(u64, bool), (NodeFailure, Option<u64>)> {
        let current = self
            .store
            .get(&self.name)
            .map_err(|e| (NodeFailure::State(e), None))?;
        let current_version = current.as_ref().map(|r| r.version);

        let ctx = ActionContext {
            node: self.name.clone(),
            cancel: self.cancel.clone(),
            deadline: self.timeout.map(|t| Instant::now() + t),
            retry: self.retry.clone(),
        };

        let payload = match panic::catch_unwind(AssertUnwindSafe(|| {
            self.action.provision(current.as_ref(), &ctx)
        })) {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => return Err((NodeFailure::Action(e), current_version)),
            Err(panic) => {
                return Err((
                    NodeFailure::Panicked(panic_message(panic.as_ref())),
                    current_version,
                ));
            }
        };

        if let Some(record) = &current
            && record.payload == payload
        {
            log::debug!("{}: state unchanged at version {}", self.name, record.version);
            return Ok((record.version, false));
        }

        self.locks
            .renew(lease, self.lock_ttl)
            .map_err(|e| (NodeFailure::State(e), current_version))?;

        let record = self
            .store
            .put(&self.name, current_version.unwrap_or(0), payload)
            .map_err(|e| (NodeFailure::State(e), current_version))?;
        log::debug!("{}: recorded version {}", self.name, record.version);
        Ok((record.version, true))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
