//! Fair allocation of script sessions across static nodes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::NodesConfig;
use crate::ssh::{RemoteExecutor, SshExecutor};

struct SchedulerState {
    /// In-flight session ids, one list per node.
    in_flight: Mutex<Vec<Vec<u64>>>,
    released: Notify,
    next_id: AtomicU64,
}

impl SchedulerState {
    fn lock(&self) -> MutexGuard<'_, Vec<Vec<u64>>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Hands out at most `capacity` concurrent sessions per node, always to the
/// least loaded node.
pub struct NodeScheduler {
    nodes: Vec<Arc<dyn RemoteExecutor>>,
    capacity: usize,
    state: Arc<SchedulerState>,
}

/// A claimed slot on one node. Dropping it frees the slot and wakes waiters.
pub struct NodeSession {
    node: usize,
    id: u64,
    exec: Arc<dyn RemoteExecutor>,
    state: Arc<SchedulerState>,
}

impl NodeSession {
    pub fn node(&self) -> usize {
        self.node
    }

    pub fn exec(&self) -> &Arc<dyn RemoteExecutor> {
        &self.exec
    }
}

impl Drop for NodeSession {
    fn drop(&mut self) {
        {
            let mut in_flight = self.state.lock();
            if let Some(list) = in_flight.get_mut(self.node) {
                list.retain(|id| *id != self.id);
            }
        }
        debug!(node = self.node, session = self.id, "node session released");
        self.state.released.notify_waiters();
    }
}

impl NodeScheduler {
    pub fn new(nodes: Vec<Arc<dyn RemoteExecutor>>, capacity: usize) -> Self {
        let state = SchedulerState {
            in_flight: Mutex::new(vec![Vec::new(); nodes.len()]),
            released: Notify::new(),
            next_id: AtomicU64::new(1),
        };
        Self {
            nodes,
            capacity: capacity.max(1),
            state: Arc::new(state),
        }
    }

    pub fn from_config(config: &NodesConfig) -> Self {
        let nodes = config
            .node
            .iter()
            .map(|target| {
                Arc::new(SshExecutor::new(target.clone()).with_retries(config.connect_retries))
                    as Arc<dyn RemoteExecutor>
            })
            .collect();
        Self::new(nodes, config.sessions_per_node)
    }

    /// Number of in-flight sessions per node.
    pub fn in_flight(&self) -> Vec<usize> {
        self.state.lock().iter().map(Vec::len).collect()
    }

    /// Claim a session on the node with the fewest in flight, waiting for
    /// any release while every node is full. Never resolves without nodes.
    pub async fn acquire(&self) -> NodeSession {
        loop {
            let notified = self.state.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(session) = self.try_acquire() {
                return session;
            }
            debug!("all nodes at capacity, waiting");
            notified.await;
        }
    }

    fn try_acquire(&self) -> Option<NodeSession> {
        let mut in_flight = self.state.lock();
        let (node, list) = in_flight
            .iter_mut()
            .enumerate()
            .min_by_key(|(_, list)| list.len())?;
        if list.len() >= self.capacity {
            return None;
        }
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        list.push(id);
        info!(node = %self.nodes[node].target().hostname, session = id, "node session acquired");
        Some(NodeSession {
            node,
            id,
            exec: self.nodes[node].clone(),
            state: self.state.clone(),
        })
    }

    pub async fn close(&self) {
        for node in &self.nodes {
            node.close().await;
        }
    }
}
