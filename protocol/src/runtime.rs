use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ProtocolError, Result};
use crate::gossip::NeighborConnectionManager;
use crate::types::{GossipValue, NodeIdentifier, SharePayload};

/// Default pause between execution cycles.
pub const DEFAULT_CYCLE_INTERVAL: Duration = Duration::from_millis(2000);

/// Inputs to one kernel round.
pub struct RoundContext<'a> {
    pub node: &'a NodeIdentifier,
    /// Number of rounds completed before this one.
    pub round: u64,
    /// Latest payload from every connected neighbor.
    pub neighbors: &'a BTreeMap<NodeIdentifier, SharePayload>,
}

/// What a kernel round produces.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundOutput {
    pub local_value: GossipValue,
    pub outbound: SharePayload,
}

/// The aggregate computation a node runs every cycle.
pub trait AggregateKernel: Send + 'static {
    fn run_round(&mut self, ctx: &RoundContext<'_>) -> Result<RoundOutput>;
}

/// Extension points around each cycle.
pub trait ExecutionHooks: Send + Sync + 'static {
    fn pre_cycle(&self, _node: &NodeIdentifier, _round: u64) {}
    fn post_cycle(&self, _node: &NodeIdentifier, _round: u64, _value: &GossipValue) {}
}

pub struct NoHooks;

impl ExecutionHooks for NoHooks {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub cycle_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cycle_interval: DEFAULT_CYCLE_INTERVAL,
        }
    }
}

struct Shared {
    kernel: Mutex<Box<dyn AggregateKernel>>,
    executions: AtomicU64,
    state: StdMutex<RuntimeState>,
    local_value: StdMutex<GossipValue>,
    last_error: StdMutex<Option<String>>,
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn fail(&self, node: &NodeIdentifier, reason: String) {
        tracing::error!(node = %node, error = %reason, "Execution loop failed, node stops executing");
        *lock(&self.last_error) = Some(reason);
        *lock(&self.state) = RuntimeState::Stopped;
    }
}

/// Drives one node: run the kernel, publish its payload, sleep, repeat.
pub struct NodeRuntime {
    node: NodeIdentifier,
    manager: NeighborConnectionManager,
    config: RuntimeConfig,
    hooks: Arc<dyn ExecutionHooks>,
    shared: Arc<Shared>,
    task: StdMutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl NodeRuntime {
    pub fn new(
        node: NodeIdentifier,
        kernel: impl AggregateKernel,
        manager: NeighborConnectionManager,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            node,
            manager,
            config,
            hooks: Arc::new(NoHooks),
            shared: Arc::new(Shared {
                kernel: Mutex::new(Box::new(kernel)),
                executions: AtomicU64::new(0),
                state: StdMutex::new(RuntimeState::Idle),
                local_value: StdMutex::new(GossipValue::Null),
                last_error: StdMutex::new(None),
            }),
            task: StdMutex::new(None),
        }
    }

    pub fn with_hooks(mut self, hooks: impl ExecutionHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn node(&self) -> &NodeIdentifier {
        &self.node
    }

    pub fn manager(&self) -> &NeighborConnectionManager {
        &self.manager
    }

    pub fn state(&self) -> RuntimeState {
        *lock(&self.shared.state)
    }

    pub fn execution_count(&self) -> u64 {
        self.shared.executions.load(Ordering::SeqCst)
    }

    pub fn local_value(&self) -> GossipValue {
        lock(&self.shared.local_value).clone()
    }

    /// Why the loop last stopped on its own, if it did.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    /// Spawn the execution loop. Fails if it is already running.
    pub fn start_executing(&self) -> Result<()> {
        let mut task = lock(&self.task);
        {
            let mut state = lock(&self.shared.state);
            if *state == RuntimeState::Running {
                return Err(ProtocolError::IllegalState(format!(
                    "node {} is already executing",
                    self.node
                )));
            }
            *state = RuntimeState::Running;
        }
        *lock(&self.shared.last_error) = None;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervise(
            self.node.clone(),
            self.shared.clone(),
            self.manager.clone(),
            self.hooks.clone(),
            self.config.cycle_interval,
            cancel.clone(),
        ));
        *task = Some((cancel, handle));
        tracing::info!(node = %self.node, "▶️ Started executing");
        Ok(())
    }

    /// Interrupt the loop and wait for it to exit. A no-op when not running.
    pub async fn stop_executing(&self) {
        let Some((cancel, handle)) = lock(&self.task).take() else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            if self.last_error().is_none() {
                self.shared.fail(&self.node, format!("execution task aborted: {e}"));
            }
        }
        *lock(&self.shared.state) = RuntimeState::Stopped;
        tracing::info!(
            node = %self.node,
            executions = self.execution_count(),
            "⏹️ Stopped executing"
        );
    }
}

/// Runs the loop as its own task so that a panic anywhere in a cycle,
/// not only in the kernel, is caught at the join and recorded.
async fn supervise(
    node: NodeIdentifier,
    shared: Arc<Shared>,
    manager: NeighborConnectionManager,
    hooks: Arc<dyn ExecutionHooks>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let inner = tokio::spawn(run_loop(
        node.clone(),
        shared.clone(),
        manager,
        hooks,
        interval,
        cancel,
    ));
    if let Err(e) = inner.await {
        let reason = if e.is_panic() {
            format!("execution loop panicked: {e}")
        } else {
            format!("execution loop aborted: {e}")
        };
        shared.fail(&node, reason);
    }
}

async fn run_loop(
    node: NodeIdentifier,
    shared: Arc<Shared>,
    manager: NeighborConnectionManager,
    hooks: Arc<dyn ExecutionHooks>,
    interval: Duration,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        let round = shared.executions.load(Ordering::SeqCst);
        hooks.pre_cycle(&node, round);

        let neighbors = manager.neighbor_snapshot().await;
        let output = {
            let mut kernel = shared.kernel.lock().await;
            let ctx = RoundContext {
                node: &node,
                round,
                neighbors: &neighbors,
            };
            std::panic::catch_unwind(AssertUnwindSafe(|| kernel.run_round(&ctx)))
        };
        let output = match output {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return shared.fail(&node, e.to_string()),
            Err(_) => return shared.fail(&node, "kernel panicked".to_string()),
        };

        let completed = shared.executions.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&shared.local_value) = output.local_value.clone();
        hooks.post_cycle(&node, completed, &output.local_value);

        let sent = manager.broadcast(&output.outbound).await;
        tracing::debug!(
            node = %node,
            round = completed,
            neighbors = neighbors.len(),
            sent,
            "Cycle complete"
        );

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
