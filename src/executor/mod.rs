//! C5: runs migration plans under a concurrency cap, with retries,
//! cancellation and per-task progress (spec.md §4.5).

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ClusterConfig;
use crate::error::Result;
use crate::planner::{MigrationPlan, PlanSink};
use crate::types::{unix_now, NodeId};

/// A live, stateful execution of a [`MigrationPlan`] (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationTask {
    pub task_id: String,
    pub plan: MigrationPlan,
    pub state: TaskState,
    pub progress: u8,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub retry_count: u32,
    pub bytes_moved: u64,
    pub failure_reason: Option<String>,
}

/// Data-movement contract (spec.md §4.5): opaque to the executor, both
/// operations must honor the deadline carried by their call and must honor
/// `cancel` by returning early once it fires rather than running to
/// completion regardless.
#[async_trait]
pub trait DataClient: Send + Sync + 'static {
    async fn transfer(&self, source: &NodeId, target: &NodeId, shard_ids: &[String], cancel: &CancellationToken) -> Result<u64>;
    async fn validate(&self, source: &NodeId, target: &NodeId, shard_ids: &[String], cancel: &CancellationToken) -> Result<()>;
}

struct QueueItem {
    priority: u8,
    seq: u64,
    task_id: String,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    /// Highest priority first; ties broken by earliest submission order
    /// (smaller `seq` wins), matching spec.md's "priority high first, then
    /// submission order."
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    config: Arc<ClusterConfig>,
    data_client: Arc<dyn DataClient>,
    registry: RwLock<HashMap<String, MigrationTask>>,
    cancel_flags: RwLock<HashMap<String, CancellationToken>>,
    queue: AsyncMutex<BinaryHeap<QueueItem>>,
    queue_len: AtomicU64,
    notify: Notify,
    next_seq: AtomicU64,
    stop_tx: watch::Sender<bool>,
}

/// Cheaply-cloneable handle to the running migration executor.
#[derive(Clone)]
pub struct MigrationExecutor {
    inner: Arc<Inner>,
    dispatcher: Arc<AsyncMutex<Option<JoinHandle<()>>>>,
}

impl MigrationExecutor {
    pub fn new(config: Arc<ClusterConfig>, data_client: Arc<dyn DataClient>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            config,
            data_client,
            registry: RwLock::new(HashMap::new()),
            cancel_flags: RwLock::new(HashMap::new()),
            queue: AsyncMutex::new(BinaryHeap::new()),
            queue_len: AtomicU64::new(0),
            notify: Notify::new(),
            next_seq: AtomicU64::new(0),
            stop_tx,
        });
        Self { inner, dispatcher: Arc::new(AsyncMutex::new(None)) }
    }

    /// Spin up the worker pool (size `max_concurrent_migrations`).
    pub async fn start(&self) {
        let mut guard = self.dispatcher.lock().await;
        if guard.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let stop_rx = self.inner.stop_tx.subscribe();
        *guard = Some(tokio::spawn(run_dispatcher(inner, stop_rx)));
    }

    /// Cancel all workers and wait up to `shutdown_deadline`; anything still
    /// running past that is abandoned and the caller is warned.
    pub async fn stop(&self) {
        let _ = self.inner.stop_tx.send(true);

        let running: Vec<String> = self
            .inner
            .registry
            .read()
            .await
            .iter()
            .filter(|(_, t)| t.state == TaskState::Running)
            .map(|(id, _)| id.clone())
            .collect();
        let cancel_flags = self.inner.cancel_flags.read().await;
        for task_id in &running {
            if let Some(token) = cancel_flags.get(task_id) {
                token.cancel();
            }
        }
        drop(cancel_flags);

        if let Some(handle) = self.dispatcher.lock().await.take() {
            match tokio::time::timeout(self.inner.config.shutdown_deadline, handle).await {
                Ok(_) => {}
                Err(_) => tracing::warn!("migration executor dispatcher did not stop within the shutdown deadline"),
            }
        }
    }

    /// Create a Pending task for each plan and enqueue it. Always returns
    /// one id per plan, even ones immediately marked Failed("queue full").
    pub async fn submit(&self, plans: Vec<MigrationPlan>) -> Vec<String> {
        let mut ids = Vec::with_capacity(plans.len());
        for plan in plans {
            let task_id = Uuid::new_v4().to_string();
            let task = MigrationTask {
                task_id: task_id.clone(),
                plan: plan.clone(),
                state: TaskState::Pending,
                progress: 0,
                start_time: None,
                end_time: None,
                retry_count: 0,
                bytes_moved: 0,
                failure_reason: None,
            };
            self.inner.registry.write().await.insert(task_id.clone(), task);
            self.inner.cancel_flags.write().await.insert(task_id.clone(), CancellationToken::new());

            if self.inner.queue_len.load(Ordering::Relaxed) as usize >= self.inner.config.migration_queue_capacity {
                self.fail_task(&task_id, "queue full".to_string()).await;
            } else {
                self.enqueue(&task_id, plan.priority).await;
            }
            ids.push(task_id);
        }
        ids
    }

    async fn enqueue(&self, task_id: &str, priority: u8) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.queue.lock().await.push(QueueItem { priority, seq, task_id: task_id.to_string() });
        self.inner.queue_len.fetch_add(1, Ordering::Relaxed);
        self.inner.notify.notify_one();
    }

    async fn fail_task(&self, task_id: &str, reason: String) {
        let mut registry = self.inner.registry.write().await;
        if let Some(task) = registry.get_mut(task_id) {
            task.state = TaskState::Failed;
            task.failure_reason = Some(reason);
            task.end_time = Some(unix_now());
        }
    }

    pub async fn task(&self, task_id: &str) -> Option<MigrationTask> {
        self.inner.registry.read().await.get(task_id).cloned()
    }

    pub async fn active_tasks(&self) -> Vec<MigrationTask> {
        self.inner
            .registry
            .read()
            .await
            .values()
            .filter(|t| !t.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Permitted from Pending or Running. Re-cancelling an already-terminal
    /// task is a no-op returning `false`.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let mut registry = self.inner.registry.write().await;
        let task = match registry.get_mut(task_id) {
            Some(t) => t,
            None => return false,
        };
        match task.state {
            TaskState::Pending => {
                task.state = TaskState::Cancelled;
                task.end_time = Some(unix_now());
                true
            }
            TaskState::Running => {
                if let Some(token) = self.inner.cancel_flags.read().await.get(task_id) {
                    token.cancel();
                }
                true
            }
            _ => false,
        }
    }
}

async fn run_dispatcher(inner: Arc<Inner>, mut stop_rx: watch::Receiver<bool>) {
    let semaphore = Arc::new(Semaphore::new(inner.config.max_concurrent_migrations.max(1)));
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => if *stop_rx.borrow() { break },
            _ = inner.notify.notified() => {}
        }

        loop {
            if *stop_rx.borrow() {
                break;
            }
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => break,
            };
            let next = {
                let mut queue = inner.queue.lock().await;
                match queue.pop() {
                    Some(item) => {
                        inner.queue_len.fetch_sub(1, Ordering::Relaxed);
                        Some(item.task_id)
                    }
                    None => None,
                }
            };
            let task_id = match next {
                Some(id) => id,
                None => {
                    drop(permit);
                    break;
                }
            };

            // Pending tasks can be cancelled between enqueue and pop.
            let still_pending = {
                let registry = inner.registry.read().await;
                registry.get(&task_id).map(|t| t.state == TaskState::Pending).unwrap_or(false)
            };
            if !still_pending {
                drop(permit);
                continue;
            }

            let inner2 = inner.clone();
            workers.push(tokio::spawn(async move {
                let _permit = permit;
                execute_task(inner2, task_id).await;
            }));
        }

        workers.retain(|h| !h.is_finished());
    }

    for handle in workers {
        let _ = handle.await;
    }
}

async fn execute_task(inner: Arc<Inner>, task_id: String) {
    let (plan, retry_count) = {
        let mut registry = inner.registry.write().await;
        let task = match registry.get_mut(&task_id) {
            Some(t) => t,
            None => return,
        };
        task.state = TaskState::Running;
        task.start_time = Some(unix_now());
        task.progress = 10;
        (task.plan.clone(), task.retry_count)
    };

    let token = match inner.cancel_flags.read().await.get(&task_id).cloned() {
        Some(t) => t,
        None => return,
    };

    if token.is_cancelled() {
        terminate(&inner, &task_id, TaskState::Cancelled, None, None).await;
        return;
    }

    let bytes_moved = tokio::select! {
        res = tokio::time::timeout(
            inner.config.migration_timeout,
            inner.data_client.transfer(&plan.source, &plan.target, &plan.shard_ids, &token),
        ) => match res {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                retry_or_fail(&inner, &task_id, retry_count, format!("transfer failed: {}", e)).await;
                return;
            }
            Err(_) => {
                retry_or_fail(&inner, &task_id, retry_count, "transfer deadline exceeded".to_string()).await;
                return;
            }
        },
        _ = token.cancelled() => {
            terminate(&inner, &task_id, TaskState::Cancelled, None, None).await;
            return;
        }
    };

    {
        let mut registry = inner.registry.write().await;
        if let Some(task) = registry.get_mut(&task_id) {
            task.bytes_moved = bytes_moved;
            task.progress = 90;
        }
    }

    if token.is_cancelled() {
        terminate(&inner, &task_id, TaskState::Cancelled, None, Some(bytes_moved)).await;
        return;
    }

    tokio::select! {
        res = tokio::time::timeout(
            inner.config.validation_timeout,
            inner.data_client.validate(&plan.source, &plan.target, &plan.shard_ids, &token),
        ) => match res {
            Ok(Ok(())) => {
                terminate(&inner, &task_id, TaskState::Completed, None, Some(bytes_moved)).await;
            }
            Ok(Err(e)) => {
                retry_or_fail(&inner, &task_id, retry_count, format!("validation failed: {}", e)).await;
            }
            Err(_) => {
                retry_or_fail(&inner, &task_id, retry_count, "validation deadline exceeded".to_string()).await;
            }
        },
        _ = token.cancelled() => {
            terminate(&inner, &task_id, TaskState::Cancelled, None, Some(bytes_moved)).await;
        }
    }
}

async fn terminate(inner: &Arc<Inner>, task_id: &str, state: TaskState, reason: Option<String>, bytes_moved: Option<u64>) {
    let mut registry = inner.registry.write().await;
    if let Some(task) = registry.get_mut(task_id) {
        task.state = state;
        task.end_time = Some(unix_now());
        if state == TaskState::Completed {
            task.progress = 100;
        }
        if let Some(bytes) = bytes_moved {
            task.bytes_moved = bytes;
        }
        task.failure_reason = reason;
    }
}

async fn retry_or_fail(inner: &Arc<Inner>, task_id: &str, retry_count: u32, reason: String) {
    if retry_count < inner.config.max_migration_retries {
        let mut registry = inner.registry.write().await;
        if let Some(task) = registry.get_mut(task_id) {
            task.retry_count += 1;
            task.state = TaskState::Pending;
            task.progress = 0;
            task.failure_reason = Some(reason);
        }
        drop(registry);
        let priority = inner.registry.read().await.get(task_id).map(|t| t.plan.priority).unwrap_or(1);
        let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
        inner.queue.lock().await.push(QueueItem { priority, seq, task_id: task_id.to_string() });
        inner.queue_len.fetch_add(1, Ordering::Relaxed);
        inner.notify.notify_one();
    } else {
        terminate(inner, task_id, TaskState::Failed, Some(reason), None).await;
    }
}

/// A no-op sink adapter so the planner can be wired to an executor handle
/// without either owning the other.
pub struct ExecutorPlanSink {
    executor: MigrationExecutor,
}

impl ExecutorPlanSink {
    pub fn new(executor: MigrationExecutor) -> Self {
        Self { executor }
    }
}

impl PlanSink for ExecutorPlanSink {
    fn submit(&self, plans: Vec<MigrationPlan>) {
        let executor = self.executor.clone();
        tokio::spawn(async move {
            let _ = executor.submit(plans).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct FlakyThenSucceedsClient {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl DataClient for FlakyThenSucceedsClient {
        async fn transfer(
            &self,
            _source: &NodeId,
            _target: &NodeId,
            _shards: &[String],
            _cancel: &CancellationToken,
        ) -> Result<u64> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                Err(crate::error::Error::unavailable(crate::error::DOMAIN_EXECUTOR, "transient"))
            } else {
                Ok(4096)
            }
        }

        async fn validate(
            &self,
            _source: &NodeId,
            _target: &NodeId,
            _shards: &[String],
            _cancel: &CancellationToken,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn task_retries_then_completes() {
        let config = Arc::new(ClusterConfig::default());
        let client = Arc::new(FlakyThenSucceedsClient { attempts: AtomicU32::new(0) });
        let executor = MigrationExecutor::new(config, client);
        executor.start().await;

        let plan = MigrationPlan {
            plan_id: "p1".into(),
            source: NodeId::new("a"),
            target: NodeId::new("b"),
            shard_ids: vec!["s1".into()],
            estimated_bytes: 4096,
            priority: 5,
        };
        let ids = executor.submit(vec![plan]).await;
        let task_id = &ids[0];

        let mut final_task = None;
        for _ in 0..200 {
            let task = executor.task(task_id).await.unwrap();
            if task.state.is_terminal() {
                final_task = Some(task);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let task = final_task.expect("task did not reach a terminal state");
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.bytes_moved, 4096);
        executor.stop().await;
    }

    /// A `DataClient` that blocks forever on `transfer` unless `cancel` fires,
    /// matching the spec's requirement that clients honor cancellation.
    struct HangingClient;

    #[async_trait]
    impl DataClient for HangingClient {
        async fn transfer(
            &self,
            _source: &NodeId,
            _target: &NodeId,
            _shards: &[String],
            cancel: &CancellationToken,
        ) -> Result<u64> {
            cancel.cancelled().await;
            Err(crate::error::Error::unavailable(crate::error::DOMAIN_EXECUTOR, "cancelled mid-transfer"))
        }

        async fn validate(
            &self,
            _source: &NodeId,
            _target: &NodeId,
            _shards: &[String],
            _cancel: &CancellationToken,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancel_interrupts_an_in_flight_transfer_without_waiting_for_its_deadline() {
        let config = Arc::new(ClusterConfig {
            migration_timeout: Duration::from_secs(3600),
            ..ClusterConfig::default()
        });
        let executor = MigrationExecutor::new(config, Arc::new(HangingClient));
        executor.start().await;

        let plan = MigrationPlan {
            plan_id: "p1".into(),
            source: NodeId::new("a"),
            target: NodeId::new("b"),
            shard_ids: vec!["s1".into()],
            estimated_bytes: 4096,
            priority: 5,
        };
        let ids = executor.submit(vec![plan]).await;
        let task_id = &ids[0];

        // Give the dispatcher a moment to pick the task up and call transfer.
        for _ in 0..50 {
            if executor.task(task_id).await.unwrap().state == TaskState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(executor.task(task_id).await.unwrap().state, TaskState::Running);

        assert!(executor.cancel(task_id).await);

        let mut final_task = None;
        for _ in 0..200 {
            let task = executor.task(task_id).await.unwrap();
            if task.state.is_terminal() {
                final_task = Some(task);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let task = final_task.expect("cancelled task did not reach a terminal state promptly");
        assert_eq!(task.state, TaskState::Cancelled);
        executor.stop().await;
    }
}
