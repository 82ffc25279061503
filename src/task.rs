//! Distributed task manager
//!
//! Periodic jobs run on exactly one instance of the cluster. Each named
//! task has a permit record in a shared store; an instance owns a task by
//! winning a single-key compare-and-swap on that record and keeps it by
//! refreshing the lease every check interval. When an owner dies, its
//! lease expires and another instance takes over within one interval
//! plus jitter. Clock skew within the lease interval is tolerated: the
//! CAS admits at most one winner per interval.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::lifecycle::Lifecycle;
use crate::retry::backoff_with_jitter;
use crate::store::Store;

/// A registered periodic job
type TaskFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Permit record stored per task, visible to every instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Permit {
    #[serde(rename = "taskID")]
    pub task_id: String,

    #[serde(rename = "ownerInstanceID")]
    pub owner: String,

    /// Unix seconds until which the lease is held
    #[serde(rename = "leaseUntil")]
    pub lease_until: i64,
}

struct ScheduledTask {
    interval: Duration,
    run: TaskFn,
    /// Unix seconds of the next due run on this instance
    next_run: i64,
}

/// Cluster-wide scheduler for named periodic tasks
pub struct TaskManager {
    lifecycle: Lifecycle,
    store: Arc<dyn Store>,
    instance_id: String,
    check_interval: Duration,
    tasks: Mutex<HashMap<String, ScheduledTask>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskManager {
    pub fn new(store: Arc<dyn Store>, instance_id: impl Into<String>, check_interval: Duration) -> Self {
        Self {
            lifecycle: Lifecycle::new("task-manager"),
            store,
            instance_id: instance_id.into(),
            check_interval,
            tasks: Mutex::new(HashMap::new()),
            handle: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register a named periodic task. The closure runs only while this
    /// instance holds the task's permit.
    pub async fn register<F, Fut>(&self, task_id: &str, interval: Duration, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let run: TaskFn = Arc::new(move || {
            Box::pin(task()) as Pin<Box<dyn Future<Output = ()> + Send>>
        });

        let mut tasks = self.tasks.lock().await;
        tasks.insert(
            task_id.to_string(),
            ScheduledTask {
                interval,
                run,
                next_run: 0,
            },
        );

        info!(task = task_id, interval_secs = interval.as_secs(), "task registered");
    }

    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.handle.lock().await;
        let this = Arc::clone(self);

        self.lifecycle.start(|| {
            let mgr = Arc::clone(&this);
            *slot = Some(tokio::spawn(async move {
                // Jitter the first check so restarting instances don't
                // stampede the permit store.
                tokio::time::sleep(backoff_with_jitter(0, mgr.check_interval, mgr.check_interval))
                    .await;

                let mut ticker = tokio::time::interval(mgr.check_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    ticker.tick().await;
                    mgr.tick().await;
                }
            }));

            info!(instance = %this.instance_id, "task manager started");
        });
    }

    pub async fn stop(&self) {
        let mut handle = self.handle.lock().await;
        self.lifecycle.stop(|| {
            if let Some(h) = handle.take() {
                h.abort();
            }
        });
    }

    /// One scheduling pass: try to hold the permit of every registered
    /// task and run the ones that are due. Public so tests can drive the
    /// scheduler deterministically.
    pub async fn tick(&self) {
        let now = Utc::now().timestamp();
        let mut tasks = self.tasks.lock().await;

        for (task_id, task) in tasks.iter_mut() {
            match self.acquire_permit(task_id, now).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(task = %task_id, "standing by; permit held elsewhere");
                    continue;
                }
                Err(e) => {
                    warn!(task = %task_id, error = %e, "permit acquisition failed");
                    continue;
                }
            }

            if now >= task.next_run {
                task.next_run = now + task.interval.as_secs() as i64;

                debug!(task = %task_id, "running task");
                (task.run)().await;
            }
        }
    }

    /// Acquire or refresh the permit for a task. The lease spans two
    /// check intervals so a single missed refresh does not lose the task.
    async fn acquire_permit(&self, task_id: &str, now: i64) -> Result<bool> {
        let lease = Permit {
            task_id: task_id.to_string(),
            owner: self.instance_id.clone(),
            lease_until: now + 2 * self.check_interval.as_secs().max(1) as i64,
        };
        let new_bytes = serde_json::to_vec(&lease)
            .map_err(|e| Error::permanent(format!("encode permit: {e}")))?;

        let current = match self.store.get(task_id).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(Error::transient(format!("read permit [{task_id}]: {e}"))),
        };

        match current {
            None => self
                .store
                .compare_and_swap(task_id, None, &new_bytes)
                .await
                .map_err(|e| Error::transient(format!("claim permit [{task_id}]: {e}"))),
            Some(bytes) => {
                let permit: Permit = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::permanent(format!("decode permit [{task_id}]: {e}")))?;

                if permit.owner != self.instance_id && permit.lease_until >= now {
                    return Ok(false);
                }

                if permit.owner != self.instance_id {
                    info!(task = %task_id, previous = %permit.owner,
                        "taking over task with expired lease");
                }

                self.store
                    .compare_and_swap(task_id, Some(&bytes), &new_bytes)
                    .await
                    .map_err(|e| Error::transient(format!("refresh permit [{task_id}]: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(store: Arc<dyn Store>, id: &str) -> Arc<TaskManager> {
        Arc::new(TaskManager::new(store, id, Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn test_single_instance_runs_task() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new("task-permit"));
        let mgr = manager(Arc::clone(&store), "instance-1");

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        mgr.register("sweep", Duration::from_secs(0), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;

        mgr.tick().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_only_one_instance_holds_permit() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new("task-permit"));
        let a = manager(Arc::clone(&store), "instance-a");
        let b = manager(Arc::clone(&store), "instance-b");

        let runs_a = Arc::new(AtomicUsize::new(0));
        let runs_b = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs_a);
        a.register("sweep", Duration::from_secs(0), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;

        let counter = Arc::clone(&runs_b);
        b.register("sweep", Duration::from_secs(0), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;

        // A claims the permit; B must stand by on every subsequent tick.
        a.tick().await;
        b.tick().await;
        a.tick().await;
        b.tick().await;

        assert!(runs_a.load(Ordering::SeqCst) >= 1);
        assert_eq!(runs_b.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_takeover_after_lease_expiry() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new("task-permit"));

        // A stale permit from a dead instance.
        let stale = Permit {
            task_id: "sweep".to_string(),
            owner: "dead-instance".to_string(),
            lease_until: Utc::now().timestamp() - 60,
        };
        store
            .put("sweep", &serde_json::to_vec(&stale).unwrap(), &[])
            .await
            .unwrap();

        let mgr = manager(Arc::clone(&store), "instance-b");
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        mgr.register("sweep", Duration::from_secs(0), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;

        mgr.tick().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let permit: Permit =
            serde_json::from_slice(&store.get("sweep").await.unwrap()).unwrap();
        assert_eq!(permit.owner, "instance-b");
    }

    #[tokio::test]
    async fn test_live_lease_not_stolen() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new("task-permit"));

        let live = Permit {
            task_id: "sweep".to_string(),
            owner: "other-instance".to_string(),
            lease_until: Utc::now().timestamp() + 60,
        };
        store
            .put("sweep", &serde_json::to_vec(&live).unwrap(), &[])
            .await
            .unwrap();

        let mgr = manager(Arc::clone(&store), "instance-b");
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        mgr.register("sweep", Duration::from_secs(0), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;

        mgr.tick().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let permit: Permit =
            serde_json::from_slice(&store.get("sweep").await.unwrap()).unwrap();
        assert_eq!(permit.owner, "other-instance");
    }
}
