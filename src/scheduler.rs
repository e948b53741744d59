//! Cron-driven front door: a `task_id -> cron entry` map, a bounded
//! de-duplicating queue, and a single worker that drives the execution
//! pipeline.
//!
//! The Vault CLI Driver is already process-globally serialized (see
//! [`crate::vault_cli`]), so running pipelines in parallel here would only
//! add queue contention without any throughput gain — hence exactly one
//! worker.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::store::models::{BackupTask, Id};
use crate::store::Store;

struct CronEntry {
    ticker: JoinHandle<()>,
    cancel: oneshot::Sender<()>,
}

/// Owns the cron registry and the task queue. Constructed as an `Arc` since
/// cron tickers, the worker, and manual-trigger callers all hold a handle
/// to the same instance.
pub struct Scheduler {
    store: Arc<Store>,
    pipeline: Arc<Pipeline>,
    entries: RwLock<HashMap<Id, CronEntry>>,
    queue_tx: StdMutex<Option<mpsc::Sender<Id>>>,
    queue_rx: StdMutex<Option<mpsc::Receiver<Id>>>,
    queued: StdMutex<HashSet<Id>>,
    stopping: AtomicBool,
    worker: StdMutex<Option<JoinHandle<()>>>,
    graceful_stop_timeout: Duration,
}

impl Scheduler {
    pub fn new(settings: &Settings, store: Arc<Store>, pipeline: Arc<Pipeline>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(settings.queue_capacity);
        Arc::new(Self {
            store,
            pipeline,
            entries: RwLock::new(HashMap::new()),
            queue_tx: StdMutex::new(Some(tx)),
            queue_rx: StdMutex::new(Some(rx)),
            queued: StdMutex::new(HashSet::new()),
            stopping: AtomicBool::new(false),
            worker: StdMutex::new(None),
            graceful_stop_timeout: settings.graceful_stop_timeout,
        })
    }

    /// Starts the single worker. Must be called exactly once.
    pub fn start(self: &Arc<Self>) {
        let rx = self
            .queue_rx
            .lock()
            .unwrap()
            .take()
            .expect("scheduler started twice");
        let me = self.clone();
        let handle = tokio::spawn(async move { me.worker_loop(rx).await });
        *self.worker.lock().unwrap() = Some(handle);
        tracing::info!("scheduler worker started");
    }

    /// Loads every enabled task at startup. Tasks with an empty cron
    /// expression are counted as manual-only and never registered.
    pub async fn load_tasks(self: &Arc<Self>) -> Result<()> {
        let tasks = self.store.list_schedulable_tasks().await?;
        let mut scheduled = 0usize;
        let mut manual = 0usize;
        for task in tasks {
            if task.is_manual_only() {
                manual += 1;
                continue;
            }
            match self.add_task(&task).await {
                Ok(()) => scheduled += 1,
                Err(e) => tracing::error!(task = %task.name, "failed to add task: {e}"),
            }
        }
        tracing::info!(scheduled, manual, "tasks loaded");
        Ok(())
    }

    /// Registers a cron entry for `task`. Two distinct calls for the same
    /// task id produce two entries — callers must `remove_task` first;
    /// [`Scheduler::update_task`] enforces that.
    pub async fn add_task(self: &Arc<Self>, task: &BackupTask) -> Result<()> {
        let normalized = normalize_cron(&task.cron_expression)?;
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| Error::config(format!("invalid cron expression '{normalized}': {e}")))?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let me = self.clone();
        let task_id = task.id;
        let ticker = tokio::spawn(async move { me.run_ticker(task_id, schedule, cancel_rx).await });

        self.entries
            .write()
            .await
            .insert(task.id, CronEntry { ticker, cancel: cancel_tx });
        tracing::info!(task_id = task.id, name = %task.name, cron = %task.cron_expression, "task added");
        Ok(())
    }

    /// Removes the cron entry for `task_id`. A task currently executing is
    /// not interrupted — the ticker only stops future firings.
    pub async fn remove_task(&self, task_id: Id) {
        if let Some(entry) = self.entries.write().await.remove(&task_id) {
            let _ = entry.cancel.send(());
            entry.ticker.abort();
            tracing::info!(task_id, "task removed from scheduler");
        }
    }

    /// Remove then, if enabled and not manual-only, re-add.
    pub async fn update_task(self: &Arc<Self>, task: &BackupTask) -> Result<()> {
        self.remove_task(task.id).await;
        if task.enabled && !task.is_manual_only() {
            self.add_task(task).await?;
        } else {
            tracing::info!(task_id = task.id, name = %task.name, "task not scheduled (disabled or manual)");
        }
        Ok(())
    }

    /// Manual trigger: runs the pipeline under this same live scheduler
    /// instance (so it still contends only for the one process-global CLI
    /// mutex), as its own detached task, bypassing the queue and
    /// de-duplication set entirely since this is an explicit one-off
    /// request rather than a cron firing.
    pub fn execute_now(self: &Arc<Self>, task: BackupTask) -> JoinHandle<()> {
        let me = self.clone();
        tokio::spawn(async move {
            tracing::info!(task = %task.name, "manually executing task");
            me.execute(&task).await;
        })
    }

    /// Stops the cron engine, closes the queue, and waits up to the
    /// configured timeout for the worker to drain and exit.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);

        {
            let mut entries = self.entries.write().await;
            for (_, entry) in entries.drain() {
                let _ = entry.cancel.send(());
                entry.ticker.abort();
            }
        }

        // Dropping the sender closes the channel: the worker drains
        // whatever is already queued, then `recv()` returns `None`.
        self.queue_tx.lock().unwrap().take();

        let handle = self.worker.lock().unwrap().take();
        let Some(handle) = handle else { return };
        match tokio::time::timeout(self.graceful_stop_timeout, handle).await {
            Ok(Ok(())) => tracing::info!("scheduler worker stopped"),
            Ok(Err(e)) => tracing::error!("scheduler worker panicked during stop: {e}"),
            Err(_) => tracing::error!(
                "scheduler worker did not drain within {:?}, giving up",
                self.graceful_stop_timeout
            ),
        }
    }

    fn enqueue(&self, task_id: Id) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let mut queued = self.queued.lock().unwrap();
        let tx_guard = self.queue_tx.lock().unwrap();
        let Some(tx) = tx_guard.as_ref() else { return };
        if queued.contains(&task_id) {
            tracing::info!(task_id, "task already queued, skipping");
            return;
        }
        match tx.try_send(task_id) {
            Ok(()) => {
                queued.insert(task_id);
                tracing::info!(task_id, "task enqueued");
            }
            Err(_) => tracing::warn!(task_id, "task queue full, dropping task"),
        }
    }

    async fn worker_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Id>) {
        while let Some(task_id) = rx.recv().await {
            self.clone().process(task_id).await;
        }
        tracing::info!("scheduler worker exiting, queue drained");
    }

    /// Runs `process_inner` in its own task so a panic inside is caught
    /// (surfaced as a `JoinError`) rather than taking down the worker loop.
    /// `queued` is released only once this — including the panic case —
    /// has completed, which is what lets the next firing enqueue again.
    async fn process(self: Arc<Self>, task_id: Id) {
        let me = self.clone();
        let handle = tokio::spawn(async move { me.process_inner(task_id).await });
        if let Err(e) = handle.await {
            tracing::error!(task_id, "task execution panicked: {e}");
        }
        self.queued.lock().unwrap().remove(&task_id);
    }

    async fn process_inner(&self, task_id: Id) {
        let task = match self.store.get_task(task_id).await {
            Ok(Some(t)) => t,
            Ok(None) => {
                tracing::warn!(task_id, "task not found, skipping");
                return;
            }
            Err(e) => {
                tracing::error!(task_id, "failed to load task: {e}");
                return;
            }
        };
        if !task.enabled {
            tracing::info!(task_id, name = %task.name, "task disabled, skipping execution");
            return;
        }
        self.execute(&task).await;
    }

    async fn execute(&self, task: &BackupTask) {
        let start = Utc::now();
        let log_id = match self.store.create_running_log(task.id, start).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(task = %task.name, "failed to create backup log: {e}");
                return;
            }
        };
        if let Err(e) = self.pipeline.run(task, log_id).await {
            tracing::error!(task = %task.name, "pipeline run failed: {e}");
        }
    }

    async fn run_ticker(self: Arc<Self>, task_id: Id, schedule: Schedule, mut cancel: oneshot::Receiver<()>) {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    self.enqueue(task_id);
                }
                _ = &mut cancel => return,
            }
        }
    }
}

/// 5-field expressions (minute hour dom month dow) are normalized to
/// 6-field (second minute hour dom month dow) by prepending `"0 "`.
fn normalize_cron(expr: &str) -> Result<String> {
    let fields = expr.split_whitespace().count();
    match fields {
        5 => Ok(format!("0 {expr}")),
        6 => Ok(expr.to_string()),
        _ => Err(Error::config(format!(
            "cron expression must have 5 or 6 fields, got {fields}: '{expr}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_five_field_expressions() {
        assert_eq!(normalize_cron("*/5 * * * *").unwrap(), "0 */5 * * * *");
    }

    #[test]
    fn leaves_six_field_expressions_untouched() {
        assert_eq!(normalize_cron("30 */5 * * * *").unwrap(), "30 */5 * * * *");
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(normalize_cron("* * *").is_err());
        assert!(normalize_cron("* * * * * * *").is_err());
    }

    #[test]
    fn six_field_schedule_parses_after_normalization() {
        let normalized = normalize_cron("*/5 * * * *").unwrap();
        assert!(Schedule::from_str(&normalized).is_ok());
    }

    proptest::proptest! {
        /// §8 property 3: a 5-field expression always normalizes by
        /// prepending a `"0 "` seconds field; a 6-field one passes through
        /// unchanged. Fields are drawn from a safe cron alphabet, not
        /// required to parse as a valid schedule.
        #[test]
        fn normalize_cron_field_count_rule_holds(
            fields in proptest::collection::vec("[0-9*/,-]{1,4}", 5..=6)
        ) {
            let expr = fields.join(" ");
            let field_count = fields.len();
            let normalized = normalize_cron(&expr).unwrap();
            if field_count == 5 {
                proptest::prop_assert_eq!(normalized, format!("0 {expr}"));
            } else {
                proptest::prop_assert_eq!(normalized, expr);
            }
        }

        #[test]
        fn normalize_cron_rejects_other_field_counts(
            fields in proptest::collection::vec("[0-9*/,-]{1,4}", 1..=15)
        ) {
            proptest::prop_assume!(fields.len() != 5 && fields.len() != 6);
            let expr = fields.join(" ");
            proptest::prop_assert!(normalize_cron(&expr).is_err());
        }
    }

    fn test_settings() -> Settings {
        Settings {
            queue_capacity: 2,
            pipeline_deadline: Duration::from_secs(2),
            bw_binary: "vault-backup-test-nonexistent-bw".to_string(),
            ..Settings::default()
        }
    }

    async fn test_store() -> Arc<Store> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler-test.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let codec = crate::crypto::Codec::from_master_secret(b"test-master-secret-32-bytes-long");
        let store = Store::connect(&url, codec).await.unwrap();
        // Keep the temp directory alive for the rest of the test process;
        // these are short-lived unit tests, not a long-running leak.
        std::mem::forget(dir);
        Arc::new(store)
    }

    fn test_pipeline(settings: &Settings, store: Arc<Store>) -> Arc<Pipeline> {
        let cli_mutex = Arc::new(tokio::sync::Mutex::new(()));
        let registry = Arc::new(crate::providers::registry::Registry::new(settings, cli_mutex.clone()));
        Arc::new(Pipeline::new(settings.clone(), store, registry, cli_mutex))
    }

    #[tokio::test]
    async fn enqueue_skips_a_task_already_marked_queued() {
        let settings = test_settings();
        let store = test_store().await;
        let pipeline = test_pipeline(&settings, store.clone());
        let scheduler = Scheduler::new(&settings, store, pipeline);

        scheduler.queued.lock().unwrap().insert(42);
        scheduler.enqueue(42);

        let mut rx = scheduler.queue_rx.lock().unwrap().take().unwrap();
        assert!(rx.try_recv().is_err(), "de-duplicated firing must not reach the channel");
    }

    #[tokio::test]
    async fn enqueue_after_stop_is_dropped() {
        let settings = test_settings();
        let store = test_store().await;
        let pipeline = test_pipeline(&settings, store.clone());
        let scheduler = Scheduler::new(&settings, store, pipeline);

        scheduler.stopping.store(true, Ordering::SeqCst);
        scheduler.enqueue(7);

        let mut rx = scheduler.queue_rx.lock().unwrap().take().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn add_then_remove_task_clears_the_cron_entry() {
        let settings = test_settings();
        let store = test_store().await;
        let pipeline = test_pipeline(&settings, store.clone());
        let scheduler = Scheduler::new(&settings, store, pipeline);

        let task = BackupTask {
            id: 1,
            name: "yearly".to_string(),
            source_server_id: 1,
            // Once a year: won't fire during this test.
            cron_expression: "0 0 0 1 1 *".to_string(),
            enabled: true,
            destinations: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        scheduler.add_task(&task).await.unwrap();
        assert_eq!(scheduler.entries.read().await.len(), 1);

        scheduler.remove_task(task.id).await;
        assert_eq!(scheduler.entries.read().await.len(), 0);
    }

    #[tokio::test]
    async fn process_inner_skips_a_disabled_task() {
        let settings = test_settings();
        let store = test_store().await;
        let pipeline = test_pipeline(&settings, store.clone());
        let scheduler = Scheduler::new(&settings, store.clone(), pipeline);

        let mut server = crate::store::models::ServerConfig {
            id: 0,
            name: "source".to_string(),
            url: "https://vault.example.com".to_string(),
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            master_password: "pw".to_string(),
            is_official: false,
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.save_server_config(&mut server).await.unwrap();

        let mut task = BackupTask {
            id: 0,
            name: "disabled-task".to_string(),
            source_server_id: server.id,
            cron_expression: String::new(),
            enabled: false,
            destinations: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.save_task(&mut task).await.unwrap();

        // Should return without creating a BackupLog (and without ever
        // touching the vault CLI, since the task is disabled).
        scheduler.process_inner(task.id).await;
    }
}
