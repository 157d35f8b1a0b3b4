use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use thiserror::Error;

use crate::executor::{ExecError, HostExecutor, SchedulerMode, Scope, JOBID_VAR_PROCNAME_UID};
use crate::fs::{AttachError, Filesystem};
use crate::metrics::{metadata_query, throughput_query, MetricsSource};
use crate::policy::{admit, QosPolicy, QosUser, ThrottleDecision};
use crate::registry::{enforce_scope_mode, RuleRegistry};
use crate::usage::{accumulate, bytes_to_mib, ScopeUsage, Uid};
use crate::window::{window_start, Tick, Ticker};

/// The polling period of the worker loop. Roll-over is detected from the
/// wall clock at each tick, so this only bounds reaction latency.
const INNER_TICK_PERIOD: Duration = Duration::from_secs(1);

// Positional column contracts of the two metric queries.
const THROUGHPUT_COLUMNS: usize = 4;
const THROUGHPUT_JOB_ID_COLUMN: usize = 2;
const THROUGHPUT_VALUE_COLUMN: usize = 3;
const METADATA_COLUMNS: usize = 3;
const METADATA_JOB_ID_COLUMN: usize = 1;
const METADATA_VALUE_COLUMN: usize = 2;

#[derive(Error, Debug)]
pub enum QosError {
    #[error(transparent)]
    AlreadyAttached(#[from] AttachError),
    #[error("Cannot {operation} QoS of file system [{fsname}] while [{phase}]")]
    Busy {
        fsname: String,
        operation: &'static str,
        phase: Lifecycle,
    },
    #[error("Failed to set the jobid variable: {0}")]
    JobidVarError(#[source] ExecError),
    #[error("Failed to enable TBF scheduling: {0}")]
    EnableSchedulerError(#[source] ExecError),
    #[error("Failed to restore FIFO scheduling: {0}")]
    DisableSchedulerError(#[source] ExecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
    /// The worker exited without an orderly disable; throttles are no longer
    /// being managed even though QoS was not switched off.
    Failed,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lifecycle::Disabled => write!(f, "disabled"),
            Lifecycle::Enabling => write!(f, "enabling"),
            Lifecycle::Enabled => write!(f, "enabled"),
            Lifecycle::Disabling => write!(f, "disabling"),
            Lifecycle::Failed => write!(f, "failed"),
        }
    }
}

/// A point-in-time view of the controller for the admin surface.
#[derive(Debug, Clone)]
pub struct QosStatus {
    pub lifecycle: Lifecycle,
    pub window_index: Option<u64>,
    pub throughput_usage: BTreeMap<Uid, u64>,
    pub metadata_usage: BTreeMap<Uid, u64>,
    pub throttled_data_uids: Vec<Uid>,
    pub throttled_metadata_uids: Vec<Uid>,
    pub dropped_rows: u64,
    pub last_cycle: Option<chrono::DateTime<chrono::Utc>>,
}

// What the worker publishes after each cycle. Kept separate from the
// lifecycle so that reading status never waits on an in-flight RPC.
#[derive(Debug, Clone, Default)]
struct CycleSnapshot {
    window_index: Option<u64>,
    throughput_usage: BTreeMap<Uid, u64>,
    metadata_usage: BTreeMap<Uid, u64>,
    throttled_data_uids: Vec<Uid>,
    throttled_metadata_uids: Vec<Uid>,
    dropped_rows: u64,
    last_cycle: Option<chrono::DateTime<chrono::Utc>>,
}

struct WorkerHandle {
    cancel: tokio::sync::watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

struct LifecycleState {
    phase: Lifecycle,
    worker: Option<WorkerHandle>,
}

/// The per-filesystem decay QoS controller. At each window roll-over all
/// throttle rules are cleared; usage then re-accumulates from the metrics
/// store and users exceeding their budget are throttled on every server
/// until the next roll-over hands them a fresh budget.
pub struct DecayQos {
    fs: Arc<Filesystem>,
    executor: Arc<dyn HostExecutor>,
    metrics: Arc<dyn MetricsSource>,
    policy: QosPolicy,
    metrics_server: String,
    lifecycle: Arc<Mutex<LifecycleState>>,
    snapshot: Arc<Mutex<CycleSnapshot>>,
    log: slog::Logger,
}

impl DecayQos {
    /// Attach a controller to the filesystem. Fails if one is already
    /// attached.
    pub fn new(
        fs: Arc<Filesystem>,
        executor: Arc<dyn HostExecutor>,
        metrics: Arc<dyn MetricsSource>,
        policy: QosPolicy,
        metrics_server: String,
        log: slog::Logger,
    ) -> Result<DecayQos, QosError> {
        fs.attach_qos()?;
        Ok(DecayQos {
            fs,
            executor,
            metrics,
            policy,
            metrics_server,
            lifecycle: Arc::new(Mutex::new(LifecycleState {
                phase: Lifecycle::Disabled,
                worker: None,
            })),
            snapshot: Arc::new(Mutex::new(CycleSnapshot::default())),
            log,
        })
    }

    pub async fn enable(&self) -> Result<(), QosError> {
        {
            let mut state = self.lifecycle.lock().unwrap();
            match state.phase {
                Lifecycle::Disabled => state.phase = Lifecycle::Enabling,
                Lifecycle::Enabled => {
                    slog::info!(self.log, "QoS is already enabled"; "fs" => self.fs.fsname());
                    return Ok(());
                }
                phase => {
                    return Err(QosError::Busy {
                        fsname: self.fs.fsname().to_owned(),
                        operation: "enable",
                        phase,
                    })
                }
            }
        }

        if let Err(e) = self.prepare_servers().await {
            // Scheduler state on the servers is left as is; re-running enable
            // after operator intervention will converge it.
            slog::error!(self.log, "failed to enable QoS";
                "fs" => self.fs.fsname(), "error" => e.to_string());
            self.lifecycle.lock().unwrap().phase = Lifecycle::Disabled;
            return Err(e);
        }

        let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
        let registry = RuleRegistry::new(
            self.executor.clone(),
            self.fs.clone(),
            self.log.new(slog::o!("subsystem" => "rule_registry")),
        );
        let worker = Worker {
            fs: self.fs.clone(),
            metrics: self.metrics.clone(),
            policy: self.policy.clone(),
            registry,
            cancel: cancel_rx,
            snapshot: self.snapshot.clone(),
            // Weak so a dropped controller closes the cancel channel instead
            // of the worker keeping its own lifecycle state alive.
            lifecycle: Arc::downgrade(&self.lifecycle),
            current_window: None,
            log: self
                .log
                .new(slog::o!("subsystem" => "qos_worker", "fs" => self.fs.fsname().to_owned())),
        };
        let join = tokio::task::spawn(async move { worker.run().await });

        let mut state = self.lifecycle.lock().unwrap();
        state.phase = Lifecycle::Enabled;
        state.worker = Some(WorkerHandle {
            cancel: cancel_tx,
            join,
        });
        slog::info!(self.log, "started QoS"; "fs" => self.fs.fsname());
        Ok(())
    }

    pub async fn disable(&self) -> Result<(), QosError> {
        let handle = {
            let mut state = self.lifecycle.lock().unwrap();
            match state.phase {
                Lifecycle::Disabled => {
                    slog::info!(self.log, "QoS is already disabled"; "fs" => self.fs.fsname());
                    return Ok(());
                }
                // A disable is already draining the worker.
                Lifecycle::Disabling => return Ok(()),
                Lifecycle::Enabling => {
                    return Err(QosError::Busy {
                        fsname: self.fs.fsname().to_owned(),
                        operation: "disable",
                        phase: Lifecycle::Enabling,
                    })
                }
                Lifecycle::Enabled | Lifecycle::Failed => {
                    state.phase = Lifecycle::Disabling;
                    state.worker.take()
                }
            }
        };

        if let Some(handle) = handle {
            // An in-flight query or remote command is allowed to finish; the
            // worker stops at its next suspension point.
            let _ = handle.cancel.send(true);
            if let Err(e) = handle.join.await {
                slog::error!(self.log, "QoS worker ended abnormally"; "error" => e.to_string());
            }
        }

        let restored = self.restore_fifo().await;

        *self.snapshot.lock().unwrap() = CycleSnapshot::default();
        self.lifecycle.lock().unwrap().phase = Lifecycle::Disabled;

        match restored {
            Ok(()) => {
                slog::info!(self.log, "stopped QoS"; "fs" => self.fs.fsname());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn status(&self) -> QosStatus {
        let lifecycle = self.lifecycle.lock().unwrap().phase;
        let snapshot = self.snapshot.lock().unwrap().clone();
        QosStatus {
            lifecycle,
            window_index: snapshot.window_index,
            throughput_usage: snapshot.throughput_usage,
            metadata_usage: snapshot.metadata_usage,
            throttled_data_uids: snapshot.throttled_data_uids,
            throttled_metadata_uids: snapshot.throttled_metadata_uids,
            dropped_rows: snapshot.dropped_rows,
            last_cycle: snapshot.last_cycle,
        }
    }

    /// The admin protocol representation: the ordered option names when
    /// neither status nor structure is requested, the concrete values
    /// otherwise.
    pub fn encode(&self, need_status: bool, need_structure: bool) -> serde_json::Value {
        if !need_structure && !need_status {
            return serde_json::json!([
                "enabled",
                "interval",
                "mbps_threshold",
                "throttled_oss_rpc_rate",
                "iops_threshold",
                "throttled_mds_rpc_rate",
                "metrics_collect_interval",
                "metrics_server",
                "users",
            ]);
        }

        let mut users: Vec<&QosUser> = self.policy.users.values().collect();
        users.sort_by(|a, b| a.uid.cmp(&b.uid));
        serde_json::json!({
            "enabled": self.lifecycle.lock().unwrap().phase == Lifecycle::Enabled,
            "interval": self.policy.window_length.as_secs(),
            "mbps_threshold": self.policy.default_user.mbps_threshold,
            "throttled_oss_rpc_rate": self.policy.default_user.throttled_oss_rpc_rate,
            "iops_threshold": self.policy.default_user.iops_threshold,
            "throttled_mds_rpc_rate": self.policy.default_user.throttled_mds_rpc_rate,
            "metrics_collect_interval": self.policy.collect_interval.as_secs(),
            "metrics_server": self.metrics_server,
            "users": users
                .iter()
                .map(|user| user.encode(need_status, need_structure))
                .collect::<Vec<serde_json::Value>>(),
        })
    }

    async fn prepare_servers(&self) -> Result<(), QosError> {
        // Without per-process-per-UID job ids the metrics rows cannot be
        // attributed to users, so this must hold before anything else.
        self.executor
            .set_jobid_var(self.fs.mgs_host(), self.fs.fsname(), JOBID_VAR_PROCNAME_UID)
            .await
            .map_err(QosError::JobidVarError)?;
        enforce_scope_mode(
            self.executor.as_ref(),
            self.fs.as_ref(),
            Scope::Data,
            SchedulerMode::Tbf,
            &self.log,
        )
        .await
        .map_err(QosError::EnableSchedulerError)?;
        enforce_scope_mode(
            self.executor.as_ref(),
            self.fs.as_ref(),
            Scope::Metadata,
            SchedulerMode::Tbf,
            &self.log,
        )
        .await
        .map_err(QosError::EnableSchedulerError)?;
        Ok(())
    }

    async fn restore_fifo(&self) -> Result<(), QosError> {
        enforce_scope_mode(
            self.executor.as_ref(),
            self.fs.as_ref(),
            Scope::Data,
            SchedulerMode::Fifo,
            &self.log,
        )
        .await
        .map_err(QosError::DisableSchedulerError)?;
        enforce_scope_mode(
            self.executor.as_ref(),
            self.fs.as_ref(),
            Scope::Metadata,
            SchedulerMode::Fifo,
            &self.log,
        )
        .await
        .map_err(QosError::DisableSchedulerError)?;
        Ok(())
    }
}

impl Drop for DecayQos {
    fn drop(&mut self) {
        // The worker only holds a weak reference to the lifecycle state, so
        // dropping the controller closes the cancel channel and a still
        // running worker stops at its next suspension point.
        self.fs.detach_qos();
    }
}

struct Worker {
    fs: Arc<Filesystem>,
    metrics: Arc<dyn MetricsSource>,
    policy: QosPolicy,
    registry: RuleRegistry,
    cancel: tokio::sync::watch::Receiver<bool>,
    snapshot: Arc<Mutex<CycleSnapshot>>,
    lifecycle: Weak<Mutex<LifecycleState>>,
    current_window: Option<u64>,
    log: slog::Logger,
}

// Marks the lifecycle failed when the worker ends without a pending cancel,
// including an unwind from a panic part way through a cycle. The throttle
// loop is dead at that point even though QoS was never switched off, and
// status() has to say so.
struct WorkerExitGuard {
    lifecycle: Weak<Mutex<LifecycleState>>,
    cancel: tokio::sync::watch::Receiver<bool>,
    log: slog::Logger,
}

impl Drop for WorkerExitGuard {
    fn drop(&mut self) {
        if *self.cancel.borrow() {
            return;
        }
        let lifecycle = match self.lifecycle.upgrade() {
            // The controller itself is gone; there is no state left to mark.
            None => return,
            Some(lifecycle) => lifecycle,
        };
        if let Ok(mut state) = lifecycle.lock() {
            if state.phase == Lifecycle::Enabled {
                state.phase = Lifecycle::Failed;
                slog::error!(self.log, "QoS worker died without an orderly disable");
            }
        };
    }
}

impl Worker {
    async fn run(mut self) {
        let _exit_guard = WorkerExitGuard {
            lifecycle: self.lifecycle.clone(),
            cancel: self.cancel.clone(),
            log: self.log.clone(),
        };
        let mut ticker = Ticker::new(
            INNER_TICK_PERIOD,
            self.policy.window_length,
            self.cancel.clone(),
        );
        loop {
            match ticker.tick().await {
                Tick::Cancelled => break,
                Tick::Time { now, window_index } => {
                    self.run_cycle(now, window_index).await;
                }
            }
        }
        slog::info!(self.log, "quitting QoS worker");
    }

    fn cancel_pending(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn run_cycle(&mut self, now: u64, window_index: u64) {
        if self.cancel_pending() {
            return;
        }

        if self.current_window != Some(window_index) {
            // Roll-over: every user gets a fresh budget. Nothing else may
            // happen this cycle until the old rules are gone.
            slog::debug!(self.log, "window rolled over";
                "now" => now, "window_index" => window_index);
            match self.registry.clear_all().await {
                Ok(()) => self.current_window = Some(window_index),
                Err(e) => {
                    slog::error!(self.log, "failed to clear throttle rules, holding this cycle";
                        "error" => e.to_string());
                    return;
                }
            }
        }

        let start = window_start(window_index, self.policy.window_length);

        // The data scope completes before the metadata scope begins.
        let throughput = self.scope_pass(Scope::Data, start).await;
        let metadata = self.scope_pass(Scope::Metadata, start).await;

        let mut snapshot = self.snapshot.lock().unwrap();
        snapshot.window_index = self.current_window;
        if let Some(usage) = throughput {
            snapshot.dropped_rows += usage.dropped_rows;
            snapshot.throughput_usage = usage.totals;
        }
        if let Some(usage) = metadata {
            snapshot.dropped_rows += usage.dropped_rows;
            snapshot.metadata_usage = usage.totals;
        }
        snapshot.throttled_data_uids = self.registry.throttled_uids(Scope::Data);
        snapshot.throttled_metadata_uids = self.registry.throttled_uids(Scope::Metadata);
        snapshot.last_cycle = Some(chrono::Utc::now());
    }

    // One scope's share of a cycle: query, aggregate, admit, install. Any
    // failure skips the scope for this cycle and is retried on the next one.
    async fn scope_pass(&mut self, scope: Scope, start: u64) -> Option<ScopeUsage> {
        if self.cancel_pending() {
            return None;
        }

        let fsname = self.fs.fsname();
        let (query, columns, job_id_column, value_column) = match scope {
            Scope::Data => (
                throughput_query(fsname, start),
                THROUGHPUT_COLUMNS,
                THROUGHPUT_JOB_ID_COLUMN,
                THROUGHPUT_VALUE_COLUMN,
            ),
            Scope::Metadata => (
                metadata_query(fsname, start),
                METADATA_COLUMNS,
                METADATA_JOB_ID_COLUMN,
                METADATA_VALUE_COLUMN,
            ),
        };

        let rows = match self.metrics.query(&query).await {
            Ok(rows) => rows,
            Err(e) => {
                slog::info!(self.log, "metrics query failed, skipping scope this cycle";
                    "scope" => scope.to_string(), "error" => e.to_string());
                return None;
            }
        };
        if let Err(e) = rows.require_columns(columns) {
            slog::info!(self.log, "metrics result misshapen, skipping scope this cycle";
                "scope" => scope.to_string(), "error" => e.to_string());
            return None;
        }
        if rows.is_empty() {
            slog::debug!(self.log, "no usage in scope since window start";
                "scope" => scope.to_string(), "window_start" => start);
            return Some(ScopeUsage::default());
        }

        let usage = accumulate(
            &rows,
            job_id_column,
            value_column,
            self.policy.collect_interval.as_secs(),
        );
        let decisions = admit(scope, &usage, &self.policy);
        for decision in &decisions {
            if self.cancel_pending() {
                break;
            }
            self.log_decision(decision, start);
            if let Err(e) = self
                .registry
                .upsert(decision.scope, &decision.uid, decision.rate)
                .await
            {
                slog::warn!(self.log, "failed to install throttle rule, will retry next cycle";
                    "scope" => scope.to_string(),
                    "uid" => decision.uid.as_str(),
                    "error" => e.to_string());
            }
        }
        Some(usage)
    }

    fn log_decision(&self, decision: &ThrottleDecision, start: u64) {
        match decision.scope {
            Scope::Data => {
                slog::info!(self.log, "user exceeded throughput budget, throttling";
                    "uid" => decision.uid.as_str(),
                    "used_mib" => bytes_to_mib(decision.used),
                    "budget_mib" => bytes_to_mib(decision.budget),
                    "rpc_rate" => decision.rate,
                    "window_start" => start);
            }
            Scope::Metadata => {
                slog::info!(self.log, "user exceeded metadata budget, throttling";
                    "uid" => decision.uid.as_str(),
                    "used_ops" => decision.used,
                    "budget_ops" => decision.budget,
                    "rpc_rate" => decision.rate,
                    "window_start" => start);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::MockExecutor;
    use crate::metrics::{QueryError, Rows};
    use crate::registry::{LDLM_ENQUEUE_RATE, LDLM_ENQUEUE_RULE};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct MockMetrics {
        responses: Mutex<HashMap<&'static str, Rows>>,
        fail_scopes: Mutex<HashSet<&'static str>>,
        panic_scopes: Mutex<HashSet<&'static str>>,
        queries: Mutex<Vec<String>>,
    }

    impl MockMetrics {
        fn scope_key(query: &str) -> &'static str {
            if query.contains("ost_jobstats_bytes") {
                "data"
            } else {
                "metadata"
            }
        }

        fn set_rows(&self, key: &'static str, rows: Rows) {
            self.responses.lock().unwrap().insert(key, rows);
        }

        fn queried_scopes(&self) -> Vec<&'static str> {
            self.queries
                .lock()
                .unwrap()
                .iter()
                .map(|q| Self::scope_key(q))
                .collect()
        }
    }

    #[async_trait]
    impl MetricsSource for MockMetrics {
        async fn query(&self, query: &str) -> Result<Rows, QueryError> {
            self.queries.lock().unwrap().push(query.to_owned());
            let key = Self::scope_key(query);
            let should_panic = self.panic_scopes.lock().unwrap().contains(key);
            if should_panic {
                panic!("mock metrics panic");
            }
            if self.fail_scopes.lock().unwrap().contains(key) {
                return Err(QueryError::MalformedBody("mock failure".to_owned()));
            }
            Ok(self
                .responses
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .unwrap_or_default())
        }
    }

    fn throughput_rows(samples: &[(&str, u64)]) -> Rows {
        Rows {
            columns: ["time", "ost_index", "job_id", "value"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            values: samples
                .iter()
                .map(|(job_id, value)| {
                    vec![
                        serde_json::json!(1_550_000_000u64),
                        serde_json::json!("OST0000"),
                        serde_json::json!(job_id),
                        serde_json::json!(value),
                    ]
                })
                .collect(),
        }
    }

    fn metadata_rows(samples: &[(&str, u64)]) -> Rows {
        Rows {
            columns: ["time", "job_id", "value"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            values: samples
                .iter()
                .map(|(job_id, value)| {
                    vec![
                        serde_json::json!(1_550_000_000u64),
                        serde_json::json!(job_id),
                        serde_json::json!(value),
                    ]
                })
                .collect(),
        }
    }

    fn test_fs() -> Arc<Filesystem> {
        Arc::new(Filesystem::new(
            "lfs0".to_owned(),
            "mgs0".to_owned(),
            vec!["oss0".to_owned(), "oss1".to_owned()],
            vec!["mds0".to_owned()],
        ))
    }

    fn test_policy() -> QosPolicy {
        let default_user = QosUser {
            uid: "default".to_owned(),
            mbps_threshold: 100,
            throttled_oss_rpc_rate: 10,
            iops_threshold: 1000,
            throttled_mds_rpc_rate: 5,
        };
        let mut users = HashMap::new();
        users.insert(
            "1001".to_owned(),
            QosUser {
                uid: "1001".to_owned(),
                ..default_user.clone()
            },
        );
        users.insert(
            "1002".to_owned(),
            QosUser {
                uid: "1002".to_owned(),
                ..default_user.clone()
            },
        );
        QosPolicy {
            users,
            default_user,
            window_length: Duration::from_secs(60),
            collect_interval: Duration::from_secs(1),
        }
    }

    fn null_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn test_worker(
        fs: Arc<Filesystem>,
        executor: Arc<MockExecutor>,
        metrics: Arc<MockMetrics>,
    ) -> Worker {
        // The sender side drops immediately; the receiver keeps reporting
        // the last sent value (false), so cycles run uncancelled.
        let (_, cancel_rx) = tokio::sync::watch::channel(false);
        Worker {
            fs: fs.clone(),
            metrics,
            policy: test_policy(),
            registry: RuleRegistry::new(executor, fs, null_log()),
            cancel: cancel_rx,
            snapshot: Arc::new(Mutex::new(CycleSnapshot::default())),
            lifecycle: Weak::new(),
            current_window: None,
            log: null_log(),
        }
    }

    // 100 MB/s over a 60 s window.
    const THROUGHPUT_BUDGET: u64 = 100 * 1_048_576 * 60;

    #[tokio::test]
    async fn test_no_traffic_installs_nothing() {
        let fs = test_fs();
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        let mut worker = test_worker(fs, executor.clone(), metrics);

        worker.run_cycle(30, 0).await;

        assert!(worker.registry.is_empty());
        assert_eq!(executor.rule_count(), 0);
        let snapshot = worker.snapshot.lock().unwrap();
        assert_eq!(snapshot.window_index, Some(0));
        assert!(snapshot.last_cycle.is_some());
    }

    #[tokio::test]
    async fn test_over_throughput_throttles_data_servers_only() {
        let fs = test_fs();
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        metrics.set_rows("data", throughput_rows(&[("dd.1001", 7_340_032_000)]));
        let mut worker = test_worker(fs, executor.clone(), metrics);

        worker.run_cycle(30, 0).await;

        assert!(executor.has_rule("oss0", Scope::Data, "uid_1001"));
        assert!(executor.has_rule("oss1", Scope::Data, "uid_1001"));
        assert!(!executor.has_rule("mds0", Scope::Metadata, "uid_1001"));
        assert_eq!(worker.registry.throttled_uids(Scope::Data), vec!["1001"]);
        assert!(worker.registry.throttled_uids(Scope::Metadata).is_empty());
    }

    #[tokio::test]
    async fn test_over_metadata_throttles_with_standing_rule() {
        let fs = test_fs();
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        // 60001 ops against a 1000 ops/s * 60 s budget.
        metrics.set_rows("metadata", metadata_rows(&[("tar.1002", 60_001)]));
        let mut worker = test_worker(fs, executor.clone(), metrics);

        worker.run_cycle(30, 0).await;

        assert!(executor.has_rule("mds0", Scope::Metadata, "uid_1002"));
        assert_eq!(
            executor.rule_rate("mds0", Scope::Metadata, LDLM_ENQUEUE_RULE),
            Some(LDLM_ENQUEUE_RATE)
        );
        assert!(!executor.has_rule("oss0", Scope::Data, "uid_1002"));
    }

    #[tokio::test]
    async fn test_usage_at_budget_is_not_throttled() {
        let fs = test_fs();
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        metrics.set_rows("data", throughput_rows(&[("dd.1001", THROUGHPUT_BUDGET)]));
        let mut worker = test_worker(fs, executor.clone(), metrics.clone());

        worker.run_cycle(30, 0).await;
        assert!(worker.registry.is_empty());

        metrics.set_rows(
            "data",
            throughput_rows(&[("dd.1001", THROUGHPUT_BUDGET + 1)]),
        );
        worker.run_cycle(30, 0).await;
        assert_eq!(worker.registry.throttled_uids(Scope::Data), vec!["1001"]);
    }

    #[tokio::test]
    async fn test_unknown_uid_throttled_with_default_rate() {
        let fs = test_fs();
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        metrics.set_rows(
            "data",
            throughput_rows(&[("dd.9999", THROUGHPUT_BUDGET + 1)]),
        );
        let mut worker = test_worker(fs, executor.clone(), metrics);

        worker.run_cycle(30, 0).await;

        assert_eq!(
            executor.rule_rate("oss0", Scope::Data, "uid_9999"),
            Some(test_policy().default_user.throttled_oss_rpc_rate)
        );
    }

    #[tokio::test]
    async fn test_rollover_clears_then_reinstalls() {
        let fs = test_fs();
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        metrics.set_rows("data", throughput_rows(&[("dd.1001", 7_340_032_000)]));
        let mut worker = test_worker(fs, executor.clone(), metrics.clone());

        // Window 1 (now = 119 with a 60 s window).
        worker.run_cycle(119, 1).await;
        assert!(executor.has_rule("oss0", Scope::Data, "uid_1001"));
        let starts_first_window = executor.state.lock().unwrap().start_calls;

        // Window 2 (now = 120): the clear runs before any new decision, and
        // the still-noisy user is throttled again with fresh rules.
        worker.run_cycle(120, 2).await;
        assert_eq!(worker.current_window, Some(2));
        assert!(executor.has_rule("oss0", Scope::Data, "uid_1001"));
        assert!(executor.state.lock().unwrap().start_calls > starts_first_window);
        assert_eq!(
            worker.snapshot.lock().unwrap().window_index,
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_identical_cycles_are_idempotent() {
        let fs = test_fs();
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        metrics.set_rows("data", throughput_rows(&[("dd.1001", 7_340_032_000)]));
        metrics.set_rows("metadata", metadata_rows(&[("tar.1002", 60_001)]));
        let mut worker = test_worker(fs, executor.clone(), metrics);

        worker.run_cycle(30, 0).await;
        let rules_after_first = executor.rule_count();
        let starts_after_first = executor.state.lock().unwrap().start_calls;

        worker.run_cycle(30, 0).await;
        assert_eq!(executor.rule_count(), rules_after_first);
        assert_eq!(
            executor.state.lock().unwrap().start_calls,
            starts_after_first
        );
    }

    #[tokio::test]
    async fn test_clear_failure_skips_metric_queries() {
        let fs = test_fs();
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        let mut worker = test_worker(fs, executor.clone(), metrics.clone());
        executor.state.lock().unwrap().fail_list_rules = true;

        worker.run_cycle(30, 0).await;
        assert!(metrics.queries.lock().unwrap().is_empty());
        assert_eq!(worker.current_window, None);

        executor.state.lock().unwrap().fail_list_rules = false;
        worker.run_cycle(30, 0).await;
        assert_eq!(worker.current_window, Some(0));
        assert_eq!(metrics.queried_scopes(), vec!["data", "metadata"]);
    }

    #[tokio::test]
    async fn test_query_failure_skips_scope_but_not_the_other() {
        let fs = test_fs();
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        metrics.fail_scopes.lock().unwrap().insert("data");
        metrics.set_rows("metadata", metadata_rows(&[("tar.1002", 60_001)]));
        let mut worker = test_worker(fs, executor.clone(), metrics);

        worker.run_cycle(30, 0).await;

        assert!(worker.registry.throttled_uids(Scope::Data).is_empty());
        assert_eq!(
            worker.registry.throttled_uids(Scope::Metadata),
            vec!["1002"]
        );
    }

    #[tokio::test]
    async fn test_dropped_rows_surface_in_snapshot() {
        let fs = test_fs();
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        metrics.set_rows(
            "data",
            throughput_rows(&[("kworker/0:1", 10), ("dd.1001", 10)]),
        );
        let mut worker = test_worker(fs, executor, metrics);

        worker.run_cycle(30, 0).await;
        assert_eq!(worker.snapshot.lock().unwrap().dropped_rows, 1);
    }

    fn full_controller(
        executor: Arc<MockExecutor>,
        metrics: Arc<MockMetrics>,
    ) -> (Arc<Filesystem>, DecayQos) {
        let fs = test_fs();
        let qos = DecayQos::new(
            fs.clone(),
            executor,
            metrics,
            test_policy(),
            "esmon0".to_owned(),
            null_log(),
        )
        .unwrap();
        (fs, qos)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_double_attach_fails() {
        let fs = test_fs();
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        let first = DecayQos::new(
            fs.clone(),
            executor.clone(),
            metrics.clone(),
            test_policy(),
            "esmon0".to_owned(),
            null_log(),
        );
        assert!(first.is_ok());
        let second = DecayQos::new(
            fs.clone(),
            executor.clone(),
            metrics.clone(),
            test_policy(),
            "esmon0".to_owned(),
            null_log(),
        );
        assert!(matches!(second, Err(QosError::AlreadyAttached(_))));

        // Dropping the attached controller releases the filesystem for a
        // fresh attach.
        drop(first);
        let third = DecayQos::new(
            fs,
            executor,
            metrics,
            test_policy(),
            "esmon0".to_owned(),
            null_log(),
        );
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_enable_prepares_servers_and_starts_worker() {
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        metrics.set_rows("metadata", metadata_rows(&[("tar.1002", 60_001)]));
        let (_fs, qos) = full_controller(executor.clone(), metrics);

        qos.enable().await.unwrap();
        assert_eq!(qos.status().lifecycle, Lifecycle::Enabled);
        assert_eq!(
            executor.state.lock().unwrap().jobid_var.as_deref(),
            Some(JOBID_VAR_PROCNAME_UID)
        );
        assert_eq!(
            executor.mode_of("oss0", Scope::Data),
            Some(SchedulerMode::Tbf)
        );
        assert_eq!(
            executor.mode_of("mds0", Scope::Metadata),
            Some(SchedulerMode::Tbf)
        );

        // Enabling again is a no-op.
        qos.enable().await.unwrap();

        let check = executor.clone();
        wait_for(move || check.has_rule("mds0", Scope::Metadata, "uid_1002")).await;
        qos.disable().await.unwrap();
    }

    #[tokio::test]
    async fn test_enable_rolls_back_when_jobid_var_fails() {
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        executor.state.lock().unwrap().fail_jobid_var = true;
        let (_fs, qos) = full_controller(executor.clone(), metrics);

        assert!(matches!(
            qos.enable().await,
            Err(QosError::JobidVarError(_))
        ));
        assert_eq!(qos.status().lifecycle, Lifecycle::Disabled);
    }

    #[tokio::test]
    async fn test_enable_rolls_back_when_tbf_fails() {
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        executor.state.lock().unwrap().fail_scheduler_mode = true;
        let (_fs, qos) = full_controller(executor.clone(), metrics);

        assert!(matches!(
            qos.enable().await,
            Err(QosError::EnableSchedulerError(_))
        ));
        assert_eq!(qos.status().lifecycle, Lifecycle::Disabled);
    }

    #[tokio::test]
    async fn test_disable_while_throttled_restores_fifo() {
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        metrics.set_rows("metadata", metadata_rows(&[("tar.1002", 60_001)]));
        let (_fs, qos) = full_controller(executor.clone(), metrics);

        qos.enable().await.unwrap();
        let check = executor.clone();
        wait_for(move || check.has_rule("mds0", Scope::Metadata, "uid_1002")).await;

        qos.disable().await.unwrap();

        let status = qos.status();
        assert_eq!(status.lifecycle, Lifecycle::Disabled);
        assert!(status.throttled_metadata_uids.is_empty());
        assert_eq!(status.window_index, None);
        for (host, scope) in [
            ("oss0", Scope::Data),
            ("oss1", Scope::Data),
            ("mds0", Scope::Metadata),
        ] {
            assert_eq!(executor.mode_of(host, scope), Some(SchedulerMode::Fifo));
        }

        // Disabling again is a no-op.
        qos.disable().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_death_surfaces_as_failed() {
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        metrics.panic_scopes.lock().unwrap().insert("data");
        let (_fs, qos) = full_controller(executor.clone(), metrics);

        qos.enable().await.unwrap();
        // The first cycle panics inside the metrics query; the worker task
        // unwinds and the lifecycle has to report the dead loop.
        wait_for(|| qos.status().lifecycle == Lifecycle::Failed).await;

        // Disabling a failed controller still restores FIFO scheduling.
        qos.disable().await.unwrap();
        assert_eq!(qos.status().lifecycle, Lifecycle::Disabled);
        assert_eq!(
            executor.mode_of("oss0", Scope::Data),
            Some(SchedulerMode::Fifo)
        );
        assert_eq!(
            executor.mode_of("mds0", Scope::Metadata),
            Some(SchedulerMode::Fifo)
        );
    }

    #[tokio::test]
    async fn test_status_reflects_cycle_results() {
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        metrics.set_rows("data", throughput_rows(&[("dd.1001", 7_340_032_000)]));
        let (_fs, qos) = full_controller(executor.clone(), metrics);

        qos.enable().await.unwrap();
        let check = executor.clone();
        wait_for(move || check.has_rule("oss0", Scope::Data, "uid_1001")).await;

        let status = qos.status();
        assert_eq!(status.lifecycle, Lifecycle::Enabled);
        assert_eq!(status.throttled_data_uids, vec!["1001"]);
        assert_eq!(
            status.throughput_usage.get("1001"),
            Some(&7_340_032_000u64)
        );
        assert!(status.window_index.is_some());

        qos.disable().await.unwrap();
    }

    #[tokio::test]
    async fn test_encode_schema_and_values() {
        let executor = Arc::new(MockExecutor::new());
        let metrics = Arc::new(MockMetrics::default());
        let (_fs, qos) = full_controller(executor, metrics);

        let schema = qos.encode(false, false);
        let names: Vec<&str> = schema
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "enabled",
                "interval",
                "mbps_threshold",
                "throttled_oss_rpc_rate",
                "iops_threshold",
                "throttled_mds_rpc_rate",
                "metrics_collect_interval",
                "metrics_server",
                "users",
            ]
        );

        let values = qos.encode(true, false);
        assert_eq!(values["enabled"], false);
        assert_eq!(values["interval"], 60);
        assert_eq!(values["metrics_server"], "esmon0");
        assert_eq!(values["users"].as_array().unwrap().len(), 2);
        assert_eq!(values["users"][0]["uid"], "1001");
    }
}
