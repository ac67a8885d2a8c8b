use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::api::{PollFailure, TaskStatusReport, TaskStatusSource};
use crate::config::AppConfig;

/// Fixed message for a task id the backend no longer knows about.
pub const TASK_GONE_MESSAGE: &str = "The task no longer exists or was already completed";

const GENERIC_POLL_ERROR: &str = "Error checking task status";
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(60);

pub type CompleteCallback = Arc<dyn Fn(Value) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Capability record attached to one tracked job: the id plus the callbacks
/// the registry promises to run at most once, on terminal transition.
pub struct TaskSubscription {
    pub id: String,
    on_complete: Option<CompleteCallback>,
    on_error: Option<ErrorCallback>,
}

impl TaskSubscription {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            on_complete: None,
            on_error: None,
        }
    }

    pub fn on_complete(mut self, callback: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorState {
    #[default]
    Idle,
    Polling,
    Completed,
    Failed,
}

/// Last observed state of one monitor, shared with whatever surface renders
/// the inline progress view.
#[derive(Debug, Clone, Default)]
pub struct TaskSnapshot {
    pub state: MonitorState,
    pub report: Option<TaskStatusReport>,
    pub error: Option<String>,
}

struct MonitorHandle {
    alive: Arc<AtomicBool>,
    snapshot: Arc<Mutex<TaskSnapshot>>,
    join: JoinHandle<()>,
}

/// Process-wide store of in-flight jobs. Owns exactly one polling monitor
/// per tracked id; performs no polling itself.
#[derive(Clone)]
pub struct TaskRegistry {
    source: Arc<dyn TaskStatusSource>,
    poll_interval: Duration,
    decay: Duration,
    tasks: Arc<Mutex<HashMap<String, MonitorHandle>>>,
}

impl TaskRegistry {
    pub fn new(source: Arc<dyn TaskStatusSource>, poll_interval: Duration, decay: Duration) -> Self {
        Self {
            source,
            poll_interval,
            decay,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(source: Arc<dyn TaskStatusSource>, config: &AppConfig) -> Self {
        Self::new(
            source,
            Duration::from_millis(config.task_poll_interval_ms),
            Duration::from_secs(config.task_decay_secs),
        )
    }

    /// Starts tracking a job and returns the live snapshot for rendering.
    /// A blank id never starts a monitor; the snapshot stays `Idle`.
    pub fn add_task(&self, subscription: TaskSubscription) -> Arc<Mutex<TaskSnapshot>> {
        let snapshot = Arc::new(Mutex::new(TaskSnapshot::default()));
        let id = subscription.id.trim().to_string();
        if id.is_empty() {
            debug!("ignoring task subscription with a blank id");
            return snapshot;
        }

        self.remove_task(&id);

        let alive = Arc::new(AtomicBool::new(true));
        snapshot.lock().state = MonitorState::Polling;
        let join = tokio::spawn(run_monitor(
            Arc::clone(&self.source),
            Arc::clone(&self.tasks),
            subscription,
            Arc::clone(&alive),
            Arc::clone(&snapshot),
            self.poll_interval,
            self.decay,
        ));

        let handle = MonitorHandle {
            alive: Arc::clone(&alive),
            snapshot: Arc::clone(&snapshot),
            join,
        };
        let mut tasks = self.tasks.lock();
        // The monitor may already have finished and deregistered itself;
        // only a still-live monitor gets an entry.
        if alive.load(Ordering::SeqCst) {
            tasks.insert(id, handle);
        }
        snapshot
    }

    /// Stops observing a job. Cancels the pending poll and makes any
    /// in-flight response a no-op. Removing an unknown id does nothing; the
    /// server-side job itself is never cancelled.
    pub fn remove_task(&self, id: &str) {
        if let Some(handle) = self.tasks.lock().remove(id) {
            handle.alive.store(false, Ordering::SeqCst);
            handle.join.abort();
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.lock().contains_key(id)
    }

    pub fn tracked(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn snapshot(&self, id: &str) -> Option<TaskSnapshot> {
        self.tasks.lock().get(id).map(|handle| handle.snapshot.lock().clone())
    }
}

/// Per-job polling loop: `Polling → {Completed, Failed}`. At most one
/// outstanding request exists at any time; the next poll is scheduled only
/// after the previous one resolves.
async fn run_monitor(
    source: Arc<dyn TaskStatusSource>,
    tasks: Arc<Mutex<HashMap<String, MonitorHandle>>>,
    mut subscription: TaskSubscription,
    alive: Arc<AtomicBool>,
    snapshot: Arc<Mutex<TaskSnapshot>>,
    base_interval: Duration,
    decay: Duration,
) {
    let mut wait = base_interval;
    loop {
        if !alive.load(Ordering::SeqCst) {
            return;
        }
        let outcome = source.poll_task_status(&subscription.id).await;
        if !alive.load(Ordering::SeqCst) {
            // Torn down while the request was in flight; drop the response.
            return;
        }

        match outcome {
            Ok(report) if report.is_completed() => {
                let result = report.result.clone().unwrap_or(Value::Null);
                {
                    let mut snap = snapshot.lock();
                    snap.state = MonitorState::Completed;
                    snap.report = Some(report);
                    snap.error = None;
                }
                if let Some(callback) = subscription.on_complete.take() {
                    callback(result);
                }
                // Keep the finished entry visible briefly, then deregister
                // unless the caller dismissed it first.
                sleep(decay).await;
                if alive.swap(false, Ordering::SeqCst) {
                    let mut map = tasks.lock();
                    let is_own_entry = map
                        .get(&subscription.id)
                        .map(|handle| Arc::ptr_eq(&handle.alive, &alive))
                        .unwrap_or(false);
                    if is_own_entry {
                        map.remove(&subscription.id);
                    }
                }
                return;
            }
            Ok(report) if report.is_failed() => {
                let message = report
                    .message
                    .clone()
                    .unwrap_or_else(|| GENERIC_POLL_ERROR.to_string());
                fail(&snapshot, Some(report), &mut subscription, message);
                return;
            }
            Ok(report) => {
                {
                    let mut snap = snapshot.lock();
                    snap.state = MonitorState::Polling;
                    snap.report = Some(report);
                    snap.error = None;
                }
                wait = base_interval;
                sleep(wait).await;
            }
            Err(PollFailure::NotFound) => {
                // The job is gone; retrying cannot bring it back.
                fail(&snapshot, None, &mut subscription, TASK_GONE_MESSAGE.to_string());
                return;
            }
            Err(PollFailure::Timeout) => {
                wait = (wait * 2).min(MAX_POLL_BACKOFF);
                warn!(
                    task_id = %subscription.id,
                    "status poll timed out; retrying in {:?}", wait
                );
                sleep(wait).await;
            }
            Err(PollFailure::Other(message)) => {
                let message = if message.trim().is_empty() {
                    GENERIC_POLL_ERROR.to_string()
                } else {
                    message
                };
                fail(&snapshot, None, &mut subscription, message);
                return;
            }
        }
    }
}

fn fail(
    snapshot: &Arc<Mutex<TaskSnapshot>>,
    report: Option<TaskStatusReport>,
    subscription: &mut TaskSubscription,
    message: String,
) {
    {
        let mut snap = snapshot.lock();
        snap.state = MonitorState::Failed;
        if let Some(report) = report {
            snap.report = Some(report);
        }
        snap.error = Some(message.clone());
    }
    if let Some(callback) = subscription.on_error.take() {
        callback(message);
    }
}

// --- Stage display model ---------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFamily {
    Import,
    CrossReference,
}

#[derive(Debug, Clone, Copy)]
pub struct StageSpec {
    pub key: &'static str,
    pub label: &'static str,
    /// Bulk-processing phases carry a sub-progress bar while active.
    pub bulk: bool,
}

pub const IMPORT_STAGES: &[StageSpec] = &[
    StageSpec { key: "reading_file", label: "Reading file", bulk: false },
    StageSpec { key: "parsing_mapping", label: "Applying column mapping", bulk: false },
    StageSpec { key: "preparing_data", label: "Building data structures", bulk: true },
    StageSpec { key: "processing", label: "Processing records", bulk: true },
];

pub const CROSS_REFERENCE_STAGES: &[StageSpec] = &[
    StageSpec { key: "analyzing", label: "Analyzing available data", bulk: false },
    StageSpec { key: "external_search", label: "Searching external sources", bulk: false },
    StageSpec { key: "lpr_search", label: "Searching LPR readings", bulk: false },
    StageSpec { key: "optimizing", label: "Optimizing the cross-reference", bulk: false },
    StageSpec { key: "crossing", label: "Crossing data", bulk: false },
    StageSpec { key: "formatting", label: "Formatting results", bulk: false },
];

pub fn stages_for(family: JobFamily) -> &'static [StageSpec] {
    match family {
        JobFamily::Import => IMPORT_STAGES,
        JobFamily::CrossReference => CROSS_REFERENCE_STAGES,
    }
}

pub fn family_for_stage(stage: &str) -> JobFamily {
    if CROSS_REFERENCE_STAGES.iter().any(|spec| spec.key == stage) {
        JobFamily::CrossReference
    } else {
        JobFamily::Import
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StagePhase {
    Done,
    Active {
        progress: Option<f64>,
        total: Option<u64>,
    },
    Failed,
    Pending,
}

#[derive(Debug, Clone)]
pub struct StageRow {
    pub key: &'static str,
    pub label: &'static str,
    pub phase: StagePhase,
}

/// Classifies every stage of the job's family against the latest report:
/// stages before the current one are done, the current one is active (or
/// failed), later ones are pending. A completed job marks everything done.
pub fn stage_rows(report: &TaskStatusReport) -> Vec<StageRow> {
    let Some(stage) = report.stage.as_deref() else {
        return Vec::new();
    };
    let specs = stages_for(family_for_stage(stage));
    let current = specs.iter().position(|spec| spec.key == stage);

    specs
        .iter()
        .enumerate()
        .map(|(idx, spec)| {
            let phase = if report.is_completed() || current.map(|c| idx < c).unwrap_or(false) {
                StagePhase::Done
            } else if Some(idx) == current && report.is_failed() {
                StagePhase::Failed
            } else if Some(idx) == current {
                StagePhase::Active {
                    progress: spec.bulk.then_some(report.progress),
                    total: if spec.bulk { report.total } else { None },
                }
            } else {
                StagePhase::Pending
            };
            StageRow {
                key: spec.key,
                label: spec.label,
                phase,
            }
        })
        .collect()
}
