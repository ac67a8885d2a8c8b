pub mod activity;
pub mod api;
pub mod config;
pub mod errors;
pub mod fields;
pub mod import;
pub mod mapping;
pub mod notify;
pub mod readers;
pub mod tasks;
pub mod tracks;

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::activity::ActivityLog;
pub use crate::api::{
    BackendClient, CaseFile, CrossReferenceFilters, PollFailure, TaskHandle, TaskStatusReport,
    TaskStatusSource,
};
pub use crate::config::{AppConfig, PublicAppConfig};
pub use crate::errors::{AppError, AppResult};
pub use crate::fields::ImportKind;
pub use crate::import::{
    friendly_task_error, validate_extension, GateOutcome, ImportPipeline, PendingImport,
};
pub use crate::mapping::{ColumnMapping, DateTimeFormat};
pub use crate::notify::{Notice, NoticeCenter, NoticeLevel};
pub use crate::readers::{GateDecision, ReaderClass, ReaderEntry, ReaderValidationReport};
pub use crate::tasks::{
    stage_rows, MonitorState, StagePhase, StageRow, TaskRegistry, TaskSnapshot, TaskSubscription,
    TASK_GONE_MESSAGE,
};
pub use crate::tracks::{ParsedTrack, TrackPoint};

/// Everything a shell needs to drive the import pipeline: configuration,
/// the backend client, the task registry, the notice center and the
/// activity log, wired together once at startup.
pub struct AppState {
    config: AppConfig,
    api: BackendClient,
    registry: TaskRegistry,
    notices: NoticeCenter,
    activity: ActivityLog,
}

impl AppState {
    pub fn initialize(data_dir: &Path) -> AppResult<Self> {
        init_tracing();
        Self::with_config(data_dir, AppConfig::from_env())
    }

    pub fn with_config(data_dir: &Path, config: AppConfig) -> AppResult<Self> {
        let api = BackendClient::new(&config)?;
        let registry = TaskRegistry::from_config(Arc::new(api.clone()), &config);
        let activity = ActivityLog::new(data_dir, &config)?;

        Ok(Self {
            config,
            api,
            registry,
            notices: NoticeCenter::new(),
            activity,
        })
    }

    pub fn pipeline(&self) -> ImportPipeline {
        ImportPipeline::new(
            self.api.clone(),
            self.registry.clone(),
            self.notices.clone(),
            self.activity.clone(),
        )
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn public_config(&self) -> PublicAppConfig {
        self.config.public_profile()
    }

    pub fn api(&self) -> &BackendClient {
        &self.api
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn notices(&self) -> &NoticeCenter {
        &self.notices
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,casefile=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
