use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use crate::activity::ActivityLog;
use crate::api::{BackendClient, CaseFile, CrossReferenceFilters};
use crate::errors::{AppError, AppResult};
use crate::fields::ImportKind;
use crate::mapping::{read_headers, ColumnMapping};
use crate::notify::{Notice, NoticeCenter, NoticeLevel};
use crate::readers::{GateDecision, ReaderValidationReport};
use crate::tasks::{TaskRegistry, TaskSubscription};
use crate::tracks::{self, ParsedTrack};

type RefreshListener = Arc<dyn Fn(Vec<CaseFile>) + Send + Sync>;

/// A selected file with its proposed mapping, waiting for edits and the
/// pre-submit gates. Discarded on submission or whenever the file changes.
#[derive(Debug)]
pub struct PendingImport {
    pub case_id: i64,
    pub kind: ImportKind,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub headers: Vec<String>,
    pub mapping: ColumnMapping,
    pub track: Option<ParsedTrack>,
}

impl PendingImport {
    /// File selection step: checks the extension, extracts headers (running
    /// the track normalizer first for GPX/KML), and proposes a mapping.
    pub fn prepare(
        case_id: i64,
        kind: ImportKind,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> AppResult<Self> {
        validate_extension(kind, file_name)?;

        let (headers, mapping, track) = if kind == ImportKind::Track {
            let track = tracks::parse_track(file_name, &bytes)?;
            let mapping = ColumnMapping::auto_map_exact(kind, &track.headers);
            (track.headers.clone(), mapping, Some(track))
        } else {
            let headers = read_headers(&bytes)?;
            let mapping = ColumnMapping::auto_map(kind, &headers);
            (headers, mapping, None)
        };

        Ok(Self {
            case_id,
            kind,
            file_name: file_name.to_string(),
            bytes,
            headers,
            mapping,
            track,
        })
    }
}

/// What the reader gate decided for one prepared import.
#[derive(Debug)]
pub enum GateOutcome {
    /// The kind carries no reader column; nothing to validate.
    NotRequired,
    /// Every identifier is known; commit without interaction.
    Proceed,
    /// New identifiers would be created; the caller must confirm before
    /// calling `submit`.
    ConfirmRequired(ReaderValidationReport),
    /// Problematic identifiers present; submission must not happen until
    /// the mapping or the file is fixed.
    Blocked(ReaderValidationReport),
}

/// Sequences the whole flow: prepare → gate → submit → track → surface the
/// outcome. The only component that renders happy-path notices.
#[derive(Clone)]
pub struct ImportPipeline {
    api: BackendClient,
    registry: TaskRegistry,
    notices: NoticeCenter,
    activity: ActivityLog,
    refresh_listener: Option<RefreshListener>,
}

impl ImportPipeline {
    pub fn new(
        api: BackendClient,
        registry: TaskRegistry,
        notices: NoticeCenter,
        activity: ActivityLog,
    ) -> Self {
        Self {
            api,
            registry,
            notices,
            activity,
            refresh_listener: None,
        }
    }

    /// Called with the fresh case listing after every successful terminal
    /// import.
    pub fn with_refresh_listener(
        mut self,
        listener: impl Fn(Vec<CaseFile>) + Send + Sync + 'static,
    ) -> Self {
        self.refresh_listener = Some(Arc::new(listener));
        self
    }

    /// Reader pre-validation gate. Only the LPR kind is checked; everything
    /// else goes straight through.
    pub async fn validate_readers(&self, pending: &PendingImport) -> AppResult<GateOutcome> {
        if pending.kind != ImportKind::Lpr {
            return Ok(GateOutcome::NotRequired);
        }
        self.require_complete(&pending.mapping)?;

        let report = self
            .api
            .validate_readers(
                pending.case_id,
                pending.kind,
                &pending.file_name,
                pending.bytes.clone(),
                pending.mapping.submission_json()?,
            )
            .await?;

        if let Some(error) = &report.error {
            return Err(AppError::Validation(format!(
                "reader validation failed: {error}"
            )));
        }

        Ok(match report.decision() {
            GateDecision::Proceed => GateOutcome::Proceed,
            GateDecision::ConfirmRequired => GateOutcome::ConfirmRequired(report),
            GateDecision::Blocked => {
                self.record_activity(
                    "import_blocked",
                    json!({
                        "case_id": pending.case_id,
                        "file_name": pending.file_name,
                        "problematic": report
                            .problematic_readers
                            .iter()
                            .map(|entry| entry.id.clone())
                            .collect::<Vec<_>>(),
                    }),
                );
                GateOutcome::Blocked(report)
            }
        })
    }

    /// Commits the import and registers its background task. For track
    /// files, the bound identifier is stamped on every point and the
    /// synthesized payload travels through the positional channel.
    pub async fn submit(
        &self,
        pending: PendingImport,
        matricula: Option<&str>,
    ) -> AppResult<String> {
        self.require_complete(&pending.mapping)?;

        let (file_name, bytes) = match &pending.track {
            Some(track) => {
                let matricula = matricula.ok_or_else(|| {
                    AppError::Validation(
                        "track imports require a vehicle identifier".into(),
                    )
                })?;
                (tabular_file_name(&pending.file_name), tracks::to_tabular(track, matricula)?)
            }
            None => (pending.file_name.clone(), pending.bytes),
        };

        let handle = self
            .api
            .submit_import(
                pending.case_id,
                pending.kind,
                &file_name,
                bytes,
                pending.mapping.submission_json()?,
            )
            .await?;

        self.record_activity(
            "import_submitted",
            json!({
                "case_id": pending.case_id,
                "task_id": handle.task_id,
                "file_name": file_name,
                "kind": pending.kind.as_tag(),
            }),
        );
        self.register_import_task(pending.case_id, handle.task_id.clone());
        Ok(handle.task_id)
    }

    /// Launches a server-side cross-reference job and tracks it.
    pub async fn submit_cross_reference(
        &self,
        filters: CrossReferenceFilters,
    ) -> AppResult<String> {
        let handle = self.api.submit_cross_reference(&filters).await?;

        self.record_activity(
            "cross_reference_submitted",
            json!({
                "case_id": filters.caso_id,
                "task_id": handle.task_id,
            }),
        );

        let notices = self.notices.clone();
        let activity = self.activity.clone();
        let error_notices = self.notices.clone();
        let error_activity = self.activity.clone();
        let task_id = handle.task_id.clone();
        let error_task_id = handle.task_id.clone();

        self.registry.add_task(
            TaskSubscription::new(handle.task_id.clone())
                .on_complete(move |result| {
                    for notice in cross_reference_notices(&result) {
                        notices.push(notice);
                    }
                    if let Err(err) =
                        activity.record("cross_reference_completed", json!({ "task_id": task_id }))
                    {
                        warn!(?err, "failed to record cross-reference completion");
                    }
                })
                .on_error(move |message| {
                    error_notices.push(Notice::new(
                        NoticeLevel::Error,
                        "Cross-reference failed",
                        friendly_task_error(&message),
                    ));
                    if let Err(err) = error_activity.record(
                        "cross_reference_failed",
                        json!({ "task_id": error_task_id, "message": message }),
                    ) {
                        warn!(?err, "failed to record cross-reference failure");
                    }
                }),
        );
        Ok(handle.task_id)
    }

    pub fn notices(&self) -> &NoticeCenter {
        &self.notices
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    fn register_import_task(&self, case_id: i64, task_id: String) {
        let notices = self.notices.clone();
        let activity = self.activity.clone();
        let api = self.api.clone();
        let listener = self.refresh_listener.clone();
        let completed_task_id = task_id.clone();

        let error_notices = self.notices.clone();
        let error_activity = self.activity.clone();
        let error_task_id = task_id.clone();

        self.registry.add_task(
            TaskSubscription::new(task_id)
                .on_complete(move |result| {
                    for notice in completion_notices(&result) {
                        notices.push(notice);
                    }
                    if let Err(err) = activity.record(
                        "import_completed",
                        json!({ "task_id": completed_task_id, "result": result }),
                    ) {
                        warn!(?err, "failed to record import completion");
                    }
                    if let Some(listener) = listener.clone() {
                        let api = api.clone();
                        tokio::spawn(async move {
                            match api.list_case_files(case_id).await {
                                Ok(files) => listener(files),
                                Err(err) => {
                                    warn!(?err, case_id, "failed to refresh case file listing")
                                }
                            }
                        });
                    }
                })
                .on_error(move |message| {
                    error_notices.push(Notice::new(
                        NoticeLevel::Error,
                        "Import failed",
                        friendly_task_error(&message),
                    ));
                    if let Err(err) = error_activity.record(
                        "import_failed",
                        json!({ "task_id": error_task_id, "message": message }),
                    ) {
                        warn!(?err, "failed to record import failure");
                    }
                }),
        );
    }

    fn require_complete(&self, mapping: &ColumnMapping) -> AppResult<()> {
        let missing = mapping.missing_required();
        if missing.is_empty() {
            return Ok(());
        }
        Err(AppError::Validation(format!(
            "mapping is incomplete; assign a source column for: {}",
            missing.join(", ")
        )))
    }

    fn record_activity(&self, name: &str, payload: Value) {
        if let Err(err) = self.activity.record(name, payload) {
            warn!(?err, name, "failed to record activity event");
        }
    }
}

/// Track kinds accept only GPX/KML containers; every tabular kind accepts
/// delimited or spreadsheet files.
pub fn validate_extension(kind: ImportKind, file_name: &str) -> AppResult<()> {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_lowercase();

    let valid: &[&str] = match kind {
        ImportKind::Track => &["gpx", "kml"],
        _ => &["csv", "xlsx", "xls"],
    };

    if valid.contains(&extension.as_str()) {
        return Ok(());
    }
    Err(AppError::Validation(match kind {
        ImportKind::Track => {
            format!("'{file_name}' is not a valid GPX (.gpx) or KML (.kml) file")
        }
        _ => format!("'{file_name}' is not a valid spreadsheet (.xlsx, .xls) or CSV file"),
    }))
}

/// Remaps the small set of known server failure texts to friendlier copy;
/// everything else is surfaced largely verbatim.
pub fn friendly_task_error(raw: &str) -> String {
    if raw.contains("timeout") || raw.contains("no longer exists") {
        "The job took too long to finish. Try again with more specific filters.".to_string()
    } else if raw.contains("No se encontraron datos") {
        "No data matched the specified filters.".to_string()
    } else if raw.contains("Error interno del servidor") || raw.contains("Internal Server Error") {
        "Internal server error. Contact an administrator if the problem persists.".to_string()
    } else {
        raw.to_string()
    }
}

/// One consolidated success notice, plus a secondary advisory when the
/// result carries duplicates or newly created readers. Successful but
/// noteworthy, never errors.
fn completion_notices(result: &Value) -> Vec<Notice> {
    let total = result
        .get("total_registros")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let duplicates = string_list(result.get("lecturas_duplicadas"));
    let new_readers = string_list(result.get("lectores_no_encontrados"));

    let mut notices = vec![Notice::new(
        NoticeLevel::Success,
        "Import completed",
        format!("{total} records were processed."),
    )];

    if !duplicates.is_empty() {
        let mut message = format!(
            "{} duplicate records were already present and were skipped.",
            duplicates.len()
        );
        let preview: Vec<&str> = duplicates.iter().map(String::as_str).take(10).collect();
        message.push_str(&format!(" First skipped: {}.", preview.join(", ")));
        notices.push(Notice::new(
            NoticeLevel::Warning,
            "Duplicate records skipped",
            message,
        ));
    }

    if !new_readers.is_empty() {
        notices.push(Notice::new(
            NoticeLevel::Info,
            "New readers created",
            format!(
                "{} readers were created automatically: {}.",
                new_readers.len(),
                new_readers.join(", ")
            ),
        ));
    }

    notices
}

fn cross_reference_notices(result: &Value) -> Vec<Notice> {
    let matches = result
        .get("total_matches")
        .and_then(Value::as_u64)
        .or_else(|| {
            result
                .get("results")
                .and_then(Value::as_array)
                .map(|rows| rows.len() as u64)
        })
        .unwrap_or(0);

    if matches == 0 {
        return vec![Notice::new(
            NoticeLevel::Info,
            "Cross-reference completed",
            "No matches were found for the specified filters.",
        )];
    }

    let limited = result
        .get("limited")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let mut message = format!("Found {matches} matches.");
    if limited {
        message.push_str(" Results were limited; use more specific filters to see everything.");
    }
    vec![Notice::new(
        NoticeLevel::Success,
        "Cross-reference completed",
        message,
    )]
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn tabular_file_name(file_name: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, _)) => format!("{stem}.csv"),
        None => format!("{file_name}.csv"),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::fields::canonical;

    #[test]
    fn extension_rules_follow_the_kind() {
        assert!(validate_extension(ImportKind::Lpr, "lecturas.CSV").is_ok());
        assert!(validate_extension(ImportKind::Gps, "datos.xlsx").is_ok());
        assert!(validate_extension(ImportKind::Lpr, "route.gpx").is_err());
        assert!(validate_extension(ImportKind::Track, "route.kml").is_ok());
        assert!(validate_extension(ImportKind::Track, "route.xlsx").is_err());
        assert!(validate_extension(ImportKind::External, "no_extension").is_err());
    }

    #[test]
    fn known_failure_texts_are_remapped() {
        assert!(friendly_task_error("connect timeout").contains("took too long"));
        assert!(
            friendly_task_error("The task no longer exists or was already completed")
                .contains("took too long")
        );
        assert!(friendly_task_error("No se encontraron datos").contains("No data matched"));
        assert!(friendly_task_error("Error interno del servidor").contains("administrator"));
        assert_eq!(friendly_task_error("columna inválida"), "columna inválida");
    }

    #[test]
    fn duplicates_trigger_a_secondary_advisory() {
        let result = json!({
            "total_registros": 120,
            "lecturas_duplicadas": ["X", "Y"]
        });
        let notices = completion_notices(&result);
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].level, NoticeLevel::Success);
        assert!(notices[0].message.contains("120"));
        assert_eq!(notices[1].level, NoticeLevel::Warning);
        assert!(notices[1].message.contains("2 duplicate records"));
        assert!(notices[1].message.contains("X, Y"));
    }

    #[test]
    fn new_readers_trigger_an_informational_advisory() {
        let result = json!({
            "total_registros": 10,
            "lectores_no_encontrados": ["CAM-7"]
        });
        let notices = completion_notices(&result);
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[1].level, NoticeLevel::Info);
        assert!(notices[1].message.contains("CAM-7"));
    }

    #[test]
    fn a_clean_result_emits_a_single_notice() {
        let notices = completion_notices(&json!({ "total_registros": 7 }));
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Success);
    }

    #[test]
    fn cross_reference_outcomes_summarize_matches() {
        let some = cross_reference_notices(&json!({ "total_matches": 4, "limited": true }));
        assert!(some[0].message.contains("4 matches"));
        assert!(some[0].message.contains("limited"));

        let none = cross_reference_notices(&json!({ "results": [] }));
        assert_eq!(none[0].level, NoticeLevel::Info);
        assert!(none[0].message.contains("No matches"));
    }

    #[test]
    fn prepares_a_tabular_import_with_an_automatic_mapping() {
        let bytes = b"Plate,Date,Time,Camera\nAB12CD,2024-01-01,10:00:00,CAM-1\n".to_vec();
        let pending =
            PendingImport::prepare(5, ImportKind::Lpr, "lecturas.csv", bytes).unwrap();

        assert_eq!(pending.headers.len(), 4);
        assert!(pending.mapping.is_complete());
        assert_eq!(
            pending.mapping.header_for(canonical::ID_LECTOR),
            Some("Camera")
        );
        assert!(pending.track.is_none());
    }

    #[test]
    fn prepares_a_track_import_with_exact_name_mapping() {
        let kml = r#"<?xml version="1.0" encoding="UTF-8"?>
        <kml xmlns="http://www.opengis.net/kml/2.2">
          <Document><Placemark><LineString>
            <coordinates>2.17,41.38,5.0 2.18,41.39,6.0</coordinates>
          </LineString></Placemark></Document>
        </kml>"#;
        let pending = PendingImport::prepare(
            5,
            ImportKind::Track,
            "route.kml",
            kml.as_bytes().to_vec(),
        )
        .unwrap();

        assert!(pending.track.is_some());
        assert!(pending.mapping.is_complete());
        assert_eq!(
            pending.mapping.header_for(canonical::ALTITUD),
            Some("Altitud")
        );
    }

    #[test]
    fn wrong_extensions_never_reach_parsing() {
        let err = PendingImport::prepare(5, ImportKind::Track, "route.xlsx", Vec::new())
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn track_payload_file_names_become_tabular() {
        assert_eq!(tabular_file_name("route.kml"), "route.csv");
        assert_eq!(tabular_file_name("track.v2.gpx"), "track.v2.csv");
        assert_eq!(tabular_file_name("route"), "route.csv");
    }
}
