use std::sync::Arc;
use std::time::Duration;

use httptest::matchers::{all_of, request};
use httptest::responders::json_encoded;
use httptest::{Expectation, Server};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::tempdir;

use casefile::{
    AppConfig, AppState, CaseFile, GateOutcome, ImportKind, MonitorState, NoticeLevel,
    PendingImport,
};

const SAMPLE_CSV: &[u8] = b"Plate,Date,Time,Camera\n\
AB12CD,2024-03-05,08:15:30,CAM-7\n\
XY99ZZ,2024-03-05,08:16:02,CAM-7\n";

#[tokio::test(flavor = "multi_thread")]
async fn lpr_import_roundtrip_with_reader_gate_and_advisories() {
    let server = Server::run();

    server.expect(
        Expectation::matching(all_of!(
            request::method("POST"),
            request::path("/casos/9/archivos/validate_lectores")
        ))
        .respond_with(json_encoded(json!({
            "total_registros": 2,
            "lectores_nuevos": [
                { "id": "CAM-7", "estado": "nuevo_seguro", "razon": "'CAM-7' parece un ID de lector válido" }
            ],
            "lectores_problematicos": [],
            "lectores_existentes": [],
            "es_seguro_proceder": true,
            "advertencias": ["Se crearán 1 lectores nuevos automáticamente."]
        }))),
    );

    server.expect(
        Expectation::matching(all_of!(
            request::method("POST"),
            request::path("/casos/9/archivos/upload")
        ))
        .respond_with(json_encoded(json!({
            "task_id": "task-abc",
            "message": "Archivo recibido; importación iniciada"
        }))),
    );

    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/api/tasks/task-abc/status")
        ))
        .respond_with(json_encoded(json!({
            "status": "completed",
            "stage": "processing",
            "progress": 100.0,
            "total": 2,
            "result": {
                "total_registros": 2,
                "lecturas_duplicadas": ["XY99ZZ"],
                "lectores_no_encontrados": ["CAM-7"]
            }
        }))),
    );

    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/casos/9/archivos")
        ))
        .respond_with(json_encoded(json!([{
            "ID_Archivo": 31,
            "Nombre_del_Archivo": "lecturas.csv",
            "Tipo_de_Archivo": "LPR",
            "Fecha_de_Importacion": "2024-03-05T08:20:00",
            "Total_Registros": 2
        }]))),
    );

    let mut config = AppConfig::from_env();
    config.api_base_url = server.url_str("/");
    config.task_poll_interval_ms = 50;
    config.task_decay_secs = 1;

    let data_dir = tempdir().unwrap();
    let state = AppState::with_config(data_dir.path(), config).unwrap();

    let refreshed: Arc<Mutex<Vec<CaseFile>>> = Arc::new(Mutex::new(Vec::new()));
    let refresh_sink = Arc::clone(&refreshed);
    let pipeline = state
        .pipeline()
        .with_refresh_listener(move |files| refresh_sink.lock().extend(files));

    // File selection proposes a complete mapping from the aliases alone.
    let pending =
        PendingImport::prepare(9, ImportKind::Lpr, "lecturas.csv", SAMPLE_CSV.to_vec()).unwrap();
    assert!(pending.mapping.is_complete());

    // The reader gate finds one new identifier and demands confirmation.
    let outcome = pipeline.validate_readers(&pending).await.unwrap();
    let report = match outcome {
        GateOutcome::ConfirmRequired(report) => report,
        other => panic!("expected confirmation gate, got {other:?}"),
    };
    assert!(report.confirm_allowed());
    assert_eq!(report.new_readers[0].id, "CAM-7");

    // Confirming commits the import and registers the background task.
    let task_id = pipeline.submit(pending, None).await.unwrap();
    assert_eq!(task_id, "task-abc");
    assert!(state.registry().contains(&task_id));

    // One poll reaches the terminal state; wait out the decay window.
    tokio::time::sleep(Duration::from_millis(1600)).await;

    let notices = state.notices().drain();
    assert_eq!(notices.len(), 3);
    assert_eq!(notices[0].level, NoticeLevel::Success);
    assert!(notices[0].message.contains("2 records"));
    assert_eq!(notices[1].level, NoticeLevel::Warning);
    assert!(notices[1].message.contains("XY99ZZ"));
    assert_eq!(notices[2].level, NoticeLevel::Info);
    assert!(notices[2].message.contains("CAM-7"));

    let files = refreshed.lock().clone();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].file_name, "lecturas.csv");

    assert!(!state.registry().contains(&task_id));

    state.activity().flush().unwrap();
    let log = std::fs::read_to_string(state.activity().log_path()).unwrap();
    assert!(log.contains("import_submitted"));
    assert!(log.contains("import_completed"));
}

#[tokio::test(flavor = "multi_thread")]
async fn problematic_readers_block_the_import() {
    let server = Server::run();

    server.expect(
        Expectation::matching(all_of!(
            request::method("POST"),
            request::path("/casos/4/archivos/validate_lectores")
        ))
        .respond_with(json_encoded(json!({
            "total_registros": 5,
            "lectores_nuevos": [
                { "id": "CAM-7", "estado": "nuevo_seguro" }
            ],
            "lectores_problematicos": [
                {
                    "id": "AB12CD",
                    "estado": "problematico",
                    "razon": "'AB12CD' parece una matrícula de vehículo, no un lector",
                    "sugerencia": "Verificar que 'AB12CD' es realmente un lector físico"
                }
            ],
            "lectores_existentes": [],
            "es_seguro_proceder": false,
            "advertencias": [
                "Se detectaron 1 lectores problemáticos que parecen matrículas de vehículos."
            ]
        }))),
    );

    let mut config = AppConfig::from_env();
    config.api_base_url = server.url_str("/");

    let data_dir = tempdir().unwrap();
    let state = AppState::with_config(data_dir.path(), config).unwrap();
    let pipeline = state.pipeline();

    let pending =
        PendingImport::prepare(4, ImportKind::Lpr, "lecturas.csv", SAMPLE_CSV.to_vec()).unwrap();

    let outcome = pipeline.validate_readers(&pending).await.unwrap();
    let report = match outcome {
        GateOutcome::Blocked(report) => report,
        other => panic!("expected a hard block, got {other:?}"),
    };
    assert!(!report.confirm_allowed());
    assert!(!report.safe_to_proceed);
    assert_eq!(report.problematic_readers[0].id, "AB12CD");

    // Nothing was submitted and no task is being tracked.
    assert_eq!(state.registry().tracked(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn vanished_tasks_fail_without_retries() {
    use httptest::responders::status_code;

    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/api/tasks/task-gone/status")
        ))
        .times(1)
        .respond_with(status_code(404)),
    );

    let mut config = AppConfig::from_env();
    config.api_base_url = server.url_str("/");
    config.task_poll_interval_ms = 30;

    let data_dir = tempdir().unwrap();
    let state = AppState::with_config(data_dir.path(), config).unwrap();

    let failures: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    state.registry().add_task(
        casefile::TaskSubscription::new("task-gone")
            .on_error(move |message| sink.lock().push(message)),
    );

    tokio::time::sleep(Duration::from_millis(300)).await;

    let seen = failures.lock().clone();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].contains("no longer exists"));
    assert_eq!(
        state.registry().snapshot("task-gone").unwrap().state,
        MonitorState::Failed
    );
}
