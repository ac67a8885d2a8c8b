use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::fields::ImportKind;
use crate::readers::ReaderValidationReport;

/// HTTP client for the case-management backend. Owns one `reqwest::Client`;
/// cheap to clone and share across surfaces.
#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    base_url: String,
    token: Option<SecretString>,
}

/// Acknowledgement for an accepted import or cross-reference submission.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskHandle {
    pub task_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// One poll response. `status` stays a plain string on the wire; the
/// monitor only distinguishes the two terminal values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStatusReport {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

impl TaskStatusReport {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }

    pub fn is_failed(&self) -> bool {
        self.status == "failed"
    }
}

/// Transport outcome classification for the polling monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollFailure {
    /// The backend no longer knows the id; the job is gone for good.
    NotFound,
    /// Timeout/abort-class failure; worth retrying with backoff.
    Timeout,
    Other(String),
}

impl fmt::Display for PollFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollFailure::NotFound => write!(f, "task not found"),
            PollFailure::Timeout => write!(f, "status request timed out"),
            PollFailure::Other(message) => write!(f, "{message}"),
        }
    }
}

/// Seam between the monitor and the transport so tests can script poll
/// responses without a server.
#[async_trait]
pub trait TaskStatusSource: Send + Sync {
    async fn poll_task_status(&self, task_id: &str) -> Result<TaskStatusReport, PollFailure>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CrossReferenceFilters {
    pub caso_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matricula: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fecha_desde: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fecha_hasta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_filters: Option<Map<String, Value>>,
}

/// Listing entry; consumed only to refresh the imported-files view after a
/// successful terminal job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseFile {
    #[serde(rename = "ID_Archivo")]
    pub id: i64,
    #[serde(rename = "Nombre_del_Archivo")]
    pub file_name: String,
    #[serde(rename = "Tipo_de_Archivo")]
    pub kind: String,
    #[serde(rename = "Fecha_de_Importacion")]
    pub imported_at: String,
    #[serde(rename = "Total_Registros")]
    pub total_records: i64,
}

impl BackendClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("casefile/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
        })
    }

    pub async fn submit_import(
        &self,
        case_id: i64,
        kind: ImportKind,
        file_name: &str,
        bytes: Vec<u8>,
        mapping_json: String,
    ) -> AppResult<TaskHandle> {
        let url = self.endpoint(&format!("casos/{case_id}/archivos/upload"));
        let form = upload_form(kind, file_name, bytes, mapping_json);
        let response = self.authorize(self.http.post(url)).multipart(form).send().await?;

        if !response.status().is_success() {
            return Err(error_from_response("import submission", response).await);
        }
        Ok(response.json().await?)
    }

    pub async fn validate_readers(
        &self,
        case_id: i64,
        kind: ImportKind,
        file_name: &str,
        bytes: Vec<u8>,
        mapping_json: String,
    ) -> AppResult<ReaderValidationReport> {
        let url = self.endpoint(&format!("casos/{case_id}/archivos/validate_lectores"));
        let form = upload_form(kind, file_name, bytes, mapping_json);
        let response = self.authorize(self.http.post(url)).multipart(form).send().await?;

        if !response.status().is_success() {
            return Err(error_from_response("reader validation", response).await);
        }
        Ok(response.json().await?)
    }

    pub async fn submit_cross_reference(
        &self,
        filters: &CrossReferenceFilters,
    ) -> AppResult<TaskHandle> {
        let url = self.endpoint("api/external-data/cross-with-lpr-async");
        let response = self
            .authorize(self.http.post(url))
            .json(filters)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response("cross-reference submission", response).await);
        }
        Ok(response.json().await?)
    }

    pub async fn list_case_files(&self, case_id: i64) -> AppResult<Vec<CaseFile>> {
        let url = self.endpoint(&format!("casos/{case_id}/archivos"));
        let response = self
            .authorize(self.http.get(url))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }
}

#[async_trait]
impl TaskStatusSource for BackendClient {
    async fn poll_task_status(&self, task_id: &str) -> Result<TaskStatusReport, PollFailure> {
        let url = self.endpoint(&format!("api/tasks/{task_id}/status"));
        let response = self
            .authorize(self.http.get(url))
            .send()
            .await
            .map_err(classify_transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(PollFailure::NotFound);
        }
        let response = response.error_for_status().map_err(classify_transport)?;
        response
            .json::<TaskStatusReport>()
            .await
            .map_err(classify_transport)
    }
}

fn upload_form(
    kind: ImportKind,
    file_name: &str,
    bytes: Vec<u8>,
    mapping_json: String,
) -> multipart::Form {
    multipart::Form::new()
        .text("tipo_archivo", kind.submission_kind().as_tag())
        .text("column_mapping", mapping_json)
        .part(
            "excel_file",
            multipart::Part::bytes(bytes).file_name(file_name.to_string()),
        )
}

fn classify_transport(err: reqwest::Error) -> PollFailure {
    if err.is_timeout() {
        PollFailure::Timeout
    } else {
        PollFailure::Other(err.to_string())
    }
}

/// The backend reports failures as `{"detail": ...}`; surface the detail
/// when present, the bare status otherwise.
async fn error_from_response(action: &str, response: reqwest::Response) -> AppError {
    let status = response.status();
    let detail = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| match body.get("detail") {
            Some(Value::String(text)) => Some(text.clone()),
            Some(other) => Some(other.to_string()),
            None => None,
        });

    match detail {
        Some(detail) => AppError::Validation(format!("{action} failed ({status}): {detail}")),
        None => AppError::Validation(format!("{action} failed ({status})")),
    }
}
