// src/main.rs

use anyhow::{Context, Result};
use axum::extract::multipart::{Multipart, MultipartError};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode as AxumStatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use bytes::Bytes;
use chrono::NaiveDate;
use clap::Parser;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};
use std::{env, net::SocketAddr, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod export;
mod hrms_client;
mod reconciliation;
mod source_formats;
mod validation;

#[cfg(test)]
mod export_tests;
#[cfg(test)]
mod source_formats_tests;
#[cfg(test)]
mod validation_tests;

use export::ExportError;
use hrms_client::{
    AttendanceBackend, HrmsClient, HrmsConfig, HrmsError, DEFAULT_DIRECTORY_CACHE_SECS,
};
use reconciliation::{
    page, total_pages, AttendanceRow, InvalidRow, RawAttendanceBundle, ReconciliationSession,
    RowCorrection,
};
use source_formats::{RawSource, SourceFormatError};

const SESSION_ID_LEN: usize = 24;
const DEFAULT_PAGE_SIZE: usize = 50;
// Abandoned reconciliation runs are swept after this long.
const SESSION_TTL_SECS: u64 = 12 * 60 * 60;

// --- Error Handling ---

#[derive(Error, Debug)]
enum AppError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    #[error("HRMS backend error: {0}")]
    Hrms(#[from] HrmsError),
    #[error("Source file parse error: {0}")]
    SourceFormat(#[from] SourceFormatError),
    #[error("Export error: {0}")]
    Export(#[from] ExportError),
    #[error("Multipart upload error: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Unknown session: {0}")]
    SessionNotFound(String),
    #[error("{0}")]
    BadRequest(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("Error occurred: {:?}", self);
        let (status_code, error_message) = match &self {
            AppError::MissingEnvVar(_) => (
                AxumStatusCode::INTERNAL_SERVER_ERROR,
                "Server configuration error.".to_string(),
            ),
            AppError::Io(_) => (
                AxumStatusCode::INTERNAL_SERVER_ERROR,
                "Server file I/O error.".to_string(),
            ),
            AppError::TlsConfig(_) => (
                AxumStatusCode::INTERNAL_SERVER_ERROR,
                "Server TLS configuration error.".to_string(),
            ),
            AppError::Hrms(hrms_err) => match hrms_err {
                HrmsError::Request(e) => {
                    error!("Network request error to HRMS: {}", e);
                    (
                        AxumStatusCode::BAD_GATEWAY,
                        "Failed to connect to HRMS backend.".to_string(),
                    )
                }
                HrmsError::ApiError { status, message } => {
                    error!("HRMS API error: Status={}, Msg={}", status, message);
                    let axum_status = AxumStatusCode::from_u16(status.as_u16())
                        .unwrap_or(AxumStatusCode::INTERNAL_SERVER_ERROR);
                    (
                        axum_status,
                        "An error occurred while communicating with the HRMS backend.".to_string(),
                    )
                }
                HrmsError::Json(e) => {
                    error!("JSON processing error from HRMS response: {}", e);
                    (
                        AxumStatusCode::INTERNAL_SERVER_ERROR,
                        "Internal error processing HRMS data.".to_string(),
                    )
                }
                HrmsError::UrlParse(e) => {
                    error!("URL parsing error for HRMS endpoint: {}", e);
                    (
                        AxumStatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error (HRMS URL config).".to_string(),
                    )
                }
                HrmsError::ConfigError(msg) => {
                    error!("HRMS client configuration error: {}", msg);
                    (
                        AxumStatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error (HRMS config).".to_string(),
                    )
                }
            },
            AppError::SourceFormat(e) => (
                AxumStatusCode::BAD_REQUEST,
                format!("Uploaded file could not be parsed: {}", e),
            ),
            AppError::Export(_) => (
                AxumStatusCode::INTERNAL_SERVER_ERROR,
                "Failed to generate export.".to_string(),
            ),
            AppError::Multipart(_) => (
                AxumStatusCode::BAD_REQUEST,
                "Malformed multipart upload.".to_string(),
            ),
            AppError::SessionNotFound(id) => (
                AxumStatusCode::NOT_FOUND,
                format!("No reconciliation session '{}'", id),
            ),
            AppError::BadRequest(msg) => (AxumStatusCode::BAD_REQUEST, msg.clone()),
        };
        (
            status_code,
            Json(ErrorBody {
                error: error_message,
            }),
        )
            .into_response()
    }
}

// --- Configuration ---

/// Attendance reconciliation service for multi-source device dumps.
#[derive(Parser, Debug)]
#[command(name = "attendance-core")]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Serve plain HTTP instead of TLS (skips CERT_PATH/KEY_PATH).
    #[arg(long)]
    no_tls: bool,
}

#[derive(Debug, Clone)]
struct TlsPaths {
    cert_path: String,
    key_path: String,
}

fn load_tls_paths() -> Result<TlsPaths, AppError> {
    Ok(TlsPaths {
        cert_path: env::var("CERT_PATH")
            .map_err(|_| AppError::MissingEnvVar("CERT_PATH".to_string()))?,
        key_path: env::var("KEY_PATH")
            .map_err(|_| AppError::MissingEnvVar("KEY_PATH".to_string()))?,
    })
}

fn load_hrms_config() -> Result<HrmsConfig, AppError> {
    Ok(HrmsConfig {
        base_url: env::var("HRMS_BASE_URL")
            .map_err(|_| AppError::MissingEnvVar("HRMS_BASE_URL".to_string()))?,
        api_key: env::var("HRMS_API_KEY")
            .map_err(|_| AppError::MissingEnvVar("HRMS_API_KEY".to_string()))?,
        api_secret: env::var("HRMS_API_SECRET")
            .map_err(|_| AppError::MissingEnvVar("HRMS_API_SECRET".to_string()))?,
        directory_cache_secs: env::var("HRMS_CACHE_DURATION_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_DIRECTORY_CACHE_SECS),
    })
}

async fn load_tls_config(paths: &TlsPaths) -> Result<RustlsConfig, AppError> {
    RustlsConfig::from_pem_file(&paths.cert_path, &paths.key_path)
        .await
        .map_err(|e| AppError::TlsConfig(format!("Failed to load TLS cert/key: {}", e)))
}

// --- Shared State ---

#[derive(Clone)]
struct AppState {
    backend: Arc<dyn AttendanceBackend>,
    sessions: Arc<Mutex<HashMap<String, SessionEntry>>>,
}

struct SessionEntry {
    created_at: Instant,
    session: ReconciliationSession,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            created_at: Instant::now(),
            session: ReconciliationSession::new(),
        }
    }
}

fn new_session_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}

/// Drop sessions older than the TTL; a successful import already removes
/// its session, this catches the abandoned ones. Returns how many were
/// swept.
fn purge_expired_sessions(
    sessions: &mut HashMap<String, SessionEntry>,
    now: Instant,
    ttl: Duration,
) -> usize {
    let before = sessions.len();
    sessions.retain(|_, entry| now.duration_since(entry.created_at) < ttl);
    before - sessions.len()
}

// --- Response DTOs ---

#[derive(Serialize)]
struct SessionCreatedResponse {
    session_id: String,
}

#[derive(Serialize)]
struct LoadRawResponse {
    message: String,
    total_rows: usize,
    counts: BTreeMap<String, usize>,
    data: RawAttendanceBundle,
}

#[derive(Serialize)]
struct PreviewResponse {
    message: String,
    total_employees: usize,
    total_records: usize,
    unmapped_rows: usize,
    page: usize,
    page_size: usize,
    total_pages: usize,
    data: Vec<AttendanceRow>,
}

#[derive(Serialize)]
struct NonValidatedRow {
    index: usize,
    #[serde(flatten)]
    row: AttendanceRow,
    errors: Vec<String>,
}

impl From<&InvalidRow> for NonValidatedRow {
    fn from(invalid: &InvalidRow) -> Self {
        Self {
            index: invalid.index,
            row: invalid.row.clone(),
            errors: invalid.error_messages(),
        }
    }
}

#[derive(Serialize)]
struct ValidationResponse {
    message: String,
    validated: BTreeMap<String, Vec<AttendanceRow>>,
    non_validated: Vec<NonValidatedRow>,
    total_valid: usize,
    total_invalid: usize,
}

#[derive(Serialize)]
struct ImportResponse {
    message: String,
    import_id: String,
}

#[derive(Serialize)]
struct StatusResponse {
    active_sessions: usize,
    hrms: String,
}

#[derive(Deserialize)]
struct PageParams {
    page: Option<usize>,
    page_size: Option<usize>,
}

#[derive(Deserialize)]
struct ExportParams {
    target: String,
}

// --- Handlers ---

async fn handle_create_session(State(state): State<AppState>) -> Json<SessionCreatedResponse> {
    let session_id = new_session_id();
    let mut sessions = state.sessions.lock().await;
    let swept = purge_expired_sessions(
        &mut sessions,
        Instant::now(),
        Duration::from_secs(SESSION_TTL_SECS),
    );
    if swept > 0 {
        info!("Swept {} expired reconciliation sessions", swept);
    }
    sessions.insert(session_id.clone(), SessionEntry::new());
    info!("Created reconciliation session {}", session_id);
    Json(SessionCreatedResponse { session_id })
}

async fn handle_load_raw(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<LoadRawResponse>, AppError> {
    let mut from_date: Option<String> = None;
    let mut to_date: Option<String> = None;
    let mut uploads: Vec<(RawSource, Bytes)> = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        match field.name().unwrap_or("") {
            "from_date" => from_date = Some(field.text().await?),
            "to_date" => to_date = Some(field.text().await?),
            "zicom_file" => uploads.push((RawSource::ZicomRegal, field.bytes().await?)),
            "essl_file" => uploads.push((RawSource::EsslWestcott, field.bytes().await?)),
            "mantra_file" => uploads.push((RawSource::Mantra, field.bytes().await?)),
            "other_file" => uploads.push((RawSource::Other, field.bytes().await?)),
            other => {
                warn!("Ignoring unknown upload field '{}'", other);
            }
        }
    }

    let from = parse_payroll_date(from_date.as_deref(), "from_date")?;
    let to = parse_payroll_date(to_date.as_deref(), "to_date")?;
    if from > to {
        return Err(AppError::BadRequest(
            "Invalid payroll date range.".to_string(),
        ));
    }
    if uploads.is_empty() {
        return Err(AppError::BadRequest(
            "Upload at least one attendance file.".to_string(),
        ));
    }

    let employees = state.backend.active_employees().await?;
    if employees.is_empty() {
        return Err(AppError::BadRequest(
            "No active employees found.".to_string(),
        ));
    }

    let mut bundle = RawAttendanceBundle::default();
    for (source, data) in uploads {
        // A bad file from one device must not sink the others; it just
        // contributes nothing and the operator re-uploads it.
        let parsed = match source {
            RawSource::ZicomRegal => source_formats::parse_zicom(&data),
            RawSource::EsslWestcott => source_formats::parse_essl(&data),
            RawSource::Mantra => source_formats::parse_mantra(&data),
            RawSource::Other => source_formats::parse_other(&data),
            RawSource::App => unreachable!("app rows are never uploaded"),
        };
        match parsed {
            Ok(rows) => {
                info!("Parsed {} rows from {} upload", rows.len(), source.label());
                bundle.set(source, rows);
            }
            Err(e) => {
                error!("Failed to parse {} upload: {}", source.label(), e);
            }
        }
    }

    let employee_ids: Vec<String> = employees.keys().cloned().collect();
    let app_rows = state.backend.app_checkins(&employee_ids, from, to).await?;
    info!("Fetched {} app check-in rows from HRMS", app_rows.len());
    bundle.set(RawSource::App, app_rows);

    let mut sessions = state.sessions.lock().await;
    let session = sessions
        .get_mut(&session_id)
        .map(|entry| &mut entry.session)
        .ok_or(AppError::SessionNotFound(session_id))?;
    session.set_raw(bundle, from, to);

    let counts: BTreeMap<String, usize> = [
        RawSource::ZicomRegal,
        RawSource::EsslWestcott,
        RawSource::Mantra,
        RawSource::Other,
        RawSource::App,
    ]
    .into_iter()
    .map(|s| (s.key().to_string(), session.raw.get(s).len()))
    .collect();

    Ok(Json(LoadRawResponse {
        message: "Attendance files processed successfully".to_string(),
        total_rows: session.raw.total_rows(),
        counts,
        data: session.raw.clone(),
    }))
}

fn parse_payroll_date(value: Option<&str>, field: &str) -> Result<NaiveDate, AppError> {
    let value = value.ok_or_else(|| {
        AppError::BadRequest(format!("Payroll period field '{}' is required.", field))
    })?;
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| AppError::BadRequest(format!("Invalid date '{}' for '{}'.", value, field)))
}

async fn handle_preview(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<PreviewResponse>, AppError> {
    let allotments = state.backend.device_allotments().await?;
    let directory = state.backend.active_employees().await?;

    let mut sessions = state.sessions.lock().await;
    let session = sessions
        .get_mut(&session_id)
        .map(|entry| &mut entry.session)
        .ok_or(AppError::SessionNotFound(session_id))?;
    if session.raw.is_empty() {
        return Err(AppError::BadRequest("Load raw data first.".to_string()));
    }

    let total_records = session.build_preview(&allotments);
    // Device dumps carry truncated or empty names; the HRMS directory
    // is authoritative.
    for row in &mut session.preview {
        if let Some(name) = directory.get(&row.employee_id) {
            if !name.is_empty() {
                row.employee_name = name.clone();
            }
        }
    }

    let total_employees = session
        .preview
        .iter()
        .map(|r| r.employee_id.as_str())
        .collect::<BTreeSet<_>>()
        .len();

    let page_size = params.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    let page_number = params.page.unwrap_or(1);
    let slice = page(&session.preview, page_number, page_size);
    let pages = total_pages(session.preview.len(), page_size);

    Ok(Json(PreviewResponse {
        message: "Preview generated successfully".to_string(),
        total_employees,
        total_records,
        unmapped_rows: session.unmapped_rows,
        page: page_number.clamp(1, pages),
        page_size: page_size.max(1),
        total_pages: pages,
        data: slice.to_vec(),
    }))
}

async fn handle_validate(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ValidationResponse>, AppError> {
    let mut sessions = state.sessions.lock().await;
    let session = sessions
        .get_mut(&session_id)
        .map(|entry| &mut entry.session)
        .ok_or(AppError::SessionNotFound(session_id))?;
    if session.preview.is_empty() {
        return Err(AppError::BadRequest("Generate preview first.".to_string()));
    }

    let (total_valid, total_invalid) = session.run_validation();
    info!(
        "Validation complete: valid={}, invalid={}",
        total_valid, total_invalid
    );

    Ok(Json(ValidationResponse {
        message: "Validation completed".to_string(),
        validated: session.validated.clone(),
        non_validated: session
            .non_validated
            .iter()
            .map(NonValidatedRow::from)
            .collect(),
        total_valid,
        total_invalid,
    }))
}

async fn handle_revalidate(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(corrections): Json<Vec<RowCorrection>>,
) -> Result<Json<ValidationResponse>, AppError> {
    let mut sessions = state.sessions.lock().await;
    let session = sessions
        .get_mut(&session_id)
        .map(|entry| &mut entry.session)
        .ok_or(AppError::SessionNotFound(session_id))?;
    if session.validated.is_empty() && session.non_validated.is_empty() {
        return Err(AppError::BadRequest("Run validation first.".to_string()));
    }

    let outcome = session.apply_corrections(&corrections);
    info!(
        "Correction round: accepted={}, revalidated={}, still_invalid={}",
        outcome.accepted, outcome.revalidated, outcome.still_invalid
    );

    Ok(Json(ValidationResponse {
        message: "Re-validation completed".to_string(),
        validated: session.validated.clone(),
        non_validated: session
            .non_validated
            .iter()
            .map(NonValidatedRow::from)
            .collect(),
        total_valid: session.total_valid(),
        total_invalid: session.non_validated.len(),
    }))
}

async fn handle_import(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ImportResponse>, AppError> {
    // Snapshot under the lock, call the HRMS without holding it. The
    // session is discarded only after the import call succeeds, so a
    // failure leaves everything in place for a retry.
    let csv_payload = {
        let sessions = state.sessions.lock().await;
        let session = sessions
            .get(&session_id)
            .map(|entry| &entry.session)
            .ok_or_else(|| AppError::SessionNotFound(session_id.clone()))?;
        if session.validated.is_empty() {
            return Err(AppError::BadRequest(
                "No validated records found.".to_string(),
            ));
        }
        export::import_sheet_csv(&session.validated)?
    };

    let csv_text = String::from_utf8(csv_payload)
        .map_err(|e| AppError::BadRequest(format!("Import payload is not UTF-8: {}", e)))?;
    let import_id = state.backend.create_attendance_import(&csv_text).await?;

    state.sessions.lock().await.remove(&session_id);
    info!(
        "Session {} committed as data import {}",
        session_id, import_id
    );

    Ok(Json(ImportResponse {
        message: "Data import created".to_string(),
        import_id,
    }))
}

async fn handle_export(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<ExportParams>,
) -> Result<Response, AppError> {
    let sessions = state.sessions.lock().await;
    let session = sessions
        .get(&session_id)
        .map(|entry| &entry.session)
        .ok_or(AppError::SessionNotFound(session_id))?;

    let (bytes, filename) = match params.target.as_str() {
        "preview" => (
            export::sheet_csv(&session.preview)?,
            "Preview_Attendance.csv",
        ),
        "validated" => (
            export::validated_sheet_csv(&session.validated)?,
            "Validated_Attendance.csv",
        ),
        other => match RawSource::from_key(other) {
            Some(source) => (
                export::raw_rows_csv(session.raw.get(source))?,
                match source {
                    RawSource::ZicomRegal => "zicom_raw.csv",
                    RawSource::EsslWestcott => "essl_raw.csv",
                    RawSource::Mantra => "mantra_raw.csv",
                    RawSource::Other => "other_raw.csv",
                    RawSource::App => "app_raw.csv",
                },
            ),
            None => {
                return Err(AppError::BadRequest(format!(
                    "Unknown export target '{}'.",
                    other
                )))
            }
        },
    };

    Ok(csv_attachment(bytes, filename))
}

async fn handle_template() -> Result<Response, AppError> {
    Ok(csv_attachment(
        export::template_csv()?,
        "Attendance Template.csv",
    ))
}

fn csv_attachment(bytes: Vec<u8>, filename: &str) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        Bytes::from(bytes),
    )
        .into_response()
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let active_sessions = {
        let mut sessions = state.sessions.lock().await;
        purge_expired_sessions(
            &mut sessions,
            Instant::now(),
            Duration::from_secs(SESSION_TTL_SECS),
        );
        sessions.len()
    };
    let hrms = match state.backend.active_employees().await {
        Ok(directory) => format!("ok ({} active employees)", directory.len()),
        Err(e) => format!("unreachable: {}", e),
    };
    Json(StatusResponse {
        active_sessions,
        hrms,
    })
}

// --- Server setup ---

fn build_router(state: AppState) -> Router {
    let session_routes = Router::new()
        .route("/", post(handle_create_session))
        .route("/{id}/load-raw", post(handle_load_raw))
        .route("/{id}/preview", post(handle_preview))
        .route("/{id}/validate", post(handle_validate))
        .route("/{id}/revalidate", post(handle_revalidate))
        .route("/{id}/import", post(handle_import))
        .route("/{id}/export", get(handle_export));

    Router::new()
        .nest("/api/session", session_routes)
        .route("/api/template", get(handle_template))
        .route("/status", get(handle_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!("Tracing subscriber initialized.");

    let cli = Cli::parse();

    let hrms_config = load_hrms_config()?;
    info!("HRMS configuration loaded.");
    let hrms_client = HrmsClient::new(hrms_config).context("Building HRMS client failed")?;

    let state = AppState {
        backend: Arc::new(hrms_client),
        sessions: Arc::new(Mutex::new(HashMap::new())),
    };
    let app = build_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], cli.port));
    if cli.no_tls {
        info!("Starting server on http://{}", addr);
        axum_server::bind(addr)
            .serve(app.into_make_service())
            .await
            .context("HTTP server failed")?;
    } else {
        let tls_paths = load_tls_paths()?;
        let tls_config = load_tls_config(&tls_paths).await?;
        info!("Starting server on https://{}", addr);
        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service())
            .await
            .context("HTTPS server failed")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_sessions_are_swept() {
        let mut sessions = HashMap::new();
        sessions.insert("stale".to_string(), SessionEntry::new());
        sessions.insert("fresh".to_string(), SessionEntry::new());

        let base = Instant::now();
        let ttl = Duration::from_secs(SESSION_TTL_SECS);
        sessions.get_mut("stale").unwrap().created_at = base;
        sessions.get_mut("fresh").unwrap().created_at = base + ttl / 2;

        // Nothing ages out before the TTL.
        assert_eq!(purge_expired_sessions(&mut sessions, base, ttl), 0);
        assert_eq!(sessions.len(), 2);

        // At base + TTL only the entry created at base has aged out.
        let swept = purge_expired_sessions(&mut sessions, base + ttl, ttl);
        assert_eq!(swept, 1);
        assert!(sessions.contains_key("fresh"));
        assert!(!sessions.contains_key("stale"));
    }
}
