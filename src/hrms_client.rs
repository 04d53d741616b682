// src/hrms_client.rs
//
// Client for the HRMS backend that owns the document store: the active
// employee directory, the device-id allotment table, the check-in app
// punches, and the data-import machinery the validated sheet is handed to.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::source_formats::{
    format_time, parse_date_lenient, parse_time_lenient, DeviceRow, RawSource, DEFAULT_SHIFT,
};

pub const DEFAULT_DIRECTORY_CACHE_SECS: u64 = 10 * 60;
const REQUEST_TIMEOUT_SECS: u64 = 30;

// --- Error type ---

#[derive(Error, Debug)]
pub enum HrmsError {
    #[error("HTTP request failed")]
    Request(#[from] reqwest::Error),

    #[error("JSON processing error")]
    Json(#[from] serde_json::Error),

    #[error("URL parsing error")]
    UrlParse(#[from] url::ParseError),

    #[error("HRMS API error: Status={status}, Message='{message}'")]
    ApiError { status: StatusCode, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// --- Configuration ---

#[derive(Clone, Debug)]
pub struct HrmsConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub directory_cache_secs: u64,
}

impl HrmsConfig {
    fn auth_header(&self) -> String {
        format!("token {}:{}", self.api_key, self.api_secret)
    }
}

// --- Wire shapes ---

#[derive(Debug, Deserialize)]
struct EmployeeResource {
    name: String,
    employee_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmployeeListResponse {
    data: Vec<EmployeeResource>,
}

#[derive(Debug, Deserialize)]
struct DeviceAllotment {
    device: String,
    device_id: String,
    employee: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse<T> {
    message: T,
}

#[derive(Debug, Deserialize)]
struct AppCheckinRow {
    employee: String,
    #[serde(default)]
    employee_name: Option<String>,
    #[serde(default)]
    shift: Option<String>,
    attendance_date: String,
    #[serde(default)]
    in_time: Option<String>,
    #[serde(default)]
    out_time: Option<String>,
}

#[derive(Debug, Serialize)]
struct AppCheckinRequest<'a> {
    employees: &'a [String],
    from_date: String,
    to_date: String,
}

#[derive(Debug, Serialize)]
struct DataImportRequest<'a> {
    file_name: &'a str,
    content: &'a str,
}

// Error payload the HRMS returns on failed calls; the message is optional
// and the body is sometimes plain text.
#[derive(Debug, Deserialize)]
struct HrmsErrorPayload {
    message: Option<String>,
}

// --- Collaborator seam ---

/// The external collaborators of the reconciliation pipeline. A trait so
/// the pipeline and handlers run against a stub in tests.
#[async_trait]
pub trait AttendanceBackend: Send + Sync {
    /// Active employees, `employee id -> employee name`.
    async fn active_employees(&self) -> Result<HashMap<String, String>, HrmsError>;

    /// Device allotment table, `(device, device id) -> employee id`.
    async fn device_allotments(&self) -> Result<HashMap<(String, String), String>, HrmsError>;

    /// Daily first-in/last-out punches from the check-in app for the given
    /// employees and payroll period, as raw rows with source "App".
    async fn app_checkins(
        &self,
        employees: &[String],
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DeviceRow>, HrmsError>;

    /// Create a data-import record for the validated sheet. Returns the
    /// import record id.
    async fn create_attendance_import(&self, csv: &str) -> Result<String, HrmsError>;
}

// --- Client ---

pub struct HrmsClient {
    config: HrmsConfig,
    http_client: Client,
    directory_cache: Mutex<Option<(Instant, HashMap<String, String>)>>,
}

impl HrmsClient {
    pub fn new(config: HrmsConfig) -> Result<Self, HrmsError> {
        if config.base_url.is_empty() {
            return Err(HrmsError::ConfigError("HRMS base URL is empty".to_string()));
        }
        // Reject unparseable base URLs up front instead of on first call.
        Url::parse(&config.base_url)?;
        let http_client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            config,
            http_client,
            directory_cache: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, HrmsError> {
        Ok(Url::parse(&self.config.base_url)?.join(path)?)
    }

    async fn check_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, HrmsError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<HrmsErrorPayload>(&body)
            .ok()
            .and_then(|p| p.message)
            .unwrap_or(body);
        warn!("HRMS call failed: status={}, message='{}'", status, message);
        Err(HrmsError::ApiError { status, message })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, HrmsError> {
        let response = self
            .http_client
            .get(url)
            .header(AUTHORIZATION, self.config.auth_header())
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        Self::check_response(response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<T, HrmsError> {
        let response = self
            .http_client
            .post(url)
            .header(AUTHORIZATION, self.config.auth_header())
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await?;
        Self::check_response(response).await
    }

    async fn fetch_active_employees(&self) -> Result<HashMap<String, String>, HrmsError> {
        let mut url = self.endpoint("api/resource/Employee")?;
        url.query_pairs_mut()
            .append_pair("filters", r#"[["status","=","Active"]]"#)
            .append_pair("fields", r#"["name","employee_name"]"#)
            .append_pair("limit_page_length", "0");
        let response: EmployeeListResponse = self.get_json(url).await?;
        Ok(response
            .data
            .into_iter()
            .map(|e| (e.name, e.employee_name.unwrap_or_default()))
            .collect())
    }
}

#[async_trait]
impl AttendanceBackend for HrmsClient {
    async fn active_employees(&self) -> Result<HashMap<String, String>, HrmsError> {
        let mut cache = self.directory_cache.lock().await;
        if let Some((fetched_at, directory)) = cache.as_ref() {
            if fetched_at.elapsed() < Duration::from_secs(self.config.directory_cache_secs) {
                debug!("Employee directory cache hit ({} employees)", directory.len());
                return Ok(directory.clone());
            }
        }
        debug!("Employee directory cache stale or empty, fetching from HRMS");
        let directory = self.fetch_active_employees().await?;
        info!("Fetched employee directory: {} active employees", directory.len());
        *cache = Some((Instant::now(), directory.clone()));
        Ok(directory)
    }

    async fn device_allotments(&self) -> Result<HashMap<(String, String), String>, HrmsError> {
        let url = self.endpoint("api/method/hrms.attendance.device_allotments")?;
        let response: MessageResponse<Vec<DeviceAllotment>> = self.get_json(url).await?;
        Ok(response
            .message
            .into_iter()
            .map(|a| ((a.device, a.device_id), a.employee))
            .collect())
    }

    async fn app_checkins(
        &self,
        employees: &[String],
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DeviceRow>, HrmsError> {
        let url = self.endpoint("api/method/hrms.attendance.app_checkins")?;
        let request = AppCheckinRequest {
            employees,
            from_date: from.format("%Y-%m-%d").to_string(),
            to_date: to.format("%Y-%m-%d").to_string(),
        };
        let response: MessageResponse<Vec<AppCheckinRow>> = self.post_json(url, &request).await?;

        let mut rows = Vec::with_capacity(response.message.len());
        for checkin in response.message {
            let Some(date) = parse_date_lenient(&checkin.attendance_date) else {
                warn!(
                    "Skipping app check-in with unparseable date '{}' for {}",
                    checkin.attendance_date, checkin.employee
                );
                continue;
            };
            rows.push(DeviceRow {
                device_id: String::new(),
                device: RawSource::App.label().to_string(),
                employee_id: Some(checkin.employee),
                employee_name: checkin.employee_name.unwrap_or_default(),
                attendance_date: date,
                shift: checkin
                    .shift
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_SHIFT.to_string()),
                in_time: format_time(checkin.in_time.as_deref().and_then(parse_time_lenient)),
                out_time: format_time(checkin.out_time.as_deref().and_then(parse_time_lenient)),
            });
        }
        Ok(rows)
    }

    async fn create_attendance_import(&self, csv: &str) -> Result<String, HrmsError> {
        let url = self.endpoint("api/method/hrms.attendance.create_data_import")?;
        let request = DataImportRequest {
            file_name: "attendance_import.csv",
            content: csv,
        };
        let response: MessageResponse<String> = self.post_json(url, &request).await?;
        info!("Created attendance data import: {}", response.message);
        Ok(response.message)
    }
}
