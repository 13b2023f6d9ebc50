//service/mod.rs
pub mod content_store;
pub mod deletion;
pub mod inspect;
pub mod ledger;
pub mod orphan_sweeper;
pub mod quota;
pub mod rate_limiter;
pub mod sniff;
pub mod upload;
pub mod user_context;
pub mod vault;
pub mod visibility;

use actix_web::error::ErrorInternalServerError;
use actix_web::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH};
use actix_web::{web, Error, HttpRequest, HttpResponse};
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, Utc};
use futures::StreamExt;
use log::{debug, info, warn};
use log_mdc;
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::error::{VaultError, VaultResult};
use crate::metadata::LinkFilter;
use crate::service::user_context::RequestContext;
use crate::service::vault::DownloadTicket;

/// Build the request context for an authenticated call: the numeric `User`
/// header names the caller, the request is rate limited per user, and every
/// other header is kept as context metadata.
fn header_handler(req: &HttpRequest, app_state: &AppState) -> Result<RequestContext, VaultError> {
    let raw = req
        .headers()
        .get("User")
        .ok_or_else(|| VaultError::Validation("Missing User header".to_string()))?
        .to_str()
        .map_err(|_| VaultError::Validation("Invalid User header value".to_string()))?;
    let user_id = raw
        .trim()
        .parse::<i64>()
        .map_err(|_| VaultError::Validation(format!("User header is not a user id: {:?}", raw)))?;

    log_mdc::insert("user", user_id.to_string());

    if let Some(limiter) = &app_state.rate_limiter {
        limiter.check(user_id)?;
    }

    let mut context = RequestContext::for_user(user_id).with_timeout(app_state.request_timeout());

    // Extract any additional headers as metadata
    for (header_name, header_value) in req.headers() {
        if let Ok(value_str) = header_value.to_str() {
            if header_name.as_str() != "user" {
                context.set_metadata(header_name.as_str().to_string(), value_str.to_string());
            }
        }
    }

    Ok(context)
}

fn anonymous_context(app_state: &AppState) -> RequestContext {
    log_mdc::insert("user", "-");
    RequestContext::anonymous().with_timeout(app_state.request_timeout())
}

/// Run blocking vault work off the async executor
async fn blocking<T, F>(work: F) -> Result<T, Error>
where
    F: FnOnce() -> VaultResult<T> + Send + 'static,
    T: Send + 'static,
{
    let result = web::block(work).await.map_err(ErrorInternalServerError)?;
    Ok(result?)
}

/// Quote-safe ASCII rendition of a display name for Content-Disposition
fn disposition_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn download_response(ticket: DownloadTicket, data: Vec<u8>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type(ticket.mime_type)
        .insert_header((
            CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", disposition_filename(&ticket.filename)),
        ))
        .body(data)
}

pub async fn upload_service(
    filename: String,
    mut payload: web::Payload,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req, &app_state)?;
    let max_file_size = app_state.vault.upload_settings().max_file_size;

    let declared_size = match req.headers().get(CONTENT_LENGTH) {
        Some(value) => Some(
            value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| VaultError::Validation("Invalid Content-Length header".to_string()))?,
        ),
        None => None,
    };
    if let Some(size) = declared_size {
        if size > max_file_size {
            return Err(VaultError::Validation(format!(
                "declared size {} exceeds the maximum of {} bytes",
                size, max_file_size
            ))
            .into());
        }
        // Reject before the body is transferred
        let vault = app_state.vault.clone();
        let quota_context = context.clone();
        blocking(move || vault.check_quota(&quota_context, size)).await?;
    }

    debug!("Starting chunk load for {:?}", filename);
    let mut bytes = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| {
            warn!("Error reading payload chunk: {}", e);
            ErrorInternalServerError("Error reading payload")
        })?;
        if (bytes.len() + chunk.len()) as u64 > max_file_size {
            return Err(VaultError::Validation(format!(
                "upload exceeds the maximum of {} bytes",
                max_file_size
            ))
            .into());
        }
        bytes.extend_from_slice(&chunk);
    }
    info!("Total received data size: {} bytes", bytes.len());

    let vault = app_state.vault.clone();
    let view = blocking(move || {
        let mut reader: &[u8] = &bytes;
        vault.upload(&context, &mut reader, &filename, declared_size)
    })
    .await?;

    Ok(HttpResponse::Created().json(view))
}

/// Query string accepted by the listing endpoint
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    /// RFC 3339 timestamp or `YYYY-MM-DD`
    pub start_date: Option<String>,
    /// RFC 3339 timestamp or `YYYY-MM-DD`; a bare date covers the whole day
    pub end_date: Option<String>,
}

fn parse_date_bound(raw: &str, end_of_day: bool) -> VaultResult<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| VaultError::Validation(format!("invalid date: {:?}", raw)))?;
    let time = if end_of_day {
        day.and_hms_nano_opt(23, 59, 59, 999_999_999)
    } else {
        day.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .ok_or_else(|| VaultError::Validation(format!("invalid date: {:?}", raw)))
}

impl ListQuery {
    pub fn into_filter(self) -> VaultResult<LinkFilter> {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Ok(LinkFilter {
            filename: non_empty(self.filename),
            mime_type: non_empty(self.mime_type),
            min_size: self.min_size,
            max_size: self.max_size,
            uploaded_after: non_empty(self.start_date)
                .map(|d| parse_date_bound(&d, false))
                .transpose()?,
            uploaded_before: non_empty(self.end_date)
                .map(|d| parse_date_bound(&d, true))
                .transpose()?,
        })
    }
}

pub async fn list_service(
    query: ListQuery,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req, &app_state)?;
    let filter = query.into_filter()?;
    debug!("Listing files with filter {:?}", filter);

    let vault = app_state.vault.clone();
    let files = blocking(move || vault.list(&context, &filter)).await?;
    Ok(HttpResponse::Ok().json(json!({ "files": files })))
}

pub async fn download_service(
    link_id: i64,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req, &app_state)?;

    let vault = app_state.vault.clone();
    let (ticket, data) = blocking(move || {
        let ticket = vault.download(&context, link_id)?;
        let data = vault.read_blob(&context, &ticket.locator)?;
        Ok((ticket, data))
    })
    .await?;

    info!("Serving link {} ({} bytes)", link_id, data.len());
    Ok(download_response(ticket, data))
}

pub async fn delete_service(
    link_id: i64,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req, &app_state)?;

    let vault = app_state.vault.clone();
    let outcome = blocking(move || vault.delete(&context, link_id)).await?;
    Ok(HttpResponse::Ok().json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    pub public: bool,
}

pub async fn visibility_service(
    link_id: i64,
    body: VisibilityRequest,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let context = header_handler(&req, &app_state)?;

    let vault = app_state.vault.clone();
    let view = blocking(move || vault.set_visibility(&context, link_id, body.public)).await?;
    Ok(HttpResponse::Ok().json(view))
}

pub async fn stats_service(req: HttpRequest, app_state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    let context = header_handler(&req, &app_state)?;

    let vault = app_state.vault.clone();
    let stats = blocking(move || vault.quota_stats(&context)).await?;
    Ok(HttpResponse::Ok().json(stats))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

pub async fn register_service(body: RegisterRequest, app_state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    let context = anonymous_context(&app_state);

    let vault = app_state.vault.clone();
    let account = blocking(move || {
        vault.register_user(&context, &body.username, &body.email, &body.password_hash)
    })
    .await?;
    Ok(HttpResponse::Created().json(account))
}

/// Token downloads need no User header and are not rate limited
pub async fn public_download_service(token: String, app_state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    let context = anonymous_context(&app_state);

    let vault = app_state.vault.clone();
    let (ticket, data) = blocking(move || {
        let ticket = vault.resolve_public(&context, &token)?;
        let data = vault.read_blob(&context, &ticket.locator)?;
        Ok((ticket, data))
    })
    .await?;
    Ok(download_response(ticket, data))
}

pub async fn health_service() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}
