// src/api.rs
use actix_web::{delete, get, patch, post, web, Error, HttpRequest, HttpResponse};

use crate::app_state::AppState;
use crate::service::{
    delete_service, download_service, health_service, list_service, public_download_service, register_service,
    stats_service, upload_service, visibility_service, ListQuery, RegisterRequest, VisibilityRequest,
};

#[get("/health")]
pub async fn health() -> HttpResponse {
    health_service().await
}

#[post("/api/users")]
pub async fn register(body: web::Json<RegisterRequest>, app_state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    register_service(body.into_inner(), app_state).await
}

#[post("/api/files/{filename}")]
pub async fn upload(
    filename: web::Path<String>,
    payload: web::Payload,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    upload_service(filename.into_inner(), payload, req, app_state).await
}

#[get("/api/files")]
pub async fn list(
    query: web::Query<ListQuery>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    list_service(query.into_inner(), req, app_state).await
}

#[get("/api/files/{id}/download")]
pub async fn download(id: web::Path<i64>, req: HttpRequest, app_state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    download_service(id.into_inner(), req, app_state).await
}

#[delete("/api/files/{id}")]
pub async fn remove(id: web::Path<i64>, req: HttpRequest, app_state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    delete_service(id.into_inner(), req, app_state).await
}

#[patch("/api/files/{id}/visibility")]
pub async fn visibility(
    id: web::Path<i64>,
    body: web::Json<VisibilityRequest>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    visibility_service(id.into_inner(), body.into_inner(), req, app_state).await
}

#[get("/api/storage-stats")]
pub async fn stats(req: HttpRequest, app_state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    stats_service(req, app_state).await
}

#[get("/api/public/{token}")]
pub async fn public_download(token: web::Path<String>, app_state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    public_download_service(token.into_inner(), app_state).await
}

/// Register every route on an App or scope
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(register)
        .service(upload)
        .service(list)
        .service(download)
        .service(remove)
        .service(visibility)
        .service(stats)
        .service(public_download);
}
