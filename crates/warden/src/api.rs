//! HTTP API
//!
//! | Route | Operation |
//! |---|---|
//! | `POST /certs/{domain}` | issue unconditionally (`?include_base=true` for wildcards) |
//! | `PUT /certs/{domain}` | renew an existing certificate that is due |
//! | `DELETE /certs/{domain}` | remove a certificate |
//! | `GET /root` | root CA as `{"cert": "<PEM>"}` |
//! | `GET /root/pem`, `GET /root/der` | root CA download |
//! | `GET /expires` | expiry per stored domain |

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::certs::{CertError, CertificateManager, DeleteOutcome, IssueReport};

type SharedManager = Arc<CertificateManager>;

/// Query parameters of `POST /certs/{domain}`
#[derive(Debug, Default, Deserialize)]
pub struct IssueParams {
    #[serde(default)]
    pub include_base: bool,
}

#[derive(Debug, Serialize)]
pub struct RootCertificate {
    pub cert: String,
}

/// [`CertError`] rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub CertError);

impl From<CertError> for ApiError {
    fn from(error: CertError) -> Self {
        Self(error)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            CertError::InvalidDomain { .. } => StatusCode::BAD_REQUEST,
            CertError::NotFound { .. } | CertError::RootMissing => StatusCode::NOT_FOUND,
            CertError::NotDueForRenewal { .. } | CertError::EngineFailure { .. } => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self.0 {
            CertError::EngineFailure {
                domain,
                status: code,
                diagnostic,
            } => {
                let report = IssueReport {
                    error: *code,
                    message: diagnostic.clone(),
                    domain: domain.clone(),
                };
                return (status, Json(report)).into_response();
            }
            CertError::InvalidDomain { domain, reason } => {
                json!({"message": format!("Invalid domain: {reason}"), "domain": domain})
            }
            CertError::NotFound { domain } => {
                json!({"message": "No such certificate", "domain": domain})
            }
            CertError::NotDueForRenewal {
                domain,
                days_remaining,
            } => json!({
                "message": "Certificate not due for expiry",
                "domain": domain,
                "days_remaining": days_remaining,
            }),
            CertError::RootMissing => json!({"message": "Root ca has not yet been generated"}),
            other => {
                error!(error = %other, "Request failed");
                json!({"message": other.to_string()})
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Build the API router over `manager`
pub fn router(manager: SharedManager) -> Router {
    Router::new()
        .route(
            "/certs/{domain}",
            post(issue_certificate)
                .put(renew_certificate)
                .delete(delete_certificate),
        )
        .route("/root", get(root_certificate))
        .route("/root/pem", get(root_certificate_pem))
        .route("/root/der", get(root_certificate_der))
        .route("/expires", get(expiries))
        .with_state(manager)
}

/// Serve the API on `listener` until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, manager: SharedManager, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Certificate API listening");
    }
    axum::serve(listener, router(manager))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn issue_certificate(
    State(manager): State<SharedManager>,
    Path(domain): Path<String>,
    Query(params): Query<IssueParams>,
) -> Result<Json<IssueReport>, ApiError> {
    info!(domain = %domain, include_base = params.include_base, "Issue requested");
    Ok(Json(manager.issue(&domain, params.include_base).await?))
}

async fn renew_certificate(
    State(manager): State<SharedManager>,
    Path(domain): Path<String>,
) -> Result<Json<IssueReport>, ApiError> {
    info!(domain = %domain, "Renewal requested");
    Ok(Json(manager.renew(&domain).await?))
}

async fn delete_certificate(
    State(manager): State<SharedManager>,
    Path(domain): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    info!(domain = %domain, "Deletion requested");
    match manager.delete(&domain).await? {
        DeleteOutcome::Removed => Ok(Json(
            json!({"message": "Certificate deleted", "domain": domain}),
        )),
        DeleteOutcome::NotPresent => Err(CertError::NotFound { domain }.into()),
    }
}

async fn root_certificate(
    State(manager): State<SharedManager>,
) -> Result<Json<RootCertificate>, ApiError> {
    let pem = manager.root_certificate_pem()?;
    Ok(Json(RootCertificate {
        cert: String::from_utf8_lossy(&pem).trim().to_string(),
    }))
}

async fn root_certificate_pem(State(manager): State<SharedManager>) -> Result<Response, ApiError> {
    let pem = manager.root_certificate_pem()?;
    Ok(attachment(pem, "application/x-pem-file", "cert.pem"))
}

async fn root_certificate_der(State(manager): State<SharedManager>) -> Result<Response, ApiError> {
    let der = manager.root_certificate_der()?;
    Ok(attachment(der, "application/pkix-cert", "cert.crt"))
}

async fn expiries(
    State(manager): State<SharedManager>,
) -> Result<Json<BTreeMap<String, DateTime<Utc>>>, ApiError> {
    Ok(Json(manager.expiry_report()?))
}

fn attachment(body: Vec<u8>, content_type: &'static str, filename: &str) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response()
}
