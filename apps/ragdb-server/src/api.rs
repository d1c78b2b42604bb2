//! HTTP surface of the retrieval pipeline.
//!
//! # Endpoints
//!
//! - `POST /v1/documents` - ingest (or re-ingest) one document
//! - `DELETE /v1/documents/:id` - remove a document's chunks
//! - `POST /v1/query` - top-k retrieval with optional metadata filter
//! - `GET /query?q=&k=` - query-string form of the same
//! - `GET /metrics` - Prometheus exposition
//! - `GET /health/live`, `GET /health/ready`

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use ragdb_core::error::Error;
use ragdb_core::types::{IngestStatus, QueryRequest, SourceDocument};
use ragdb_pipeline::Pipeline;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub q: String,
    pub k: Option<usize>,
}

pub fn create_router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/v1/documents", post(ingest_document))
        .route("/v1/documents/:id", delete(remove_document))
        .route("/v1/query", post(query))
        .route("/query", get(query_get))
        .route("/metrics", get(metrics))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .with_state(pipeline)
}

async fn ingest_document(
    State(pipeline): State<Arc<Pipeline>>,
    payload: Result<Json<SourceDocument>, JsonRejection>,
) -> Response {
    let Json(doc) = match payload {
        Ok(p) => p,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    match pipeline.ingest.ingest(doc).await {
        Ok(receipt) => {
            let status = match receipt.status {
                IngestStatus::Failed => StatusCode::UNPROCESSABLE_ENTITY,
                IngestStatus::Acknowledged | IngestStatus::Partial => StatusCode::OK,
            };
            (status, Json(receipt)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn remove_document(State(pipeline): State<Arc<Pipeline>>, Path(id): Path<String>) -> Response {
    match pipeline.ingest.remove_document(&id).await {
        Ok(receipt) => (StatusCode::OK, Json(receipt)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn query(State(pipeline): State<Arc<Pipeline>>, payload: Result<Json<QueryRequest>, JsonRejection>) -> Response {
    let Json(request) = match payload {
        Ok(p) => p,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    run_query(&pipeline, request).await
}

async fn query_get(State(pipeline): State<Arc<Pipeline>>, Query(params): Query<QueryParams>) -> Response {
    let k = params.k.unwrap_or(pipeline.query.settings().default_k);
    run_query(&pipeline, QueryRequest::new(params.q, k)).await
}

async fn run_query(pipeline: &Pipeline, request: QueryRequest) -> Response {
    match pipeline.query.query(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn metrics(State(pipeline): State<Arc<Pipeline>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], pipeline.render_metrics())
}

async fn live(State(pipeline): State<Arc<Pipeline>>) -> impl IntoResponse {
    (StatusCode::OK, Json(pipeline.health_report()))
}

async fn ready(State(pipeline): State<Arc<Pipeline>>) -> impl IntoResponse {
    let report = pipeline.health_report();
    let status = if report.ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(report))
}

pub fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::InvalidQuery(_) | Error::InputRejected(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Backpressure(_) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &Error) -> Response {
    let status = status_for(e);
    if e.is_client_error() {
        tracing::debug!(error = %e, status = status.as_u16(), "request rejected");
    } else {
        tracing::warn!(error = %e, status = status.as_u16(), "request failed");
    }
    (status, Json(ErrorResponse { error: e.to_string() })).into_response()
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: message })).into_response()
}
