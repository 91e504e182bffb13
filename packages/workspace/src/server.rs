//! JSON-over-HTTP binding of the document procedures.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use sketchpad_common::{
    CreateDocumentRequest, CreateDocumentResponse, Document, DocumentData, ErrorResponse,
    OpenedDocument, SaveDocumentRequest, SaveDocumentResponse, SuccessResponse,
};
use tower_http::cors::CorsLayer;

use crate::service::{DocumentService, ServiceError};

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

/// Helper to convert service errors to a status and body
fn to_api_error(e: ServiceError) -> ApiError {
    let status = if e.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(ErrorResponse::new(e.to_string())))
}

pub fn router(service: Arc<DocumentService>) -> Router {
    Router::new()
        .route(
            "/api/documents",
            get(list_documents)
                .post(create_document)
                .delete(delete_all_documents),
        )
        .route(
            "/api/documents/:id",
            get(get_document).put(save_document).delete(delete_document),
        )
        .route("/api/documents/:id/record", get(open_document))
        .with_state(service)
        .layer(CorsLayer::permissive())
}

async fn list_documents(State(service): State<Arc<DocumentService>>) -> Json<Vec<Document>> {
    Json(service.list_documents().await)
}

async fn get_document(
    State(service): State<Arc<DocumentService>>,
    Path(id): Path<String>,
) -> Json<DocumentData> {
    Json(service.get_document(&id).await)
}

async fn open_document(
    State(service): State<Arc<DocumentService>>,
    Path(id): Path<String>,
) -> ApiResult<OpenedDocument> {
    match service.open_document(&id).await {
        Some(opened) => Ok(Json(opened)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!("Document not found: {}", id))),
        )),
    }
}

/// The body is optional, but one that is present must be a valid request
fn parse_create_request(body: &[u8]) -> Result<CreateDocumentRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(CreateDocumentRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(format!("Invalid request body: {}", e))),
        )
    })
}

async fn create_document(
    State(service): State<Arc<DocumentService>>,
    body: Bytes,
) -> ApiResult<CreateDocumentResponse> {
    let title = parse_create_request(&body)?.title;
    service
        .create_document(title)
        .await
        .map(Json)
        .map_err(to_api_error)
}

async fn save_document(
    State(service): State<Arc<DocumentService>>,
    Path(id): Path<String>,
    Json(request): Json<SaveDocumentRequest>,
) -> ApiResult<SaveDocumentResponse> {
    service
        .save_document(&id, request)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!(document_id = %id, error = %e, "Save failed");
            to_api_error(e)
        })
}

async fn delete_document(
    State(service): State<Arc<DocumentService>>,
    Path(id): Path<String>,
) -> ApiResult<SuccessResponse> {
    service
        .delete_document(&id)
        .await
        .map(Json)
        .map_err(to_api_error)
}

async fn delete_all_documents(
    State(service): State<Arc<DocumentService>>,
) -> ApiResult<SuccessResponse> {
    service
        .delete_all_documents()
        .await
        .map(Json)
        .map_err(to_api_error)
}
