//! JSON API over the pipeline, the explanation service and chat sessions.

mod handlers;
pub mod messages;

use crate::{
    CerebrumPipeline, ClassifierError, DecodeError, PipelineError,
    classifier::Classifier,
    explanation::Explainer,
    session::{SessionError, SessionStore},
};
use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use std::sync::Arc;

/// Largest accepted upload.
pub const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Shared state handed to every handler.
pub struct AppState<C: Classifier, E> {
    pub pipeline: Arc<CerebrumPipeline<C>>,
    pub explainer: Arc<E>,
    pub sessions: Arc<SessionStore>,
}

impl<C: Classifier, E> AppState<C, E> {
    pub fn new(pipeline: CerebrumPipeline<C>, explainer: E) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            explainer: Arc::new(explainer),
            sessions: Arc::new(SessionStore::default()),
        }
    }
}

impl<C: Classifier, E> Clone for AppState<C, E> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            explainer: self.explainer.clone(),
            sessions: self.sessions.clone(),
        }
    }
}

/// Errors turned into JSON responses at the HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Session(SessionError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Session(SessionError::Busy) => StatusCode::CONFLICT,
            ApiError::Session(_) => StatusCode::BAD_REQUEST,
            ApiError::Pipeline(PipelineError::Decode(DecodeError::UnsupportedType(_))) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            ApiError::Pipeline(PipelineError::Decode(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Pipeline(PipelineError::Classifier(
                ClassifierError::ModelNotFound(_)
                | ClassifierError::Load { .. }
                | ClassifierError::IncompatibleArtifact { .. },
            )) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Pipeline(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("{}", self);
        } else {
            log::warn!("{}", self);
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Builds the application router.
pub fn router<C, E>(state: AppState<C, E>) -> Router
where
    C: Classifier + Send + Sync + 'static,
    E: Explainer + 'static,
{
    Router::new()
        .route("/", get(|| async { "Welcome to Cerebrum!" }))
        .route("/health", get(handlers::health::<C, E>))
        .route("/sessions", post(handlers::create_session::<C, E>))
        .route(
            "/sessions/{id}",
            get(handlers::get_session::<C, E>).delete(handlers::delete_session::<C, E>),
        )
        .route("/sessions/{id}/analyze", post(handlers::analyze::<C, E>))
        .route("/sessions/{id}/chat", post(handlers::chat::<C, E>))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}
