use super::{
    ApiError, AppState,
    messages::{
        AnalysisResponse, ChatRequest, ChatResponse, ExplanationView, HealthResponse,
        SessionCreated, SessionView,
    },
};
use crate::{
    ImageMime, PipelineError, UploadedImage,
    classifier::Classifier,
    explanation::{self, Explainer},
    presentation::Report,
    session::{ChatTurn, Role, SessionError, SessionId, SessionStore},
};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use std::sync::Arc;

pub(super) async fn health<C, E>(State(state): State<AppState<C, E>>) -> Json<HealthResponse>
where
    C: Classifier + Send + Sync + 'static,
    E: Explainer + 'static,
{
    Json(HealthResponse {
        status: "ok".to_string(),
        model: state.pipeline.model_status().as_str().to_string(),
    })
}

pub(super) async fn create_session<C, E>(State(state): State<AppState<C, E>>) -> impl IntoResponse
where
    C: Classifier + Send + Sync + 'static,
    E: Explainer + 'static,
{
    let session_id = state.sessions.create();
    log::info!("Opened session {}", session_id);
    (StatusCode::CREATED, Json(SessionCreated { session_id }))
}

pub(super) async fn get_session<C, E>(
    State(state): State<AppState<C, E>>,
    Path(id): Path<SessionId>,
) -> Result<Json<SessionView>, ApiError>
where
    C: Classifier + Send + Sync + 'static,
    E: Explainer + 'static,
{
    Ok(Json(state.sessions.snapshot(id)?.into()))
}

pub(super) async fn delete_session<C, E>(
    State(state): State<AppState<C, E>>,
    Path(id): Path<SessionId>,
) -> Result<StatusCode, ApiError>
where
    C: Classifier + Send + Sync + 'static,
    E: Explainer + 'static,
{
    state.sessions.remove(id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn analyze<C, E>(
    State(state): State<AppState<C, E>>,
    Path(id): Path<SessionId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AnalysisResponse>, ApiError>
where
    C: Classifier + Send + Sync + 'static,
    E: Explainer + 'static,
{
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let mime = ImageMime::from_content_type(content_type).map_err(PipelineError::from)?;

    // fail fast on unknown sessions before paying for inference
    state.sessions.with_session(id, |_| ())?;

    let upload = UploadedImage::new(body.to_vec(), mime);
    let pipeline = state.pipeline.clone();
    let scan = tokio::task::spawn_blocking(move || pipeline.run(upload))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    let report = Report::from_prediction(&scan.prediction);
    log::info!(
        "Session {}: scan {} classified as {} ({:.4}) in {:?}",
        id,
        scan.id,
        report.predicted,
        report.confidence,
        scan.duration
    );

    state
        .sessions
        .with_session(id, |session| session.begin_request())??;

    let query = explanation::initial_query(report.predicted);
    let recorded = report.clone();
    let settled = settle(&state, move |explainer, sessions| async move {
        let explanation = explainer.explain(&query).await;
        let suggested_questions = sessions.with_session(id, |session| {
            session.record_analysis(recorded, &explanation);
            session.suggested_questions.clone()
        })?;
        Ok::<_, SessionError>((explanation, suggested_questions))
    });
    let (explanation, suggested_questions) = settled.await?;

    Ok(Json(AnalysisResponse {
        scan_id: scan.id,
        duration: scan.duration,
        markdown: report.to_markdown(Some(explanation.text())),
        report,
        explanation: ExplanationView::from(&explanation),
        suggested_questions,
    }))
}

pub(super) async fn chat<C, E>(
    State(state): State<AppState<C, E>>,
    Path(id): Path<SessionId>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError>
where
    C: Classifier + Send + Sync + 'static,
    E: Explainer + 'static,
{
    let prompt = state.sessions.with_session(id, |session| {
        let prompt = session.resolve_prompt(&request)?;
        session.begin_turn(&prompt)?;
        Ok::<_, SessionError>(prompt)
    })??;

    log::debug!("Session {}: asking the explanation service", id);
    let question = prompt.clone();
    let explanation = settle(&state, move |explainer, sessions| async move {
        let explanation = explainer.explain(&question).await;
        sessions.with_session(id, |session| session.finish_turn(&explanation))?;
        Ok::<_, SessionError>(explanation)
    })
    .await?;

    Ok(Json(ChatResponse {
        turns: vec![
            ChatTurn {
                role: Role::User,
                content: prompt,
            },
            ChatTurn {
                role: Role::Assistant,
                content: explanation.text().to_string(),
            },
        ],
        explanation: ExplanationView::from(&explanation),
    }))
}

/// Runs the part of a request that follows `begin_request` on its own task.
///
/// The task outlives the handler, so a client that hangs up mid-request still
/// leaves its session settled instead of stuck in `Sent`.
async fn settle<C, E, F, Fut, R>(state: &AppState<C, E>, exchange: F) -> Result<R, ApiError>
where
    C: Classifier + Send + Sync + 'static,
    E: Explainer + 'static,
    F: FnOnce(Arc<E>, Arc<SessionStore>) -> Fut,
    Fut: Future<Output = Result<R, SessionError>> + Send + 'static,
    R: Send + 'static,
{
    let task = tokio::spawn(exchange(state.explainer.clone(), state.sessions.clone()));
    task.await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)
}
