use crate::{
    explanation::{Explanation, ExplanationState},
    presentation::Report,
    session::{AnalysisRecord, ChatTurn, Session, SessionId},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use crate::session::ChatPrompt as ChatRequest;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionCreated {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExplanationView {
    pub status: ExplanationState,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Explanation> for ExplanationView {
    fn from(explanation: &Explanation) -> Self {
        Self {
            status: ExplanationState::settled(explanation),
            text: explanation.text().to_string(),
            error: explanation.error().map(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResponse {
    pub scan_id: u64,
    pub duration: Duration,
    pub report: Report,
    pub markdown: String,
    pub explanation: ExplanationView,
    pub suggested_questions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub turns: Vec<ChatTurn>,
    pub explanation: ExplanationView,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub state: ExplanationState,
    pub history: Vec<ChatTurn>,
    pub suggested_questions: Vec<String>,
    pub last_analysis: Option<AnalysisRecord>,
}

impl From<Session> for SessionView {
    fn from(session: Session) -> Self {
        Self {
            session_id: session.id,
            state: session.state,
            history: session.history.turns().to_vec(),
            suggested_questions: session.suggested_questions,
            last_analysis: session.last_analysis,
        }
    }
}
