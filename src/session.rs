//! Per-user conversation state.
//!
//! Each session is an explicit context object stored in a `SessionStore`;
//! handlers look it up by id instead of sharing ambient globals.

use crate::{
    classifier::TumorCategory,
    explanation::{Explainer, Explanation, ExplanationState},
    presentation::Report,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

pub type SessionId = u64;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("session is still waiting for an answer")]
    Busy,
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("no suggested question at index {0}")]
    UnknownSuggestion(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Append-only, ordered list of turns.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ChatHistory {
    turns: Vec<ChatTurn>,
}

impl ChatHistory {
    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.turns.push(ChatTurn {
            role,
            content: content.into(),
        });
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// What the user asked for: free text, or one of the suggested questions.
///
/// A suggestion wins over free text.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ChatPrompt {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub suggestion: Option<usize>,
}

/// The last analysis shown to the user.
#[derive(Clone, Debug, Serialize)]
pub struct AnalysisRecord {
    pub report: Report,
    pub explanation: String,
}

pub fn default_suggestions() -> Vec<String> {
    vec![
        "What is a Glioma?".to_string(),
        "What is a Meningioma?".to_string(),
        "What is a Pituitary tumor?".to_string(),
    ]
}

pub fn suggestions_for(category: TumorCategory) -> Vec<String> {
    match category {
        TumorCategory::Normal => vec![
            "What does a normal brain MRI mean?".to_string(),
            "When should I get another scan?".to_string(),
            "What are early signs of a brain tumor?".to_string(),
        ],
        tumor => vec![
            format!("What is a {tumor} tumor?"),
            format!("What treatments are available for a {tumor} tumor?"),
            "What kind of specialist should I consult?".to_string(),
        ],
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub state: ExplanationState,
    pub history: ChatHistory,
    pub suggested_questions: Vec<String>,
    pub last_analysis: Option<AnalysisRecord>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            state: ExplanationState::Idle,
            history: ChatHistory::default(),
            suggested_questions: default_suggestions(),
            last_analysis: None,
        }
    }

    /// Marks an explanation request as in flight.
    pub fn begin_request(&mut self) -> Result<(), SessionError> {
        if self.state == ExplanationState::Sent {
            return Err(SessionError::Busy);
        }
        self.state = ExplanationState::Sent;
        Ok(())
    }

    pub fn finish_request(&mut self, explanation: &Explanation) {
        self.state = ExplanationState::settled(explanation);
    }

    pub fn resolve_prompt(&self, prompt: &ChatPrompt) -> Result<String, SessionError> {
        if let Some(index) = prompt.suggestion {
            return self
                .suggested_questions
                .get(index)
                .cloned()
                .ok_or(SessionError::UnknownSuggestion(index));
        }

        match prompt.prompt.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Ok(text.to_string()),
            _ => Err(SessionError::EmptyPrompt),
        }
    }

    /// Appends the user turn and marks the session busy.
    pub fn begin_turn(&mut self, prompt: &str) -> Result<(), SessionError> {
        self.begin_request()?;
        self.history.push(Role::User, prompt);
        Ok(())
    }

    /// Appends the assistant turn and settles the request state.
    pub fn finish_turn(&mut self, explanation: &Explanation) {
        self.history.push(Role::Assistant, explanation.text());
        self.finish_request(explanation);
    }

    pub fn record_analysis(&mut self, report: Report, explanation: &Explanation) {
        self.suggested_questions = suggestions_for(report.predicted);
        self.last_analysis = Some(AnalysisRecord {
            report,
            explanation: explanation.text().to_string(),
        });
        self.finish_request(explanation);
    }
}

/// Runs one chat exchange against a session owned by the caller.
pub async fn converse<E: Explainer>(
    session: &mut Session,
    explainer: &E,
    prompt: &ChatPrompt,
) -> Result<Explanation, SessionError> {
    let text = session.resolve_prompt(prompt)?;
    session.begin_turn(&text)?;
    let explanation = explainer.explain(&text).await;
    session.finish_turn(&explanation);
    Ok(explanation)
}

/// All live sessions of the process.
#[derive(Default)]
pub struct SessionStore {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl SessionStore {
    pub fn create(&self) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(id, Session::new(id));
        log::debug!("Created session {}", id);
        id
    }

    /// Runs `f` against the session while holding the store lock.
    pub fn with_session<R>(
        &self,
        id: SessionId,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<R, SessionError> {
        let mut sessions = self.lock();
        let session = sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        Ok(f(session))
    }

    pub fn snapshot(&self, id: SessionId) -> Result<Session, SessionError> {
        self.with_session(id, |session| session.clone())
    }

    pub fn remove(&self, id: SessionId) -> Result<(), SessionError> {
        self.lock()
            .remove(&id)
            .map(|_| log::debug!("Removed session {}", id))
            .ok_or(SessionError::NotFound(id))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
