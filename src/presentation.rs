//! Turns predictions and chat history into something a user can read.

use crate::{
    classifier::{PredictionVector, TumorCategory},
    session::{ChatHistory, Role},
};
use serde::Serialize;

/// Visual treatment of a prediction headline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Indicator {
    Success,
    Warning,
}

impl Indicator {
    pub fn for_category(category: TumorCategory) -> Self {
        if category.is_tumor() {
            Indicator::Warning
        } else {
            Indicator::Success
        }
    }
}

/// One slice of the confidence chart.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CategoryScore {
    pub category: TumorCategory,
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Report {
    pub predicted: TumorCategory,
    pub confidence: f32,
    pub indicator: Indicator,
    pub headline: String,
    pub scores: Vec<CategoryScore>,
}

impl Report {
    pub fn from_prediction(prediction: &PredictionVector) -> Self {
        let predicted = prediction.predicted();
        let headline = match predicted {
            TumorCategory::Normal => "✅ Prediction: No Tumor Detected!".to_string(),
            tumor => format!("⚠️ Prediction: {tumor} Tumor Detected!"),
        };

        Self {
            predicted,
            confidence: prediction.confidence(),
            indicator: Indicator::for_category(predicted),
            headline,
            scores: prediction
                .iter()
                .map(|(category, confidence)| CategoryScore {
                    category,
                    confidence,
                })
                .collect(),
        }
    }

    /// Renders the report, followed by the explanation when one is given.
    pub fn to_markdown(&self, explanation: Option<&str>) -> String {
        let rows: String = self
            .scores
            .iter()
            .map(|score| format!("| {} | `{:.4}` |\n", score.category, score.confidence))
            .collect();
        let mut out = format!(
            "**{}**\n\nConfidence: `{:.4}`\n\n### Possibility of all categories\n\n\
             | Category | Confidence |\n|---|---|\n{rows}",
            self.headline, self.confidence
        );

        if let Some(explanation) = explanation {
            out.push_str("\n## AI Report\n\n");
            out.push_str(explanation);
            out.push('\n');
        }

        out
    }
}

/// Renders a conversation as Markdown, one block per turn.
pub fn render_transcript(history: &ChatHistory) -> String {
    history
        .turns()
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                Role::User => "You",
                Role::Assistant => "Assistant",
            };
            format!("**{speaker}:** {}", turn.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
