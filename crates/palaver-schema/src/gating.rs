//! Session lifecycle states and the consent-gating state machine.
//!
//! External channels have no UI, so consent and the optional pre-survey are
//! collected through the conversation itself. The flow is a small finite
//! state machine over the session status; transitions are driven only by
//! inbound user messages.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Setup,
    Pending,
    PendingPreSurvey,
    Active,
    /// Terminal: the session has ended and awaits review.
    PendingReview,
    Complete,
    Unknown,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Pending => "pending",
            Self::PendingPreSurvey => "pending-pre-survey",
            Self::Active => "active",
            Self::PendingReview => "pending-review",
            Self::Complete => "complete",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "setup" => Self::Setup,
            "pending" => Self::Pending,
            "pending-pre-survey" => Self::PendingPreSurvey,
            "active" => Self::Active,
            "pending-review" => Self::PendingReview,
            "complete" => Self::Complete,
            _ => Self::Unknown,
        }
    }

    /// Whether the session still needs the pre-conversation formalities.
    pub fn requires_gating(&self) -> bool {
        matches!(self, Self::Setup | Self::Pending | Self::PendingPreSurvey)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the orchestrator must do after a gating transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatingAction {
    /// Send (or re-send) the consent request.
    AskConsent,
    /// Send (or re-send) the pre-survey link.
    AskSurvey,
    /// Gating is complete; activate the session and send the seed message.
    StartConversation,
}

/// The consent-gating transition table.
///
/// `gave_consent` is whether the inbound reply equals the consent token;
/// `has_survey` is whether the experiment configures a pre-survey.
/// Returns `None` for statuses outside the gating flow.
pub fn consent_transition(
    status: SessionStatus,
    gave_consent: bool,
    has_survey: bool,
) -> Option<(SessionStatus, GatingAction)> {
    use GatingAction::*;
    use SessionStatus::*;

    let next = match (status, gave_consent, has_survey) {
        // First inbound message moves the session out of setup and prompts
        // for consent regardless of what was said.
        (Setup, _, _) => (Pending, AskConsent),
        (Pending, true, false) => (Active, StartConversation),
        (Pending, true, true) => (PendingPreSurvey, AskSurvey),
        (Pending, false, _) => (Pending, AskConsent),
        (PendingPreSurvey, true, _) => (Active, StartConversation),
        (PendingPreSurvey, false, _) => (PendingPreSurvey, AskSurvey),
        _ => return None,
    };
    Some(next)
}
