use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flows::states::Phase;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        Self(format!("run-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactOrigin {
    /// Model output accepted as-is.
    Generated,
    /// Replacement text supplied by the human.
    Edited,
}

/// A phase deliverable once the approval cycle has accepted it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub phase: Phase,
    pub body: String,
    pub origin: ArtifactOrigin,
    /// Number of feedback-driven regenerations before acceptance.
    pub revisions: u32,
    pub accepted_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(phase: Phase, body: impl Into<String>, origin: ArtifactOrigin, revisions: u32) -> Self {
        Self { phase, body: body.into(), origin, revisions, accepted_at: Utc::now() }
    }

    pub fn is_blank(&self) -> bool {
        self.body.trim().is_empty()
    }
}
