//! Records of the append-only action log.
//!
//! The wire shape of a log entry is the one persistent contract other
//! tooling depends on: monotonically increasing `_id`, never rewritten.

use serde::{Deserialize, Serialize};

use crate::{ActionId, TimeSpan, UploadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Upload,
    Analyze,
    MarkedValid,
    MarkedInvalid,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let repr = match self {
            Self::Upload => "upload",
            Self::Analyze => "analyze",
            Self::MarkedValid => "marked_valid",
            Self::MarkedInvalid => "marked_invalid",
        };
        write!(f, "{repr}")
    }
}

/// Payload of a log entry, before the log assigns its id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionBody {
    pub action: ActionKind,

    pub timespans: Vec<TimeSpan>,

    /// Exactly one entry for `upload` / `marked_*`, possibly many for direct
    /// analyses, `None` for derived analyses.
    #[serde(default)]
    pub upload_ids: Option<Vec<UploadId>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_formats: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_types: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,

    /// The largest log id the producing run considered (`analyze` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_action_id: Option<ActionId>,
}

impl ActionBody {
    pub fn upload(upload_id: UploadId, timespan: TimeSpan, format: impl Into<String>) -> Self {
        Self {
            action: ActionKind::Upload,
            timespans: vec![timespan],
            upload_ids: Some(vec![upload_id]),
            output_formats: Some(vec![format.into()]),
            output_types: None,
            analyzer_id: None,
            git_url: None,
            git_commit: None,
            max_action_id: None,
        }
    }

    pub fn marked(
        valid: bool,
        upload_id: UploadId,
        timespans: Vec<TimeSpan>,
        output_formats: Option<Vec<String>>,
    ) -> Self {
        Self {
            action: if valid {
                ActionKind::MarkedValid
            } else {
                ActionKind::MarkedInvalid
            },
            timespans,
            upload_ids: Some(vec![upload_id]),
            output_formats,
            output_types: None,
            analyzer_id: None,
            git_url: None,
            git_commit: None,
            max_action_id: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn analyze(
        analyzer_id: impl Into<String>,
        output_types: Vec<String>,
        timespans: Vec<TimeSpan>,
        upload_ids: Option<Vec<UploadId>>,
        max_action_id: ActionId,
        git_url: impl Into<String>,
        git_commit: impl Into<String>,
    ) -> Self {
        Self {
            action: ActionKind::Analyze,
            timespans,
            upload_ids,
            output_formats: None,
            output_types: Some(output_types),
            analyzer_id: Some(analyzer_id.into()),
            git_url: Some(git_url.into()),
            git_commit: Some(git_commit.into()),
            max_action_id: Some(max_action_id),
        }
    }

    /// True when the entry advertises any of the given formats or types as
    /// its output, i.e. when it feeds an analyzer declaring those inputs.
    pub fn feeds(&self, input_formats: &[String], input_types: &[String]) -> bool {
        let format_hit = self
            .output_formats
            .iter()
            .flatten()
            .any(|f| input_formats.contains(f));

        let type_hit = self
            .output_types
            .iter()
            .flatten()
            .any(|t| input_types.contains(t));

        format_hit || type_hit
    }
}

/// A numbered entry of the action log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    #[serde(rename = "_id")]
    pub id: ActionId,

    #[serde(flatten)]
    pub body: ActionBody,
}

impl ActionRecord {
    pub fn same_code(&self, git_url: &str, git_commit: &str) -> bool {
        self.body.git_url.as_deref() == Some(git_url)
            && self.body.git_commit.as_deref() == Some(git_commit)
    }
}
