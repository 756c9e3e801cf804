//! Domain types and machinery shared by every kairos crate.
//!
//! Glossary:
//!  - `action`: one entry in the append-only action log (an upload, an
//!    analysis, or a validity flip).
//!  - `analyzer`: a registered pipeline stage, run as a subprocess, that
//!    turns uploads or upstream observations into new observations.
//!  - `scratch scope`: the isolated write area where a running analyzer
//!    places candidate observations before validation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod action;
pub mod config;
pub mod machine;
pub mod observation;
pub mod sensitivity;
pub mod stores;
pub mod timeline;

pub use action::*;
pub use machine::*;
pub use observation::*;
pub use stores::*;

/// Instant on the observatory time axis.
pub type Instant = chrono::DateTime<chrono::Utc>;

/// Closed interval on the time axis, `start <= end`.
pub type TimeSpan = (Instant, Instant);

/// Key into the action log. `-1` is the sentinel for "no action considered
/// yet"; every allocated id is non-negative.
pub type ActionId = i64;

/// Reference to an upload row in the metadata store.
pub type UploadId = String;

/// Key of an observation in the authoritative collection.
pub type ObservationId = u64;

/// Key of a document inside a scratch scope.
pub type ScratchDocId = u64;

pub const NO_ACTION_ID: ActionId = -1;

/// Reserved identifier prefix for module agents.
pub const MODULE_PREFIX: &str = "module_";

/// Reserved identifier prefix for online agents.
pub const ONLINE_PREFIX: &str = "online_";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("analyzer {0} not on record")]
    UnknownAnalyzer(String),

    #[error("scratch scope {0} not found")]
    UnknownScope(String),

    #[error("counter {0} not found")]
    UnknownCounter(String),

    #[error("stored document is corrupt: {0}")]
    Corrupt(String),

    #[error("internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn internal<T>(value: T) -> Self
    where
        T: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        StoreError::Internal(value.into())
    }

    pub fn corrupt(value: impl std::fmt::Display) -> Self {
        StoreError::Corrupt(value.to_string())
    }
}

/// Record of one registered analyzer module. Created by admin, never
/// destroyed; every component mutates it only through gated transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerRecord {
    pub id: String,
    pub state: AnalyzerState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wish: Option<Wish>,

    pub input_formats: Vec<String>,
    pub input_types: Vec<String>,
    pub output_types: Vec<String>,

    pub command_line: Vec<String>,
    pub working_dir: std::path::PathBuf,

    /// Populated between `executing` and `validating`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AnalyzerFailure>,

    /// Action id of the last successful commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<ActionId>,

    /// Advisory: why the sensor skipped this analyzer on its last tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stalled_reason: Option<String>,
}

impl AnalyzerRecord {
    pub fn new(
        id: impl Into<String>,
        input_formats: Vec<String>,
        input_types: Vec<String>,
        output_types: Vec<String>,
        command_line: Vec<String>,
        working_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            state: AnalyzerState::Disabled,
            wish: None,
            input_formats,
            input_types,
            output_types,
            command_line,
            working_dir: working_dir.into(),
            execution_result: None,
            error: None,
            action_id: None,
            stalled_reason: None,
        }
    }

    /// Direct analyzers consume raw uploads instead of derived observations.
    pub fn is_direct(&self) -> bool {
        self.input_types.is_empty()
    }
}

/// What a finished run left behind for the validator: the scratch scope it
/// wrote into, the largest action id it considered, and exactly one of
/// `timespans` / `upload_ids` depending on the sensitivity mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub scratch_scope: String,
    pub max_action_id: ActionId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timespans: Option<Vec<TimeSpan>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_ids: Option<Vec<UploadId>>,
}

/// Stamped on the analyzer record when it transitions to `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerFailure {
    pub domain: OwnerDomain,
    pub reason: String,
}

impl AnalyzerFailure {
    pub fn new(domain: OwnerDomain, reason: impl Into<String>) -> Self {
        Self {
            domain,
            reason: reason.into(),
        }
    }
}

/// Upload row in the external metadata store. The observatory core only
/// writes the per-environment `action_ids` / `valid` stamps; everything else
/// belongs to the uploader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: UploadId,

    #[serde(default)]
    pub complete: bool,

    #[serde(default)]
    pub meta: UploadMeta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Instant>,

    /// Environment name -> action id assigned by that environment.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub action_ids: std::collections::BTreeMap<String, ActionId>,

    /// Environment name -> current validity.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub valid: std::collections::BTreeMap<String, bool>,

    /// Uploader-defined fields; the admission filter matches against these.
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Instant>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<Instant>,
}

impl UploadRecord {
    /// An upload is admissible once complete with format and time bounds,
    /// and not yet stamped for the given environment.
    pub fn is_pending(&self, environment: &str) -> bool {
        self.complete
            && self.meta.format.is_some()
            && self.meta.start_time.is_some()
            && self.meta.stop_time.is_some()
            && !self.action_ids.contains_key(environment)
    }
}

/// Scoped credential record provisioned for one agent: read access to the
/// shared scopes, read+write only on its own scratch scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantRecord {
    pub identifier: String,
    pub token: String,
    pub scratch_scope: String,
    pub read_scopes: Vec<String>,
}

/// Admin-initiated message drained by the validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AdminRequest {
    ValidateUpload { upload_id: UploadId, valid: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: u64,
    pub receiver: String,

    #[serde(flatten)]
    pub request: AdminRequest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyzer_directness_follows_input_types() {
        let direct = AnalyzerRecord::new("a", vec!["f0".into()], vec![], vec![], vec![], "/tmp");
        assert!(direct.is_direct());

        let derived = AnalyzerRecord::new("b", vec![], vec!["t0".into()], vec![], vec![], "/tmp");
        assert!(!derived.is_direct());
    }

    #[test]
    fn upload_pending_requires_complete_metadata() {
        let mut upload = UploadRecord {
            id: "u0".into(),
            complete: true,
            meta: UploadMeta {
                format: Some("fmt".into()),
                start_time: Some(chrono::Utc::now()),
                stop_time: Some(chrono::Utc::now()),
            },
            timestamp: None,
            action_ids: Default::default(),
            valid: Default::default(),
            extra: Default::default(),
        };

        assert!(upload.is_pending("prod"));

        upload.action_ids.insert("prod".into(), 7);
        assert!(!upload.is_pending("prod"));
        assert!(upload.is_pending("staging"));

        upload.meta.format = None;
        assert!(!upload.is_pending("staging"));
    }
}
