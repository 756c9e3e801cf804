//! The commit engine: schema-validate scratch output, reconcile it against
//! the live observations, append the `analyze` log entry, and fix up
//! validity histories.
//!
//! The log append is the commit point. Everything after it only touches
//! observation bodies in ways that are idempotent for identical scratch
//! content, so an interrupted fix-up can be repeated.

use std::collections::HashMap;
use std::fmt::Display;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use kairos_core::timeline::Timeline;
use kairos_core::{
    ActionBody, ActionId, ActionLog as _, AnalyzerRecord, CandidateQuery, Domain,
    ExecutionResult, IdFactory as _, Observation, ObservationId, ObservationOp,
    ObservationStore as _, ScratchDocId, ScratchObservation, ScratchStore as _, StoreError,
    TimeSpan, UploadId, ACTION_ID_COUNTER, SCRATCH_FIELDS,
};

use crate::repo::{self, RepoError};
use crate::validator::checks;

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub doc: Option<ScratchDocId>,
    pub reason: String,
    pub extra: String,
}

impl ValidationIssue {
    fn new(doc: Option<ScratchDocId>, reason: impl Into<String>, extra: impl Into<String>) -> Self {
        Self {
            doc,
            reason: reason.into(),
            extra: extra.into(),
        }
    }
}

impl Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.doc {
            Some(doc) => write!(f, "validation error on document {}: {}", doc, self.reason)?,
            None => write!(f, "validation error: {}", self.reason)?,
        }

        if !self.extra.is_empty() {
            write!(f, " ({})", self.extra)?;
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("validation failed with {} issue(s)", .0.len())]
    Validation(Vec<ValidationIssue>),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error("{0}")]
    Internal(String),
}

impl From<serde_json::Error> for CommitError {
    fn from(error: serde_json::Error) -> Self {
        CommitError::Internal(format!("codec error: {error}"))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommitOutcome {
    pub action_id: ActionId,
    pub valid_count: usize,
    pub kept: usize,
    pub inserted: usize,
    pub deprecated: usize,
}

/// What kind of run is being committed, resolved from the execution result.
enum RunKind {
    Normal,
    Direct {
        upload_ids: Vec<UploadId>,
        upload_actions: Vec<ActionId>,
    },
}

/// Check every scratch document against the schema, the declared output
/// types, and the run's timespans. Issues accumulate up to the abort cap.
pub fn validate(
    analyzer_id: &str,
    timespans: &[TimeSpan],
    output_types: &[String],
    docs: &[(ScratchDocId, Value)],
    abort_max_errors: usize,
) -> (Vec<(ScratchDocId, ScratchObservation)>, Vec<ValidationIssue>) {
    let mut issues = Vec::new();
    let mut parsed = Vec::new();

    if timespans.is_empty() {
        issues.push(ValidationIssue::new(None, "no timespans given", ""));
        return (parsed, issues);
    }

    for (doc_id, doc) in docs {
        match validate_doc(analyzer_id, timespans, output_types, *doc_id, doc) {
            Ok(observation) => parsed.push((*doc_id, observation)),
            Err(issue) => {
                issues.push(issue);
                if issues.len() > abort_max_errors {
                    break;
                }
            }
        }
    }

    (parsed, issues)
}

fn validate_doc(
    analyzer_id: &str,
    timespans: &[TimeSpan],
    output_types: &[String],
    doc_id: ScratchDocId,
    doc: &Value,
) -> Result<ScratchObservation, ValidationIssue> {
    let doc_id = Some(doc_id);

    let Some(fields) = doc.as_object() else {
        return Err(ValidationIssue::new(doc_id, "document is not an object", ""));
    };

    let expected: Vec<&str> = SCRATCH_FIELDS.iter().copied().filter(|f| *f != "_id").collect();

    let unexpected: Vec<&String> = fields
        .keys()
        .filter(|k| !expected.contains(&k.as_str()))
        .collect();
    let missing: Vec<&&str> = expected
        .iter()
        .filter(|k| !fields.contains_key(**k))
        .collect();

    if !unexpected.is_empty() || !missing.is_empty() {
        return Err(ValidationIssue::new(
            doc_id,
            "wrong fields",
            format!("expected {expected:?}, unexpected {unexpected:?}, missing {missing:?}"),
        ));
    }

    let observation: ScratchObservation = serde_json::from_value(doc.clone())
        .map_err(|e| ValidationIssue::new(doc_id, "malformed document", e.to_string()))?;

    if observation.analyzer_id != analyzer_id {
        return Err(ValidationIssue::new(
            doc_id,
            "wrong analyzer id",
            format!("expected {analyzer_id}, got {}", observation.analyzer_id),
        ));
    }

    if let Some(condition) = observation
        .conditions
        .iter()
        .find(|c| !output_types.contains(c))
    {
        return Err(ValidationIssue::new(
            doc_id,
            "condition not declared in output_types",
            format!("expected {condition} to be in {output_types:?}"),
        ));
    }

    if !timespans.iter().any(|span| observation.time.within(span)) {
        return Err(ValidationIssue::new(doc_id, "timespan", ""));
    }

    if !observation.path.is_array() {
        return Err(ValidationIssue::new(doc_id, "path field is not a list", ""));
    }

    let sources_ok = match &observation.sources {
        Value::Array(_) => true,
        Value::Object(map) => map
            .get("upl")
            .and_then(Value::as_array)
            .is_some_and(|ids| ids.iter().all(|id| id.as_i64().is_some())),
        _ => false,
    };

    if !sources_ok {
        return Err(ValidationIssue::new(
            doc_id,
            "sources field is neither a list nor an object with upload action ids",
            "",
        ));
    }

    for condition in &observation.conditions {
        if checks::check_value(condition, &observation.value) == Some(false) {
            return Err(ValidationIssue::new(
                doc_id,
                "value",
                format!("value check for condition {condition} failed"),
            ));
        }
    }

    Ok(observation)
}

fn resolve_kind<D: Domain>(
    domain: &D,
    result: &ExecutionResult,
) -> Result<(RunKind, Vec<TimeSpan>), CommitError> {
    match (&result.timespans, &result.upload_ids) {
        (Some(timespans), None) => Ok((RunKind::Normal, timespans.clone())),

        (None, Some(upload_ids)) => {
            let mut upload_actions = Vec::with_capacity(upload_ids.len());
            let mut merged = Timeline::new();

            for upload_id in upload_ids {
                let entry = domain.actions().upload_action(upload_id)?.ok_or_else(|| {
                    CommitError::Internal(format!("upload {upload_id} has no entry in the action log"))
                })?;

                upload_actions.push(entry.id);
                for (start, end) in entry.body.timespans {
                    merged.add(start, end);
                }
            }

            Ok((
                RunKind::Direct {
                    upload_ids: upload_ids.clone(),
                    upload_actions,
                },
                merged.into_intervals(),
            ))
        }

        _ => Err(CommitError::Internal(
            "execution result must carry exactly one of timespans and upload_ids".into(),
        )),
    }
}

pub fn commit<D: Domain>(
    domain: &D,
    analyzer: &AnalyzerRecord,
    result: &ExecutionResult,
    abort_max_errors: usize,
) -> Result<CommitOutcome, CommitError> {
    let (kind, timespans) = resolve_kind(domain, result)?;

    // the working directory was cleaned by the supervisor before execution
    let (git_url, git_commit) =
        repo::repository_url_commit(&analyzer.working_dir).map_err(|e| {
            CommitError::Internal(format!(
                "working_dir of analyzer {} is not a usable git repository: {e}",
                analyzer.id
            ))
        })?;

    debug!(analyzer = %analyzer.id, "validating scratch output");

    let docs = domain.scratch().docs(&result.scratch_scope)?;
    let (parsed, issues) = validate(
        &analyzer.id,
        &timespans,
        &analyzer.output_types,
        &docs,
        abort_max_errors,
    );

    if !issues.is_empty() {
        return Err(CommitError::Validation(issues));
    }

    let valid_count = parsed.len();

    let action_id = domain.ids().next_id(ACTION_ID_COUNTER)? as ActionId;

    domain.scratch().stamp_all(&result.scratch_scope, action_id)?;

    // index scratch by content hash for counterpart lookup
    let mut by_hash: HashMap<String, Vec<(ScratchDocId, Value)>> = HashMap::new();
    for (doc_id, observation) in &parsed {
        by_hash
            .entry(observation.content_hash()?)
            .or_default()
            .push((*doc_id, observation.compare_value()?));
    }

    let query = match &kind {
        RunKind::Normal => CandidateQuery::Timespans {
            analyzer_id: &analyzer.id,
            timespans: &timespans,
        },
        RunKind::Direct { upload_actions, .. } => CandidateQuery::UploadActions {
            analyzer_id: &analyzer.id,
            upload_actions,
        },
    };

    debug!(analyzer = %analyzer.id, "looking for counterparts among live candidates");

    let candidates = domain.observations().candidates(&query)?;

    // scratch doc id -> (live counterpart, was it valid before this run)
    let mut counterparts: HashMap<ScratchDocId, (ObservationId, bool)> = HashMap::new();

    for (obs_id, candidate) in &candidates {
        if let Some(counterpart) = find_counterpart(candidate, &by_hash)? {
            counterparts.insert(counterpart, (*obs_id, candidate.is_valid()));
            domain
                .scratch()
                .set_counterpart(&result.scratch_scope, counterpart, *obs_id)?;
        }
    }

    let (run_timespans, run_upload_ids) = match &kind {
        RunKind::Normal => (timespans.clone(), None),
        RunKind::Direct { upload_ids, .. } => (timespans.clone(), Some(upload_ids.clone())),
    };

    // the commit point: everything beyond this entry is repeatable fix-up
    domain.actions().append_with_id(
        action_id,
        ActionBody::analyze(
            analyzer.id.clone(),
            analyzer.output_types.clone(),
            run_timespans,
            run_upload_ids,
            result.max_action_id,
            git_url,
            git_commit,
        ),
    )?;

    // push a provisional invalidation onto every candidate that was valid;
    // kept counterparts get it popped again below
    let deprecated = domain.observations().push_invalidations(&query, action_id)?;

    let mut ops = Vec::with_capacity(parsed.len());
    let mut kept = 0;
    let mut inserted = 0;

    for (doc_id, observation) in parsed {
        match counterparts.get(&doc_id) {
            Some((obs_id, was_valid)) => {
                kept += 1;
                if *was_valid {
                    ops.push(ObservationOp::RetractInvalidation {
                        id: *obs_id,
                        action_id,
                    });
                } else {
                    ops.push(ObservationOp::Revive {
                        id: *obs_id,
                        action_id,
                    });
                }
            }
            None => {
                inserted += 1;
                ops.push(ObservationOp::Insert {
                    observation: observation.into_observation(action_id)?,
                });
            }
        }
    }

    domain.observations().apply(&ops)?;

    domain.scratch().drop_scope(&result.scratch_scope)?;

    let outcome = CommitOutcome {
        action_id,
        valid_count,
        kept,
        inserted,
        deprecated: deprecated.saturating_sub(kept),
    };

    info!(
        analyzer = %analyzer.id,
        action_id,
        kept,
        inserted,
        deprecated = outcome.deprecated,
        "commit done"
    );

    Ok(outcome)
}

fn find_counterpart(
    candidate: &Observation,
    by_hash: &HashMap<String, Vec<(ScratchDocId, Value)>>,
) -> Result<Option<ScratchDocId>, CommitError> {
    let hash = candidate.content_hash()?;

    let Some(bucket) = by_hash.get(&hash) else {
        return Ok(None);
    };

    let candidate_value = candidate.compare_value()?;

    for (doc_id, compare_value) in bucket {
        if *compare_value == candidate_value {
            return Ok(Some(*doc_id));
        }
    }

    Ok(None)
}
