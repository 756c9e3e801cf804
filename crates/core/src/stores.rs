//! Store traits implemented by the storage backend.
//!
//! All cross-component exclusion reduces to two store guarantees:
//! compare-and-swap state transitions and the atomic action-id counter.
//! Everything else is plain reads and bulk writes.

use serde_json::Value;

use crate::machine::{AnalyzerState, OwnerDomain, TransitionError, Wish};
use crate::observation::Observation;
use crate::{
    ActionBody, ActionId, ActionRecord, AdminRequest, AnalyzerFailure, AnalyzerRecord,
    ExecutionResult, GrantRecord, ObservationId, RequestRecord, ScratchDocId, StoreError,
    UploadId, UploadRecord,
};

/// Counter names served by the id factory.
pub const ACTION_ID_COUNTER: &str = "action_id";
pub const AGENT_ID_COUNTER: &str = "agent_id";

/// Globally atomic named counters. Allocation must be a race-free
/// fetch-and-add inside the store, never read-then-write.
pub trait IdFactory {
    fn next_id(&self, counter: &str) -> Result<u64, StoreError>;
}

/// Side effects applied together with a state transition, inside the same
/// atomic compare-and-swap.
#[derive(Debug, Clone, Default)]
pub struct TransitionEffects {
    pub set_execution_result: Option<ExecutionResult>,
    pub clear_execution_result: bool,
    pub set_action_id: Option<ActionId>,
    pub set_error: Option<AnalyzerFailure>,
    pub clear_error: bool,
    pub clear_wish: bool,
}

impl TransitionEffects {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn error(failure: AnalyzerFailure) -> Self {
        Self {
            set_error: Some(failure),
            clear_wish: true,
            ..Self::default()
        }
    }
}

pub trait AnalyzerStore {
    fn create(&self, record: &AnalyzerRecord) -> Result<(), StoreError>;

    fn get(&self, id: &str) -> Result<Option<AnalyzerRecord>, StoreError>;

    fn all(&self) -> Result<Vec<AnalyzerRecord>, StoreError>;

    fn in_states(&self, states: &[AnalyzerState]) -> Result<Vec<AnalyzerRecord>, StoreError>;

    /// Compare-and-swap transition. `Ok(false)` means the analyzer was no
    /// longer in `from` (soft failure, re-evaluate next tick); a pair not in
    /// the state machine is rejected outright.
    fn transition(
        &self,
        id: &str,
        from: AnalyzerState,
        to: AnalyzerState,
        effects: TransitionEffects,
    ) -> Result<bool, StoreError>;

    /// Move to `error` from whatever state the analyzer is currently in,
    /// stamping the failing domain and reason. Safe to call from catch-all
    /// error paths.
    fn fail(&self, id: &str, domain: OwnerDomain, reason: &str) -> Result<(), StoreError>;

    fn set_wish(&self, id: &str, wish: Option<Wish>) -> Result<(), StoreError>;

    fn set_stalled_reason(&self, id: &str, reason: Option<&str>) -> Result<(), StoreError>;

    fn running(&self) -> Result<Vec<AnalyzerRecord>, StoreError> {
        self.in_states(&AnalyzerState::RUNNING)
    }

    /// Types in the input declaration of at least one running analyzer.
    fn blocked_types(&self) -> Result<Vec<String>, StoreError> {
        let mut types: Vec<String> = self
            .running()?
            .into_iter()
            .flat_map(|a| a.input_types)
            .collect();
        types.sort();
        types.dedup();
        Ok(types)
    }

    /// Types in the output declaration of at least one running analyzer.
    fn unstable_types(&self) -> Result<Vec<String>, StoreError> {
        let mut types: Vec<String> = self
            .running()?
            .into_iter()
            .flat_map(|a| a.output_types)
            .collect();
        types.sort();
        types.dedup();
        Ok(types)
    }
}

impl From<TransitionError> for StoreError {
    fn from(value: TransitionError) -> Self {
        StoreError::internal(value)
    }
}

/// Honour a pending wish if the analyzer currently sits in a state owned by
/// the calling domain. Returns `true` when the caller should skip the
/// analyzer for this tick. The wish is cleared atomically with the
/// transition it causes.
pub fn honour_wish(
    store: &impl AnalyzerStore,
    analyzer: &AnalyzerRecord,
    domain: OwnerDomain,
) -> Result<bool, StoreError> {
    let honourable_cancel = matches!(
        (domain, analyzer.state),
        (OwnerDomain::Sensor, AnalyzerState::Sensing)
            | (OwnerDomain::Supervisor, AnalyzerState::Planned)
            | (OwnerDomain::Validator, AnalyzerState::Executed)
    );

    match analyzer.wish {
        Some(Wish::Disable)
            if domain == OwnerDomain::Sensor && analyzer.state == AnalyzerState::Sensing =>
        {
            tracing::info!(analyzer = %analyzer.id, "disabling upon request");

            let effects = TransitionEffects {
                clear_wish: true,
                ..TransitionEffects::default()
            };

            store.transition(
                &analyzer.id,
                AnalyzerState::Sensing,
                AnalyzerState::Disabled,
                effects,
            )?;

            Ok(true)
        }
        Some(Wish::Cancel) if honourable_cancel => {
            tracing::info!(analyzer = %analyzer.id, "cancelling upon request");

            let effects = TransitionEffects::error(AnalyzerFailure::new(
                domain,
                "cancelled upon request",
            ));

            store.transition(&analyzer.id, analyzer.state, AnalyzerState::Error, effects)?;

            Ok(true)
        }
        _ => Ok(false),
    }
}

pub trait ActionLog {
    /// Append an entry, allocating its id from the action counter in the
    /// same atomic step. Returns the id.
    fn append(&self, body: ActionBody) -> Result<ActionId, StoreError>;

    /// Append an entry under a pre-allocated id. The id must come from the
    /// action counter, so the log stays dense and monotonic.
    fn append_with_id(&self, id: ActionId, body: ActionBody) -> Result<(), StoreError>;

    fn get(&self, id: ActionId) -> Result<Option<ActionRecord>, StoreError>;

    /// All entries, ascending by id.
    fn all(&self) -> Result<Vec<ActionRecord>, StoreError>;

    /// Entries whose output formats/types intersect the given inputs,
    /// newest first.
    fn input_actions(
        &self,
        input_formats: &[String],
        input_types: &[String],
    ) -> Result<Vec<ActionRecord>, StoreError>;

    /// `analyze` entries of the given analyzer, newest first.
    fn output_actions(&self, analyzer_id: &str) -> Result<Vec<ActionRecord>, StoreError>;

    /// The `upload` entry referencing the given upload, if any.
    fn upload_action(&self, upload_id: &UploadId) -> Result<Option<ActionRecord>, StoreError>;
}

/// Which live observations a commit may supersede.
#[derive(Debug, Clone)]
pub enum CandidateQuery<'a> {
    /// Derived analyzers: same analyzer, observation time covered by any of
    /// the run's timespans.
    Timespans {
        analyzer_id: &'a str,
        timespans: &'a [crate::TimeSpan],
    },

    /// Direct analyzers: same analyzer, `sources.upl` mentioning any of the
    /// upload actions this run processed.
    UploadActions {
        analyzer_id: &'a str,
        upload_actions: &'a [ActionId],
    },
}

impl CandidateQuery<'_> {
    pub fn matches(&self, obs: &Observation) -> bool {
        match self {
            CandidateQuery::Timespans {
                analyzer_id,
                timespans,
            } => {
                obs.analyzer_id == *analyzer_id
                    && timespans.iter().any(|span| obs.time.within(span))
            }
            CandidateQuery::UploadActions {
                analyzer_id,
                upload_actions,
            } => {
                obs.analyzer_id == *analyzer_id
                    && obs
                        .source_upload_actions()
                        .iter()
                        .any(|id| upload_actions.contains(id))
            }
        }
    }
}

/// One element of the post-commit fix-up batch.
#[derive(Debug, Clone)]
pub enum ObservationOp {
    /// Pop the front stamp iff it is `{action_id, false}` and the stamp
    /// beneath is valid: the kept observation's validity did not change.
    RetractInvalidation {
        id: ObservationId,
        action_id: ActionId,
    },

    /// Push `{action_id, true}` iff the observation is currently invalid:
    /// the kept observation comes back to life.
    Revive {
        id: ObservationId,
        action_id: ActionId,
    },

    /// Brand new observation.
    Insert { observation: Observation },
}

pub trait ObservationStore {
    fn get(&self, id: ObservationId) -> Result<Option<Observation>, StoreError>;

    fn all(&self) -> Result<Vec<(ObservationId, Observation)>, StoreError>;

    fn candidates(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<(ObservationId, Observation)>, StoreError>;

    /// Push `{action_id, valid: false}` onto the front of every candidate
    /// that is currently valid. Returns how many were marked.
    fn push_invalidations(
        &self,
        query: &CandidateQuery,
        action_id: ActionId,
    ) -> Result<usize, StoreError>;

    /// Apply a fix-up batch. Implementations process ops in bulk blocks of
    /// at most 1000 writes per transaction.
    fn apply(&self, ops: &[ObservationOp]) -> Result<(), StoreError>;
}

pub trait ScratchStore {
    fn create_scope(&self, scope: &str) -> Result<(), StoreError>;

    fn drop_scope(&self, scope: &str) -> Result<(), StoreError>;

    fn scope_exists(&self, scope: &str) -> Result<bool, StoreError>;

    fn scopes_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    fn insert(&self, scope: &str, doc: &Value) -> Result<ScratchDocId, StoreError>;

    /// All documents of a scope in insertion order.
    fn docs(&self, scope: &str) -> Result<Vec<(ScratchDocId, Value)>, StoreError>;

    /// Stamp `action_ids: [{id, valid: true}]` and the content hash onto
    /// every document of the scope. Returns how many were stamped.
    fn stamp_all(&self, scope: &str, action_id: ActionId) -> Result<usize, StoreError>;

    /// Record that a scratch document was found identical to a live
    /// observation; it will be kept instead of inserted.
    fn set_counterpart(
        &self,
        scope: &str,
        doc: ScratchDocId,
        observation: ObservationId,
    ) -> Result<(), StoreError>;
}

pub trait MetadataStore {
    fn get(&self, id: &UploadId) -> Result<Option<UploadRecord>, StoreError>;

    fn put(&self, record: &UploadRecord) -> Result<(), StoreError>;

    /// Complete uploads with format and time bounds that this environment
    /// has not stamped yet, matching the admission filter, oldest first.
    fn pending_uploads(
        &self,
        environment: &str,
        filter: Option<&serde_json::Map<String, Value>>,
    ) -> Result<Vec<UploadRecord>, StoreError>;

    /// Atomically allocate the next action id, stamp it (and `valid: true`)
    /// onto the row for this environment, and append the `upload` entry to
    /// the action log. `None` when the upload is not eligible.
    fn assign_action_id(
        &self,
        upload_id: &UploadId,
        environment: &str,
    ) -> Result<Option<ActionId>, StoreError>;

    /// Atomically flip this environment's validity of an upload and append
    /// the matching `marked_valid` / `marked_invalid` entry. `None` when the
    /// upload has no stamped action id or no upload entry in the log.
    fn set_valid(
        &self,
        upload_id: &UploadId,
        environment: &str,
        valid: bool,
    ) -> Result<Option<ActionId>, StoreError>;
}

pub trait RequestStore {
    fn submit(&self, receiver: &str, request: AdminRequest) -> Result<u64, StoreError>;

    /// Find-and-delete the oldest request addressed to the receiver.
    fn drain_oldest(&self, receiver: &str) -> Result<Option<RequestRecord>, StoreError>;
}

pub trait GrantStore {
    fn provision(&self, grant: &GrantRecord) -> Result<(), StoreError>;

    fn get(&self, identifier: &str) -> Result<Option<GrantRecord>, StoreError>;

    fn revoke(&self, identifier: &str) -> Result<bool, StoreError>;

    fn identifiers_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Aggregation of every store the control plane needs, in the spirit of a
/// single shared database with named scopes.
pub trait Domain: Clone + Send + Sync + 'static {
    type Analyzers: AnalyzerStore;
    type Actions: ActionLog;
    type Observations: ObservationStore;
    type Scratch: ScratchStore;
    type Metadata: MetadataStore;
    type Requests: RequestStore;
    type Grants: GrantStore;
    type Ids: IdFactory;

    fn environment(&self) -> &str;

    fn analyzers(&self) -> &Self::Analyzers;
    fn actions(&self) -> &Self::Actions;
    fn observations(&self) -> &Self::Observations;
    fn scratch(&self) -> &Self::Scratch;
    fn metadata(&self) -> &Self::Metadata;
    fn requests(&self) -> &Self::Requests;
    fn grants(&self) -> &Self::Grants;
    fn ids(&self) -> &Self::Ids;
}
