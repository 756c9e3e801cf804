//! End-to-end scenarios over the three-stage control loop, with the module
//! execution step played by the test instead of a subprocess.

mod common;

use serde_json::json;

use kairos::sensor::Sensor;
use kairos::validator::{commit, Validator};
use kairos_core::config::ValidatorConfig;
use kairos_core::sensitivity::{ActionSet, AnalyzerIdentity};
use kairos_core::{
    ActionKind, ActionLog as _, AdminRequest, AnalyzerState, AnalyzerStore as _, Domain,
    ExecutionResult, MetadataStore as _, ObservationOp, ObservationStore as _, RequestStore as _,
    ScratchStore as _, TimeSpec, TransitionEffects, ValidityStamp,
};

use common::{at, derived_analyzer, direct_analyzer, in_memory_domain, init_git_repo, upload};

fn scratch_doc(value: i64, hour: u32, upl: &[i64]) -> serde_json::Value {
    json!({
        "analyzer_id": "analyzer-x",
        "conditions": ["tcp-ttl"],
        "time": at(hour, 0).to_rfc3339(),
        "path": ["src", "dst"],
        "value": value,
        "sources": {"upl": upl},
    })
}

/// Play the supervisor's part: pretend the module ran and produced the
/// given scratch documents and result info.
fn play_execution<D: Domain>(
    domain: &D,
    analyzer_id: &str,
    scope: &str,
    docs: &[serde_json::Value],
    result: ExecutionResult,
) {
    domain.scratch().create_scope(scope).unwrap();
    for doc in docs {
        domain.scratch().insert(scope, doc).unwrap();
    }

    assert!(domain
        .analyzers()
        .transition(
            analyzer_id,
            AnalyzerState::Planned,
            AnalyzerState::Executing,
            TransitionEffects::none(),
        )
        .unwrap());

    let effects = TransitionEffects {
        set_execution_result: Some(result),
        ..TransitionEffects::default()
    };

    assert!(domain
        .analyzers()
        .transition(
            analyzer_id,
            AnalyzerState::Executing,
            AnalyzerState::Executed,
            effects,
        )
        .unwrap());
}

#[test]
fn empty_world_keeps_sensing() {
    let domain = in_memory_domain("test");
    let repo = tempfile::tempdir().unwrap();
    init_git_repo(repo.path());

    domain
        .analyzers()
        .create(&direct_analyzer("analyzer-x", repo.path()))
        .unwrap();

    Sensor::new(domain.clone()).tick().unwrap();

    let analyzer = kairos_core::AnalyzerStore::get(domain.analyzers(), "analyzer-x").unwrap().unwrap();
    assert_eq!(analyzer.state, AnalyzerState::Sensing);
}

#[test]
fn single_upload_flows_through_the_whole_loop() {
    let domain = in_memory_domain("test");
    let repo = tempfile::tempdir().unwrap();
    init_git_repo(repo.path());

    domain
        .analyzers()
        .create(&direct_analyzer("analyzer-x", repo.path()))
        .unwrap();
    domain
        .metadata()
        .put(&upload("upl-a", at(4, 0), at(8, 0)))
        .unwrap();

    let validator = Validator::new(domain.clone(), ValidatorConfig::default());
    let sensor = Sensor::new(domain.clone());

    // validator assigns action id 0 and logs the upload
    validator.tick().unwrap();

    let entry = kairos_core::ActionLog::get(domain.actions(), 0).unwrap().unwrap();
    assert_eq!(entry.body.action, ActionKind::Upload);
    assert_eq!(entry.body.upload_ids, Some(vec!["upl-a".to_string()]));

    // sensor notices the unprocessed upload and plans the analyzer
    sensor.tick().unwrap();
    let analyzer = kairos_core::AnalyzerStore::get(domain.analyzers(), "analyzer-x").unwrap().unwrap();
    assert_eq!(analyzer.state, AnalyzerState::Planned);

    // the module writes one candidate observation and reports per-upload
    play_execution(
        &domain,
        "analyzer-x",
        "module_0",
        &[scratch_doc(64, 5, &[0])],
        ExecutionResult {
            scratch_scope: "module_0".into(),
            max_action_id: 0,
            timespans: None,
            upload_ids: Some(vec!["upl-a".into()]),
        },
    );

    // validator commits: fresh analyze entry, observation inserted
    validator.tick().unwrap();

    let analyzer = kairos_core::AnalyzerStore::get(domain.analyzers(), "analyzer-x").unwrap().unwrap();
    assert_eq!(analyzer.state, AnalyzerState::Sensing);
    assert_eq!(analyzer.action_id, Some(1));
    assert!(analyzer.execution_result.is_none());

    let analysis = kairos_core::ActionLog::get(domain.actions(), 1).unwrap().unwrap();
    assert_eq!(analysis.body.action, ActionKind::Analyze);
    assert_eq!(analysis.body.max_action_id, Some(0));
    assert_eq!(analysis.body.upload_ids, Some(vec!["upl-a".to_string()]));
    assert_eq!(analysis.body.analyzer_id.as_deref(), Some("analyzer-x"));

    let observations = kairos_core::ObservationStore::all(domain.observations()).unwrap();
    assert_eq!(observations.len(), 1);
    let (_, obs) = &observations[0];
    assert_eq!(obs.action_ids, vec![ValidityStamp { id: 1, valid: true }]);
    assert_eq!(obs.time, TimeSpec::Instant(at(5, 0)));

    // scratch is gone
    assert!(!domain.scratch().scope_exists("module_0").unwrap());

    // nothing left to do: the sensitivity answer is now empty
    let set = ActionSet::load(
        domain.actions(),
        AnalyzerIdentity {
            analyzer_id: "analyzer-x",
            git_url: common::GIT_URL,
            git_commit: &kairos::repo::repository_commit(repo.path()).unwrap(),
        },
        &["format0".to_string()],
        &[],
    )
    .unwrap();

    let (max_action_id, unprocessed) = set.direct().unwrap();
    assert_eq!(max_action_id, 0);
    assert!(unprocessed.is_empty());

    sensor.tick().unwrap();
    let analyzer = kairos_core::AnalyzerStore::get(domain.analyzers(), "analyzer-x").unwrap().unwrap();
    assert_eq!(analyzer.state, AnalyzerState::Sensing);
}

#[test]
fn invalidation_request_reopens_the_upload() {
    let domain = in_memory_domain("test");
    let repo = tempfile::tempdir().unwrap();
    init_git_repo(repo.path());

    domain
        .analyzers()
        .create(&direct_analyzer("analyzer-x", repo.path()))
        .unwrap();
    domain
        .metadata()
        .put(&upload("upl-a", at(4, 0), at(8, 0)))
        .unwrap();

    let validator = Validator::new(domain.clone(), ValidatorConfig::default());
    let sensor = Sensor::new(domain.clone());

    validator.tick().unwrap();
    sensor.tick().unwrap();

    play_execution(
        &domain,
        "analyzer-x",
        "module_0",
        &[scratch_doc(64, 5, &[0])],
        ExecutionResult {
            scratch_scope: "module_0".into(),
            max_action_id: 0,
            timespans: None,
            upload_ids: Some(vec!["upl-a".into()]),
        },
    );
    validator.tick().unwrap();

    // admin asks to invalidate the upload
    domain
        .requests()
        .submit(
            "validator",
            AdminRequest::ValidateUpload {
                upload_id: "upl-a".into(),
                valid: false,
            },
        )
        .unwrap();

    validator.tick().unwrap();

    let row = kairos_core::MetadataStore::get(domain.metadata(), &"upl-a".into()).unwrap().unwrap();
    assert_eq!(row.valid.get("test"), Some(&false));

    let marked = kairos_core::ActionLog::all(domain.actions()).unwrap();
    let last = marked.last().unwrap();
    assert_eq!(last.body.action, ActionKind::MarkedInvalid);

    // the sensor owes the upload again
    sensor.tick().unwrap();
    let analyzer = kairos_core::AnalyzerStore::get(domain.analyzers(), "analyzer-x").unwrap().unwrap();
    assert_eq!(analyzer.state, AnalyzerState::Planned);
}

#[test]
fn identical_rerun_keeps_history_untouched() {
    let domain = in_memory_domain("test");
    let repo = tempfile::tempdir().unwrap();
    init_git_repo(repo.path());

    let analyzer = derived_analyzer("analyzer-x", repo.path());
    domain.analyzers().create(&analyzer).unwrap();

    // live observation born under action 7
    let existing = scratch_doc(64, 5, &[0]);
    let parsed: kairos_core::ScratchObservation = serde_json::from_value(existing).unwrap();
    let mut live = parsed.into_observation(7).unwrap();
    live.action_ids = vec![ValidityStamp { id: 7, valid: true }];
    domain
        .observations()
        .apply(&[ObservationOp::Insert { observation: live }])
        .unwrap();

    // burn action ids so the commit allocates a fresh one above 7
    for _ in 0..9 {
        use kairos_core::IdFactory as _;
        domain.ids().next_id(kairos_core::ACTION_ID_COUNTER).unwrap();
    }

    // a re-run produced the identical document in scratch
    domain.scratch().create_scope("module_1").unwrap();
    domain
        .scratch()
        .insert("module_1", &scratch_doc(64, 5, &[0]))
        .unwrap();

    let result = ExecutionResult {
        scratch_scope: "module_1".into(),
        max_action_id: 8,
        timespans: Some(vec![(at(4, 0), at(8, 0))]),
        upload_ids: None,
    };

    let outcome = commit::commit(&domain, &analyzer, &result, 100).unwrap();

    assert_eq!(outcome.action_id, 9);
    assert_eq!(outcome.kept, 1);
    assert_eq!(outcome.inserted, 0);

    // push-then-pop cancelled out: the history is exactly as before
    let observations = kairos_core::ObservationStore::all(domain.observations()).unwrap();
    assert_eq!(observations.len(), 1);
    assert_eq!(
        observations[0].1.action_ids,
        vec![ValidityStamp { id: 7, valid: true }]
    );

    // but the log gained the analyze entry
    let analysis = kairos_core::ActionLog::get(domain.actions(), 9).unwrap().unwrap();
    assert_eq!(analysis.body.action, ActionKind::Analyze);

    assert!(!domain.scratch().scope_exists("module_1").unwrap());
}

#[test]
fn changed_rerun_supersedes_the_old_observation() {
    let domain = in_memory_domain("test");
    let repo = tempfile::tempdir().unwrap();
    init_git_repo(repo.path());

    let analyzer = derived_analyzer("analyzer-x", repo.path());
    domain.analyzers().create(&analyzer).unwrap();

    let parsed: kairos_core::ScratchObservation =
        serde_json::from_value(scratch_doc(64, 5, &[0])).unwrap();
    domain
        .observations()
        .apply(&[ObservationOp::Insert {
            observation: parsed.into_observation(0).unwrap(),
        }])
        .unwrap();

    domain.scratch().create_scope("module_1").unwrap();
    domain
        .scratch()
        .insert("module_1", &scratch_doc(65, 5, &[0]))
        .unwrap();

    let result = ExecutionResult {
        scratch_scope: "module_1".into(),
        max_action_id: 0,
        timespans: Some(vec![(at(4, 0), at(8, 0))]),
        upload_ids: None,
    };

    use kairos_core::IdFactory as _;
    domain.ids().next_id(kairos_core::ACTION_ID_COUNTER).unwrap();

    let outcome = commit::commit(&domain, &analyzer, &result, 100).unwrap();

    assert_eq!(outcome.kept, 0);
    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.deprecated, 1);

    let observations = kairos_core::ObservationStore::all(domain.observations()).unwrap();
    assert_eq!(observations.len(), 2);

    let old = observations
        .iter()
        .find(|(_, o)| o.value == json!(64))
        .unwrap();
    assert!(!old.1.is_valid());
    assert_eq!(old.1.action_ids.len(), 2);
    assert_eq!(old.1.action_ids[0].id, outcome.action_id);

    let new = observations
        .iter()
        .find(|(_, o)| o.value == json!(65))
        .unwrap();
    assert!(new.1.is_valid());
}

#[test]
fn validation_failure_moves_analyzer_to_error_and_drops_scratch() {
    let domain = in_memory_domain("test");
    let repo = tempfile::tempdir().unwrap();
    init_git_repo(repo.path());

    domain
        .analyzers()
        .create(&direct_analyzer("analyzer-x", repo.path()))
        .unwrap();
    domain
        .metadata()
        .put(&upload("upl-a", at(4, 0), at(8, 0)))
        .unwrap();

    let validator = Validator::new(domain.clone(), ValidatorConfig::default());
    let sensor = Sensor::new(domain.clone());

    validator.tick().unwrap();
    sensor.tick().unwrap();

    // ttl value out of range fails the condition check
    play_execution(
        &domain,
        "analyzer-x",
        "module_0",
        &[scratch_doc(7000, 5, &[0])],
        ExecutionResult {
            scratch_scope: "module_0".into(),
            max_action_id: 0,
            timespans: None,
            upload_ids: Some(vec!["upl-a".into()]),
        },
    );

    validator.tick().unwrap();

    let analyzer = kairos_core::AnalyzerStore::get(domain.analyzers(), "analyzer-x").unwrap().unwrap();
    assert_eq!(analyzer.state, AnalyzerState::Error);

    let failure = analyzer.error.unwrap();
    assert!(failure.reason.contains("value"));

    assert!(!domain.scratch().scope_exists("module_0").unwrap());
    assert!(kairos_core::ObservationStore::all(domain.observations()).unwrap().is_empty());
}

#[test]
fn internal_error_when_result_is_ambiguous() {
    let domain = in_memory_domain("test");
    let repo = tempfile::tempdir().unwrap();
    init_git_repo(repo.path());

    domain
        .analyzers()
        .create(&direct_analyzer("analyzer-x", repo.path()))
        .unwrap();
    domain
        .metadata()
        .put(&upload("upl-a", at(4, 0), at(8, 0)))
        .unwrap();

    let validator = Validator::new(domain.clone(), ValidatorConfig::default());
    let sensor = Sensor::new(domain.clone());

    validator.tick().unwrap();
    sensor.tick().unwrap();

    // neither timespans nor upload_ids: the supervisor handed over a run
    // that never submitted result info
    play_execution(
        &domain,
        "analyzer-x",
        "module_0",
        &[],
        ExecutionResult {
            scratch_scope: "module_0".into(),
            max_action_id: -1,
            timespans: None,
            upload_ids: None,
        },
    );

    validator.tick().unwrap();

    let analyzer = kairos_core::AnalyzerStore::get(domain.analyzers(), "analyzer-x").unwrap().unwrap();
    assert_eq!(analyzer.state, AnalyzerState::Error);
    assert!(analyzer
        .error
        .unwrap()
        .reason
        .contains("exactly one of timespans and upload_ids"));
}

#[test]
fn type_blocking_stalls_conflicting_analyzers() {
    let domain = in_memory_domain("test");
    let repo = tempfile::tempdir().unwrap();
    init_git_repo(repo.path());

    // a running analyzer consumes type0
    let mut running = derived_analyzer("upstream", repo.path());
    running.state = AnalyzerState::Executing;
    running.input_types = vec!["type0".into()];
    running.output_types = vec!["type1".into()];
    domain.analyzers().create(&running).unwrap();

    // this one writes type0, so its output is blocked
    let mut writer = derived_analyzer("writer", repo.path());
    writer.input_types = vec![];
    writer.input_formats = vec!["format0".into()];
    writer.output_types = vec!["type0".into()];
    domain.analyzers().create(&writer).unwrap();

    // and this one reads type1, which is unstable while upstream runs
    let mut reader = derived_analyzer("reader", repo.path());
    reader.input_types = vec!["type1".into()];
    reader.output_types = vec!["type2".into()];
    domain.analyzers().create(&reader).unwrap();

    // give both something to do
    domain
        .metadata()
        .put(&upload("upl-a", at(4, 0), at(8, 0)))
        .unwrap();
    Validator::new(domain.clone(), ValidatorConfig::default())
        .tick()
        .unwrap();

    Sensor::new(domain.clone()).tick().unwrap();

    let writer = kairos_core::AnalyzerStore::get(domain.analyzers(), "writer").unwrap().unwrap();
    assert_eq!(writer.state, AnalyzerState::Sensing);
    assert_eq!(writer.stalled_reason.as_deref(), Some("output type blocked"));

    let reader = kairos_core::AnalyzerStore::get(domain.analyzers(), "reader").unwrap().unwrap();
    assert_eq!(reader.state, AnalyzerState::Sensing);
    assert_eq!(reader.stalled_reason.as_deref(), Some("input type unstable"));
}
