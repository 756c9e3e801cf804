//! Supervisor integration: the request broker over a real TCP socket and
//! module execution as a real subprocess.

mod common;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use kairos_core::config::{DataServiceConfig, SupervisorConfig};
use kairos_core::{AnalyzerState, AnalyzerStore as _, Domain, GrantRecord, GrantStore as _, ScratchStore as _};

use common::{derived_analyzer, in_memory_domain, init_git_repo};

fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        listen_address: "127.0.0.1:0".into(),
        ensure_clean_repo: false,
        spark: None,
        distributed: None,
    }
}

async fn roundtrip(stream: &mut BufReader<TcpStream>, request: Value) -> Value {
    let mut wire = request.to_string();
    wire.push('\n');

    stream.get_mut().write_all(wire.as_bytes()).await.unwrap();

    let mut line = String::new();
    stream.read_line(&mut line).await.unwrap();
    serde_json::from_str(&line).unwrap()
}

async fn wait_for_state<D: Domain>(
    domain: &D,
    analyzer_id: &str,
    wanted: AnalyzerState,
) -> kairos_core::AnalyzerRecord {
    for _ in 0..300 {
        let analyzer = kairos_core::AnalyzerStore::get(domain.analyzers(), analyzer_id).unwrap().unwrap();
        if analyzer.state == wanted {
            return analyzer;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    panic!("analyzer {analyzer_id} never reached {wanted}");
}

#[tokio::test]
async fn broker_rejects_unknown_and_badly_formed_requests() {
    let domain = in_memory_domain("test");
    let cancel = CancellationToken::new();

    let (addr, _handle) = kairos::supervisor::spawn(
        domain,
        test_config(),
        DataServiceConfig::default(),
        cancel.clone(),
    )
    .await
    .unwrap();

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut stream = BufReader::new(stream);

    let answer = roundtrip(&mut stream, json!({"hello": "world"})).await;
    assert!(answer["error"]
        .as_str()
        .unwrap()
        .contains("missing one or more fields"));

    let answer = roundtrip(
        &mut stream,
        json!({
            "identifier": "module_99",
            "token": "nope",
            "action": "get_info",
            "payload": null,
        }),
    )
    .await;
    assert!(answer["error"]
        .as_str()
        .unwrap()
        .contains("authentication failed"));

    cancel.cancel();
}

#[tokio::test]
async fn boot_cleanup_reaps_reserved_grants_but_keeps_scratch() {
    let domain = in_memory_domain("test");

    // leftover credentials of a crashed predecessor
    domain
        .grants()
        .provision(&GrantRecord {
            identifier: "online_3".into(),
            token: "stale".into(),
            scratch_scope: "online_3".into(),
            read_scopes: vec![],
        })
        .unwrap();
    domain
        .grants()
        .provision(&GrantRecord {
            identifier: "curator".into(),
            token: "keep".into(),
            scratch_scope: "curator".into(),
            read_scopes: vec![],
        })
        .unwrap();

    // a scratch scope of an executed run still awaiting validation
    domain.scratch().create_scope("module_7").unwrap();

    let cancel = CancellationToken::new();
    let (_, _handle) = kairos::supervisor::spawn(
        domain.clone(),
        test_config(),
        DataServiceConfig::default(),
        cancel.clone(),
    )
    .await
    .unwrap();

    assert!(kairos_core::GrantStore::get(domain.grants(), "online_3").unwrap().is_none());
    assert!(kairos_core::GrantStore::get(domain.grants(), "curator").unwrap().is_some());
    assert!(domain.scratch().scope_exists("module_7").unwrap());

    cancel.cancel();
}

#[tokio::test]
async fn module_success_hands_run_to_the_validator() {
    let domain = in_memory_domain("test");
    let repo = tempfile::tempdir().unwrap();
    init_git_repo(repo.path());

    let mut analyzer = derived_analyzer("analyzer-x", repo.path());
    analyzer.state = AnalyzerState::Planned;
    analyzer.command_line = vec!["sh".into(), "-c".into(), "exit 0".into()];
    domain.analyzers().create(&analyzer).unwrap();

    let cancel = CancellationToken::new();
    let (_, _handle) = kairos::supervisor::spawn(
        domain.clone(),
        test_config(),
        DataServiceConfig::default(),
        cancel.clone(),
    )
    .await
    .unwrap();

    let analyzer = wait_for_state(&domain, "analyzer-x", AnalyzerState::Executed).await;

    let result = analyzer.execution_result.unwrap();
    assert!(result.scratch_scope.starts_with("module_"));

    // no result info was submitted; the validator will refuse downstream
    assert!(result.timespans.is_none());
    assert!(result.upload_ids.is_none());

    // scratch survives for the validator, credentials do not
    assert!(domain.scratch().scope_exists(&result.scratch_scope).unwrap());
    assert!(kairos_core::GrantStore::get(domain.grants(), &result.scratch_scope).unwrap().is_none());

    cancel.cancel();
}

#[tokio::test]
async fn module_failure_surfaces_stderr_in_the_error() {
    let domain = in_memory_domain("test");
    let repo = tempfile::tempdir().unwrap();
    init_git_repo(repo.path());

    let mut analyzer = derived_analyzer("analyzer-x", repo.path());
    analyzer.state = AnalyzerState::Planned;
    analyzer.command_line = vec![
        "sh".into(),
        "-c".into(),
        "echo boom >&2; exit 3".into(),
    ];
    domain.analyzers().create(&analyzer).unwrap();

    let cancel = CancellationToken::new();
    let (_, _handle) = kairos::supervisor::spawn(
        domain.clone(),
        test_config(),
        DataServiceConfig::default(),
        cancel.clone(),
    )
    .await
    .unwrap();

    let analyzer = wait_for_state(&domain, "analyzer-x", AnalyzerState::Error).await;

    let failure = analyzer.error.unwrap();
    assert!(failure.reason.contains("boom"));

    // the failed run's scratch scope is gone
    assert!(domain.scratch().scopes_with_prefix("module_").unwrap().is_empty());

    cancel.cancel();
}
