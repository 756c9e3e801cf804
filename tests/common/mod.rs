#![allow(dead_code)]

use std::path::Path;
use std::process::Command;

use chrono::{TimeZone, Utc};

use kairos::adapters::DomainAdapter;
use kairos_core::{AnalyzerRecord, AnalyzerState, Instant, UploadMeta, UploadRecord};

pub const GIT_URL: &str = "https://example.org/analyzer.git";

/// A throwaway git repository standing in for a fetched analyzer checkout.
pub fn init_git_repo(dir: &Path) {
    let git = |args: &[&str]| {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("failed to run git");
        assert!(status.status.success(), "git {args:?} failed: {status:?}");
    };

    git(&["init", "-q"]);
    git(&[
        "-c",
        "user.email=tests@example.org",
        "-c",
        "user.name=tests",
        "commit",
        "-q",
        "--allow-empty",
        "-m",
        "init",
    ]);
    git(&["remote", "add", "origin", GIT_URL]);
}

pub fn in_memory_domain(environment: &str) -> DomainAdapter {
    let store = kairos_redb::Store::in_memory().expect("in-memory store");
    DomainAdapter::new(store, environment)
}

pub fn at(hour: u32, minute: u32) -> Instant {
    Utc.with_ymd_and_hms(2016, 6, 12, hour, minute, 0).unwrap()
}

pub fn direct_analyzer(id: &str, working_dir: &Path) -> AnalyzerRecord {
    let mut analyzer = AnalyzerRecord::new(
        id,
        vec!["format0".into()],
        vec![],
        vec!["tcp-ttl".into()],
        vec!["true".into()],
        working_dir,
    );
    analyzer.state = AnalyzerState::Sensing;
    analyzer
}

pub fn derived_analyzer(id: &str, working_dir: &Path) -> AnalyzerRecord {
    let mut analyzer = AnalyzerRecord::new(
        id,
        vec![],
        vec!["type0".into()],
        vec!["tcp-ttl".into()],
        vec!["true".into()],
        working_dir,
    );
    analyzer.state = AnalyzerState::Sensing;
    analyzer
}

pub fn upload(id: &str, start: Instant, stop: Instant) -> UploadRecord {
    UploadRecord {
        id: id.into(),
        complete: true,
        meta: UploadMeta {
            format: Some("format0".into()),
            start_time: Some(start),
            stop_time: Some(stop),
        },
        timestamp: Some(start),
        action_ids: Default::default(),
        valid: Default::default(),
        extra: Default::default(),
    }
}
