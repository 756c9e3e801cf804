//! The validator: assigns action ids to fresh uploads, validates and
//! commits executed analyzers, and serves admin validity-flip requests.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kairos_core::config::ValidatorConfig;
use kairos_core::{
    honour_wish, AdminRequest, AnalyzerFailure, AnalyzerRecord, AnalyzerState, AnalyzerStore as _,
    Domain, ExecutionResult, MetadataStore as _, OwnerDomain, RequestStore as _,
    ScratchStore as _, TransitionEffects,
};

use crate::prelude::*;

pub mod checks;
pub mod commit;

use commit::CommitError;

pub const TICK_INTERVAL: Duration = Duration::from_secs(4);

/// How many issues a rendered validation report carries at most.
const REPORT_ISSUE_LIMIT: usize = 50;

pub struct Validator<D: Domain> {
    domain: D,
    config: ValidatorConfig,
}

impl<D: Domain> Validator<D> {
    pub fn new(domain: D, config: ValidatorConfig) -> Self {
        Self { domain, config }
    }

    pub fn tick(&self) -> Result<(), Error> {
        debug!("check for work");

        self.check_for_analyzers()?;
        self.check_for_uploads()?;
        self.check_for_requests()?;

        Ok(())
    }

    /// Drive every executed analyzer through validation and commit.
    fn check_for_analyzers(&self) -> Result<(), Error> {
        let executed = self
            .domain
            .analyzers()
            .in_states(&[AnalyzerState::Executed])?;

        for analyzer in executed {
            if honour_wish(self.domain.analyzers(), &analyzer, OwnerDomain::Validator)? {
                continue;
            }

            let id = analyzer.id.clone();
            if let Err(error) = self.validate_analyzer(&analyzer) {
                warn!(analyzer = %id, %error, "validator pass failed");

                self.domain.analyzers().fail(
                    &id,
                    OwnerDomain::Validator,
                    &format!("error while validating: {error}"),
                )?;
            }
        }

        Ok(())
    }

    fn validate_analyzer(&self, analyzer: &AnalyzerRecord) -> Result<(), Error> {
        info!(analyzer = %analyzer.id, "validating and committing");

        let moved = self.domain.analyzers().transition(
            &analyzer.id,
            AnalyzerState::Executed,
            AnalyzerState::Validating,
            TransitionEffects::none(),
        )?;

        if !moved {
            return Ok(());
        }

        let Some(result) = &analyzer.execution_result else {
            self.domain.analyzers().fail(
                &analyzer.id,
                OwnerDomain::Validator,
                "internal error: analyzer reached executed without an execution result",
            )?;
            return Ok(());
        };

        match commit::commit(&self.domain, analyzer, result, self.config.abort_max_errors) {
            Ok(outcome) => {
                info!(
                    analyzer = %analyzer.id,
                    action_id = outcome.action_id,
                    records = outcome.valid_count,
                    "successfully committed analyzer run"
                );

                let effects = TransitionEffects {
                    set_action_id: Some(outcome.action_id),
                    clear_execution_result: true,
                    clear_error: true,
                    ..TransitionEffects::default()
                };

                self.domain.analyzers().transition(
                    &analyzer.id,
                    AnalyzerState::Validating,
                    AnalyzerState::Sensing,
                    effects,
                )?;
            }
            Err(error) => {
                let report = render_report(&error);
                warn!(analyzer = %analyzer.id, %report, "commit refused");

                self.drop_scratch(result);

                let effects = TransitionEffects::error(AnalyzerFailure::new(
                    OwnerDomain::Validator,
                    report.as_str(),
                ));

                self.domain.analyzers().transition(
                    &analyzer.id,
                    AnalyzerState::Validating,
                    AnalyzerState::Error,
                    effects,
                )?;
            }
        }

        Ok(())
    }

    fn drop_scratch(&self, result: &ExecutionResult) {
        if let Err(error) = self.domain.scratch().drop_scope(&result.scratch_scope) {
            warn!(scope = %result.scratch_scope, %error, "failed to drop scratch scope");
        }
    }

    /// Assign an action id to every admissible upload.
    fn check_for_uploads(&self) -> Result<(), Error> {
        let environment = self.domain.environment().to_string();

        let pending = self
            .domain
            .metadata()
            .pending_uploads(&environment, self.config.upload_filter.as_ref())?;

        for upload in pending {
            match self
                .domain
                .metadata()
                .assign_action_id(&upload.id, &environment)?
            {
                Some(action_id) => {
                    info!(upload = %upload.id, action_id, "assigned action id to upload");
                }
                None => {
                    // raced by a validity flip or stamped meanwhile
                    debug!(upload = %upload.id, "upload no longer eligible");
                }
            }
        }

        Ok(())
    }

    /// Drain admin requests, flipping upload validity and logging the flip.
    fn check_for_requests(&self) -> Result<(), Error> {
        let environment = self.domain.environment().to_string();

        while let Some(record) = self.domain.requests().drain_oldest("validator")? {
            match record.request {
                AdminRequest::ValidateUpload { upload_id, valid } => {
                    info!(upload = %upload_id, valid, "fulfilling validity request");

                    let flipped =
                        self.domain
                            .metadata()
                            .set_valid(&upload_id, &environment, valid)?;

                    if flipped.is_none() {
                        warn!(
                            upload = %upload_id,
                            "upload unknown or not assigned in this environment, request dropped"
                        );
                    }
                }
            }
        }

        Ok(())
    }
}

fn render_report(error: &CommitError) -> String {
    match error {
        CommitError::Validation(issues) => {
            let mut report = String::from("error when executing validator:");

            for (index, issue) in issues.iter().take(REPORT_ISSUE_LIMIT).enumerate() {
                report.push_str(&format!("\n{index}: {issue}"));
            }

            if issues.len() > REPORT_ISSUE_LIMIT {
                report.push_str(&format!("\n... and {} more", issues.len() - REPORT_ISSUE_LIMIT));
            }

            report
        }
        other => format!("error when executing validator: {other}"),
    }
}

pub async fn run<D: Domain>(
    domain: D,
    config: ValidatorConfig,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let validator = Validator::new(domain, config);

    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => validator.tick()?,
        }
    }

    Ok(())
}
