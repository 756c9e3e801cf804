//! The sensor: scans analyzers in `sensing`, asks the sensitivity engine
//! whether unprocessed input accumulated, and plans them for execution.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kairos_core::sensitivity::{ActionSet, AnalyzerIdentity};
use kairos_core::{honour_wish, AnalyzerRecord, AnalyzerState, Domain, OwnerDomain};
use kairos_core::{AnalyzerStore as _, TransitionEffects};

use crate::prelude::*;
use crate::repo;

pub const TICK_INTERVAL: Duration = Duration::from_secs(4);

pub struct Sensor<D: Domain> {
    domain: D,
}

impl<D: Domain> Sensor<D> {
    pub fn new(domain: D) -> Self {
        Self { domain }
    }

    /// One periodic scan. Failures inside a single analyzer move that
    /// analyzer to `error` and never abort the loop.
    pub fn tick(&self) -> Result<(), Error> {
        debug!("check for work");

        let sensing = self
            .domain
            .analyzers()
            .in_states(&[AnalyzerState::Sensing])?;

        for analyzer in sensing {
            let id = analyzer.id.clone();

            if let Err(error) = self.check_analyzer(&analyzer) {
                warn!(analyzer = %id, %error, "sensor check failed");

                self.domain.analyzers().fail(
                    &id,
                    OwnerDomain::Sensor,
                    &format!("error while sensing: {error}"),
                )?;
            }
        }

        Ok(())
    }

    fn check_analyzer(&self, analyzer: &AnalyzerRecord) -> Result<(), Error> {
        let analyzers = self.domain.analyzers();

        if honour_wish(analyzers, analyzer, OwnerDomain::Sensor)? {
            return Ok(());
        }

        // serialize conflicting workloads: never write a type someone is
        // reading, never read a type someone is writing
        let blocked = analyzers.blocked_types()?;
        if let Some(output) = analyzer.output_types.iter().find(|t| blocked.contains(t)) {
            debug!(analyzer = %analyzer.id, blocked_type = %output, "output type blocked");
            analyzers.set_stalled_reason(&analyzer.id, Some("output type blocked"))?;
            return Ok(());
        }

        let unstable = analyzers.unstable_types()?;
        if let Some(input) = analyzer.input_types.iter().find(|t| unstable.contains(t)) {
            debug!(analyzer = %analyzer.id, unstable_type = %input, "input type unstable");
            analyzers.set_stalled_reason(&analyzer.id, Some("input type unstable"))?;
            return Ok(());
        }

        let (git_url, git_commit) = repo::repository_url_commit(&analyzer.working_dir)?;

        let action_set = ActionSet::load(
            self.domain.actions(),
            AnalyzerIdentity {
                analyzer_id: &analyzer.id,
                git_url: &git_url,
                git_commit: &git_commit,
            },
            &analyzer.input_formats,
            &analyzer.input_types,
        )?;

        if action_set.has_unprocessed_data(analyzer.is_direct())? {
            info!(analyzer = %analyzer.id, "ordering execution");

            analyzers.set_stalled_reason(&analyzer.id, None)?;
            analyzers.transition(
                &analyzer.id,
                AnalyzerState::Sensing,
                AnalyzerState::Planned,
                TransitionEffects::none(),
            )?;
        } else {
            analyzers.set_stalled_reason(&analyzer.id, None)?;
        }

        Ok(())
    }
}

pub async fn run<D: Domain>(domain: D, cancel: CancellationToken) -> Result<(), Error> {
    let sensor = Sensor::new(domain);

    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => sensor.tick()?,
        }
    }

    Ok(())
}
