//! Sensitivity: given the action log and an analyzer's declared inputs,
//! decide what work the analyzer still owes.
//!
//! Direct analyzers (empty `input_types`) owe a set of unprocessed uploads;
//! derived analyzers owe a set of unprocessed time intervals. Both answers
//! come with the largest action id the decision considered, which the next
//! run pins itself to.

use std::collections::HashMap;

use chrono::{TimeDelta, Timelike};
use thiserror::Error;

use crate::action::ActionRecord;
use crate::stores::ActionLog;
use crate::timeline::{self, Timeline};
use crate::{ActionId, StoreError, TimeSpan, UploadId, NO_ACTION_ID};

#[derive(Debug, Error)]
pub enum SensitivityError {
    #[error("direct sensitivity requires an empty input_types declaration")]
    DirectNotAllowed,

    #[error("input action {0} carries no upload reference")]
    MissingUploadRef(ActionId),
}

/// The identity a run is pinned to; a code change invalidates older runs.
#[derive(Debug, Clone, Copy)]
pub struct AnalyzerIdentity<'a> {
    pub analyzer_id: &'a str,
    pub git_url: &'a str,
    pub git_commit: &'a str,
}

/// The action-log slice relevant to one analyzer: entries feeding its
/// declared inputs and its own surviving analyses, both newest first.
#[derive(Debug, Clone)]
pub struct ActionSet {
    input_formats: Vec<String>,
    input_types: Vec<String>,

    pub input_actions: Vec<ActionRecord>,
    pub output_actions: Vec<ActionRecord>,

    input_max_action_id: ActionId,
    output_max_action_id: ActionId,
}

impl ActionSet {
    pub fn assemble(
        input_actions: Vec<ActionRecord>,
        output_actions: Vec<ActionRecord>,
        input_formats: Vec<String>,
        input_types: Vec<String>,
    ) -> Self {
        let input_max_action_id = input_actions
            .iter()
            .map(|a| a.id)
            .max()
            .unwrap_or(NO_ACTION_ID);

        let output_max_action_id = output_actions
            .iter()
            .filter_map(|a| a.body.max_action_id)
            .max()
            .unwrap_or(NO_ACTION_ID);

        Self {
            input_formats,
            input_types,
            input_actions,
            output_actions,
            input_max_action_id,
            output_max_action_id,
        }
    }

    /// Assemble the action set from the log: input actions are everything
    /// whose output types/formats intersect the declared inputs; output
    /// actions are this analyzer's analyses, keeping only the newest prefix
    /// produced by the current code.
    pub fn load(
        log: &impl ActionLog,
        identity: AnalyzerIdentity,
        input_formats: &[String],
        input_types: &[String],
    ) -> Result<Self, StoreError> {
        let input_actions = log.input_actions(input_formats, input_types)?;

        let output_actions = log
            .output_actions(identity.analyzer_id)?
            .into_iter()
            .take_while(|a| a.same_code(identity.git_url, identity.git_commit))
            .collect();

        Ok(Self::assemble(
            input_actions,
            output_actions,
            input_formats.to_vec(),
            input_types.to_vec(),
        ))
    }

    pub fn is_direct_allowed(&self) -> bool {
        self.input_types.is_empty()
    }

    pub fn max_action_id(&self) -> ActionId {
        self.input_max_action_id.max(self.output_max_action_id)
    }

    pub fn has_unprocessed_data(&self, direct: bool) -> Result<bool, SensitivityError> {
        if direct {
            let (_, uploads) = self.direct()?;
            Ok(!uploads.is_empty())
        } else {
            let (_, timespans) = self.basic();
            Ok(!timespans.is_empty())
        }
    }

    /// Per-upload sensitivity. An upload is processed iff some surviving
    /// analysis lists it in `upload_ids` and was computed at or after the
    /// upload's newest input action; everything else is owed, in first-seen
    /// order.
    pub fn direct(&self) -> Result<(ActionId, Vec<UploadId>), SensitivityError> {
        if !self.is_direct_allowed() {
            return Err(SensitivityError::DirectNotAllowed);
        }

        // newest input action id per upload, preserving first-seen order
        let mut order: Vec<UploadId> = Vec::new();
        let mut newest: HashMap<UploadId, ActionId> = HashMap::new();

        for action in &self.input_actions {
            let upload_id = action
                .body
                .upload_ids
                .as_ref()
                .and_then(|ids| ids.first())
                .ok_or(SensitivityError::MissingUploadRef(action.id))?;

            match newest.get_mut(upload_id) {
                Some(seen) => {
                    if *seen < action.id {
                        *seen = action.id;
                    }
                }
                None => {
                    order.push(upload_id.clone());
                    newest.insert(upload_id.clone(), action.id);
                }
            }
        }

        let unprocessed = order
            .into_iter()
            .filter(|upload_id| {
                let upload_max = newest[upload_id];

                let processed = self.output_actions.iter().any(|analysis| {
                    analysis.body.max_action_id.unwrap_or(NO_ACTION_ID) >= upload_max
                        && analysis
                            .body
                            .upload_ids
                            .as_ref()
                            .is_some_and(|ids| ids.contains(upload_id))
                });

                !processed
            })
            .collect();

        Ok((self.max_action_id(), unprocessed))
    }

    /// Time-interval sensitivity. Replays input and output actions in log
    /// order: inputs add their timespans to the working timeline, outputs
    /// remove theirs. The replay order is what makes an invalidation
    /// reopen work only when no newer analysis covers it.
    pub fn basic(&self) -> (ActionId, Vec<TimeSpan>) {
        let mut actions: Vec<(bool, &ActionRecord)> = self
            .input_actions
            .iter()
            .map(|a| (true, a))
            .chain(self.output_actions.iter().map(|a| (false, a)))
            .collect();

        actions.sort_by_key(|(_, a)| a.id);

        let mut todo = Timeline::new();
        for (is_input, action) in actions {
            for (start, end) in &action.body.timespans {
                if is_input {
                    todo.add(*start, *end);
                } else {
                    todo.remove(*start, *end);
                }
            }
        }

        (self.max_action_id(), todo.into_intervals())
    }

    /// The merged timespans of the input actions alone.
    pub fn input_timespans(&self) -> (ActionId, Vec<TimeSpan>) {
        let mut merged = Timeline::new();
        for action in &self.input_actions {
            for (start, end) in &action.body.timespans {
                merged.add(*start, *end);
            }
        }

        (self.max_action_id(), merged.into_intervals())
    }
}

/// Wrap basic sensitivity, passing every residual interval through an
/// extend function and re-coalescing the result.
pub fn extend<F>(extend_fn: F, action_set: &ActionSet) -> (ActionId, Vec<TimeSpan>)
where
    F: Fn(TimeSpan) -> TimeSpan,
{
    let (max_action_id, timespans) = action_set.basic();

    let mut extended = Timeline::new();
    for timespan in timespans {
        let (start, end) = extend_fn(timespan);
        extended.add(start, end);
    }

    (max_action_id, extended.into_intervals())
}

/// Snap an interval outwards to full hours.
pub fn extend_hourly(span: TimeSpan) -> TimeSpan {
    let (start, stop) = span;
    debug_assert!(start <= stop);

    let truncate = |t: crate::Instant| {
        t.with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(t)
    };

    let start = truncate(start);

    let stop = if stop.minute() > 0 || stop.second() > 0 || stop.nanosecond() > 0 {
        truncate(stop) + TimeDelta::hours(1)
    } else {
        stop
    };

    (start, stop)
}

/// Margin sensitivity: cluster the merged input timespans into islands with
/// gap at most `offset`, then keep the islands overlapping any residual
/// basic interval. Result is sorted ascending.
pub fn margin(offset: TimeDelta, action_set: &ActionSet) -> (ActionId, Vec<TimeSpan>) {
    let (max_action_id, input_timespans) = action_set.input_timespans();

    let islands = timeline::margin(offset, &input_timespans);
    let (_, unprocessed) = action_set.basic();

    let mut result: Vec<TimeSpan> = islands
        .into_iter()
        .filter(|(island_start, island_end)| {
            unprocessed
                .iter()
                .any(|(start, end)| start <= island_end && island_start <= end)
        })
        .collect();

    result.sort();
    result.dedup();

    (max_action_id, result)
}
