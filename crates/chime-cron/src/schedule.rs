//! Due-time arithmetic for jobs.

use chrono::{DateTime, TimeDelta, Utc};

use chime_types::RunStatus;

use crate::dispatch::ExecutionOutcome;
use crate::{CronJob, CronSchedule};

/// Longest summary kept on the job record.
pub const MAX_SUMMARY_CHARS: usize = 2000;

/// What the caller should do with a job after recording a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterRun {
    Keep,
    Delete,
}

/// The next pending occurrence of `job`, or `None` if nothing is pending.
///
/// Missed `every` occurrences collapse into one: after a run the next
/// occurrence is the first one strictly after `last_run_at`.
pub fn next_run_at(job: &CronJob) -> Option<DateTime<Utc>> {
    if !job.enabled {
        return None;
    }
    match &job.schedule {
        CronSchedule::At { at } => match job.last_run_at {
            Some(last) if last >= *at => None,
            _ => Some(*at),
        },
        CronSchedule::Every { every_ms, anchor } => {
            let every = i64::try_from(*every_ms).ok().filter(|ms| *ms > 0)?;
            let base = anchor.unwrap_or(job.created_at);
            let step = TimeDelta::try_milliseconds(every)?;
            let Some(last) = job.last_run_at else {
                return base.checked_add_signed(step);
            };
            let elapsed = (last - base).num_milliseconds();
            let k = if elapsed < 0 { 1 } else { elapsed / every + 1 };
            let offset = TimeDelta::try_milliseconds(every.checked_mul(k)?)?;
            base.checked_add_signed(offset)
        }
    }
}

/// Whether `job` should run at `now`.
///
/// Derived from `schedule` and `last_run_at`; the stored `next_run_at` is a
/// cache and may be missing or out of date in a hand-edited store.
pub fn is_due(job: &CronJob, now: DateTime<Utc>) -> bool {
    next_run_at(job).is_some_and(|next| next <= now)
}

/// IDs of the jobs due at `now`, earliest first.
pub fn due_job_ids(jobs: &[CronJob], now: DateTime<Utc>) -> Vec<String> {
    let mut due: Vec<(DateTime<Utc>, &CronJob)> = jobs
        .iter()
        .filter_map(|job| next_run_at(job).filter(|next| *next <= now).map(|next| (next, job)))
        .collect();
    due.sort_by(|(a_next, a), (b_next, b)| {
        (a_next, a.created_at, &a.id).cmp(&(b_next, b.created_at, &b.id))
    });
    due.into_iter().map(|(_, job)| job.id.clone()).collect()
}

/// Record a finished run on the job and re-derive its next run.
pub fn record_run(
    job: &mut CronJob,
    outcome: &ExecutionOutcome,
    started_at: DateTime<Utc>,
    duration_ms: u64,
    now: DateTime<Utc>,
) -> AfterRun {
    job.last_run_at = Some(started_at);
    job.last_status = Some(outcome.status);
    job.last_summary = Some(truncate_summary(&outcome.summary));
    job.last_duration_ms = Some(duration_ms);
    job.updated_at = now;

    if matches!(job.schedule, CronSchedule::At { .. }) {
        if job.delete_after_run && outcome.status == RunStatus::Ok {
            return AfterRun::Delete;
        }
        job.enabled = false;
    }
    job.next_run_at = next_run_at(job);
    AfterRun::Keep
}

fn truncate_summary(summary: &str) -> String {
    match summary.char_indices().nth(MAX_SUMMARY_CHARS) {
        Some((idx, _)) => summary[..idx].to_string(),
        None => summary.to_string(),
    }
}
