//! The backfill scheduling loop shared by the EASY, HYBRID, and
//! CONSERVATIVE policies, which differ only in `reservation_depth`.
//!
//! The loop walks the pending queue in key order, asking the matcher to
//! allocate-or-reserve while reservations remain within the depth and to
//! allocate-only beyond it. It is resumable: one job is in flight at a
//! time, its position held in `cursor`, and each match callback submits
//! the next. Reservations live only for the duration of one pass; the
//! next pass cancels and re-plans them against the then-current state.

use errors::ErrorMetadata;

use crate::{
    job::{
        JobId,
        JobState,
    },
    matcher::{
        MatchFailure,
        MatchRequest,
        MatchStatus,
        Matcher,
    },
    queue::Queue,
};

impl Queue {
    pub(crate) fn run_backfill_loop(&mut self, matcher: &mut dyn Matcher) -> anyhow::Result<()> {
        if self.is_sched_loop_active() {
            // A previous pass is still draining match results.
            return Ok(());
        }
        self.set_schedulability(false);
        self.cancel_reserved_jobs(matcher)?;
        self.merge_provisional_pending();
        self.cursor = self.first_pending();
        self.reservation_count = 0;
        self.scheduled_count = 0;
        self.set_sched_loop_active(true)?;
        self.next_match_iter(matcher)
    }

    fn cancel_reserved_jobs(&mut self, matcher: &mut dyn Matcher) -> anyhow::Result<()> {
        let reserved = std::mem::take(&mut self.reserved);
        let mut result = Ok(());
        for (_, id) in reserved {
            if let Err(e) = matcher.cancel(id, false) {
                tracing::warn!("failed to cancel reservation for job {id}: {e:#}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.reservation_count = 0;
        result
    }

    /// Submits the cursor job, or winds the loop down at end-of-queue or
    /// when the per-pass budget is spent.
    fn next_match_iter(&mut self, matcher: &mut dyn Matcher) -> anyhow::Result<()> {
        let reached_depth = self.scheduled_count >= self.queue_depth;
        let reached_end = self.cursor.is_none();
        if reached_end || reached_depth {
            self.set_sched_loop_active(false)?;
            if reached_depth && !reached_end && self.is_scheduled() {
                // More jobs remain and this pass placed something: start
                // over next tick.
                self.set_schedulability(true);
            }
            return Ok(());
        }
        let (_, id) = self.cursor.expect("checked above");
        let jobspec = self
            .jobs
            .get(&id)
            .ok_or_else(|| {
                anyhow::anyhow!(ErrorMetadata::not_found(
                    "JobNotFound",
                    format!("cursor job {id} vanished mid-loop"),
                ))
            })?
            .jobspec
            .clone();
        self.try_reserve = self.reservation_count < self.reservation_depth;
        let batch = [MatchRequest { id, jobspec }];
        matcher.match_allocate_multi(self.try_reserve, &batch, self)
    }

    pub(crate) fn bf_handle_match_success(
        &mut self,
        matcher: &mut dyn Matcher,
        id: JobId,
        status: MatchStatus,
        r: &str,
        at: i64,
        ov: f64,
    ) -> anyhow::Result<()> {
        self.ensure_loop_active()?;
        let (key, cursor_id) = self.cursor_entry()?;
        if cursor_id != id {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "MatchOutOfOrder",
                format!("match result for job {id} while job {cursor_id} is in flight"),
            ));
        }
        let job = self.jobs.get_mut(&id).ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::not_found(
                "JobNotFound",
                format!("matched job {id} vanished mid-loop"),
            ))
        })?;
        job.schedule.reserved = status == MatchStatus::Reserved;
        job.schedule.r = r.to_owned();
        job.schedule.old_at = job.schedule.at;
        job.schedule.at = at;
        job.schedule.ov = ov;
        if status == MatchStatus::Reserved {
            // A job that cannot run now holds a future start time; it
            // stays pending and the estimate is annotated back.
            self.record_reservation(id);
            self.cursor = self.next_pending_after(key);
            self.mark_scheduled();
        } else {
            self.cursor = self.to_running(key, true)?;
        }
        self.scheduled_count += 1;
        self.next_match_iter(matcher)
    }

    pub(crate) fn bf_handle_match_failure(
        &mut self,
        matcher: &mut dyn Matcher,
        id: JobId,
        failure: MatchFailure,
    ) -> anyhow::Result<()> {
        self.ensure_loop_active()?;
        if failure == MatchFailure::NoData {
            // End of the submitted batch; the next submission (or wind
            // down) already happened from the per-job callback.
            return Ok(());
        }
        let (key, cursor_id) = self.cursor_entry()?;
        if cursor_id != id {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "MatchOutOfOrder",
                format!("match failure for job {id} while job {cursor_id} is in flight"),
            ));
        }
        match failure {
            MatchFailure::ResourceBusy => {
                self.cursor = self.next_pending_after(key);
                if self.try_reserve {
                    // Busy on a reservation attempt means the job cannot
                    // be reserved under current topology (down nodes).
                    // Park it until the resource layer announces a
                    // change, and spend no loop budget on it.
                    if let Some(id) = self.pending.remove(&key) {
                        debug_assert_eq!(
                            self.jobs.get(&id).map(|j| j.state),
                            Some(JobState::Pending),
                        );
                        self.blocked.insert(key, id);
                    }
                } else {
                    self.scheduled_count += 1;
                }
            },
            MatchFailure::Unsatisfiable => {
                self.cursor = self.to_rejected(key, "unsatisfiable")?;
                self.scheduled_count += 1;
            },
            MatchFailure::Other(msg) => {
                tracing::warn!("match error for job {id}: {msg}");
                self.cursor = self.to_rejected(key, "match error")?;
                self.scheduled_count += 1;
            },
            MatchFailure::NoData => unreachable!("handled above"),
        }
        self.next_match_iter(matcher)
    }

    fn cursor_entry(&self) -> anyhow::Result<(crate::job::PendingKey, JobId)> {
        self.cursor.ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::invalid_argument(
                "NoCursor",
                "match result arrived with no job in flight",
            ))
        })
    }
}
