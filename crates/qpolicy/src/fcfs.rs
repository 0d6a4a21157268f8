//! The strict-order FCFS scheduling loop: the reservation-depth-zero
//! variant, which submits up to `queue_depth` pending jobs as one batch
//! and consumes results in order.

use errors::ErrorMetadata;

use crate::{
    job::JobId,
    matcher::{
        MatchFailure,
        MatchRequest,
        MatchStatus,
        Matcher,
    },
    queue::Queue,
};

impl Queue {
    pub(crate) fn run_fcfs_loop(&mut self, matcher: &mut dyn Matcher) -> anyhow::Result<()> {
        if self.is_sched_loop_active() {
            return Ok(());
        }
        self.set_schedulability(false);
        self.merge_provisional_pending();
        self.fcfs_cursor = self.first_pending();
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut batch = Vec::new();
        for (_, &id) in self.pending.iter().take(self.queue_depth as usize) {
            let jobspec = self
                .jobs
                .get(&id)
                .expect("pending entries map to jobs")
                .jobspec
                .clone();
            batch.push(MatchRequest { id, jobspec });
        }
        if batch.len() == self.queue_depth as usize && self.pending.len() != batch.len() {
            // Cut off by the depth cap, not end-of-queue; end-of-batch
            // re-arms schedulability so the next tick resumes.
            self.queue_depth_limit = true;
        }
        self.set_sched_loop_active(true)?;
        if let Err(e) = matcher.match_allocate_multi(false, &batch, self) {
            self.set_sched_loop_active(false)?;
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn fcfs_handle_match_success(
        &mut self,
        _matcher: &mut dyn Matcher,
        id: JobId,
        status: MatchStatus,
        r: &str,
        at: i64,
        ov: f64,
    ) -> anyhow::Result<()> {
        self.ensure_loop_active()?;
        let (key, cursor_id) = self.fcfs_cursor_entry()?;
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
        job.schedule.at = at;
        job.schedule.ov = ov;
        self.fcfs_cursor = self.to_running(key, true)?;
        Ok(())
    }

    pub(crate) fn fcfs_handle_match_failure(
        &mut self,
        _matcher: &mut dyn Matcher,
        id: JobId,
        failure: MatchFailure,
    ) -> anyhow::Result<()> {
        self.ensure_loop_active()?;
        if failure == MatchFailure::NoData {
            if self.queue_depth_limit {
                self.set_schedulability(true);
                self.queue_depth_limit = false;
            }
            self.set_sched_loop_active(false)?;
            // A transition occurred this pass either way; run the
            // response batching.
            self.mark_scheduled();
            return Ok(());
        }
        let (key, cursor_id) = self.fcfs_cursor_entry()?;
        if cursor_id != id {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "MatchOutOfOrder",
                format!("match failure for job {id} while job {cursor_id} is in flight"),
            ));
        }
        match failure {
            MatchFailure::ResourceBusy => {
                self.fcfs_cursor = self.next_pending_after(key);
            },
            MatchFailure::Unsatisfiable => {
                self.fcfs_cursor = self.to_rejected(key, "unsatisfiable")?;
            },
            MatchFailure::Other(msg) => {
                tracing::warn!("match error for job {id}: {msg}");
                self.fcfs_cursor = self.to_rejected(key, "match error")?;
            },
            MatchFailure::NoData => unreachable!("handled above"),
        }
        Ok(())
    }

    fn fcfs_cursor_entry(&self) -> anyhow::Result<(crate::job::PendingKey, JobId)> {
        self.fcfs_cursor.ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::invalid_argument(
                "NoCursor",
                "match result arrived with no job in flight",
            ))
        })
    }
}
