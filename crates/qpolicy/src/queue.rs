use std::collections::BTreeMap;

use common::knobs::{
    DEFAULT_QUEUE_DEPTH,
    HYBRID_RESERVATION_DEPTH,
    MAX_QUEUE_DEPTH,
    MAX_RESERVATION_DEPTH,
};
use errors::ErrorMetadata;
use serde::Serialize;
use serde_json::json;

use crate::{
    job::{
        Job,
        JobId,
        JobState,
        PendingKey,
    },
    matcher::Matcher,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PolicyKind {
    Fcfs,
    Easy,
    Hybrid,
    Conservative,
}

impl PolicyKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fcfs" => Some(Self::Fcfs),
            "easy" => Some(Self::Easy),
            "hybrid" => Some(Self::Hybrid),
            "conservative" => Some(Self::Conservative),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Fcfs => "fcfs",
            Self::Easy => "easy",
            Self::Hybrid => "hybrid",
            Self::Conservative => "conservative",
        }
    }

    fn default_reservation_depth(&self) -> u32 {
        match self {
            Self::Fcfs => 0,
            Self::Easy => 1,
            Self::Hybrid => *HYBRID_RESERVATION_DEPTH,
            Self::Conservative => *MAX_RESERVATION_DEPTH,
        }
    }
}

/// Cumulative per-queue action counters, reported by `stats-get` and
/// resettable by `stats-clear`.
#[derive(Copy, Clone, Debug, Default, Serialize)]
pub struct ActionCounts {
    pub pending: u64,
    pub running: u64,
    pub reserved: u64,
    pub rejected: u64,
    pub complete: u64,
    pub cancelled: u64,
    pub reprioritized: u64,
}

/// Monotonic stamp sources for the per-state queues. Unlike
/// [`ActionCounts`] these are never reset; stamps key maps and order the
/// pending tiebreak, so reuse would corrupt them.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct StampSeq {
    pub pending: u64,
    pub running: u64,
    pub rejected: u64,
    pub complete: u64,
    pub canceled: u64,
    pub reprio: u64,
    pub reserved: u64,
}

/// One named queue: authoritative job storage, the per-state orderings,
/// the provisional buffers used while a scheduling loop is in flight, and
/// the loop cursor state of the policy variants.
pub struct Queue {
    policy: PolicyKind,

    pub(crate) jobs: BTreeMap<JobId, Job>,
    pub(crate) pending: BTreeMap<PendingKey, JobId>,
    pub(crate) pending_provisional: BTreeMap<PendingKey, JobId>,
    /// Jobs whose reservation attempt failed resource-busy; they leave
    /// only on a topology change notification.
    pub(crate) blocked: BTreeMap<PendingKey, JobId>,
    pub(crate) running: BTreeMap<u64, JobId>,
    pub(crate) alloced: BTreeMap<u64, JobId>,
    pub(crate) rejected: BTreeMap<u64, JobId>,
    pub(crate) canceled: BTreeMap<u64, JobId>,
    /// Reservations held by the current backfill pass, in reservation
    /// order; cancelled wholesale when the next pass starts.
    pub(crate) reserved: BTreeMap<u64, JobId>,

    pending_cancel_provisional: BTreeMap<u64, JobId>,
    pending_reprio_provisional: BTreeMap<u64, (JobId, u32)>,
    pending_reconsider: bool,

    schedulable: bool,
    scheduled: bool,
    sched_loop_active: bool,

    pub(crate) queue_depth: u32,
    max_queue_depth: u32,
    pub(crate) reservation_depth: u32,
    pub(crate) max_reservation_depth: u32,
    qparams: BTreeMap<String, String>,
    pparams: BTreeMap<String, String>,

    pub(crate) seq: StampSeq,
    counts: ActionCounts,

    // Resumable backfill cursor: the pending entry currently awaiting its
    // match result. Explicit data rather than a borrowed iterator, so the
    // pending map stays mutable between callbacks.
    pub(crate) cursor: Option<(PendingKey, JobId)>,
    pub(crate) reservation_count: u32,
    pub(crate) scheduled_count: u32,
    pub(crate) try_reserve: bool,

    // FCFS batch cursor and depth-cutoff flag.
    pub(crate) fcfs_cursor: Option<(PendingKey, JobId)>,
    pub(crate) queue_depth_limit: bool,
}

impl Queue {
    pub fn new(policy: PolicyKind) -> Self {
        Self {
            policy,
            jobs: BTreeMap::new(),
            pending: BTreeMap::new(),
            pending_provisional: BTreeMap::new(),
            blocked: BTreeMap::new(),
            running: BTreeMap::new(),
            alloced: BTreeMap::new(),
            rejected: BTreeMap::new(),
            canceled: BTreeMap::new(),
            reserved: BTreeMap::new(),
            pending_cancel_provisional: BTreeMap::new(),
            pending_reprio_provisional: BTreeMap::new(),
            pending_reconsider: false,
            schedulable: false,
            scheduled: false,
            sched_loop_active: false,
            queue_depth: *DEFAULT_QUEUE_DEPTH,
            max_queue_depth: *MAX_QUEUE_DEPTH,
            reservation_depth: policy.default_reservation_depth(),
            max_reservation_depth: *MAX_RESERVATION_DEPTH,
            qparams: BTreeMap::new(),
            pparams: BTreeMap::new(),
            seq: StampSeq::default(),
            counts: ActionCounts::default(),
            cursor: None,
            reservation_count: 0,
            scheduled_count: 0,
            try_reserve: false,
            fcfs_cursor: None,
            queue_depth_limit: false,
        }
    }

    pub fn policy(&self) -> PolicyKind {
        self.policy
    }

    pub fn queue_depth(&self) -> u32 {
        self.queue_depth
    }

    /// True when a job or resource event occurred such that the scheduling
    /// loop should run for this queue.
    pub fn is_schedulable(&self) -> bool {
        self.schedulable
    }

    pub fn set_schedulability(&mut self, schedulable: bool) {
        self.schedulable = schedulable;
    }

    /// True when job state changed this pass and responses should be
    /// emitted.
    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    pub fn reset_scheduled(&mut self) {
        self.scheduled = false;
    }

    pub(crate) fn mark_scheduled(&mut self) {
        self.scheduled = true;
    }

    pub fn is_sched_loop_active(&self) -> bool {
        self.sched_loop_active
    }

    /// Flips the loop-active flag. On deactivation the provisional
    /// buffers flush, in this order: reprioritize, cancel, reconsider.
    pub(crate) fn set_sched_loop_active(&mut self, active: bool) -> anyhow::Result<()> {
        let prev = self.sched_loop_active;
        self.sched_loop_active = active;
        if !prev || active {
            return Ok(());
        }
        let mut result = Ok(());
        if let Err(e) = self.process_provisional_reprio() {
            result = Err(e);
        }
        if let Err(e) = self.process_provisional_cancel() {
            if result.is_ok() {
                result = Err(e);
            }
        }
        self.process_provisional_reconsider();
        result
    }

    /// Requests cancellation of an in-flight scheduling loop. Returns
    /// true when the cancel is deferred to the next callback boundary (the
    /// caller must buffer its mutation), false when no loop is active and
    /// the mutation may proceed synchronously.
    pub fn cancel_sched_loop(&mut self) -> bool {
        if !self.sched_loop_active {
            return false;
        }
        if self.policy != PolicyKind::Fcfs {
            // Zeroing the remaining budget makes the next callback wind
            // the loop down; the cancel itself applies on loop exit.
            self.scheduled_count = self.queue_depth;
        }
        true
    }

    pub fn lookup(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn lookup_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    /// Enqueues a new pending job. The job lands in the provisional
    /// pending map and merges into the authoritative one at the next loop
    /// entry.
    pub fn insert(&mut self, mut job: Job) -> anyhow::Result<()> {
        if self.jobs.contains_key(&job.id) {
            anyhow::bail!(ErrorMetadata::already_exists(
                "JobExists",
                format!("job {} is already enqueued", job.id),
            ));
        }
        job.state = JobState::Pending;
        job.t_stamps.pending = self.seq.pending;
        self.seq.pending += 1;
        self.counts.pending += 1;
        self.pending_provisional.insert(job.pending_key(), job.id);
        self.jobs.insert(job.id, job);
        self.schedulable = true;
        Ok(())
    }

    /// Cancels a pending job. If a scheduling loop is in flight the
    /// cancel is buffered and applied on loop exit.
    pub fn remove_pending(&mut self, id: JobId) -> anyhow::Result<()> {
        let Some(job) = self.jobs.get_mut(&id) else {
            anyhow::bail!(ErrorMetadata::not_found(
                "JobNotFound",
                format!("no job {id} in this queue"),
            ));
        };
        if job.state != JobState::Pending {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "JobNotPending",
                format!("job {id} is not pending"),
            ));
        }
        job.t_stamps.canceled = self.seq.canceled;
        self.seq.canceled += 1;
        self.counts.cancelled += 1;
        let canceled_ts = job.t_stamps.canceled;
        if self.sched_loop_active && self.cancel_sched_loop() {
            // The job may have a match request in flight; defer until the
            // loop winds down.
            self.pending_cancel_provisional.insert(canceled_ts, id);
        } else {
            self.erase_pending_job(id)?;
            let job = self.jobs.get_mut(&id).expect("job looked up above");
            job.state = JobState::Canceled;
            self.canceled.insert(canceled_ts, id);
            self.schedulable = true;
        }
        Ok(())
    }

    /// Releases a job: pending jobs cancel, running jobs release their
    /// resources through the matcher (partially unless `is_final`). A
    /// full removal reported before the final release is a protocol
    /// violation, surfaced after the local reap completes.
    pub fn remove(
        &mut self,
        matcher: &mut dyn Matcher,
        id: JobId,
        is_final: bool,
        r: &str,
    ) -> anyhow::Result<()> {
        let result = self.remove_inner(matcher, id, is_final, r);
        self.cancel_sched_loop();
        // Blocked jobs must be reconsidered after a job completes: a job
        // that could not run because of an existing reservation can once
        // the reserving job finishes early.
        self.reconsider_blocked_jobs();
        result
    }

    fn remove_inner(
        &mut self,
        matcher: &mut dyn Matcher,
        id: JobId,
        is_final: bool,
        r: &str,
    ) -> anyhow::Result<()> {
        let Some(job) = self.jobs.get(&id) else {
            anyhow::bail!(ErrorMetadata::not_found(
                "JobNotFound",
                format!("no job {id} in this queue"),
            ));
        };
        match job.state {
            JobState::Pending => self.remove_pending(id)?,
            JobState::Running | JobState::AllocRunning => {
                let full_removal = if !is_final {
                    matcher.partial_cancel(id, r, true).map_err(|e| {
                        tracing::warn!("partial release failed for job {id}: {e:#}");
                        e
                    })?
                } else {
                    // Full cancel cleans up whatever remains allocated.
                    matcher.cancel(id, true).map_err(|e| {
                        tracing::warn!("final release failed for job {id}: {e:#}");
                        e
                    })?;
                    true
                };
                // Run the loop again even if the matcher and queue
                // disagree below.
                self.schedulable = true;
                if full_removal || is_final {
                    let job = self.jobs.get_mut(&id).expect("job looked up above");
                    let running_ts = job.t_stamps.running;
                    job.t_stamps.complete = self.seq.complete;
                    job.state = JobState::Complete;
                    self.seq.complete += 1;
                    self.counts.complete += 1;
                    self.alloced.remove(&running_ts);
                    self.running.remove(&running_ts);
                    self.jobs.remove(&id);
                    if full_removal && !is_final {
                        // The matcher dropped the allocation before the
                        // final release arrived. Local reap already
                        // happened; report the discrepancy.
                        tracing::error!(
                            "allocation removed before final release for job {id}"
                        );
                        anyhow::bail!(ErrorMetadata::protocol_violation(
                            "EarlyFullRemoval",
                            format!("allocation removed before final release for job {id}"),
                        ));
                    }
                }
            },
            _ => {},
        }
        Ok(())
    }

    /// Re-keys a pending job under a new priority. Buffered while a loop
    /// is in flight.
    pub fn reprioritize(&mut self, id: JobId, priority: u32) -> anyhow::Result<()> {
        let Some(job) = self.jobs.get(&id) else {
            anyhow::bail!(ErrorMetadata::not_found(
                "JobNotFound",
                format!("no job {id} in this queue"),
            ));
        };
        if job.state != JobState::Pending {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "JobNotPending",
                format!("cannot reprioritize non-pending job {id}"),
            ));
        }
        self.pending_reprio_provisional
            .insert(self.seq.reprio, (id, priority));
        self.seq.reprio += 1;
        self.counts.reprioritized += 1;
        if !self.sched_loop_active || !self.cancel_sched_loop() {
            self.process_provisional_reprio()?;
        }
        Ok(())
    }

    /// Moves every blocked job back to pending, immediately or (with a
    /// loop in flight) on loop exit. Called on every resource-status
    /// change announcement.
    pub fn reconsider_blocked_jobs(&mut self) {
        self.pending_reconsider = true;
        if !self.sched_loop_active {
            self.process_provisional_reconsider();
        }
    }

    /// Startup reconstruction of an already-running job: re-install its
    /// allocation in the matcher, then account it in the running queue.
    pub fn reconstruct(&mut self, matcher: &mut dyn Matcher, job: Job) -> anyhow::Result<String> {
        let alloc = matcher.update_allocate(job.id, &job.schedule.r)?;
        self.reconstruct_queue(job)?;
        Ok(alloc.r)
    }

    fn reconstruct_queue(&mut self, mut job: Job) -> anyhow::Result<()> {
        if self.jobs.contains_key(&job.id) {
            anyhow::bail!(ErrorMetadata::already_exists(
                "JobExists",
                format!("job {} is already enqueued", job.id),
            ));
        }
        job.t_stamps.running = self.seq.running;
        self.seq.running += 1;
        self.counts.running += 1;
        self.running.insert(job.t_stamps.running, job.id);
        self.jobs.insert(job.id, job);
        Ok(())
    }

    /// Pops one newly allocated job; the job itself stays accounted in
    /// the running queue.
    pub fn alloced_pop(&mut self) -> Option<Job> {
        let (&ts, &id) = self.alloced.iter().next()?;
        self.alloced.remove(&ts);
        self.jobs.get(&id).cloned()
    }

    /// Pops one rejected job, fully graduating it from the queue.
    pub fn rejected_pop(&mut self) -> Option<Job> {
        let (&ts, &id) = self.rejected.iter().next()?;
        self.rejected.remove(&ts);
        self.jobs.remove(&id)
    }

    /// Pops one canceled job, fully graduating it from the queue.
    pub fn canceled_pop(&mut self) -> Option<Job> {
        let (&ts, &id) = self.canceled.iter().next()?;
        self.canceled.remove(&ts);
        self.jobs.remove(&id)
    }

    /// The first `limit` pending jobs in key order.
    pub fn pending_ids(&self, limit: usize) -> Vec<JobId> {
        self.pending.values().take(limit).copied().collect()
    }

    // ---- provisional flushes -------------------------------------------

    fn process_provisional_cancel(&mut self) -> anyhow::Result<()> {
        let deferred = std::mem::take(&mut self.pending_cancel_provisional);
        for (canceled_ts, id) in deferred {
            let Some(job) = self.jobs.get(&id) else {
                anyhow::bail!(ErrorMetadata::not_found(
                    "JobNotFound",
                    format!("deferred cancel for unknown job {id}"),
                ));
            };
            // The loop may have placed or rejected the job in the
            // meantime; only still-pending jobs cancel.
            if job.state != JobState::Pending {
                continue;
            }
            self.erase_pending_job(id)?;
            let job = self.jobs.get_mut(&id).expect("job looked up above");
            job.state = JobState::Canceled;
            self.canceled.insert(canceled_ts, id);
            self.schedulable = true;
        }
        Ok(())
    }

    fn process_provisional_reprio(&mut self) -> anyhow::Result<()> {
        let deferred = std::mem::take(&mut self.pending_reprio_provisional);
        for (_, (id, priority)) in deferred {
            let Some(job) = self.jobs.get(&id) else {
                anyhow::bail!(ErrorMetadata::not_found(
                    "JobNotFound",
                    format!("deferred reprioritize for unknown job {id}"),
                ));
            };
            if job.state != JobState::Pending {
                continue;
            }
            let found_in_provisional = self.erase_pending_job(id)?;
            let job = self.jobs.get_mut(&id).expect("job looked up above");
            job.priority = priority;
            let key = job.pending_key();
            self.insert_pending_job(key, id, found_in_provisional)?;
            self.schedulable = true;
            // This job may now rank below one it was blocking.
            self.reconsider_blocked_jobs();
        }
        Ok(())
    }

    fn process_provisional_reconsider(&mut self) {
        if !self.pending_reconsider {
            return;
        }
        self.pending_reconsider = false;
        let unblocked = self.blocked.len();
        let blocked = std::mem::take(&mut self.blocked);
        self.pending.extend(blocked);
        if unblocked > 0 {
            self.schedulable = true;
        }
    }

    fn insert_pending_job(
        &mut self,
        key: PendingKey,
        id: JobId,
        into_provisional: bool,
    ) -> anyhow::Result<()> {
        let map = if into_provisional {
            &mut self.pending_provisional
        } else {
            &mut self.pending
        };
        if map.insert(key, id).is_some() {
            anyhow::bail!(ErrorMetadata::already_exists(
                "PendingKeyExists",
                format!("pending key collision while re-inserting job {id}"),
            ));
        }
        Ok(())
    }

    /// Erases the job from whichever pending-class map holds it. Returns
    /// true when it was found in the provisional map.
    fn erase_pending_job(&mut self, id: JobId) -> anyhow::Result<bool> {
        let key = self.jobs.get(&id).expect("caller verified the job").pending_key();
        if self.pending.remove(&key).is_some() || self.blocked.remove(&key).is_some() {
            return Ok(false);
        }
        if self.pending_provisional.remove(&key).is_some() {
            return Ok(true);
        }
        anyhow::bail!(ErrorMetadata::not_found(
            "PendingJobNotFound",
            format!("job {id} is in no pending-class map"),
        ));
    }

    // ---- loop-internal transitions -------------------------------------

    /// Moves the pending entry at `key` to running (and to the alloced
    /// queue when `use_alloced_queue`). Returns the next pending entry
    /// after the removed one.
    pub(crate) fn to_running(
        &mut self,
        key: PendingKey,
        use_alloced_queue: bool,
    ) -> anyhow::Result<Option<(PendingKey, JobId)>> {
        let id = *self.pending.get(&key).ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::not_found(
                "PendingJobNotFound",
                "pending entry vanished mid-loop",
            ))
        })?;
        let job = self.jobs.get_mut(&id).expect("pending entries map to jobs");
        job.state = JobState::Running;
        job.t_stamps.running = self.seq.running;
        self.seq.running += 1;
        self.counts.running += 1;
        self.running.insert(job.t_stamps.running, id);
        if use_alloced_queue {
            let running_ts = {
                let job = self.jobs.get_mut(&id).expect("pending entries map to jobs");
                job.state = JobState::AllocRunning;
                job.t_stamps.running
            };
            self.alloced.insert(running_ts, id);
            self.scheduled = true;
        }
        self.pending.remove(&key);
        Ok(self.next_pending_after(key))
    }

    /// Moves the pending entry at `key` to the rejected queue with a
    /// note. Returns the next pending entry after the removed one.
    pub(crate) fn to_rejected(
        &mut self,
        key: PendingKey,
        note: &str,
    ) -> anyhow::Result<Option<(PendingKey, JobId)>> {
        let id = *self.pending.get(&key).ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::not_found(
                "PendingJobNotFound",
                "pending entry vanished mid-loop",
            ))
        })?;
        let job = self.jobs.get_mut(&id).expect("pending entries map to jobs");
        job.state = JobState::Rejected;
        job.note = note.to_owned();
        job.t_stamps.rejected = self.seq.rejected;
        self.seq.rejected += 1;
        self.counts.rejected += 1;
        self.rejected.insert(job.t_stamps.rejected, id);
        self.scheduled = true;
        self.pending.remove(&key);
        Ok(self.next_pending_after(key))
    }

    pub(crate) fn next_pending_after(&self, key: PendingKey) -> Option<(PendingKey, JobId)> {
        use std::ops::Bound;
        self.pending
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, v)| (*k, *v))
    }

    pub(crate) fn first_pending(&self) -> Option<(PendingKey, JobId)> {
        self.pending.iter().next().map(|(k, v)| (*k, *v))
    }

    /// Merges provisionally inserted jobs into the authoritative pending
    /// map; called at loop entry, where iterating `pending` is safe.
    pub(crate) fn merge_provisional_pending(&mut self) {
        let provisional = std::mem::take(&mut self.pending_provisional);
        self.pending.extend(provisional);
    }

    pub(crate) fn record_reservation(&mut self, id: JobId) {
        self.reserved.insert(self.seq.reserved, id);
        self.seq.reserved += 1;
        self.counts.reserved += 1;
        self.reservation_count += 1;
    }

    // ---- parameters ----------------------------------------------------

    /// Parses comma-delimited `key=value` pairs into the queue parameter
    /// map. Applied by [`Queue::apply_params`].
    pub fn set_queue_params(&mut self, params: &str) -> anyhow::Result<()> {
        let parsed = parse_params(params)?;
        self.qparams.extend(parsed);
        Ok(())
    }

    /// Parses comma-delimited `key=value` pairs into the policy parameter
    /// map. Applied by [`Queue::apply_params`].
    pub fn set_policy_params(&mut self, params: &str) -> anyhow::Result<()> {
        let parsed = parse_params(params)?;
        self.pparams.extend(parsed);
        Ok(())
    }

    /// Applies the accumulated parameter maps to the live configuration.
    pub fn apply_params(&mut self) -> anyhow::Result<()> {
        if let Some(v) = self.qparams.get("max-queue-depth") {
            let depth = parse_depth("max-queue-depth", v)?;
            self.max_queue_depth = depth.min(*MAX_QUEUE_DEPTH);
            if self.max_queue_depth < self.queue_depth {
                self.queue_depth = self.max_queue_depth;
            }
        }
        if let Some(v) = self.qparams.get("queue-depth") {
            let depth = parse_depth("queue-depth", v)?;
            self.queue_depth = depth.min(self.max_queue_depth);
        }
        match self.policy {
            PolicyKind::Fcfs | PolicyKind::Easy => {},
            PolicyKind::Hybrid => {
                if let Some(v) = self.pparams.get("max-reservation-depth") {
                    self.max_reservation_depth = parse_depth("max-reservation-depth", v)?;
                }
                if let Some(v) = self.pparams.get("reservation-depth") {
                    let depth = parse_depth("reservation-depth", v)?;
                    self.reservation_depth = depth.min(self.max_reservation_depth);
                }
            },
            PolicyKind::Conservative => {
                if let Some(v) = self.pparams.get("max-reservation-depth") {
                    let depth = parse_depth("max-reservation-depth", v)?;
                    self.max_reservation_depth = depth;
                    if depth < self.reservation_depth {
                        self.reservation_depth = depth;
                    }
                }
                // Conservative reserves for everything it considers, so
                // the effective depth tracks the queue depth.
                if self.reservation_depth > self.queue_depth {
                    self.reservation_depth = self.queue_depth;
                }
            },
        }
        Ok(())
    }

    /// Canonicalized parameter strings for the params RPC.
    pub fn params(&self) -> (String, String) {
        let join = |map: &BTreeMap<String, String>| {
            map.iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",")
        };
        (join(&self.qparams), join(&self.pparams))
    }

    // ---- stats ---------------------------------------------------------

    pub fn stats_json(&self) -> serde_json::Value {
        let ids = |map: &BTreeMap<u64, JobId>| map.values().copied().collect::<Vec<_>>();
        let pending_ids = |map: &BTreeMap<PendingKey, JobId>| {
            map.values().copied().collect::<Vec<_>>()
        };
        json!({
            "policy": self.policy.name(),
            "queue_depth": self.queue_depth,
            "max_queue_depth": self.max_queue_depth,
            "queue_parameters": self.qparams,
            "policy_parameters": self.pparams,
            "action_counts": self.counts,
            "pending_queues": {
                "pending": pending_ids(&self.pending),
                "pending_provisional": pending_ids(&self.pending_provisional),
                "blocked": pending_ids(&self.blocked),
            },
            "scheduled_queues": {
                "running": ids(&self.running),
                "rejected": ids(&self.rejected),
                "canceled": ids(&self.canceled),
            },
        })
    }

    pub fn stats_clear(&mut self) {
        self.counts = ActionCounts::default();
    }

    // ---- scheduling loop entry -----------------------------------------

    /// Runs (or resumes) one scheduling-loop pass against the matcher.
    /// With a synchronous matcher the pass completes before returning;
    /// with an asynchronous one it suspends after the first submission
    /// and resumes as results stream back through the adapter callbacks.
    pub fn run_sched_loop(&mut self, matcher: &mut dyn Matcher) -> anyhow::Result<()> {
        match self.policy {
            PolicyKind::Fcfs => self.run_fcfs_loop(matcher),
            _ => self.run_backfill_loop(matcher),
        }
    }

    pub(crate) fn ensure_loop_active(&self) -> anyhow::Result<()> {
        if !self.sched_loop_active {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "LoopNotActive",
                "match result arrived outside an active scheduling loop",
            ));
        }
        Ok(())
    }
}

impl crate::matcher::MatchAdapter for Queue {
    fn handle_match_success(
        &mut self,
        matcher: &mut dyn Matcher,
        id: JobId,
        status: crate::matcher::MatchStatus,
        r: &str,
        at: i64,
        ov: f64,
    ) -> anyhow::Result<()> {
        match self.policy {
            PolicyKind::Fcfs => self.fcfs_handle_match_success(matcher, id, status, r, at, ov),
            _ => self.bf_handle_match_success(matcher, id, status, r, at, ov),
        }
    }

    fn handle_match_failure(
        &mut self,
        matcher: &mut dyn Matcher,
        id: JobId,
        failure: crate::matcher::MatchFailure,
    ) -> anyhow::Result<()> {
        match self.policy {
            PolicyKind::Fcfs => self.fcfs_handle_match_failure(matcher, id, failure),
            _ => self.bf_handle_match_failure(matcher, id, failure),
        }
    }

    fn is_sched_loop_active(&self) -> bool {
        self.sched_loop_active
    }
}

fn parse_params(params: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut parsed = Vec::new();
    for pair in params.split(',') {
        let Some((k, v)) = pair.split_once('=') else {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "BadParam",
                format!("expected key=value, got \"{pair}\""),
            ));
        };
        let k = k.trim();
        let v = v.trim();
        if k.is_empty() || v.is_empty() {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "BadParam",
                format!("empty key or value in \"{pair}\""),
            ));
        }
        parsed.push((k.to_owned(), v.to_owned()));
    }
    Ok(parsed)
}

fn parse_depth(key: &str, value: &str) -> anyhow::Result<u32> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        anyhow::bail!(ErrorMetadata::invalid_argument(
            "BadParam",
            format!("{key} must be a number, got \"{value}\""),
        ));
    }
    let depth: u32 = value.parse().map_err(|_| {
        anyhow::anyhow!(ErrorMetadata::out_of_range(
            "DepthOutOfRange",
            format!("{key} value \"{value}\" is out of range"),
        ))
    })?;
    if depth < 1 {
        anyhow::bail!(ErrorMetadata::out_of_range(
            "DepthOutOfRange",
            format!("{key} must be at least 1"),
        ));
    }
    Ok(depth)
}
