//! Event handlers between the job manager and the policy queues, plus the
//! per-tick prepare/check phases.

use std::collections::BTreeMap;

use errors::ErrorMetadata;
use qpolicy::{
    job::{
        adjusted_priority,
        Job,
        JobId,
    },
    matcher::Matcher,
    Queue,
};
use serde_json::json;

use crate::{
    jobspec::JobSpec,
    opts::QmanagerOpts,
};

/// The transport seam back to the job manager: one call per outbound
/// response.
pub trait JobResponder {
    fn alloc_success(&mut self, id: JobId, r: &str);
    fn alloc_deny(&mut self, id: JobId, note: &str);
    fn alloc_cancel(&mut self, id: JobId);
    fn alloc_annotate(&mut self, id: JobId, t_estimate: i64);
}

/// The named queues and the tick state shared by the prepare and check
/// phases.
pub struct QueueManager {
    queues: BTreeMap<String, Queue>,
    opts: QmanagerOpts,
    pls_sched_loop: bool,
    pls_post_loop: bool,
}

impl QueueManager {
    /// Builds the queue set from a canonicalized option set.
    pub fn new(mut opts: QmanagerOpts) -> anyhow::Result<Self> {
        opts.canonicalize();
        let mut queues = BTreeMap::new();
        for (name, prop) in opts.per_queue() {
            let mut queue = Queue::new(prop.policy());
            if let Some(params) = prop.queue_params() {
                queue.set_queue_params(params)?;
            }
            if let Some(params) = prop.policy_params() {
                queue.set_policy_params(params)?;
            }
            queue.apply_params()?;
            queues.insert(name.clone(), queue);
        }
        Ok(Self {
            queues,
            opts,
            pls_sched_loop: false,
            pls_post_loop: false,
        })
    }

    pub fn queue(&self, name: &str) -> Option<&Queue> {
        self.queues.get(name)
    }

    pub fn queue_mut(&mut self, name: &str) -> Option<&mut Queue> {
        self.queues.get_mut(name)
    }

    /// The queue owning `id`, if any.
    pub fn find_queue(&self, id: JobId) -> Option<&str> {
        self.queues
            .iter()
            .find(|(_, queue)| queue.lookup(id).is_some())
            .map(|(name, _)| name.as_str())
    }

    /// Hello replay: reconstructs one already-running job at startup. The
    /// owning queue comes from the jobspec's queue attribute when
    /// present; a queue that no longer exists fails the job.
    pub fn handle_hello(
        &mut self,
        matcher: &mut dyn Matcher,
        id: JobId,
        priority: u32,
        user_id: u32,
        t_submit: f64,
        r: &str,
        jobspec: Option<&str>,
    ) -> anyhow::Result<()> {
        let queue_name = match jobspec {
            Some(text) => JobSpec::parse(text)?
                .queue_name()
                .unwrap_or(self.opts.default_queue_name())
                .to_owned(),
            None => self.opts.default_queue_name().to_owned(),
        };
        let Some(queue) = self.queues.get_mut(&queue_name) else {
            anyhow::bail!(ErrorMetadata::not_found(
                "UnknownQueue",
                format!("job {id} names queue \"{queue_name}\" which no longer exists"),
            ));
        };
        let job = Job::running(id, user_id, adjusted_priority(priority), t_submit, r.to_owned());
        queue.reconstruct(matcher, job)?;
        tracing::debug!("requeue success (queue={queue_name} id={id})");
        Ok(())
    }

    /// New allocation request. Failures that concern the request itself
    /// (bad jobspec, unknown queue) deny the allocation rather than
    /// erroring the handler.
    pub fn handle_alloc(
        &mut self,
        responder: &mut dyn JobResponder,
        id: JobId,
        priority: u32,
        user_id: u32,
        t_submit: f64,
        jobspec: &str,
    ) -> anyhow::Result<()> {
        let spec = match JobSpec::parse(jobspec) {
            Ok(spec) => spec,
            Err(e) => {
                responder.alloc_deny(id, &format!("{e:#}"));
                return Ok(());
            },
        };
        let queue_name = spec
            .queue_name()
            .unwrap_or(self.opts.default_queue_name())
            .to_owned();
        let Some(queue) = self.queues.get_mut(&queue_name) else {
            responder.alloc_deny(id, &format!("queue ({queue_name}) doesn't exist"));
            return Ok(());
        };
        let job = Job::new(
            id,
            user_id,
            adjusted_priority(priority),
            t_submit,
            jobspec.to_owned(),
        );
        if let Err(e) = queue.insert(job) {
            tracing::warn!("queue insert failed (queue={queue_name} id={id}): {e:#}");
            responder.alloc_deny(id, &format!("could not insert job into queue {queue_name}"));
        }
        Ok(())
    }

    /// Release request, partial unless `is_final`.
    pub fn handle_free(
        &mut self,
        matcher: &mut dyn Matcher,
        id: JobId,
        r: &str,
        is_final: bool,
    ) -> anyhow::Result<()> {
        let Some(queue_name) = self.find_queue(id).map(str::to_owned) else {
            anyhow::bail!(ErrorMetadata::not_found(
                "JobNotFound",
                format!("can't find queue for job {id}"),
            ));
        };
        let queue = self.queues.get_mut(&queue_name).expect("found above");
        queue.remove(matcher, id, is_final, r)
    }

    /// Cancellation of a still-pending job.
    pub fn handle_cancel(&mut self, id: JobId) -> anyhow::Result<()> {
        let Some(queue_name) = self.find_queue(id).map(str::to_owned) else {
            anyhow::bail!(ErrorMetadata::not_found(
                "JobNotFound",
                format!("can't find queue for job {id}"),
            ));
        };
        let queue = self.queues.get_mut(&queue_name).expect("found above");
        if queue.lookup(id).is_some_and(|job| job.is_pending()) {
            queue.remove_pending(id)?;
        }
        Ok(())
    }

    /// Priority updates; entries for unknown or non-pending jobs are
    /// logged and skipped.
    pub fn handle_prioritize(&mut self, updates: &[(JobId, u32)]) {
        for &(id, priority) in updates {
            let Some(queue_name) = self.find_queue(id).map(str::to_owned) else {
                tracing::warn!("reprioritize for unknown job {id}");
                continue;
            };
            let queue = self.queues.get_mut(&queue_name).expect("found above");
            if let Err(e) = queue.reprioritize(id, adjusted_priority(priority)) {
                tracing::warn!("reprioritize failed (id={id}): {e:#}");
            }
        }
    }

    /// The resource layer announced a topology change: every queue
    /// reconsiders its blocked jobs.
    pub fn handle_resource_status_change(&mut self) {
        for queue in self.queues.values_mut() {
            queue.reconsider_blocked_jobs();
        }
    }

    /// Prepare phase: snapshot which queues have scheduling work or
    /// pending responses. Returns whether the check phase must run.
    pub fn prep(&mut self) -> bool {
        self.pls_sched_loop = false;
        self.pls_post_loop = false;
        for queue in self.queues.values() {
            self.pls_sched_loop = self.pls_sched_loop || queue.is_schedulable();
            self.pls_post_loop = self.pls_post_loop || queue.is_scheduled();
        }
        self.pls_sched_loop || self.pls_post_loop
    }

    /// Check phase: run the scheduling loop for every schedulable queue,
    /// then emit the batched responses.
    pub fn check(
        &mut self,
        matcher: &mut dyn Matcher,
        responder: &mut dyn JobResponder,
    ) -> anyhow::Result<()> {
        if !self.pls_sched_loop && !self.pls_post_loop {
            return Ok(());
        }
        if self.pls_sched_loop {
            for (name, queue) in &mut self.queues {
                if let Err(e) = queue.run_sched_loop(matcher) {
                    tracing::error!("sched loop failed (queue={name}): {e:#}");
                    return Err(e);
                }
            }
        }
        self.post_sched_loop(responder);
        Ok(())
    }

    /// Emits, per queue: allocation successes, denials, cancellations,
    /// then start-time annotations for the first `queue_depth` pending
    /// jobs whose estimate changed.
    pub fn post_sched_loop(&mut self, responder: &mut dyn JobResponder) {
        for queue in self.queues.values_mut() {
            while let Some(job) = queue.alloced_pop() {
                responder.alloc_success(job.id, &job.schedule.r);
            }
            while let Some(job) = queue.rejected_pop() {
                let note = format!("alloc denied due to type=\"{}\"", job.note);
                responder.alloc_deny(job.id, &note);
            }
            while let Some(job) = queue.canceled_pop() {
                responder.alloc_cancel(job.id);
            }
            for id in queue.pending_ids(queue.queue_depth() as usize) {
                let job = queue.lookup_mut(id).expect("pending ids are live");
                // unchanged estimates are not re-annotated
                if job.schedule.at == job.schedule.old_at {
                    continue;
                }
                job.schedule.old_at = job.schedule.at;
                let at = job.schedule.at;
                responder.alloc_annotate(id, at);
            }
            queue.reset_scheduled();
        }
    }

    // ---- administrative RPCs -------------------------------------------

    /// The canonicalized option set per queue.
    pub fn params_json(&self) -> serde_json::Value {
        let mut params = serde_json::Map::new();
        for (name, queue) in &self.queues {
            let (qparams, pparams) = queue.params();
            params.insert(
                name.clone(),
                json!({
                    "policy": queue.policy().name(),
                    "queue-params": qparams,
                    "policy-params": pparams,
                }),
            );
        }
        json!({
            "options": self.opts.jsonify(),
            "queues": params,
        })
    }

    pub fn stats_json(&self) -> serde_json::Value {
        let queues: serde_json::Map<String, serde_json::Value> = self
            .queues
            .iter()
            .map(|(name, queue)| (name.clone(), queue.stats_json()))
            .collect();
        json!({ "queues": queues })
    }

    pub fn stats_clear(&mut self) {
        for queue in self.queues.values_mut() {
            queue.stats_clear();
        }
    }

    /// Proxied to the resource layer.
    pub fn resource_status(&self, matcher: &dyn Matcher) -> anyhow::Result<serde_json::Value> {
        matcher.resource_status()
    }

    /// Proxied to the resource layer.
    pub fn feasibility(
        &self,
        matcher: &dyn Matcher,
        jobspec: &str,
    ) -> anyhow::Result<serde_json::Value> {
        matcher.feasibility(jobspec)
    }
}
