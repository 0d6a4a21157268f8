//! The interface through which queue policies consume the resource
//! matcher.
//!
//! The matcher owns the resource model; the queue only ever asks it to
//! allocate-or-reserve a batch of jobs, to update a reconstructed
//! allocation, or to cancel (fully or partially). Match results stream
//! back one job at a time through [`MatchAdapter`], which the queue
//! implements; a synchronous matcher drives the adapter before
//! `match_allocate_multi` returns, an asynchronous one delivers the same
//! callbacks from the host event loop later.

use crate::job::JobId;

/// One job of a match batch.
#[derive(Clone, Debug)]
pub struct MatchRequest {
    pub id: JobId,
    pub jobspec: String,
}

/// How a successful match placed the job.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatchStatus {
    /// Resources are usable now.
    Allocated,
    /// Resources are reserved at a future start time.
    Reserved,
}

/// Why a match failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchFailure {
    /// Not satisfiable right now (or, during a reservation attempt, not
    /// reservable under current topology).
    ResourceBusy,
    /// Never satisfiable under current topology.
    Unsatisfiable,
    /// End of the submitted batch; no job is associated with this result.
    NoData,
    /// Any other matcher-side error, with its message.
    Other(String),
}

/// A (re)established allocation returned by
/// [`Matcher::update_allocate`].
#[derive(Clone, Debug)]
pub struct Allocation {
    pub r: String,
    pub at: i64,
    pub ov: f64,
}

/// Implemented by the queue policy; invoked by the matcher as results for
/// a submitted batch become available. The matcher handle is passed back
/// in so the adapter can submit the next request from inside a callback.
pub trait MatchAdapter {
    fn handle_match_success(
        &mut self,
        matcher: &mut dyn Matcher,
        id: JobId,
        status: MatchStatus,
        r: &str,
        at: i64,
        ov: f64,
    ) -> anyhow::Result<()>;

    fn handle_match_failure(
        &mut self,
        matcher: &mut dyn Matcher,
        id: JobId,
        failure: MatchFailure,
    ) -> anyhow::Result<()>;

    fn is_sched_loop_active(&self) -> bool;
}

/// The resource matcher as seen from the queue policy. Every operation is
/// atomic from the queue's perspective; the queue never mutates resource
/// state directly.
pub trait Matcher {
    /// Submit a batch for allocation (or reservation, when
    /// `orelse_reserve` is set). Results arrive via `adapter`, one per
    /// job, terminated by [`MatchFailure::NoData`].
    fn match_allocate_multi(
        &mut self,
        orelse_reserve: bool,
        jobs: &[MatchRequest],
        adapter: &mut dyn MatchAdapter,
    ) -> anyhow::Result<()>;

    /// Re-install a known allocation (startup reconstruction).
    fn update_allocate(&mut self, id: JobId, r: &str) -> anyhow::Result<Allocation>;

    /// Release all resources held by the job.
    fn cancel(&mut self, id: JobId, noent_ok: bool) -> anyhow::Result<()>;

    /// Release the subset `r`; returns whether the job is now fully
    /// released.
    fn partial_cancel(&mut self, id: JobId, r: &str, noent_ok: bool) -> anyhow::Result<bool>;

    /// Startup handshake.
    fn hello(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Startup handshake; `queue_depth` is advisory only.
    fn ready(&mut self, _mode: &str, _queue_depth: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Proxied `resource-status` administrative query.
    fn resource_status(&self) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    /// Proxied `feasibility` administrative query.
    fn feasibility(&self, _jobspec: &str) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
}
