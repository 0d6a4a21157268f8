//! The queue manager: glue between the external job manager, the named
//! policy queues, and the resource matcher.
//!
//! [`QueueManager`] owns the queues and translates job-manager events
//! (alloc, free, cancel, prioritize, the startup hello replay) into queue
//! operations; each host tick runs a *prepare* phase (snapshot which
//! queues have work) and a *check* phase (run scheduling loops, then emit
//! one response per transitioned job). [`service::SchedulerService`]
//! drives those phases from a tokio event stream.
//!
//! Configuration follows the `queues` / `queue-policy` / `queue-params` /
//! `policy-params` option keys with per-queue overrides; see
//! [`opts::QmanagerOpts`].

pub mod callbacks;
pub mod jobspec;
pub mod opts;
pub mod service;
pub mod sim;

pub use callbacks::{
    JobResponder,
    QueueManager,
};
pub use opts::QmanagerOpts;
