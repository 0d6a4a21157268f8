//! Per-queue scheduling policy for the queue manager.
//!
//! A [`Queue`] owns the jobs submitted to one named queue and decides, per
//! scheduling-loop pass, which pending jobs to hand to the resource
//! matcher and in what order. FCFS submits a strict-order batch; the
//! backfill variants (EASY, HYBRID, CONSERVATIVE) walk the pending queue
//! with a resumable cursor, reserving future start times for jobs that
//! cannot run now and backfilling later jobs into the gaps. The variants
//! differ only in how many reservations they may hold at once.
//!
//! The matcher is consumed through the [`matcher::Matcher`] trait and
//! calls back through [`matcher::MatchAdapter`]; results may be delivered
//! synchronously or streamed in later, so all loop state lives on the
//! queue itself. While a loop is in flight, inserts, cancels, and
//! reprioritizations divert into provisional buffers that are flushed in a
//! fixed order on loop exit.

pub mod job;
pub mod matcher;
mod queue;

mod backfill;
mod fcfs;


pub use queue::{
    PolicyKind,
    Queue,
};
