//! Time-indexed reservation planning for a single resource pool, and a
//! composite over several pools.
//!
//! A [`Planner`] tracks one resource type over a bounded time window as a
//! sequence of *scheduled points*: the instants at which the amount of free
//! resource changes because a placed interval (a *span*) begins or ends.
//! Points live in one arena and are threaded through two search trees: one
//! ordered by time (resource state at `t`, successor iteration) and one
//! ordered by remaining resources, annotated with the minimum time in each
//! subtree so that "earliest point with at least R free" resolves without a
//! scan.
//!
//! A [`MultiPlanner`] owns one planner per resource type and answers
//! conjunctive queries ("2 cores and 4 GB from t for d") across all of
//! them with a shared composite span id.

mod mintime_tree;
mod multi;
mod planner;
mod point;
mod point_tree;

#[cfg(test)]
mod tests;

pub use multi::{
    MultiPlanner,
    MultiSpanId,
};
pub use planner::{
    Planner,
    SpanId,
};
