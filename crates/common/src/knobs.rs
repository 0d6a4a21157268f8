//! Tunable limits and parameters for the queue manager.
//!
//! Every knob here should have a comment explaining what it's for and the
//! upper/lower bounds if applicable. When running locally, these knobs can
//! all be overridden with an environment variable.
#![deny(missing_docs)]

use std::sync::LazyLock;

use cmd_util::env::env_config;

/// How many pending jobs a single scheduling-loop pass considers. Raising
/// this trades per-tick latency for scheduling depth.
pub static DEFAULT_QUEUE_DEPTH: LazyLock<u32> =
    LazyLock::new(|| env_config("QMANAGER_DEFAULT_QUEUE_DEPTH", 32));

/// Administrative ceiling on `queue-depth`. Bounds worst-case per-tick work
/// no matter what an operator configures.
pub static MAX_QUEUE_DEPTH: LazyLock<u32> =
    LazyLock::new(|| env_config("QMANAGER_MAX_QUEUE_DEPTH", 1_000_000));

/// Default reservation depth for the hybrid backfill policy: how many
/// pending jobs may hold a future reservation simultaneously.
pub static HYBRID_RESERVATION_DEPTH: LazyLock<u32> =
    LazyLock::new(|| env_config("QMANAGER_HYBRID_RESERVATION_DEPTH", 64));

/// Ceiling on `reservation-depth` for all backfill policies. The
/// conservative policy starts here and is further capped by the effective
/// queue depth.
pub static MAX_RESERVATION_DEPTH: LazyLock<u32> =
    LazyLock::new(|| env_config("QMANAGER_MAX_RESERVATION_DEPTH", 100_000));
