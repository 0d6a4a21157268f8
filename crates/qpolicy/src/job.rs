use std::fmt;

use serde::Serialize;

/// Job identifier assigned by the external job manager.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    Init,
    Pending,
    Rejected,
    Running,
    AllocRunning,
    Canceled,
    Complete,
}

/// Schedule information: the allocated or reserved (for backfill)
/// resource set and its timing.
#[derive(Clone, Debug, Default)]
pub struct Schedule {
    /// Resource set text, opaque to the queue.
    pub r: String,
    /// True when this is a future reservation rather than an allocation.
    pub reserved: bool,
    /// Scheduled-at estimate; 0 for an immediate allocation.
    pub at: i64,
    /// The last `at` annotated back to the job manager, so unchanged
    /// estimates are not re-sent.
    pub old_at: i64,
    /// Match overhead in seconds.
    pub ov: f64,
}

/// Per-state enqueue stamps; each is a per-queue monotonic sequence.
#[derive(Copy, Clone, Debug, Default)]
pub struct TStamps {
    pub pending: u64,
    pub running: u64,
    pub rejected: u64,
    pub complete: u64,
    pub canceled: u64,
}

/// `t_submit` with a total order so it can participate in the pending key.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SubmitTime(pub f64);

impl Eq for SubmitTime {}

impl PartialOrd for SubmitTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SubmitTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Ordering key for the pending queues: lexicographic ascending, lower is
/// better. Priorities are stored already adjusted (see
/// [`adjusted_priority`]) so that the highest user priority sorts first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PendingKey {
    pub priority: u32,
    pub t_submit: SubmitTime,
    pub seq: u64,
}

/// The job manager defines `u32::MAX` as the maximum priority, and the
/// pending queues sort ascending with lower-is-better, so user priorities
/// are flipped once on entry.
pub fn adjusted_priority(user_priority: u32) -> u32 {
    u32::MAX - user_priority
}

#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub user_id: u32,
    /// Adjusted priority (lower is better).
    pub priority: u32,
    pub t_submit: f64,
    pub state: JobState,
    pub jobspec: String,
    /// Rejection reason, set when the job moves to the rejected queue.
    pub note: String,
    pub t_stamps: TStamps,
    pub schedule: Schedule,
}

impl Job {
    pub fn new(id: JobId, user_id: u32, priority: u32, t_submit: f64, jobspec: String) -> Self {
        Self {
            id,
            user_id,
            priority,
            t_submit,
            state: JobState::Init,
            jobspec,
            note: String::new(),
            t_stamps: TStamps::default(),
            schedule: Schedule::default(),
        }
    }

    /// A running job being reconstructed at startup, with its resource set
    /// already known.
    pub fn running(id: JobId, user_id: u32, priority: u32, t_submit: f64, r: String) -> Self {
        Self {
            id,
            user_id,
            priority,
            t_submit,
            state: JobState::Running,
            jobspec: String::new(),
            note: String::new(),
            t_stamps: TStamps::default(),
            schedule: Schedule {
                r,
                ..Schedule::default()
            },
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == JobState::Pending
    }

    pub fn pending_key(&self) -> PendingKey {
        PendingKey {
            priority: self.priority,
            t_submit: SubmitTime(self.t_submit),
            seq: self.t_stamps.pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_key_ordering() {
        let key = |priority, t_submit, seq| PendingKey {
            priority,
            t_submit: SubmitTime(t_submit),
            seq,
        };
        // lower adjusted priority wins, then earlier submit, then sequence
        assert!(key(1, 9.0, 9) < key(2, 0.0, 0));
        assert!(key(1, 1.0, 9) < key(1, 2.0, 0));
        assert!(key(1, 1.0, 0) < key(1, 1.0, 1));
        // a higher user priority maps to a smaller adjusted priority
        assert!(adjusted_priority(200) < adjusted_priority(100));
    }
}
