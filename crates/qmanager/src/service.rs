//! The host event loop: a tokio task that feeds job-manager events to the
//! queue manager and runs the prepare/check phases after each batch.
//!
//! The core stays single-threaded cooperative; this loop is the only
//! place it runs. Outbound responses flow through an unbounded channel so
//! emitting can never block the scheduling pass.

use futures::{
    future::Fuse,
    select_biased,
    FutureExt,
};
use qpolicy::{
    job::JobId,
    matcher::Matcher,
};
use tokio::sync::{
    mpsc,
    oneshot,
};

use crate::callbacks::{
    JobResponder,
    QueueManager,
};

/// Inbound events from the job-manager transport and the resource layer.
#[derive(Clone, Debug)]
pub enum JobManagerEvent {
    /// Startup replay of one already-running job.
    Hello {
        id: JobId,
        priority: u32,
        user_id: u32,
        t_submit: f64,
        r: String,
        jobspec: Option<String>,
    },
    Alloc {
        id: JobId,
        priority: u32,
        user_id: u32,
        t_submit: f64,
        jobspec: String,
    },
    Free {
        id: JobId,
        r: String,
        is_final: bool,
    },
    Cancel {
        id: JobId,
    },
    Prioritize(Vec<(JobId, u32)>),
    /// The resource layer announced a topology change (node up/down).
    ResourceStatusChanged,
}

/// Outbound per-allocation responses.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobResponse {
    AllocSuccess { id: JobId, r: String, t_estimate: i64 },
    AllocDeny { id: JobId, note: String },
    AllocCancel { id: JobId },
    AllocAnnotate { id: JobId, t_estimate: i64 },
}

/// Forwards responses into an unbounded channel.
pub struct ChannelResponder {
    tx: mpsc::UnboundedSender<JobResponse>,
}

impl ChannelResponder {
    pub fn new(tx: mpsc::UnboundedSender<JobResponse>) -> Self {
        Self { tx }
    }

    fn send(&mut self, response: JobResponse) {
        if self.tx.send(response).is_err() {
            tracing::warn!("job-manager response channel closed");
        }
    }
}

impl JobResponder for ChannelResponder {
    fn alloc_success(&mut self, id: JobId, r: &str) {
        self.send(JobResponse::AllocSuccess {
            id,
            r: r.to_owned(),
            t_estimate: 0,
        });
    }

    fn alloc_deny(&mut self, id: JobId, note: &str) {
        self.send(JobResponse::AllocDeny {
            id,
            note: note.to_owned(),
        });
    }

    fn alloc_cancel(&mut self, id: JobId) {
        self.send(JobResponse::AllocCancel { id });
    }

    fn alloc_annotate(&mut self, id: JobId, t_estimate: i64) {
        self.send(JobResponse::AllocAnnotate { id, t_estimate });
    }
}

/// Stops the service loop without closing the event channel.
pub struct ShutdownHandle(oneshot::Sender<()>);

impl ShutdownHandle {
    pub fn shutdown(self) {
        let _ = self.0.send(());
    }
}

pub struct SchedulerService<M> {
    manager: QueueManager,
    matcher: M,
    responder: ChannelResponder,
    shutdown: Fuse<oneshot::Receiver<()>>,
}

impl<M: Matcher> SchedulerService<M> {
    pub fn new(
        manager: QueueManager,
        matcher: M,
        response_tx: mpsc::UnboundedSender<JobResponse>,
    ) -> (Self, ShutdownHandle) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let service = Self {
            manager,
            matcher,
            responder: ChannelResponder::new(response_tx),
            shutdown: shutdown_rx.fuse(),
        };
        (service, ShutdownHandle(shutdown_tx))
    }

    /// Runs until shut down or until the event channel closes. Each
    /// wakeup drains the events already queued (the transport's read
    /// batch), then runs one prepare/check tick.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<JobManagerEvent>,
    ) -> anyhow::Result<()> {
        self.matcher.hello()?;
        // The depth argument is advisory only; the job manager ignores it.
        self.matcher.ready("unlimited", 0)?;
        loop {
            select_biased! {
                result = &mut self.shutdown => {
                    if result.is_ok() {
                        tracing::info!("shutdown requested");
                        break;
                    }
                    // the controller went away without signalling; keep
                    // serving events
                },
                event = events.recv().fuse() => {
                    let Some(event) = event else {
                        break;
                    };
                    self.dispatch(event);
                    while let Ok(event) = events.try_recv() {
                        self.dispatch(event);
                    }
                    self.tick()?;
                },
            }
        }
        Ok(())
    }

    /// One prepare/check pass; public for drivers that pump events
    /// themselves.
    pub fn tick(&mut self) -> anyhow::Result<()> {
        if self.manager.prep() {
            self.manager.check(&mut self.matcher, &mut self.responder)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, event: JobManagerEvent) {
        let result = match event {
            JobManagerEvent::Hello {
                id,
                priority,
                user_id,
                t_submit,
                r,
                jobspec,
            } => self.manager.handle_hello(
                &mut self.matcher,
                id,
                priority,
                user_id,
                t_submit,
                &r,
                jobspec.as_deref(),
            ),
            JobManagerEvent::Alloc {
                id,
                priority,
                user_id,
                t_submit,
                jobspec,
            } => self.manager.handle_alloc(
                &mut self.responder,
                id,
                priority,
                user_id,
                t_submit,
                &jobspec,
            ),
            JobManagerEvent::Free { id, r, is_final } => {
                self.manager.handle_free(&mut self.matcher, id, &r, is_final)
            },
            JobManagerEvent::Cancel { id } => self.manager.handle_cancel(id),
            JobManagerEvent::Prioritize(updates) => {
                self.manager.handle_prioritize(&updates);
                Ok(())
            },
            JobManagerEvent::ResourceStatusChanged => {
                self.manager.handle_resource_status_change();
                Ok(())
            },
        };
        if let Err(e) = result {
            tracing::warn!("event handling failed: {e:#}");
        }
    }

    pub fn manager(&self) -> &QueueManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut QueueManager {
        &mut self.manager
    }

    pub fn matcher_mut(&mut self) -> &mut M {
        &mut self.matcher
    }
}
