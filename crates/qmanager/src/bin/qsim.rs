//! Drives the scheduler against the simulation matcher: one jobspec JSON
//! document per stdin line becomes one allocation request, and every
//! job-manager response prints to stdout as a JSON line.

use std::io::BufRead;

use clap::Parser;
use qmanager::{
    service::{
        JobManagerEvent,
        SchedulerService,
    },
    sim::SimMatcher,
    QmanagerOpts,
    QueueManager,
};
use qpolicy::job::JobId;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "qsim", about = "Run the queue manager against a simulated resource pool")]
struct Args {
    /// Core count of the simulated pool.
    #[arg(long, default_value_t = 16)]
    cores: u64,

    /// Queue policy: fcfs, easy, hybrid, or conservative.
    #[arg(long, default_value = "fcfs")]
    policy: String,

    /// Plan horizon in scheduler ticks.
    #[arg(long, default_value_t = 1_000_000)]
    horizon: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    cmd_util::config_service();
    let args = Args::parse();

    let mut opts = QmanagerOpts::default();
    opts.parse("queue-policy", &args.policy)?;
    let manager = QueueManager::new(opts)?;
    let matcher = SimMatcher::new(args.horizon, &[("core", args.cores)])?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (response_tx, mut response_rx) = mpsc::unbounded_channel();
    // the loop exits on event-channel close; the shutdown handle stays
    // unused but must outlive the run
    let (service, _shutdown) = SchedulerService::new(manager, matcher, response_tx);

    let printer = tokio::spawn(async move {
        while let Some(response) = response_rx.recv().await {
            match serde_json::to_string(&response) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::error!("response serialization failed: {e}"),
            }
        }
    });

    for (i, line) in std::io::stdin().lock().lines().enumerate() {
        let jobspec = line?;
        if jobspec.trim().is_empty() {
            continue;
        }
        event_tx.send(JobManagerEvent::Alloc {
            id: JobId(i as u64 + 1),
            priority: 100,
            user_id: 1000,
            t_submit: i as f64,
            jobspec,
        })?;
    }
    drop(event_tx);

    service.run(event_rx).await?;
    printer.await?;
    Ok(())
}
