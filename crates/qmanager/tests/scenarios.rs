//! End-to-end scenarios: queue manager + policy queues + the
//! planner-backed simulation matcher.

use qmanager::{
    callbacks::JobResponder,
    jobspec::JobSpec,
    service::{
        JobManagerEvent,
        JobResponse,
        SchedulerService,
    },
    sim::SimMatcher,
    QmanagerOpts,
    QueueManager,
};
use qpolicy::matcher::Matcher;
use qpolicy::job::{
    JobId,
    JobState,
};
use serde_json::json;
use tokio::sync::mpsc;

#[derive(Default)]
struct Recorder {
    responses: Vec<JobResponse>,
}

impl JobResponder for Recorder {
    fn alloc_success(&mut self, id: JobId, r: &str) {
        self.responses.push(JobResponse::AllocSuccess {
            id,
            r: r.to_owned(),
            t_estimate: 0,
        });
    }

    fn alloc_deny(&mut self, id: JobId, note: &str) {
        self.responses.push(JobResponse::AllocDeny {
            id,
            note: note.to_owned(),
        });
    }

    fn alloc_cancel(&mut self, id: JobId) {
        self.responses.push(JobResponse::AllocCancel { id });
    }

    fn alloc_annotate(&mut self, id: JobId, t_estimate: i64) {
        self.responses.push(JobResponse::AllocAnnotate { id, t_estimate });
    }
}

impl Recorder {
    fn successes(&self) -> Vec<JobId> {
        self.responses
            .iter()
            .filter_map(|r| match r {
                JobResponse::AllocSuccess { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }

    fn annotations(&self) -> Vec<(JobId, i64)> {
        self.responses
            .iter()
            .filter_map(|r| match r {
                JobResponse::AllocAnnotate { id, t_estimate } => Some((*id, *t_estimate)),
                _ => None,
            })
            .collect()
    }
}

fn jobspec(cores: u64, duration: u64) -> String {
    json!({"resources": {"core": cores}, "duration": duration}).to_string()
}

fn manager_with_policy(policy: &str) -> QueueManager {
    let mut opts = QmanagerOpts::default();
    opts.parse("queue-policy", policy).unwrap();
    opts.parse("queue-params", "queue-depth=4").unwrap();
    QueueManager::new(opts).unwrap()
}

fn tick(manager: &mut QueueManager, matcher: &mut SimMatcher, recorder: &mut Recorder) {
    if manager.prep() {
        manager.check(matcher, recorder).unwrap();
    }
}

fn submit(
    manager: &mut QueueManager,
    recorder: &mut Recorder,
    id: u64,
    priority: u32,
    t_submit: f64,
    spec: &str,
) {
    manager
        .handle_alloc(recorder, JobId(id), priority, 1000, t_submit, spec)
        .unwrap();
}

#[test]
fn test_fcfs_ordering() {
    let mut manager = manager_with_policy("fcfs");
    let mut matcher = SimMatcher::new(1_000_000, &[("core", 4)]).unwrap();
    let mut recorder = Recorder::default();

    for (id, t) in [(1, 1.0), (2, 2.0), (3, 3.0), (4, 4.0)] {
        submit(&mut manager, &mut recorder, id, 100, t, &jobspec(2, 100));
    }
    tick(&mut manager, &mut matcher, &mut recorder);
    assert_eq!(recorder.successes(), vec![JobId(1), JobId(2)]);
    let queue = manager.queue("default").unwrap();
    assert_eq!(queue.pending_ids(10), vec![JobId(3), JobId(4)]);

    // freeing the first job lets the next in order run
    recorder.responses.clear();
    manager
        .handle_free(&mut matcher, JobId(1), &jobspec(2, 100), true)
        .unwrap();
    tick(&mut manager, &mut matcher, &mut recorder);
    assert_eq!(recorder.successes(), vec![JobId(3)]);
    assert_eq!(manager.queue("default").unwrap().pending_ids(10), vec![JobId(4)]);
}

#[test]
fn test_easy_backfill() {
    let mut manager = manager_with_policy("easy");
    let mut matcher = SimMatcher::new(1_000_000, &[("core", 4)]).unwrap();
    let mut recorder = Recorder::default();

    // a job holding 2 cores for 100 ticks is already running at startup
    manager
        .handle_hello(&mut matcher, JobId(10), 100, 1000, 0.5, &jobspec(2, 100), None)
        .unwrap();

    // the high-priority job needs the whole machine: reserved at t=100
    submit(&mut manager, &mut recorder, 20, 200, 2.0, &jobspec(4, 100));
    // the small job fits in the gap before the reservation
    submit(&mut manager, &mut recorder, 30, 100, 3.0, &jobspec(2, 50));
    tick(&mut manager, &mut matcher, &mut recorder);

    assert_eq!(recorder.successes(), vec![JobId(30)]);
    assert_eq!(recorder.annotations(), vec![(JobId(20), 100)]);
    let queue = manager.queue("default").unwrap();
    let reserved = queue.lookup(JobId(20)).unwrap();
    assert_eq!(reserved.state, JobState::Pending);
    assert!(reserved.schedule.reserved);
    assert_eq!(reserved.schedule.at, 100);

    // the next pass re-reserves at the same estimate: no re-annotation
    recorder.responses.clear();
    submit(&mut manager, &mut recorder, 40, 100, 4.0, &jobspec(4, 20));
    tick(&mut manager, &mut matcher, &mut recorder);
    assert_eq!(recorder.successes(), vec![]);
    assert_eq!(recorder.annotations(), vec![]);
    let queue = manager.queue("default").unwrap();
    assert_eq!(queue.lookup(JobId(20)).unwrap().schedule.at, 100);
    assert_eq!(queue.lookup(JobId(40)).unwrap().state, JobState::Pending);
}

#[test]
fn test_conservative_reserves_deeper() {
    let mut manager = manager_with_policy("conservative");
    let mut matcher = SimMatcher::new(1_000_000, &[("core", 4)]).unwrap();
    let mut recorder = Recorder::default();

    manager
        .handle_hello(&mut matcher, JobId(10), 100, 1000, 0.5, &jobspec(2, 100), None)
        .unwrap();
    submit(&mut manager, &mut recorder, 20, 200, 2.0, &jobspec(4, 100));
    submit(&mut manager, &mut recorder, 30, 100, 3.0, &jobspec(2, 50));
    submit(&mut manager, &mut recorder, 40, 100, 4.0, &jobspec(4, 50));
    tick(&mut manager, &mut matcher, &mut recorder);

    // the small job still backfills now
    assert_eq!(recorder.successes(), vec![JobId(30)]);
    // both big jobs hold reservations: t=100, then t=200 behind it
    assert_eq!(recorder.annotations(), vec![(JobId(20), 100), (JobId(40), 200)]);
}

#[test]
fn test_partial_release() {
    let mut manager = manager_with_policy("fcfs");
    let mut matcher = SimMatcher::new(1_000_000, &[("core", 10)]).unwrap();
    let mut recorder = Recorder::default();

    submit(&mut manager, &mut recorder, 1, 100, 1.0, &jobspec(6, 100));
    tick(&mut manager, &mut matcher, &mut recorder);
    assert_eq!(recorder.successes(), vec![JobId(1)]);

    // partial release of 2 cores: job keeps running on the rest
    manager
        .handle_free(&mut matcher, JobId(1), &jobspec(2, 100), false)
        .unwrap();
    let queue = manager.queue("default").unwrap();
    assert_eq!(queue.lookup(JobId(1)).unwrap().state, JobState::AllocRunning);
    let status = matcher.resource_status().unwrap();
    assert_eq!(status["resources"]["core"]["free_now"], 6);

    // final release reaps and returns everything
    manager
        .handle_free(&mut matcher, JobId(1), &jobspec(4, 100), true)
        .unwrap();
    assert!(manager.queue("default").unwrap().lookup(JobId(1)).is_none());
    let status = matcher.resource_status().unwrap();
    assert_eq!(status["resources"]["core"]["free_now"], 10);
}

#[test]
fn test_reconsider_on_topology_change() {
    let mut manager = manager_with_policy("easy");
    let mut matcher = SimMatcher::new(1_000_000, &[("core", 4)]).unwrap();
    let mut recorder = Recorder::default();

    // all cores down: the reservation attempt answers resource-busy and
    // the job parks on topology
    matcher.set_down("core", 4).unwrap();
    submit(&mut manager, &mut recorder, 1, 100, 1.0, &jobspec(2, 100));
    tick(&mut manager, &mut matcher, &mut recorder);
    assert_eq!(recorder.successes(), vec![]);
    let queue = manager.queue("default").unwrap();
    assert!(queue.pending_ids(10).is_empty());
    assert_eq!(queue.lookup(JobId(1)).unwrap().state, JobState::Pending);

    // the node comes back: the blocked job returns to pending and places
    matcher.set_all_up().unwrap();
    manager.handle_resource_status_change();
    tick(&mut manager, &mut matcher, &mut recorder);
    assert_eq!(recorder.successes(), vec![JobId(1)]);
}

#[test]
fn test_prioritize_pending_job() {
    let mut manager = manager_with_policy("fcfs");
    let mut matcher = SimMatcher::new(1_000_000, &[("core", 4)]).unwrap();
    let mut recorder = Recorder::default();

    submit(&mut manager, &mut recorder, 1, 100, 1.0, &jobspec(4, 100));
    submit(&mut manager, &mut recorder, 2, 100, 2.0, &jobspec(4, 100));
    submit(&mut manager, &mut recorder, 3, 100, 3.0, &jobspec(2, 100));
    tick(&mut manager, &mut matcher, &mut recorder);
    assert_eq!(recorder.successes(), vec![JobId(1)]);

    // bump the last job ahead of the second
    manager.handle_prioritize(&[(JobId(3), 500)]);
    recorder.responses.clear();
    manager
        .handle_free(&mut matcher, JobId(1), &jobspec(4, 100), true)
        .unwrap();
    tick(&mut manager, &mut matcher, &mut recorder);
    assert_eq!(recorder.successes(), vec![JobId(3)]);
}

#[test]
fn test_unsatisfiable_and_unknown_queue_deny() {
    let mut manager = manager_with_policy("fcfs");
    let mut matcher = SimMatcher::new(1_000_000, &[("core", 4)]).unwrap();
    let mut recorder = Recorder::default();

    // more cores than the machine has: denied as unsatisfiable
    submit(&mut manager, &mut recorder, 1, 100, 1.0, &jobspec(8, 100));
    tick(&mut manager, &mut matcher, &mut recorder);
    assert!(matches!(
        &recorder.responses[..],
        [JobResponse::AllocDeny { id: JobId(1), note }]
            if note.contains("unsatisfiable")
    ));

    // a queue that does not exist: denied synchronously
    recorder.responses.clear();
    let spec = json!({
        "resources": {"core": 1},
        "attributes": {"system": {"queue": "nope"}},
    })
    .to_string();
    submit(&mut manager, &mut recorder, 2, 100, 2.0, &spec);
    assert!(matches!(
        &recorder.responses[..],
        [JobResponse::AllocDeny { id: JobId(2), note }] if note.contains("nope")
    ));

    // malformed jobspec: denied with the parser's message
    recorder.responses.clear();
    submit(&mut manager, &mut recorder, 3, 100, 3.0, "{broken");
    assert!(matches!(
        &recorder.responses[..],
        [JobResponse::AllocDeny { id: JobId(3), note }] if note.contains("jobspec")
    ));
}

#[test]
fn test_cancel_pending_job() {
    let mut manager = manager_with_policy("fcfs");
    let mut matcher = SimMatcher::new(1_000_000, &[("core", 4)]).unwrap();
    let mut recorder = Recorder::default();

    submit(&mut manager, &mut recorder, 1, 100, 1.0, &jobspec(4, 100));
    submit(&mut manager, &mut recorder, 2, 100, 2.0, &jobspec(4, 100));
    tick(&mut manager, &mut matcher, &mut recorder);

    manager.handle_cancel(JobId(2)).unwrap();
    recorder.responses.clear();
    tick(&mut manager, &mut matcher, &mut recorder);
    assert!(recorder
        .responses
        .contains(&JobResponse::AllocCancel { id: JobId(2) }));
    assert!(manager.queue("default").unwrap().lookup(JobId(2)).is_none());
}

#[test]
fn test_multi_queue_routing_and_stats() {
    let mut opts = QmanagerOpts::default();
    opts.parse("queues", "batch debug").unwrap();
    opts.parse("queue-policy", "easy").unwrap();
    opts.parse("queue-policy-per-queue", "debug:fcfs").unwrap();
    let mut manager = QueueManager::new(opts).unwrap();
    let mut matcher = SimMatcher::new(1_000_000, &[("core", 4)]).unwrap();
    let mut recorder = Recorder::default();

    let spec_for = |queue: &str| {
        json!({
            "resources": {"core": 1},
            "duration": 10,
            "attributes": {"system": {"queue": queue}},
        })
        .to_string()
    };
    submit(&mut manager, &mut recorder, 1, 100, 1.0, &spec_for("batch"));
    submit(&mut manager, &mut recorder, 2, 100, 2.0, &spec_for("debug"));
    tick(&mut manager, &mut matcher, &mut recorder);

    assert_eq!(manager.find_queue(JobId(1)), Some("batch"));
    assert_eq!(manager.find_queue(JobId(2)), Some("debug"));

    let stats = manager.stats_json();
    assert_eq!(stats["queues"]["batch"]["policy"], "easy");
    assert_eq!(stats["queues"]["debug"]["policy"], "fcfs");
    assert_eq!(stats["queues"]["batch"]["action_counts"]["running"], 1);

    let params = manager.params_json();
    assert_eq!(params["queues"]["batch"]["policy"], "easy");

    manager.stats_clear();
    assert_eq!(manager.stats_json()["queues"]["batch"]["action_counts"]["running"], 0);
}

#[test]
fn test_feasibility_proxy() {
    let manager = manager_with_policy("fcfs");
    let matcher = SimMatcher::new(1_000_000, &[("core", 4)]).unwrap();
    let feasible = manager.feasibility(&matcher, &jobspec(2, 10)).unwrap();
    assert_eq!(feasible["feasible"], true);
    let infeasible = manager.feasibility(&matcher, &jobspec(16, 10)).unwrap();
    assert_eq!(infeasible["feasible"], false);
}

#[tokio::test]
async fn test_service_event_loop() {
    let manager = manager_with_policy("fcfs");
    let matcher = SimMatcher::new(1_000_000, &[("core", 4)]).unwrap();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (response_tx, mut response_rx) = mpsc::unbounded_channel();
    let (service, shutdown) = SchedulerService::new(manager, matcher, response_tx);
    let handle = tokio::spawn(service.run(event_rx));

    // both jobs want the whole machine, so the second can only place
    // after the first is freed
    let spec = jobspec(4, 100);
    event_tx
        .send(JobManagerEvent::Alloc {
            id: JobId(1),
            priority: 100,
            user_id: 1000,
            t_submit: 1.0,
            jobspec: spec.clone(),
        })
        .unwrap();
    let response = response_rx.recv().await.unwrap();
    assert_eq!(
        response,
        JobResponse::AllocSuccess {
            id: JobId(1),
            r: spec.clone(),
            t_estimate: 0,
        },
    );

    event_tx
        .send(JobManagerEvent::Free {
            id: JobId(1),
            r: jobspec(4, 100),
            is_final: true,
        })
        .unwrap();
    event_tx
        .send(JobManagerEvent::Alloc {
            id: JobId(2),
            priority: 100,
            user_id: 1000,
            t_submit: 2.0,
            jobspec: spec.clone(),
        })
        .unwrap();
    let response = response_rx.recv().await.unwrap();
    assert_eq!(
        response,
        JobResponse::AllocSuccess {
            id: JobId(2),
            r: spec,
            t_estimate: 0,
        },
    );

    // the shutdown handle stops the loop without closing the channel
    shutdown.shutdown();
    handle.await.unwrap().unwrap();
}

#[test]
fn test_hello_requires_known_queue() {
    use errors::ErrorMetadataAnyhowExt;
    let mut opts = QmanagerOpts::default();
    opts.parse("queues", "batch").unwrap();
    let mut manager = QueueManager::new(opts).unwrap();
    let mut matcher = SimMatcher::new(1_000_000, &[("core", 4)]).unwrap();

    let spec = json!({
        "resources": {"core": 1},
        "attributes": {"system": {"queue": "retired"}},
    })
    .to_string();
    let err = manager
        .handle_hello(&mut matcher, JobId(1), 100, 1000, 0.5, &spec, Some(&spec))
        .unwrap_err();
    assert!(err.is_not_found());

    // sanity: the jobspec round-trips the queue attribute
    assert_eq!(JobSpec::parse(&spec).unwrap().queue_name(), Some("retired"));
}
