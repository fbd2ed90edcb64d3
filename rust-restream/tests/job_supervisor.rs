//! Job table behavior against scripted worker processes.
#![cfg(unix)]

mod common;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_restream::domain::JobState;
use rust_restream::protocol::ControlEvent;
use rust_restream::supervisor::{
    JobEvent, JobSupervisor, SupervisorConfig, SupervisorError, WorkerCommand,
};
use tokio::sync::mpsc::UnboundedReceiver;

use common::{recv_until, write_script};

const WAIT: Duration = Duration::from_secs(5);

/// Reports like a worker, then waits for stdin to close.
const POLITE_WORKER: &str = r#"echo "STATUS:starting"
echo "STATUS:checking"
echo "TITLE:Evening show: part 2"
echo "LOG:INFO:loaded $1"
echo "frame=  100 fps=25"
echo "worker diagnostics" >&2
read _line
echo "LOG:INFO:relay stopped"
echo "STATUS:stopped""#;

fn supervisor(
    dir: &Path,
    worker_body: &str,
    stop_timeout: Duration,
) -> (JobSupervisor, UnboundedReceiver<JobEvent>, PathBuf) {
    let script = write_script(dir, "worker.sh", worker_body);
    let config_path = dir.join("config.toml");
    let worker = WorkerCommand::new("/bin/sh").with_args([script.to_string_lossy()]);
    let config = SupervisorConfig {
        stop_timeout,
        shutdown_grace: Duration::from_secs(2),
    };
    let (supervisor, events) = JobSupervisor::new(config, worker);
    (supervisor, events, config_path)
}

fn is_status(event: &JobEvent, state: JobState) -> bool {
    event.event.state() == Some(state)
}

fn is_log(event: &JobEvent) -> bool {
    matches!(event.event, ControlEvent::Log { .. })
}

#[tokio::test]
async fn test_start_reports_and_mirrors_worker() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, mut events, config) = supervisor(dir.path(), POLITE_WORKER, WAIT);

    let instance = supervisor.start("room1", &config).unwrap();

    let first = events.recv().await.unwrap();
    assert_eq!(first.job_id, "room1");
    assert_eq!(first.instance, instance);
    assert_eq!(first.event, ControlEvent::status(JobState::Starting));

    let seen = recv_until(&mut events, WAIT, |e| {
        e.event == ControlEvent::debug("frame=  100 fps=25")
    })
    .await;
    let seen: Vec<ControlEvent> = seen.into_iter().map(|e| e.event).collect();
    assert!(seen.contains(&ControlEvent::title("Evening show: part 2")));
    assert!(seen.contains(&ControlEvent::info(format!("loaded {}", config.display()))));

    let snapshot = supervisor.status("room1").unwrap();
    assert_eq!(snapshot.state, JobState::Checking);
    assert_eq!(snapshot.title.as_deref(), Some("Evening show: part 2"));
    assert_eq!(snapshot.instance, instance);
    assert!(snapshot.pid.is_some());
    assert_eq!(snapshot.uptime.len(), "00:00:00".len());

    // stderr arrives on its own stream; only its presence is ordered.
    recv_until(&mut events, WAIT, |e| {
        e.event == ControlEvent::debug("worker diagnostics")
    })
    .await;

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_second_start_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, mut events, config) = supervisor(dir.path(), POLITE_WORKER, WAIT);

    let instance = supervisor.start("room1", &config).unwrap();
    let err = supervisor.start("room1", &config).unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyRunning(ref id) if id == "room1"));
    assert_eq!(supervisor.job_count(), 1);
    assert_eq!(supervisor.status("room1").unwrap().instance, instance);

    // Only one Starting was published.
    let seen = recv_until(&mut events, WAIT, |e| e.event.state() == Some(JobState::Checking)).await;
    assert_eq!(
        seen.iter()
            .filter(|e| e.instance == instance && is_status(e, JobState::Starting))
            .count(),
        2 // the supervisor's and the worker's own
    );
    assert!(seen.iter().all(|e| e.instance == instance));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_stop_unknown_job_mutates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, mut events, _config) = supervisor(dir.path(), POLITE_WORKER, WAIT);

    let err = supervisor.stop("ghost").unwrap_err();
    assert!(matches!(err, SupervisorError::NotRunning(ref id) if id == "ghost"));
    assert_eq!(supervisor.job_count(), 0);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_stop_is_graceful_and_immediate() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, mut events, config) = supervisor(dir.path(), POLITE_WORKER, WAIT);

    supervisor.start("room1", &config).unwrap();
    recv_until(&mut events, WAIT, |e| is_status(e, JobState::Checking)).await;

    supervisor.stop("room1").unwrap();
    assert!(!supervisor.is_running("room1"));
    assert!(supervisor.status("room1").is_none());
    assert!(matches!(
        supervisor.stop("room1"),
        Err(SupervisorError::NotRunning(_))
    ));

    // After the supervisor's Stopped only the worker's log lines come through.
    let seen = recv_until(&mut events, WAIT, |e| e.event == ControlEvent::info("relay stopped")).await;
    let stopped = seen
        .iter()
        .position(|e| is_status(e, JobState::Stopped))
        .expect("supervisor published Stopped");
    assert!(seen[stopped + 1..].iter().all(|e| is_log(e)));

    // No synthetic "worker exited" for a job that was asked to stop.
    let report = supervisor.shutdown().await;
    assert_eq!(report.total_jobs, 0);
    while let Ok(event) = events.try_recv() {
        assert!(is_log(&event), "unexpected {:?}", event.event);
        assert_ne!(event.event, ControlEvent::info("worker exited"));
    }
}

#[tokio::test]
async fn test_reports_after_stop_are_not_republished() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, mut events, config) = supervisor(
        dir.path(),
        r#"echo "STATUS:starting"
echo "STATUS:checking"
sleep 0.3
echo "STATUS:offline"
echo "TITLE:too late"
echo "LOG:WARN:still winding down"
read _line
echo "STATUS:stopped""#,
        WAIT,
    );

    let instance = supervisor.start("room1", &config).unwrap();
    recv_until(&mut events, WAIT, |e| is_status(e, JobState::Checking)).await;
    supervisor.stop("room1").unwrap();

    let mut seen = recv_until(&mut events, WAIT, |e| {
        e.event == ControlEvent::warn("still winding down")
    })
    .await;
    // Waits for the reader tasks, so everything the worker wrote has been handled.
    supervisor.shutdown().await;
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }

    assert!(seen.iter().all(|e| e.instance == instance));
    let states: Vec<JobState> = seen.iter().filter_map(|e| e.event.state()).collect();
    // The supervisor's Starting, then the worker's own.
    assert_eq!(
        states,
        [JobState::Starting, JobState::Starting, JobState::Checking, JobState::Stopped]
    );
    assert!(JobState::is_valid_path(&states));
    assert!(!seen.iter().any(|e| e.event == ControlEvent::title("too late")));
}

#[tokio::test]
async fn test_repeated_streaming_keeps_table_entry() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, mut events, config) = supervisor(
        dir.path(),
        r#"echo "STATUS:starting"
echo "STATUS:checking"
echo "TITLE:Live now"
echo "STATUS:streaming"
echo "LOG:INFO:tick 1"
sleep 0.2
echo "STATUS:streaming"
echo "STATUS:streaming"
echo "LOG:INFO:tick 2"
read _line
echo "STATUS:stopped""#,
        WAIT,
    );

    supervisor.start("room1", &config).unwrap();
    recv_until(&mut events, WAIT, |e| e.event == ControlEvent::info("tick 1")).await;
    let before = supervisor.status("room1").unwrap();
    assert_eq!(before.state, JobState::Streaming);

    let seen = recv_until(&mut events, WAIT, |e| e.event == ControlEvent::info("tick 2")).await;
    assert_eq!(
        seen.iter().filter(|e| is_status(e, JobState::Streaming)).count(),
        2
    );

    let after = supervisor.status("room1").unwrap();
    assert_eq!(after.state, JobState::Streaming);
    assert_eq!(after.instance, before.instance);
    assert_eq!(after.pid, before.pid);
    assert_eq!(after.started_at, before.started_at);
    assert_eq!(after.title.as_deref(), Some("Live now"));
    assert_eq!(supervisor.job_count(), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_unexpected_exit_removes_job() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, mut events, config) = supervisor(
        dir.path(),
        "echo STATUS:starting\necho STATUS:checking\nexit 3",
        WAIT,
    );

    supervisor.start("room1", &config).unwrap();
    let seen = recv_until(&mut events, WAIT, |e| is_status(e, JobState::Stopped)).await;
    let tail: Vec<&ControlEvent> = seen.iter().rev().take(2).map(|e| &e.event).collect();
    assert_eq!(
        tail,
        [
            &ControlEvent::status(JobState::Stopped),
            &ControlEvent::info("worker exited")
        ]
    );
    assert!(!supervisor.is_running("room1"));

    // A job that is gone can be started again.
    let instance = supervisor.restart("room1", &config).unwrap();
    assert_eq!(supervisor.status("room1").unwrap().instance, instance);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_stale_reader_leaves_new_instance_alone() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, mut events, config) = supervisor(dir.path(), POLITE_WORKER, WAIT);

    let first = supervisor.start("room1", &config).unwrap();
    recv_until(&mut events, WAIT, |e| is_status(e, JobState::Checking)).await;

    supervisor.stop("room1").unwrap();
    let second = supervisor.start("room1", &config).unwrap();
    assert_ne!(first, second);

    // Wait until the first worker has reported its own Stopped and gone away.
    recv_until(&mut events, WAIT, |e| {
        e.instance == first && e.event == ControlEvent::info("relay stopped")
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let snapshot = supervisor.status("room1").unwrap();
    assert_eq!(snapshot.instance, second);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_kills_unresponsive_workers() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, mut events, config) = supervisor(
        dir.path(),
        "echo STATUS:starting\nexec sleep 30",
        Duration::from_millis(300),
    );

    supervisor.start("stubborn", &config).unwrap();
    recv_until(&mut events, WAIT, |e| is_status(e, JobState::Starting)).await;

    let started = tokio::time::Instant::now();
    let report = supervisor.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.total_jobs, 1);
    assert_eq!(report.forced_terminations, 1);
    assert!(!report.all_graceful());
    assert_eq!(supervisor.job_count(), 0);
}

#[tokio::test]
async fn test_shutdown_of_polite_workers_is_graceful() {
    let dir = tempfile::tempdir().unwrap();
    let (supervisor, mut events, config) = supervisor(dir.path(), POLITE_WORKER, WAIT);

    supervisor.start("a", &config).unwrap();
    supervisor.start("b", &config).unwrap();
    let mut checking = 0;
    recv_until(&mut events, WAIT, |e| {
        if is_status(e, JobState::Checking) {
            checking += 1;
        }
        checking == 2
    })
    .await;

    let listed: Vec<String> = supervisor.list().into_iter().map(|s| s.job_id).collect();
    assert_eq!(listed, ["a", "b"]);

    let report = supervisor.shutdown().await;
    assert_eq!(report.total_jobs, 2);
    assert_eq!(report.graceful_stops, 2);
    assert!(report.all_graceful());
}
