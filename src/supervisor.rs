use crate::{
    config::{SupervisorConfig, TaskConfig},
    connector::TaskConnector,
    datastream::{Datastream, DatastreamStatus},
    task::{DatastreamTask, TaskHandle, TaskShared},
    util,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

/// How long the supervisor waits for a newly created task to signal that its startup completed
/// before logging a warning. The task keeps starting in the background either way.
const START_TIMEOUT: Duration = Duration::from_secs(10);

/// Floor for the liveness daemon's aligned initial delay.
const MIN_DAEMON_DELAY: Duration = Duration::from_secs(120);

/// One running task: its supervisor-side handle and the thread driving its loop.
struct TaskEntry {
    /// Handle for stop requests, snapshot updates and liveness reads.
    handle: TaskHandle,
    /// The thread running the task loop. Taken when the task is joined; absent after the
    /// supervisor abandoned a thread that would not stop in time.
    thread: Option<JoinHandle<()>>,
}

/// Per-connector registry of datastream tasks. Starts and stops tasks when the assignment
/// changes, propagates datastream snapshot updates, and periodically restarts tasks that are no
/// longer live.
pub struct TaskSupervisor {
    /// Builds the collaborators of every task.
    connector: Arc<dyn TaskConnector>,
    /// Configuration handed to every task.
    task_config: TaskConfig,
    /// Supervisor-level configuration.
    config: SupervisorConfig,
    /// Running tasks keyed by datastream name.
    tasks: Mutex<HashMap<String, TaskEntry>>,
    /// The liveness daemon thread, once started.
    daemon: Mutex<Option<JoinHandle<()>>>,
    /// Signals the liveness daemon to exit.
    daemon_stop_tx: Sender<()>,
    /// Receiver the daemon listens on.
    daemon_stop_rx: Receiver<()>,
    /// Number of tasks restarted by liveness checks.
    restarts: AtomicU64,
}

impl TaskSupervisor {
    /// Creates a new [`TaskSupervisor`] for the given connector.
    pub fn new(
        connector: Arc<dyn TaskConnector>,
        task_config: TaskConfig,
        config: SupervisorConfig,
    ) -> Self {
        let (daemon_stop_tx, daemon_stop_rx) = bounded(1);

        Self {
            connector,
            task_config,
            config,
            tasks: Mutex::new(HashMap::new()),
            daemon: Mutex::new(None),
            daemon_stop_tx,
            daemon_stop_rx,
            restarts: AtomicU64::new(0),
        }
    }

    /// Applies a new assignment: stops tasks whose datastream is gone, refreshes the snapshot
    /// of tasks that stay, and starts tasks for new datastreams. Datastreams that fail
    /// validation are rejected without touching any running task.
    pub fn on_assignment_change(&self, datastreams: Vec<Datastream>) {
        let mut desired: HashMap<String, Datastream> = HashMap::new();

        for datastream in datastreams {
            if let Err(e) = datastream.validate() {
                tracing::error!("rejecting invalid datastream {}: {}", datastream.name, e);
                continue;
            }

            if datastream.status != DatastreamStatus::Ready {
                tracing::info!(
                    "datastream {} has status {:?}, not running a task for it",
                    datastream.name,
                    datastream.status
                );
                continue;
            }

            desired.insert(datastream.name.clone(), datastream);
        }

        let mut tasks = self.tasks.lock();

        let removed: Vec<String> = tasks
            .keys()
            .filter(|name| !desired.contains_key(*name))
            .cloned()
            .collect();

        for name in removed {
            if let Some(entry) = tasks.remove(&name) {
                tracing::info!("datastream {} unassigned, stopping its task", name);
                self.stop_entry(&name, entry);
            }
        }

        for (name, datastream) in desired {
            match tasks.get_mut(&name) {
                Some(entry) => entry.handle.update_datastream(datastream),
                None => {
                    tracing::info!("datastream {} assigned, starting a task", name);

                    let entry = self.start_task(datastream);
                    tasks.insert(name, entry);
                }
            }
        }

        metrics::gauge!("kafmirror_supervisor_tasks").set(tasks.len() as f64);
    }

    /// Starts the liveness daemon. The first check is aligned to a daemon-interval boundary
    /// from the top of the hour so instances across hosts do not all check at once.
    pub fn start_daemon(self: &Arc<Self>) {
        let mut daemon = self.daemon.lock();

        if daemon.is_some() {
            return;
        }

        let supervisor = Arc::clone(self);
        let stop_rx = self.daemon_stop_rx.clone();

        let handle = std::thread::Builder::new()
            .name(String::from("supervisor-daemon"))
            .spawn(move || {
                let initial =
                    initial_daemon_delay(supervisor.config.daemon_interval, millis_past_hour());

                tracing::info!("first liveness check in {:?}", initial);

                match stop_rx.recv_timeout(initial) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    Err(RecvTimeoutError::Timeout) => {}
                }

                let ticker = crossbeam_channel::tick(supervisor.config.daemon_interval);

                supervisor.check_liveness();

                loop {
                    crossbeam_channel::select! {
                        recv(ticker) -> _ => supervisor.check_liveness(),
                        recv(stop_rx) -> _ => return,
                    }
                }
            })
            .expect("daemon thread spawned");

        *daemon = Some(handle);
    }

    /// Checks every task for liveness and restarts the dead ones with the same identity. A task
    /// is live iff its thread is alive and it polled within the configured silence threshold.
    pub fn check_liveness(&self) {
        let mut tasks = self.tasks.lock();

        let now = util::epoch_millis();
        let threshold = self.config.non_good_state_threshold.as_millis() as i64;

        let dead: Vec<String> = tasks
            .iter()
            .filter(|(_, entry)| {
                let thread_alive = entry
                    .thread
                    .as_ref()
                    .map(|t| !t.is_finished())
                    .unwrap_or(false);

                let silent = now - entry.handle.shared().last_polled_ms() > threshold;

                !thread_alive || silent
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in dead {
            tracing::warn!("task for datastream {} is not live, restarting it", name);

            metrics::counter!("kafmirror_supervisor_restarts_total").increment(1);
            self.restarts.fetch_add(1, Ordering::SeqCst);

            if let Some(entry) = tasks.remove(&name) {
                let datastream = entry.handle.shared().datastream().as_ref().clone();

                self.stop_entry(&name, entry);

                let entry = self.start_task(datastream);
                tasks.insert(name, entry);
            }
        }
    }

    /// Stops the daemon and every running task.
    pub fn stop_all(&self) {
        let _ = self.daemon_stop_tx.try_send(());

        if let Some(daemon) = self.daemon.lock().take() {
            let _ = daemon.join();
        }

        let entries: Vec<(String, TaskEntry)> = self.tasks.lock().drain().collect();

        for (name, entry) in entries {
            self.stop_entry(&name, entry);
        }
    }

    /// Returns the shared state of the task running the given datastream, if one exists.
    pub fn task_shared(&self, datastream: &str) -> Option<Arc<TaskShared>> {
        self.tasks
            .lock()
            .get(datastream)
            .map(|entry| Arc::clone(entry.handle.shared()))
    }

    /// Returns the names of the datastreams with a running task, sorted.
    pub fn datastream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the number of tasks restarted by liveness checks.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Builds a task for the datastream and spawns its loop thread.
    fn start_task(&self, datastream: Datastream) -> TaskEntry {
        let (task, handle) =
            DatastreamTask::new(datastream, self.task_config.clone(), Arc::clone(&self.connector));

        let name = handle.shared().id().to_string();

        let thread = std::thread::Builder::new()
            .name(format!("task-{}", name))
            .spawn(move || task.run())
            .expect("task thread spawned");

        if !handle.await_started(START_TIMEOUT) {
            tracing::warn!("task {} did not report started within {:?}", name, START_TIMEOUT);
        }

        TaskEntry {
            handle,
            thread: Some(thread),
        }
    }

    /// Requests a cooperative stop and waits up to the cancel timeout. A task that does not
    /// stop in time has its thread abandoned; the stop flag and adapter wakeup remain in place
    /// so it can still wind down on its own.
    fn stop_entry(&self, name: &str, mut entry: TaskEntry) {
        entry.handle.stop();

        if entry.handle.await_stopped(self.config.cancel_task_timeout) {
            if let Some(thread) = entry.thread.take() {
                let _ = thread.join();
            }
        } else {
            tracing::warn!(
                "task for datastream {} did not stop within {:?}, abandoning its thread",
                name,
                self.config.cancel_task_timeout
            );
        }
    }
}

/// Returns wall-clock milliseconds elapsed since the top of the current hour.
fn millis_past_hour() -> Duration {
    Duration::from_millis((util::epoch_millis().rem_euclid(3_600_000)) as u64)
}

/// Aligns the first liveness check to the next daemon-interval boundary measured from the top
/// of the hour, with a floor of two minutes (or the interval itself when shorter).
fn initial_daemon_delay(interval: Duration, past_hour: Duration) -> Duration {
    let interval_ms = (interval.as_millis().max(1)) as u64;
    let past_ms = past_hour.as_millis() as u64;

    let until_boundary = interval_ms - (past_ms % interval_ms);
    let floor = MIN_DAEMON_DELAY.min(interval);

    Duration::from_millis(until_boundary).max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        partition::SourcePartition,
        task::TaskState,
        testutil::{MockConnector, MockProducer, MockSourceAdapter, test_datastream},
    };
    use std::time::Instant;

    fn fast_supervisor_config() -> SupervisorConfig {
        SupervisorConfig {
            daemon_interval: Duration::from_millis(50),
            non_good_state_threshold: Duration::from_millis(100),
            cancel_task_timeout: Duration::from_secs(5),
        }
    }

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            if condition() {
                return true;
            }

            std::thread::sleep(Duration::from_millis(5));
        }

        condition()
    }

    #[test]
    fn assignment_change_starts_and_stops_tasks() {
        let adapter = MockSourceAdapter::new(vec![SourcePartition::new("A", 0)]);
        let connector = MockConnector::new(adapter, MockProducer::immediate());

        let supervisor = TaskSupervisor::new(
            connector,
            crate::testutil::fast_config(),
            fast_supervisor_config(),
        );

        supervisor.on_assignment_change(vec![
            test_datastream("one", HashMap::new()),
            test_datastream("two", HashMap::new()),
        ]);

        assert_eq!(supervisor.datastream_names(), vec!["one", "two"]);

        let one = supervisor.task_shared("one").unwrap();
        assert_eq!(one.state(), TaskState::Running);

        // dropping a datastream from the assignment stops its task.
        supervisor.on_assignment_change(vec![test_datastream("two", HashMap::new())]);

        assert_eq!(supervisor.datastream_names(), vec!["two"]);
        assert_eq!(one.state(), TaskState::Stopped);

        supervisor.stop_all();

        assert!(supervisor.datastream_names().is_empty());
    }

    #[test]
    fn invalid_datastreams_are_rejected() {
        let adapter = MockSourceAdapter::new(vec![SourcePartition::new("A", 0)]);
        let connector = MockConnector::new(adapter, MockProducer::immediate());

        let supervisor = TaskSupervisor::new(
            connector,
            crate::testutil::fast_config(),
            fast_supervisor_config(),
        );

        let mut invalid = test_datastream("bad", HashMap::new());
        invalid.destination = String::from("not a connection string");

        supervisor.on_assignment_change(vec![invalid]);

        assert!(supervisor.datastream_names().is_empty());

        supervisor.stop_all();
    }

    #[test]
    fn snapshot_update_propagates_pause_configuration() {
        let adapter = MockSourceAdapter::new(vec![SourcePartition::new("A", 0)]);
        let connector = MockConnector::new(Arc::clone(&adapter), MockProducer::immediate());

        let supervisor = TaskSupervisor::new(
            connector,
            crate::testutil::fast_config(),
            fast_supervisor_config(),
        );

        supervisor.on_assignment_change(vec![test_datastream("one", HashMap::new())]);

        assert!(adapter.paused_set().is_empty());

        let mut metadata = HashMap::new();
        metadata.insert(
            String::from(crate::datastream::PAUSED_SOURCE_PARTITIONS),
            String::from(r#"{"A": ["0"]}"#),
        );

        supervisor.on_assignment_change(vec![test_datastream("one", metadata)]);

        assert!(wait_until(Duration::from_secs(5), || {
            adapter.paused_set().contains(&SourcePartition::new("A", 0))
        }));

        supervisor.stop_all();
    }

    #[test]
    fn stalled_task_is_restarted_with_the_same_identity() {
        let stalled = MockSourceAdapter::new(vec![SourcePartition::new("A", 0)]);
        stalled.set_hang(true);

        let replacement = MockSourceAdapter::new(vec![SourcePartition::new("A", 0)]);

        let connector = MockConnector::new(Arc::clone(&stalled), MockProducer::immediate());
        connector.push_adapter(Arc::clone(&replacement));

        let supervisor = Arc::new(TaskSupervisor::new(
            connector,
            crate::testutil::fast_config(),
            fast_supervisor_config(),
        ));

        supervisor.on_assignment_change(vec![test_datastream("one", HashMap::new())]);

        let before = supervisor.task_shared("one").unwrap();

        // the hanging poll freezes the task's poll clock past the liveness threshold.
        std::thread::sleep(Duration::from_millis(150));

        supervisor.check_liveness();

        assert_eq!(supervisor.restarts(), 1);

        let after = supervisor.task_shared("one").unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.id().to_string(), before.id().to_string());
        assert_eq!(after.state(), TaskState::Running);
        assert_eq!(before.state(), TaskState::Stopped);

        supervisor.stop_all();
    }

    #[test]
    fn initial_delay_aligns_to_interval_boundaries() {
        let interval = Duration::from_secs(300);

        // 17 minutes past the hour: the next 5 minute boundary is 3 minutes away.
        let delay = initial_daemon_delay(interval, Duration::from_secs(17 * 60));
        assert_eq!(delay, Duration::from_secs(180));

        // 19 minutes past the hour the boundary is only 1 minute away; the 2 minute floor wins.
        let delay = initial_daemon_delay(interval, Duration::from_secs(19 * 60));
        assert_eq!(delay, Duration::from_secs(120));

        // for an interval shorter than 2 minutes the floor is the interval itself.
        let short = Duration::from_secs(30);
        let delay = initial_daemon_delay(short, Duration::from_secs(10));
        assert_eq!(delay, short);
    }
}
