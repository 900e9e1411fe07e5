use crate::rollout::{Operation, WorkflowEngine};
use std::collections::BTreeSet;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone)]
pub struct TaskJob {
    pub task_id: String,
    pub operation: Operation,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("task `{task_id}` is already running")]
    AlreadyRunning { task_id: String },
    #[error("worker pool is stopped")]
    Stopped,
    #[error("worker pool lock poisoned")]
    Poisoned,
}

/// Fixed set of worker threads executing admitted tasks. A task id is never
/// executed by two workers at once.
pub struct WorkerPool {
    sender: Option<Sender<TaskJob>>,
    handles: Vec<JoinHandle<()>>,
    in_flight: Arc<Mutex<BTreeSet<String>>>,
}

impl WorkerPool {
    pub fn start(engine: Arc<WorkflowEngine>, max_concurrency: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<TaskJob>();
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = Arc::new(Mutex::new(BTreeSet::new()));
        let handles = (0..max_concurrency.max(1))
            .map(|index| {
                let engine = engine.clone();
                let receiver = receiver.clone();
                let in_flight = in_flight.clone();
                thread::spawn(move || worker_loop(index, &engine, &receiver, &in_flight))
            })
            .collect();
        Self {
            sender: Some(sender),
            handles,
            in_flight,
        }
    }

    pub fn dispatch(&self, job: TaskJob) -> Result<(), DispatchError> {
        let sender = self.sender.as_ref().ok_or(DispatchError::Stopped)?;
        {
            let mut in_flight = self.in_flight.lock().map_err(|_| DispatchError::Poisoned)?;
            if !in_flight.insert(job.task_id.clone()) {
                return Err(DispatchError::AlreadyRunning {
                    task_id: job.task_id,
                });
            }
        }
        let task_id = job.task_id.clone();
        sender.send(job).map_err(|_| {
            if let Ok(mut in_flight) = self.in_flight.lock() {
                in_flight.remove(&task_id);
            }
            DispatchError::Stopped
        })
    }

    /// Ids queued or executing right now.
    pub fn in_flight(&self) -> Vec<String> {
        self.in_flight
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stops accepting jobs and waits for queued ones to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    index: usize,
    engine: &WorkflowEngine,
    receiver: &Mutex<Receiver<TaskJob>>,
    in_flight: &Mutex<BTreeSet<String>>,
) {
    let worker_id = format!("worker-{index}");
    let log = engine.log();
    log.info("worker.started", &worker_id);
    loop {
        let job = {
            let Ok(receiver) = receiver.lock() else {
                log.error("worker.stopped", &format!("{worker_id}: receiver lock poisoned"));
                return;
            };
            match receiver.recv() {
                Ok(job) => job,
                Err(_) => break,
            }
        };

        let outcome = engine.execute(&job.task_id, &job.operation);
        log.task(
            "info",
            &job.task_id,
            "worker.completed",
            &format!("{worker_id} finished with {}", outcome.state),
        );
        if let Ok(mut in_flight) = in_flight.lock() {
            in_flight.remove(&job.task_id);
        }
    }
    log.info("worker.stopped", &worker_id);
}
