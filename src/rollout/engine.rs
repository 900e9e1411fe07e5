use crate::clients::{KeyStore, ObjectStore, RemoteExecutor};
use crate::config::{AgentAction, Settings};
use crate::ledger::{
    LedgerError, ProgressInfo, TaskLedger, TaskPatch, TaskRecord, TaskState,
    TransitionError, UpdateStep, PROGRESS_TOTAL,
};
use crate::rollout::agent::AgentController;
use crate::rollout::backup::BackupManager;
use crate::rollout::builder::{create_descriptors, create_templates};
use crate::rollout::drift::check_files;
use crate::rollout::error::{GuardError, RolloutError};
use crate::rollout::guard::{admit_update, claim_main_task, link_sub_task, release_main_task};
use crate::rollout::keys::KeySynchronizer;
use crate::rollout::layout::RolloutLayout;
use crate::rollout::progress::ProgressCursor;
use crate::rollout::request::{CheckRequest, FollowUpRequest, Operation, UpdateRequest};
use crate::shared::{now_secs, EventLog};
use serde::Serialize;
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// Terminal state and last progress record of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task_id: String,
    pub state: TaskState,
    pub info: ProgressInfo,
}

/// Sequences the rollout components into the four operations.
pub struct WorkflowEngine {
    settings: Settings,
    ledger: Arc<dyn TaskLedger>,
    executor: Arc<dyn RemoteExecutor>,
    keys: Arc<dyn KeyStore>,
    objects: Arc<dyn ObjectStore>,
    log: EventLog,
}

impl WorkflowEngine {
    pub fn new(
        settings: Settings,
        ledger: Arc<dyn TaskLedger>,
        executor: Arc<dyn RemoteExecutor>,
        keys: Arc<dyn KeyStore>,
        objects: Arc<dyn ObjectStore>,
        log: EventLog,
    ) -> Self {
        Self {
            settings,
            ledger,
            executor,
            keys,
            objects,
            log,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn ledger(&self) -> &Arc<dyn TaskLedger> {
        &self.ledger
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    fn agent(&self) -> AgentController {
        AgentController::new(
            self.executor.clone(),
            self.settings.agent.clone(),
            self.log.clone(),
        )
    }

    /// Runs the guards for `operation` and records the new task as `PENDING`.
    /// Nothing remote happens here.
    pub fn admit(&self, task_id: &str, operation: &Operation) -> Result<TaskRecord, GuardError> {
        operation.validate()?;
        let arguments = operation
            .arguments()
            .map_err(|err| GuardError::InvalidAccess(format!("arguments do not serialize: {err}")))?;

        let claimed_main = match operation {
            Operation::Update(request) => {
                admit_update(self.ledger.as_ref(), request, &self.log)?;
                None
            }
            Operation::Check(_) => None,
            Operation::Acknowledge(follow_up) | Operation::Rollback(follow_up) => {
                claim_main_task(
                    self.ledger.as_ref(),
                    operation.name(),
                    &follow_up.main_task_id,
                    &self.log,
                )?;
                Some(follow_up.main_task_id.as_str())
            }
        };

        let record = match self
            .ledger
            .create(task_id, operation.name(), &arguments, now_secs())
        {
            Ok(record) => record,
            Err(err) => {
                if let Some(main_task_id) = claimed_main {
                    self.log.task(
                        "error",
                        main_task_id,
                        "guard.claim_orphaned",
                        &format!("sub task {task_id} could not be created: {err}"),
                    );
                }
                return Err(match err {
                    LedgerError::DuplicateTask { task_id } => GuardError::ConstraintConflict(
                        format!("task <{task_id}> already exists"),
                    ),
                    other => other.into(),
                });
            }
        };

        if let Some(main_task_id) = claimed_main {
            link_sub_task(self.ledger.as_ref(), main_task_id, task_id, &self.log);
        }
        self.log.task(
            "info",
            task_id,
            "task.created",
            &format!("{} task admitted", operation.name()),
        );
        Ok(record)
    }

    /// Runs an admitted task to a terminal state. Failures are recorded on
    /// the task, never returned.
    pub fn execute(&self, task_id: &str, operation: &Operation) -> TaskOutcome {
        let mut run = TaskRun::new(self, task_id);
        let messages = FinalMessages::for_operation(operation);

        let result = match run.begin() {
            Ok(()) => catch_unwind(AssertUnwindSafe(|| self.dispatch(&mut run, operation)))
                .unwrap_or_else(|payload| Err(RolloutError::Panicked(panic_message(&*payload)))),
            Err(err) => Err(err),
        };
        let (outcome, finalization) = run.finalize(result, &messages);

        if let Operation::Acknowledge(follow_up) | Operation::Rollback(follow_up) = operation {
            match finalization {
                Finalization::Recorded => release_main_task(
                    self.ledger.as_ref(),
                    &follow_up.main_task_id,
                    operation.name(),
                    &self.log,
                ),
                Finalization::AlreadyFinalized => {}
                Finalization::Unrecorded => self.log.task(
                    "error",
                    &follow_up.main_task_id,
                    "guard.claim_orphaned",
                    &format!("sub task {task_id} ended without a terminal ledger row"),
                ),
            }
        }
        outcome
    }

    /// Finalizes an admitted task that will never run as `FAILURE` with
    /// `reason`. A follow-up's main task keeps its claim.
    pub fn abandon(&self, task_id: &str, operation: &Operation, reason: &str) -> TaskOutcome {
        let run = TaskRun::new(self, task_id);
        let messages = FinalMessages::for_operation(operation);
        let (outcome, _) = run.finalize(
            Err(RolloutError::NotDispatched(reason.to_string())),
            &messages,
        );
        if let Operation::Acknowledge(follow_up) | Operation::Rollback(follow_up) = operation {
            self.log.task(
                "error",
                &follow_up.main_task_id,
                "guard.claim_orphaned",
                &format!("sub task {task_id} was not dispatched: {reason}"),
            );
        }
        outcome
    }

    fn dispatch(&self, run: &mut TaskRun<'_>, operation: &Operation) -> Result<Value, RolloutError> {
        match operation {
            Operation::Update(request) => self.run_update(run, request),
            Operation::Check(request) => self.run_check(run, request),
            Operation::Acknowledge(follow_up) => self.run_acknowledge(run, follow_up),
            Operation::Rollback(follow_up) => self.run_rollback(run, follow_up),
        }
    }

    fn run_update(&self, run: &mut TaskRun<'_>, request: &UpdateRequest) -> Result<Value, RolloutError> {
        let agent = self.agent();
        let layout = run.step(
            &format!("Begin to update configurations of {}.", request.service_name),
            Some(UpdateStep::Initialize),
            || Ok(RolloutLayout::new(request.coordinate(), &self.settings)),
            |layout| json!({ "coordinate": layout.coordinate().folder() }),
        )?;
        let _staging = layout.staging_cleanup();
        let backup = BackupManager::new(
            &layout,
            &agent,
            self.objects.as_ref(),
            &self.settings.object_storage.bucket,
            &self.log,
        );
        let keys = KeySynchronizer::new(&layout, self.keys.as_ref(), &self.log);
        let hosts = &request.hosts;
        let files = &request.files;

        run.step_json("Creating new template files ...", None, || {
            create_templates(&layout, files)
        })?;
        run.step_json("Creating new descriptor files ...", None, || {
            create_descriptors(&layout, &agent, request)
        })?;
        run.step_json("Backing up old files ...", Some(UpdateStep::Backup), || {
            backup.backup_files(hosts, files)
        })?;
        run.step_json("Backing up old items ...", None, || keys.backup_keys(files))?;
        run.step_json("Stopping remote agent ...", Some(UpdateStep::Cleanup), || {
            agent.command(hosts, AgentAction::Stop)
        })?;
        run.step_json("Deleting old template and descriptor files ...", None, || {
            backup.delete_files(hosts)
        })?;
        run.step_json("Updating items ...", Some(UpdateStep::Update), || {
            keys.update_keys(files, false)
        })?;
        run.step_json("Pushing new template and descriptor files ...", None, || {
            backup.push_files(hosts, false)
        })?;
        run.step_json("Starting remote agent ...", None, || {
            agent.command(hosts, AgentAction::Start)
        })?;

        Ok(json!({
            "coordinate": layout.coordinate().folder(),
            "hosts": hosts,
            "files": files.iter().map(|file| file.name.as_str()).collect::<Vec<_>>(),
        }))
    }

    fn run_check(&self, run: &mut TaskRun<'_>, request: &CheckRequest) -> Result<Value, RolloutError> {
        let agent = self.agent();
        let mut reports = Vec::with_capacity(request.files.len());
        for file in &request.files {
            let report = run.step_json(
                &format!("Checking file {} ...", file.dest_path()),
                None,
                || check_files(&agent, std::slice::from_ref(file), &request.hosts),
            )?;
            reports.push(report);
        }
        Ok(Value::Array(reports))
    }

    fn load_main_request(&self, main_task_id: &str) -> Result<(TaskRecord, UpdateRequest), RolloutError> {
        let main = self
            .ledger
            .get(main_task_id)?
            .ok_or_else(|| RolloutError::TaskMissing {
                task_id: main_task_id.to_string(),
            })?;
        match Operation::decode(main.name, &main.arguments)? {
            Operation::Update(request) => Ok((main, request)),
            _ => Err(RolloutError::NotAnUpdate {
                task_id: main.task_id,
                name: main.name,
            }),
        }
    }

    fn run_acknowledge(&self, run: &mut TaskRun<'_>, follow_up: &FollowUpRequest) -> Result<Value, RolloutError> {
        let agent = self.agent();
        let main_task_id = follow_up.main_task_id.as_str();
        let (_, request) = run.step(
            &format!("Begin to acknowledge task <{main_task_id}>."),
            None,
            || self.load_main_request(main_task_id),
            |(main, _)| json!({ "main_task_id": main.task_id }),
        )?;
        let layout = RolloutLayout::new(request.coordinate(), &self.settings);
        let backup = BackupManager::new(
            &layout,
            &agent,
            self.objects.as_ref(),
            &self.settings.object_storage.bucket,
            &self.log,
        );
        let keys = KeySynchronizer::new(&layout, self.keys.as_ref(), &self.log);
        let hosts = &request.hosts;
        let files = &request.files;

        run.step_json("Stopping remote agent ...", None, || {
            agent.command(hosts, AgentAction::Stop)
        })?;
        let removed_files = run.step_json("Deleting expired files ...", None, || {
            backup.delete_expired_files(hosts, files)
        })?;
        let removed_keys = run.step_json("Deleting expired items ...", None, || {
            keys.delete_expired_keys(files)
        })?;
        run.step_json("Starting remote agent ...", None, || {
            agent.command(hosts, AgentAction::Start)
        })?;
        Ok(json!({ "expired_files": removed_files, "expired_items": removed_keys }))
    }

    fn run_rollback(&self, run: &mut TaskRun<'_>, follow_up: &FollowUpRequest) -> Result<Value, RolloutError> {
        let agent = self.agent();
        let main_task_id = follow_up.main_task_id.as_str();
        let (main, request) = run.step(
            &format!("Begin to rollback task <{main_task_id}>."),
            None,
            || self.load_main_request(main_task_id),
            |(main, _)| json!({ "main_task_id": main.task_id, "main_step": main.step }),
        )?;
        if main.step < UpdateStep::Cleanup {
            // Nothing remote was touched before cleanup.
            return Ok(Value::Null);
        }

        let layout = RolloutLayout::new(request.coordinate(), &self.settings);
        let backup = BackupManager::new(
            &layout,
            &agent,
            self.objects.as_ref(),
            &self.settings.object_storage.bucket,
            &self.log,
        );
        let keys = KeySynchronizer::new(&layout, self.keys.as_ref(), &self.log);
        let hosts = &request.hosts;
        let files = &request.files;

        run.step_json("Stopping remote agent ...", None, || {
            agent.command(hosts, AgentAction::Stop)
        })?;
        run.step_json("Deleting the new files ...", None, || {
            backup.delete_files(hosts)
        })?;
        run.step_json("Rolling back to the old files ...", None, || {
            backup.push_files(hosts, true)
        })?;
        let restored = run.step_json("Rolling back the items ...", None, || {
            keys.update_keys(files, true)
        })?;
        run.step_json("Starting remote agent ...", None, || {
            agent.command(hosts, AgentAction::Start)
        })?;
        Ok(json!({ "restored_items": restored }))
    }
}

struct FinalMessages {
    success: String,
    failure: String,
}

impl FinalMessages {
    fn for_operation(operation: &Operation) -> Self {
        let (success, failure) = match operation {
            Operation::Update(_) => (
                "Configurations have been updated completely.".to_string(),
                "Error occurs while updating configurations.".to_string(),
            ),
            Operation::Check(_) => (
                "Configuration files have been checked completely.".to_string(),
                "Error occurs while checking configuration files.".to_string(),
            ),
            Operation::Acknowledge(follow_up) => (
                format!("Task <{}> has been acknowledged.", follow_up.main_task_id),
                format!(
                    "Error occurs while acknowledging task <{}>.",
                    follow_up.main_task_id
                ),
            ),
            Operation::Rollback(follow_up) => (
                format!("Task <{}> has been rolled back completely.", follow_up.main_task_id),
                format!(
                    "Error occurs while rolling back task <{}>.",
                    follow_up.main_task_id
                ),
            ),
        };
        Self { success, failure }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}

/// How `finalize` left the ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finalization {
    Recorded,
    AlreadyFinalized,
    Unrecorded,
}

/// Progress bookkeeping for one task between `begin` and `finalize`.
struct TaskRun<'e> {
    engine: &'e WorkflowEngine,
    task_id: String,
    started: Instant,
    cursor: ProgressCursor,
    begun: bool,
}

impl<'e> TaskRun<'e> {
    fn new(engine: &'e WorkflowEngine, task_id: &str) -> Self {
        Self {
            engine,
            task_id: task_id.to_string(),
            started: Instant::now(),
            cursor: ProgressCursor::default(),
            begun: false,
        }
    }

    fn apply(&self, patch: &TaskPatch) -> Result<TaskRecord, RolloutError> {
        self.engine
            .ledger
            .update(&self.task_id, patch)?
            .ok_or_else(|| RolloutError::TaskMissing {
                task_id: self.task_id.clone(),
            })
    }

    fn begin(&mut self) -> Result<(), RolloutError> {
        self.apply(&TaskPatch::default().state(TaskState::Progress))?;
        self.begun = true;
        Ok(())
    }

    /// Runs one step: stamps `checkpoint` on entry, runs `op`, then records
    /// progress with `summarize(result)` as data.
    fn step<T>(
        &mut self,
        message: &str,
        checkpoint: Option<UpdateStep>,
        op: impl FnOnce() -> Result<T, RolloutError>,
        summarize: impl FnOnce(&T) -> Value,
    ) -> Result<T, RolloutError> {
        let current = self.cursor.advance();
        if let Some(checkpoint) = checkpoint {
            self.apply(
                &TaskPatch::default()
                    .state(TaskState::Progress)
                    .step(checkpoint),
            )?;
        }
        self.engine
            .log
            .task("info", &self.task_id, "task.step", message);

        let result = op()?;
        let info = ProgressInfo::new(current, message).with_data(summarize(&result));
        self.apply(&TaskPatch::default().state(TaskState::Progress).info(info))?;
        Ok(result)
    }

    /// [`TaskRun::step`] whose data is the serialized result, returned as JSON.
    fn step_json<T: Serialize>(
        &mut self,
        message: &str,
        checkpoint: Option<UpdateStep>,
        op: impl FnOnce() -> Result<T, RolloutError>,
    ) -> Result<Value, RolloutError> {
        let wrapped = || {
            let result = op()?;
            serde_json::to_value(&result).map_err(|source| RolloutError::StepResult {
                step: message.to_string(),
                source,
            })
        };
        self.step(message, checkpoint, wrapped, Value::clone)
    }

    /// Writes the terminal record, first moving a row that never left
    /// `PENDING` to `PROGRESS`. A ledger failure here is logged and the
    /// computed outcome still returned.
    fn finalize(
        self,
        result: Result<Value, RolloutError>,
        messages: &FinalMessages,
    ) -> (TaskOutcome, Finalization) {
        let (state, info) = match result {
            Ok(data) => (
                TaskState::Success,
                ProgressInfo::new(PROGRESS_TOTAL, messages.success.clone()).with_data(data),
            ),
            Err(err) => (
                TaskState::Failure,
                ProgressInfo::new(PROGRESS_TOTAL, messages.failure.clone())
                    .with_error(err.to_string()),
            ),
        };
        let elapsed = self.started.elapsed().as_secs_f64();
        let patch = TaskPatch::default()
            .state(state)
            .info(info.clone())
            .finished(now_secs(), elapsed);

        let log = &self.engine.log;
        if !self.begun {
            if let Err(err) = self.enter_progress() {
                log.task(
                    "warn",
                    &self.task_id,
                    "task.ledger_update_failed",
                    &format!("could not enter PROGRESS before finalizing: {err}"),
                );
            }
        }

        let finalization = match self.engine.ledger.update(&self.task_id, &patch) {
            Ok(Some(_)) => {
                log.task(
                    if state == TaskState::Success { "info" } else { "error" },
                    &self.task_id,
                    "task.finalized",
                    &format!(
                        "{state} after {elapsed:.3}s: {}",
                        info.error.as_deref().unwrap_or(&info.message)
                    ),
                );
                Finalization::Recorded
            }
            Ok(None) => {
                log.task(
                    "error",
                    &self.task_id,
                    "task.ledger_update_failed",
                    "task row vanished before finalization",
                );
                Finalization::Unrecorded
            }
            Err(LedgerError::Transition {
                source: TransitionError::AlreadyFinalized { state: existing },
                ..
            }) => {
                log.task(
                    "warn",
                    &self.task_id,
                    "task.ledger_update_failed",
                    &format!("task was already finalized as {existing}"),
                );
                Finalization::AlreadyFinalized
            }
            Err(err) => {
                log.task(
                    "error",
                    &self.task_id,
                    "task.ledger_update_failed",
                    &err.to_string(),
                );
                Finalization::Unrecorded
            }
        };

        let outcome = TaskOutcome {
            task_id: self.task_id,
            state,
            info,
        };
        (outcome, finalization)
    }

    /// Moves a `PENDING` row to `PROGRESS`; rows already past it are left alone.
    fn enter_progress(&self) -> Result<(), RolloutError> {
        let record = self
            .engine
            .ledger
            .get(&self.task_id)?
            .ok_or_else(|| RolloutError::TaskMissing {
                task_id: self.task_id.clone(),
            })?;
        if record.state == TaskState::Pending {
            self.apply(&TaskPatch::default().state(TaskState::Progress))?;
        }
        Ok(())
    }
}
