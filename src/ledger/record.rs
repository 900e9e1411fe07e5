use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROGRESS_TOTAL: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskName {
    Update,
    Check,
    Acknowledge,
    Rollback,
}

impl TaskName {
    pub const ALL: [TaskName; 4] = [
        TaskName::Update,
        TaskName::Check,
        TaskName::Acknowledge,
        TaskName::Rollback,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Check => "check",
            Self::Acknowledge => "acknowledge",
            Self::Rollback => "rollback",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "update" => Ok(Self::Update),
            "check" => Ok(Self::Check),
            "acknowledge" => Ok(Self::Acknowledge),
            "rollback" => Ok(Self::Rollback),
            other => Err(format!(
                "task name must be one of: update, check, acknowledge, rollback; got `{other}`"
            )),
        }
    }

    /// The `ack_status` a finished follow-up task leaves on its main task.
    pub fn follow_up_ack_status(self) -> Option<AckStatus> {
        match self {
            Self::Acknowledge => Some(AckStatus::Passed),
            Self::Rollback => Some(AckStatus::Rollbacked),
            Self::Update | Self::Check => None,
        }
    }
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Progress,
    Success,
    Failure,
}

impl TaskState {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Progress)
                | (TaskState::Progress, TaskState::Progress)
                | (TaskState::Progress, TaskState::Success)
                | (TaskState::Progress, TaskState::Failure)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Progress => "PROGRESS",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(Self::Pending),
            "PROGRESS" => Some(Self::Progress),
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckStatus {
    Pending,
    Passed,
    Rollbacked,
}

impl AckStatus {
    /// Valid moves are `null -> PENDING` and `PENDING -> {PASSED, ROLLBACKED}`.
    pub fn can_follow(current: Option<Self>, next: Self) -> bool {
        matches!(
            (current, next),
            (None, AckStatus::Pending)
                | (Some(AckStatus::Pending), AckStatus::Passed)
                | (Some(AckStatus::Pending), AckStatus::Rollbacked)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Passed => "PASSED",
            Self::Rollbacked => "ROLLBACKED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(Self::Pending),
            "PASSED" => Some(Self::Passed),
            "ROLLBACKED" => Some(Self::Rollbacked),
            _ => None,
        }
    }
}

impl std::fmt::Display for AckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checkpoints an update run passes through, in order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
pub enum UpdateStep {
    #[default]
    None = 0,
    Initialize = 1,
    Backup = 2,
    Cleanup = 3,
    Update = 4,
}

impl From<UpdateStep> for u8 {
    fn from(value: UpdateStep) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for UpdateStep {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Initialize),
            2 => Ok(Self::Backup),
            3 => Ok(Self::Cleanup),
            4 => Ok(Self::Update),
            other => Err(format!("update step must be within 0..=4, got {other}")),
        }
    }
}

impl std::fmt::Display for UpdateStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::None => "none",
            Self::Initialize => "initialize",
            Self::Backup => "backup",
            Self::Cleanup => "cleanup",
            Self::Update => "update",
        };
        f.write_str(label)
    }
}

/// Last progress snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub current: u8,
    pub total: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressInfo {
    pub fn new(current: u8, message: impl Into<String>) -> Self {
        Self {
            current,
            total: PROGRESS_TOTAL,
            message: message.into(),
            data: None,
            error: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub name: TaskName,
    pub arguments: Value,
    pub begin_time: i64,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub elapsed: Option<f64>,
    pub state: TaskState,
    #[serde(default)]
    pub info: Option<ProgressInfo>,
    #[serde(default)]
    pub ack_status: Option<AckStatus>,
    #[serde(default)]
    pub step: UpdateStep,
    #[serde(default)]
    pub sub_task_id: Option<String>,
}

impl TaskRecord {
    pub fn new(task_id: impl Into<String>, name: TaskName, arguments: Value, now: i64) -> Self {
        Self {
            task_id: task_id.into(),
            name,
            arguments,
            begin_time: now,
            end_time: None,
            elapsed: None,
            state: TaskState::Pending,
            info: None,
            ack_status: None,
            step: UpdateStep::None,
            sub_task_id: None,
        }
    }
}

/// Field-wise mutation of a task row. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub state: Option<TaskState>,
    pub info: Option<ProgressInfo>,
    pub end_time: Option<i64>,
    pub elapsed: Option<f64>,
    pub ack_status: Option<AckStatus>,
    pub step: Option<UpdateStep>,
    pub sub_task_id: Option<String>,
}

impl TaskPatch {
    pub fn state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn info(mut self, info: ProgressInfo) -> Self {
        self.info = Some(info);
        self
    }

    pub fn step(mut self, step: UpdateStep) -> Self {
        self.step = Some(step);
        self
    }

    pub fn ack_status(mut self, ack_status: AckStatus) -> Self {
        self.ack_status = Some(ack_status);
        self
    }

    pub fn sub_task_id(mut self, sub_task_id: impl Into<String>) -> Self {
        self.sub_task_id = Some(sub_task_id.into());
        self
    }

    pub fn finished(mut self, end_time: i64, elapsed: f64) -> Self {
        self.end_time = Some(end_time);
        self.elapsed = Some(elapsed);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("task state transition `{from}` -> `{to}` is invalid")]
    State { from: TaskState, to: TaskState },
    #[error("task step cannot move backward from `{from}` to `{to}`")]
    StepRegression { from: UpdateStep, to: UpdateStep },
    #[error("ack status transition `{}` -> `{to}` is invalid", display_ack(.from))]
    AckStatus {
        from: Option<AckStatus>,
        to: AckStatus,
    },
    #[error("ack status only applies to update tasks, not `{name}`")]
    AckOnNonUpdate { name: TaskName },
    #[error("sub task already linked as `{existing}`")]
    SubTaskAlreadyLinked { existing: String },
    #[error("task is already finalized as `{state}`")]
    AlreadyFinalized { state: TaskState },
    #[error("end time may only be recorded together with a terminal state")]
    EndWithoutTerminalState,
}

fn display_ack(value: &Option<AckStatus>) -> &'static str {
    value.map(AckStatus::as_str).unwrap_or("null")
}

/// Validates every field of `patch` against `record` and applies it only if
/// all of them are allowed.
pub fn apply_patch(record: &mut TaskRecord, patch: &TaskPatch) -> Result<(), TransitionError> {
    let touches_run_fields = patch.state.is_some()
        || patch.info.is_some()
        || patch.step.is_some()
        || patch.end_time.is_some()
        || patch.elapsed.is_some();
    if touches_run_fields && record.state.is_terminal() {
        return Err(TransitionError::AlreadyFinalized {
            state: record.state,
        });
    }

    if let Some(next) = patch.state {
        if !record.state.can_transition_to(next) {
            return Err(TransitionError::State {
                from: record.state,
                to: next,
            });
        }
    }

    if patch.end_time.is_some() || patch.elapsed.is_some() {
        let finalizing = patch.state.map(TaskState::is_terminal).unwrap_or(false);
        if !finalizing {
            return Err(TransitionError::EndWithoutTerminalState);
        }
    }

    if let Some(next) = patch.step {
        if next < record.step {
            return Err(TransitionError::StepRegression {
                from: record.step,
                to: next,
            });
        }
    }

    if let Some(next) = patch.ack_status {
        if record.name != TaskName::Update {
            return Err(TransitionError::AckOnNonUpdate { name: record.name });
        }
        if !AckStatus::can_follow(record.ack_status, next) {
            return Err(TransitionError::AckStatus {
                from: record.ack_status,
                to: next,
            });
        }
    }

    if patch.sub_task_id.is_some() {
        if let Some(existing) = record.sub_task_id.as_ref() {
            return Err(TransitionError::SubTaskAlreadyLinked {
                existing: existing.clone(),
            });
        }
    }

    if let Some(state) = patch.state {
        record.state = state;
    }
    if let Some(info) = patch.info.as_ref() {
        record.info = Some(info.clone());
    }
    if let Some(end_time) = patch.end_time {
        record.end_time = Some(end_time);
    }
    if let Some(elapsed) = patch.elapsed {
        record.elapsed = Some(elapsed);
    }
    if let Some(step) = patch.step {
        record.step = step;
    }
    if let Some(ack_status) = patch.ack_status {
        record.ack_status = Some(ack_status);
    }
    if let Some(sub_task_id) = patch.sub_task_id.as_ref() {
        record.sub_task_id = Some(sub_task_id.clone());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckFilter {
    Unset,
    Is(AckStatus),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub name: Option<TaskName>,
    pub state: Option<TaskState>,
    pub ack_status: Option<AckFilter>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn named(name: TaskName) -> Self {
        Self {
            name: Some(name),
            ..Self::default()
        }
    }

    pub fn with_ack(mut self, ack_status: AckFilter) -> Self {
        self.ack_status = Some(ack_status);
        self
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn matches(&self, record: &TaskRecord) -> bool {
        if self.name.is_some_and(|name| name != record.name) {
            return false;
        }
        if self.state.is_some_and(|state| state != record.state) {
            return false;
        }
        match self.ack_status {
            None => true,
            Some(AckFilter::Unset) => record.ack_status.is_none(),
            Some(AckFilter::Is(status)) => record.ack_status == Some(status),
        }
    }
}
