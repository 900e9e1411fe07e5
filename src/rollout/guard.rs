use crate::ledger::{
    AckFilter, AckStatus, LedgerError, TaskFilter, TaskLedger, TaskName, TaskPatch, TaskRecord,
    TaskState,
};
use crate::rollout::error::GuardError;
use crate::rollout::request::{Coordinate, UpdateRequest};
use crate::shared::EventLog;

/// Update tasks that still own their coordinate's backup: `ack_status` is
/// unset or `PENDING`.
fn unacknowledged_updates(ledger: &dyn TaskLedger) -> Result<Vec<TaskRecord>, LedgerError> {
    let mut open = ledger.list(&TaskFilter::named(TaskName::Update).with_ack(AckFilter::Unset))?;
    open.extend(ledger.list(
        &TaskFilter::named(TaskName::Update).with_ack(AckFilter::Is(AckStatus::Pending)),
    )?);
    Ok(open)
}

/// Rejects an update while another update for the same coordinate is still
/// unacknowledged.
///
/// This is check-then-act: two submissions racing past this check can both
/// be admitted.
pub fn admit_update(
    ledger: &dyn TaskLedger,
    request: &UpdateRequest,
    log: &EventLog,
) -> Result<(), GuardError> {
    let wanted = request.coordinate();
    for task in unacknowledged_updates(ledger)? {
        let previous: UpdateRequest = match serde_json::from_value(task.arguments.clone()) {
            Ok(previous) => previous,
            Err(err) => {
                log.task(
                    "warn",
                    &task.task_id,
                    "guard.undecodable_arguments",
                    &err.to_string(),
                );
                continue;
            }
        };
        if same_target(&previous.coordinate(), &wanted) {
            let message = format!(
                "task <{}> for {wanted} has not been acknowledged or rolled back",
                task.task_id
            );
            log.warn("guard.rejected", &message);
            return Err(GuardError::ConstraintConflict(message));
        }
    }
    Ok(())
}

/// Coordinates sharing a folder share staging paths and key space.
fn same_target(a: &Coordinate, b: &Coordinate) -> bool {
    a.folder() == b.folder()
}

/// Validates that `main_task_id` may be acknowledged or rolled back and
/// claims it by moving its `ack_status` to `PENDING`.
pub fn claim_main_task(
    ledger: &dyn TaskLedger,
    follow_up: TaskName,
    main_task_id: &str,
    log: &EventLog,
) -> Result<TaskRecord, GuardError> {
    let Some(main) = ledger.get(main_task_id)? else {
        return Err(GuardError::ObjectNotFound(format!(
            "task <{main_task_id}> does not exist"
        )));
    };
    if main.name != TaskName::Update {
        return Err(GuardError::InvalidAccess(format!(
            "task <{main_task_id}> is a {} task; only update tasks can be {}d",
            main.name, follow_up
        )));
    }
    if !main.state.is_terminal() {
        return Err(GuardError::ConstraintConflict(format!(
            "task <{main_task_id}> is still {}",
            main.state
        )));
    }
    if let Some(status) = main.ack_status {
        return Err(GuardError::ConstraintConflict(format!(
            "task <{main_task_id}> is already claimed ({status})"
        )));
    }
    if follow_up == TaskName::Acknowledge && main.state == TaskState::Failure {
        return Err(GuardError::InvalidAccess(format!(
            "task <{main_task_id}> failed and must be rolled back instead"
        )));
    }

    let patch = TaskPatch::default().ack_status(AckStatus::Pending);
    match ledger.update(main_task_id, &patch) {
        Ok(Some(claimed)) => {
            log.task("info", main_task_id, "guard.claimed", follow_up.as_str());
            Ok(claimed)
        }
        Ok(None) => Err(GuardError::ObjectNotFound(format!(
            "task <{main_task_id}> does not exist"
        ))),
        Err(LedgerError::Transition { source, .. }) => Err(GuardError::ConstraintConflict(
            format!("task <{main_task_id}> was claimed concurrently: {source}"),
        )),
        Err(other) => Err(other.into()),
    }
}

/// Records the follow-up run on its main task. Failures are logged only.
pub fn link_sub_task(ledger: &dyn TaskLedger, main_task_id: &str, sub_task_id: &str, log: &EventLog) {
    let patch = TaskPatch::default().sub_task_id(sub_task_id);
    if let Err(err) = ledger.update(main_task_id, &patch) {
        log.task(
            "error",
            main_task_id,
            "task.ledger_update_failed",
            &format!("linking sub task {sub_task_id}: {err}"),
        );
    }
}

/// Closes the claim once the follow-up run finished, whatever its outcome.
pub fn release_main_task(
    ledger: &dyn TaskLedger,
    main_task_id: &str,
    follow_up: TaskName,
    log: &EventLog,
) {
    let Some(status) = follow_up.follow_up_ack_status() else {
        return;
    };
    let patch = TaskPatch::default().ack_status(status);
    match ledger.update(main_task_id, &patch) {
        Ok(_) => log.task("info", main_task_id, "guard.released", status.as_str()),
        Err(err) => log.task(
            "error",
            main_task_id,
            "task.ledger_update_failed",
            &format!("setting ack_status {status}: {err}"),
        ),
    }
}
