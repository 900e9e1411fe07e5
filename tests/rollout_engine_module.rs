mod support;

use confwave::clients::{KeyStore, ObjectStore};
use confwave::ledger::{
    AckStatus, LedgerError, MemoryTaskLedger, TaskFilter, TaskLedger, TaskName, TaskPatch,
    TaskRecord, TaskState, UpdateStep, PROGRESS_TOTAL,
};
use confwave::rollout::{CheckRequest, FollowUpRequest, Operation, WorkflowEngine};
use confwave::shared::EventLog;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use support::{app_file, update_request, Harness, DESCRIPTOR_DIR, TEMPLATE_ROOT};

const HOSTS: [&str; 2] = ["10.0.0.1", "10.0.0.2"];
const APP_DESCRIPTOR: &str = "/apps/confd/conf.d/prod.web.1.0.app.cfg.toml";
const APP_TEMPLATE: &str = "/apps/confd/templates/prod/web/1.0/app.cfg.tmpl";
const API_DESCRIPTOR: &str = "/apps/confd/conf.d/prod.api.2.0.db.cfg.toml";
const RAW_FILE: &str = "/etc/web/app.cfg";

/// A release of `prod/web/1.0` already deployed on every host, plus an
/// unrelated service sharing the agent.
fn seed_previous_release(h: &Harness) {
    for host in HOSTS {
        h.fleet
            .put_file(host, APP_DESCRIPTOR, "old descriptor\n", "0775", "root");
        h.fleet.put_file(host, APP_TEMPLATE, "old template\n", "0775", "root");
        h.fleet.put_file(host, API_DESCRIPTOR, "api descriptor\n", "0775", "root");
        h.fleet.put_file(host, RAW_FILE, "hello there\n", "0644", "web");
    }
    h.keys
        .write("/prod/web/1.0/app.cfg/name", "there")
        .expect("seed key");
    h.keys
        .write("/prod/web/1.0/app.cfg/legacy", "x")
        .expect("seed key");
}

fn run(h: &Harness, task_id: &str, op: &Operation) -> confwave::rollout::TaskOutcome {
    h.engine.admit(task_id, op).expect("admit");
    h.engine.execute(task_id, op)
}

fn follow_up(main_task_id: &str) -> FollowUpRequest {
    FollowUpRequest {
        main_task_id: main_task_id.to_string(),
    }
}

fn key(h: &Harness, path: &str) -> Option<String> {
    h.keys.snapshot().expect("snapshot").get(path).cloned()
}

#[test]
fn update_rolls_out_templates_descriptors_and_items() {
    let h = Harness::new(&HOSTS);
    let op = Operation::Update(update_request(vec![app_file(&[("name", "world")])], &HOSTS));

    let outcome = run(&h, "task-update-1", &op);
    assert_eq!(outcome.state, TaskState::Success, "{:?}", outcome.info);
    assert_eq!(outcome.info.current, PROGRESS_TOTAL);
    assert!(outcome.info.error.is_none());
    assert_eq!(
        key(&h, "/prod/web/1.0/app.cfg/name").as_deref(),
        Some("world")
    );

    for host in HOSTS {
        let descriptor = h.fleet.file(host, APP_DESCRIPTOR).expect("descriptor pushed");
        assert!(descriptor.content.starts_with("[template]\n"));
        assert!(descriptor
            .content
            .contains("prefix = \"/prod/web/1.0/app.cfg\"\n"));
        assert!(descriptor.content.contains("keys = [\"name\"]\n"));
        assert!(descriptor.content.contains("src = \"prod/web/1.0/app.cfg.tmpl\"\n"));
        assert!(descriptor.content.contains("dest = \"/etc/web/app.cfg\"\n"));
        assert!(descriptor.content.contains("uid = 1001\ngid = 1002\n"));
        assert!(descriptor
            .content
            .contains("reload_cmd = \"systemctl reload 'web'\"\n"));
        assert_eq!(descriptor.mode, "0775");
        assert_eq!(descriptor.owner, "root");

        let template = h.fleet.file(host, APP_TEMPLATE).expect("template pushed");
        assert_eq!(template.content, "hello {{getv \"/name\"}}\n");
        assert!(h.fleet.agent_running(host));
    }
    assert!(h.fleet.ran_command("/apps/sh/confd.sh stop"));
    assert!(h.fleet.ran_command("/apps/sh/confd.sh start"));

    let record = h
        .ledger
        .get("task-update-1")
        .expect("get")
        .expect("record");
    assert_eq!(record.state, TaskState::Success);
    assert_eq!(record.step, UpdateStep::Update);
    assert_eq!(record.ack_status, None);
    assert!(record.end_time.is_some());
    let data = record.info.and_then(|info| info.data).expect("final data");
    assert_eq!(data["coordinate"], "prod/web/1.0");
    assert_eq!(data["files"], serde_json::json!(["app.cfg"]));

    assert!(!h.settings.staging.tmp_dir.join("conf.d/prod/web/1.0").exists());
    assert!(!h.settings.staging.tmp_dir.join("templates/prod/web/1.0").exists());
    assert!(h.log_text().contains("\"event\":\"task.finalized\""));
}

#[test]
fn update_snapshots_the_previous_release_before_replacing_it() {
    let h = Harness::new(&HOSTS);
    seed_previous_release(&h);
    let op = Operation::Update(update_request(vec![app_file(&[("name", "world")])], &HOSTS));

    let outcome = run(&h, "task-update-1", &op);
    assert_eq!(outcome.state, TaskState::Success, "{:?}", outcome.info);

    let bucket = &h.settings.object_storage.bucket;
    assert_eq!(
        h.objects
            .list_objects(bucket, "descriptor/prod/web/1.0/10.0.0.1/")
            .expect("list"),
        vec!["descriptor/prod/web/1.0/10.0.0.1/prod.web.1.0.app.cfg.toml".to_string()]
    );
    assert_eq!(
        h.objects
            .list_objects(bucket, "template/prod/web/1.0/10.0.0.2/")
            .expect("list"),
        vec!["template/prod/web/1.0/10.0.0.2/app.cfg.tmpl".to_string()]
    );
    assert_eq!(
        h.objects
            .list_objects(bucket, "rawfile/prod/web/1.0/10.0.0.1/")
            .expect("list"),
        vec!["rawfile/prod/web/1.0/10.0.0.1/0644@@web@@web~sep~~sl~etc~sl~web~sl~app.cfg".to_string()]
    );
    assert_eq!(key(&h, "/bak/prod/web/1.0/app.cfg/name").as_deref(), Some("there"));
    assert_eq!(key(&h, "/bak/prod/web/1.0/app.cfg/legacy").as_deref(), Some("x"));

    for host in HOSTS {
        let api = h.fleet.file(host, API_DESCRIPTOR).expect("other service kept");
        assert_eq!(api.content, "api descriptor\n");
    }
}

#[test]
fn integrity_failure_halts_before_anything_destructive() {
    let h = Harness::new(&HOSTS);
    seed_previous_release(&h);
    h.fleet.fail_fetches_containing("/conf.d/");
    let op = Operation::Update(update_request(vec![app_file(&[("name", "world")])], &HOSTS));

    let outcome = run(&h, "task-update-1", &op);
    assert_eq!(outcome.state, TaskState::Failure);
    assert_eq!(outcome.info.current, PROGRESS_TOTAL);
    let error = outcome.info.error.expect("error recorded");
    assert!(error.contains("backup integrity"), "{error}");
    assert!(error.contains("prod.web.1.0.app.cfg.toml"), "{error}");

    let record = h.ledger.get("task-update-1").expect("get").expect("record");
    assert_eq!(record.step, UpdateStep::Backup);
    assert!(!h.fleet.ran_command("/apps/sh/confd.sh stop"));
    for host in HOSTS {
        assert!(h.fleet.agent_running(host));
        assert_eq!(
            h.fleet.file(host, APP_DESCRIPTOR).expect("descriptor").content,
            "old descriptor\n"
        );
    }
    assert_eq!(key(&h, "/prod/web/1.0/app.cfg/name").as_deref(), Some("there"));

    let acknowledge = Operation::Acknowledge(follow_up("task-update-1"));
    let err = h
        .engine
        .admit("task-ack-1", &acknowledge)
        .expect_err("failed update cannot be acknowledged");
    assert_eq!(err.status_code(), 400);

    let rollback = Operation::Rollback(follow_up("task-update-1"));
    let outcome = run(&h, "task-rollback-1", &rollback);
    assert_eq!(outcome.state, TaskState::Success);
    assert_eq!(outcome.info.data, Some(Value::Null));
    assert!(!h.fleet.ran_command("/apps/sh/confd.sh stop"));
    let main = h.ledger.get("task-update-1").expect("get").expect("record");
    assert_eq!(main.ack_status, Some(AckStatus::Rollbacked));
    assert_eq!(main.sub_task_id.as_deref(), Some("task-rollback-1"));
}

#[test]
fn failure_after_cleanup_records_the_cleanup_checkpoint() {
    let h = Harness::new(&HOSTS);
    h.fleet.fail_commands_containing("confd.sh stop");
    let op = Operation::Update(update_request(vec![app_file(&[("name", "world")])], &HOSTS));

    let outcome = run(&h, "task-update-1", &op);
    assert_eq!(outcome.state, TaskState::Failure);
    assert!(outcome
        .info
        .error
        .as_deref()
        .is_some_and(|error| error.contains("remote shell failed")));
    let record = h.ledger.get("task-update-1").expect("get").expect("record");
    assert_eq!(record.step, UpdateStep::Cleanup);
    assert_eq!(key(&h, "/prod/web/1.0/app.cfg/name"), None);
}

#[test]
fn acknowledge_prunes_expired_files_and_items() {
    let h = Harness::new(&HOSTS);
    seed_previous_release(&h);
    let update = Operation::Update(update_request(vec![app_file(&[("name", "world")])], &HOSTS));
    assert_eq!(run(&h, "task-update-1", &update).state, TaskState::Success);

    let expired_descriptor = format!("{DESCRIPTOR_DIR}/prod.web.1.0.old.cfg.toml");
    let expired_template = format!("{TEMPLATE_ROOT}/prod/web/1.0/old.cfg.tmpl");
    h.fleet
        .put_file("10.0.0.1", &expired_descriptor, "stale\n", "0775", "root");
    h.fleet
        .put_file("10.0.0.1", &expired_template, "stale\n", "0775", "root");

    let acknowledge = Operation::Acknowledge(follow_up("task-update-1"));
    h.engine.admit("task-ack-1", &acknowledge).expect("admit");
    let main = h.ledger.get("task-update-1").expect("get").expect("record");
    assert_eq!(main.ack_status, Some(AckStatus::Pending));
    assert_eq!(main.sub_task_id.as_deref(), Some("task-ack-1"));

    let outcome = h.engine.execute("task-ack-1", &acknowledge);
    assert_eq!(outcome.state, TaskState::Success, "{:?}", outcome.info);
    assert_eq!(outcome.info.message, "Task <task-update-1> has been acknowledged.");

    assert!(h.fleet.file("10.0.0.1", &expired_descriptor).is_none());
    assert!(h.fleet.file("10.0.0.1", &expired_template).is_none());
    assert!(h.fleet.file("10.0.0.1", APP_DESCRIPTOR).is_some());
    assert!(h.fleet.file("10.0.0.1", APP_TEMPLATE).is_some());
    assert!(h.fleet.file("10.0.0.1", API_DESCRIPTOR).is_some());
    assert_eq!(key(&h, "/prod/web/1.0/app.cfg/legacy"), None);
    assert_eq!(key(&h, "/prod/web/1.0/app.cfg/name").as_deref(), Some("world"));

    let main = h.ledger.get("task-update-1").expect("get").expect("record");
    assert_eq!(main.ack_status, Some(AckStatus::Passed));

    let again = Operation::Rollback(follow_up("task-update-1"));
    let err = h
        .engine
        .admit("task-rollback-1", &again)
        .expect_err("already settled");
    assert_eq!(err.status_code(), 403);
}

#[test]
fn rollback_restores_the_snapshot_files_and_items() {
    let h = Harness::new(&HOSTS);
    seed_previous_release(&h);
    let update = Operation::Update(update_request(
        vec![app_file(&[("name", "world"), ("extra", "1")])],
        &HOSTS,
    ));
    assert_eq!(run(&h, "task-update-1", &update).state, TaskState::Success);
    assert_eq!(key(&h, "/prod/web/1.0/app.cfg/extra").as_deref(), Some("1"));
    for host in HOSTS {
        h.fleet.put_file(host, RAW_FILE, "hello world\n", "0600", "root");
    }

    let rollback = Operation::Rollback(follow_up("task-update-1"));
    let outcome = run(&h, "task-rollback-1", &rollback);
    assert_eq!(outcome.state, TaskState::Success, "{:?}", outcome.info);

    assert_eq!(key(&h, "/prod/web/1.0/app.cfg/name").as_deref(), Some("there"));
    assert_eq!(key(&h, "/prod/web/1.0/app.cfg/legacy").as_deref(), Some("x"));
    assert_eq!(key(&h, "/prod/web/1.0/app.cfg/extra"), None);
    for host in HOSTS {
        assert_eq!(
            h.fleet.file(host, APP_DESCRIPTOR).expect("descriptor").content,
            "old descriptor\n"
        );
        assert_eq!(
            h.fleet.file(host, APP_TEMPLATE).expect("template").content,
            "old template\n"
        );
        let raw = h.fleet.file(host, RAW_FILE).expect("raw file");
        assert_eq!(raw.content, "hello there\n");
        assert_eq!(raw.mode, "0644");
        assert_eq!(raw.owner, "web");
        assert!(h.fleet.file(host, API_DESCRIPTOR).is_some());
        assert!(h.fleet.agent_running(host));
    }

    let main = h.ledger.get("task-update-1").expect("get").expect("record");
    assert_eq!(main.ack_status, Some(AckStatus::Rollbacked));
}

#[test]
fn check_reports_drift_per_host() {
    let h = Harness::new(&HOSTS);
    h.fleet.put_file("10.0.0.1", RAW_FILE, "hello there\n", "0644", "web");
    let op = Operation::Check(CheckRequest {
        files: vec![app_file(&[("name", "world")])],
        hosts: HOSTS.iter().map(|host| host.to_string()).collect(),
    });

    let outcome = run(&h, "task-check-1", &op);
    assert_eq!(outcome.state, TaskState::Success, "{:?}", outcome.info);
    let data = outcome.info.data.expect("reports");
    let first = &data[0]["app.cfg"]["10.0.0.1"];
    assert_ne!(first["content"], "OK");
    assert_eq!(first["content_expected"], "hello world");
    assert_eq!(first["content_actual"], "hello there");
    assert_eq!(first["mode"], "OK");
    assert_eq!(first["owner"], "OK");

    let second = &data[0]["app.cfg"]["10.0.0.2"];
    assert_eq!(second["mode"], "unknown != 0644");
    assert_eq!(second["owner"], "unknown != web:web");
    assert_eq!(second["content_actual"], "");
}

#[test]
fn duplicate_task_ids_are_rejected_at_admission() {
    let h = Harness::new(&HOSTS);
    let op = Operation::Check(CheckRequest {
        files: vec![app_file(&[])],
        hosts: vec!["10.0.0.1".to_string()],
    });
    h.engine.admit("task-check-1", &op).expect("first admit");
    let err = h
        .engine
        .admit("task-check-1", &op)
        .expect_err("duplicate id");
    assert_eq!(err.status_code(), 403);
}

/// Memory ledger whose next `failures` updates fail.
struct FlakyLedger {
    inner: Arc<MemoryTaskLedger>,
    failures: AtomicUsize,
}

impl TaskLedger for FlakyLedger {
    fn create(
        &self,
        task_id: &str,
        name: TaskName,
        arguments: &Value,
        now: i64,
    ) -> Result<TaskRecord, LedgerError> {
        self.inner.create(task_id, name, arguments, now)
    }

    fn update(&self, task_id: &str, patch: &TaskPatch) -> Result<Option<TaskRecord>, LedgerError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LedgerError::Poisoned);
        }
        self.inner.update(task_id, patch)
    }

    fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, LedgerError> {
        self.inner.get(task_id)
    }

    fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, LedgerError> {
        self.inner.list(filter)
    }
}

/// Admits an acknowledge of a finished update through a ledger that starts
/// failing updates once the follow-up begins executing.
fn acknowledge_through_flaky_ledger(h: &Harness, failures: usize) -> confwave::rollout::TaskOutcome {
    seed_previous_release(h);
    let update = Operation::Update(update_request(vec![app_file(&[("name", "world")])], &HOSTS));
    assert_eq!(run(h, "task-update-1", &update).state, TaskState::Success);

    let ledger = Arc::new(FlakyLedger {
        inner: h.ledger.clone(),
        failures: AtomicUsize::new(0),
    });
    let engine = WorkflowEngine::new(
        h.settings.clone(),
        ledger.clone(),
        h.fleet.clone(),
        h.keys.clone(),
        h.objects.clone(),
        EventLog::under_state_root(&h.settings.state_root),
    );
    let op = Operation::Acknowledge(follow_up("task-update-1"));
    engine.admit("task-ack-1", &op).expect("admit");
    ledger.failures.store(failures, Ordering::SeqCst);
    engine.execute("task-ack-1", &op)
}

#[test]
fn a_failed_first_ledger_write_still_ends_in_a_terminal_row() {
    let h = Harness::new(&HOSTS);
    let outcome = acknowledge_through_flaky_ledger(&h, 1);
    assert_eq!(outcome.state, TaskState::Failure);

    let row = h.ledger.get("task-ack-1").expect("get").expect("row");
    assert_eq!(row.state, TaskState::Failure);
    assert!(row.end_time.is_some());
    let info = row.info.expect("info");
    assert_eq!(info.current, PROGRESS_TOTAL);
    assert!(info.error.expect("error").contains("poisoned"));

    let main = h.ledger.get("task-update-1").expect("get").expect("main");
    assert_eq!(main.ack_status, Some(AckStatus::Passed));
}

#[test]
fn an_unrecorded_follow_up_leaves_the_main_task_claimed() {
    let h = Harness::new(&HOSTS);
    let outcome = acknowledge_through_flaky_ledger(&h, usize::MAX);
    assert_eq!(outcome.state, TaskState::Failure);

    let row = h.ledger.get("task-ack-1").expect("get").expect("row");
    assert!(!row.state.is_terminal());
    let main = h.ledger.get("task-update-1").expect("get").expect("main");
    assert_eq!(main.ack_status, Some(AckStatus::Pending));
    assert!(h.log_text().contains("guard.claim_orphaned"));
}

#[test]
fn abandoned_tasks_are_finalized_as_failures() {
    let h = Harness::new(&HOSTS);
    seed_previous_release(&h);
    let update = Operation::Update(update_request(vec![app_file(&[("name", "world")])], &HOSTS));
    assert_eq!(run(&h, "task-update-1", &update).state, TaskState::Success);

    let op = Operation::Rollback(follow_up("task-update-1"));
    h.engine.admit("task-rollback-1", &op).expect("admit");
    let outcome = h
        .engine
        .abandon("task-rollback-1", &op, "worker pool is stopped");
    assert_eq!(outcome.state, TaskState::Failure);

    let row = h.ledger.get("task-rollback-1").expect("get").expect("row");
    assert_eq!(row.state, TaskState::Failure);
    assert!(row.end_time.is_some());
    assert_eq!(
        row.info.and_then(|info| info.error).as_deref(),
        Some("task was not dispatched: worker pool is stopped")
    );
    let main = h.ledger.get("task-update-1").expect("get").expect("main");
    assert_eq!(main.ack_status, Some(AckStatus::Pending));
    assert!(h.log_text().contains("guard.claim_orphaned"));
}
