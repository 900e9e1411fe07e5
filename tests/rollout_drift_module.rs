mod support;

use confwave::rollout::agent::AgentController;
use confwave::rollout::drift::{check_files, compare_content, render_expected, OK};
use confwave::shared::EventLog;
use std::sync::Arc;
use support::{app_file, settings_in, FakeFleet};
use tempfile::tempdir;

#[test]
fn expected_content_substitutes_every_placeholder() {
    let mut file = app_file(&[("name", "world"), ("port", "8$1")]);
    file.template = "hello {{getv \"/name\"}}\nport={{getv   \"/port\"}}\r\n\n".to_string();
    assert_eq!(
        render_expected(&file).expect("render"),
        "hello world\nport=8$1"
    );
}

#[test]
fn content_differences_report_both_sides() {
    assert_eq!(compare_content("hello world", "hello world\n").0, OK);
    let (content, expected, actual) = compare_content("hello world", "hello there\n");
    assert!(content.contains(" != "));
    assert_eq!(expected.as_deref(), Some("hello world"));
    assert_eq!(actual.as_deref(), Some("hello there"));
}

#[test]
fn check_files_compares_content_mode_and_owner() {
    let tmp = tempdir().expect("tempdir");
    let settings = settings_in(tmp.path());
    let fleet = Arc::new(FakeFleet::new(settings.agent.commands.clone(), &["h1", "h2"]));
    fleet.put_file("h1", "/etc/web/app.cfg", "hello world\n", "644", "web");
    fleet.put_file("h2", "/etc/web/app.cfg", "hello world", "0600", "root");
    let agent = AgentController::new(fleet, settings.agent.clone(), EventLog::disabled());

    let report = check_files(
        &agent,
        &[app_file(&[("name", "world")])],
        &["h1".to_string(), "h2".to_string()],
    )
    .expect("check");
    let h1 = &report["app.cfg"]["h1"];
    assert_eq!(h1.content, OK);
    assert_eq!(h1.mode, OK);
    assert_eq!(h1.owner, OK);
    assert_eq!(h1.last_modify_time, "2024-05-06 07:08:09.000000000 +0000");

    let h2 = &report["app.cfg"]["h2"];
    assert_eq!(h2.content, OK);
    assert_eq!(h2.mode, "0600 != 0644");
    assert_eq!(h2.owner, "root:root != web:web");
}
