use crate::config::load_global_settings;
use crate::ledger::{TaskFilter, TaskName};
use crate::rollout::{CheckRequest, FollowUpRequest, Operation, UpdateRequest};
use crate::runtime::RolloutService;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Run,
    Query,
    List,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "run" => CliVerb::Run,
        "query" => CliVerb::Query,
        "list" => CliVerb::List,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

pub fn help_text() -> String {
    [
        "Commands:",
        "  run update <request.yaml>            Back up, then roll out new configuration",
        "  run check <request.yaml>             Compare deployed files against their templates",
        "  run acknowledge <main-task-id>       Accept an update and prune expired files/items",
        "  run rollback <main-task-id>          Restore the snapshot taken by an update",
        "  query <task-id>                      Print one task record",
        "  list [update|check|acknowledge|rollback]",
        "                                       Print task records, newest first",
    ]
    .join("\n")
}

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    if args.is_empty() {
        return Ok(help_text());
    }
    match parse_cli_verb(args[0].as_str()) {
        CliVerb::Run => cmd_run(&args[1..]),
        CliVerb::Query => cmd_query(&args[1..]),
        CliVerb::List => cmd_list(&args[1..]),
        CliVerb::Help => Ok(help_text()),
        CliVerb::Unknown => Err(format!("unknown command `{}`", args[0])),
    }
}

fn open_service() -> Result<RolloutService, String> {
    let settings = load_global_settings().map_err(|e| e.to_string())?;
    RolloutService::from_settings(settings).map_err(|e| e.to_string())
}

fn to_pretty_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| e.to_string())
}

fn read_request<T: DeserializeOwned>(path: &Path) -> Result<T, String> {
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    serde_yaml::from_str(&raw).map_err(|e| format!("invalid request {}: {e}", path.display()))
}

/// Builds the operation named by `args[0]` from `args[1]`.
pub fn parse_operation(args: &[String]) -> Result<Operation, String> {
    let [name, target] = args else {
        return Err("usage: run <update|check|acknowledge|rollback> <request.yaml|task-id>".to_string());
    };
    let follow_up = || FollowUpRequest {
        main_task_id: target.clone(),
    };
    match TaskName::parse(name)? {
        TaskName::Update => Ok(Operation::Update(read_request::<UpdateRequest>(
            Path::new(target),
        )?)),
        TaskName::Check => Ok(Operation::Check(read_request::<CheckRequest>(Path::new(
            target,
        ))?)),
        TaskName::Acknowledge => Ok(Operation::Acknowledge(follow_up())),
        TaskName::Rollback => Ok(Operation::Rollback(follow_up())),
    }
}

fn cmd_run(args: &[String]) -> Result<String, String> {
    let operation = parse_operation(args)?;
    let service = open_service()?;
    let outcome = service.run_inline(operation).map_err(|e| e.to_string())?;
    let record = service
        .query(&outcome.task_id)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("task `{}` vanished", outcome.task_id))?;
    service.shutdown();
    to_pretty_json(&record)
}

fn cmd_query(args: &[String]) -> Result<String, String> {
    let [task_id] = args else {
        return Err("usage: query <task-id>".to_string());
    };
    let service = open_service()?;
    let record = service
        .query(task_id)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("task `{task_id}` not found"))?;
    service.shutdown();
    to_pretty_json(&record)
}

fn cmd_list(args: &[String]) -> Result<String, String> {
    let filter = match args {
        [] => TaskFilter::all(),
        [name] => TaskFilter::named(TaskName::parse(name)?),
        _ => return Err("usage: list [update|check|acknowledge|rollback]".to_string()),
    };
    let service = open_service()?;
    let records = service.list(&filter).map_err(|e| e.to_string())?;
    service.shutdown();
    to_pretty_json(&records)
}
