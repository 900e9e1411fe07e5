use crate::rollout::agent::{AgentController, RemoteFileStat};
use crate::rollout::error::RolloutError;
use crate::rollout::request::ConfigFile;
use regex::{NoExpand, Regex};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const OK: &str = "OK";

/// Drift of one file on one host. Each compared field is `OK` or
/// `actual != expected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDrift {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_actual: Option<String>,
    pub mode: String,
    pub owner: String,
    pub last_modify_time: String,
}

pub type DriftReport = BTreeMap<String, BTreeMap<String, FileDrift>>;

fn placeholder(key: &str) -> Result<Regex, RolloutError> {
    Regex::new(&format!(r#"\{{\{{getv\s+"/{}"\}}\}}"#, regex::escape(key))).map_err(|err| {
        RolloutError::Placeholder {
            key: key.to_string(),
            reason: err.to_string(),
        }
    })
}

fn strip_line_endings(raw: &str) -> &str {
    raw.trim_end_matches(['\r', '\n'])
}

fn sha256_hex(raw: &str) -> String {
    Sha256::digest(raw.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Substitutes every item's `{{getv "/key"}}` token and strips trailing line
/// endings.
pub fn render_expected(file: &ConfigFile) -> Result<String, RolloutError> {
    let mut content = file.template.clone();
    for (key, value) in &file.items {
        content = placeholder(key)?
            .replace_all(&content, NoExpand(value))
            .into_owned();
    }
    Ok(strip_line_endings(&content).to_string())
}

/// Compares rendered `expected` against fetched `actual` content.
pub fn compare_content(expected: &str, actual: &str) -> (String, Option<String>, Option<String>) {
    let actual = strip_line_endings(actual);
    let expected_hash = sha256_hex(expected);
    let actual_hash = sha256_hex(actual);
    if expected_hash == actual_hash {
        return (OK.to_string(), None, None);
    }
    (
        format!("{actual_hash} != {expected_hash}"),
        Some(expected.to_string()),
        Some(actual.to_string()),
    )
}

/// Octal mode from an `ls`/`stat` permission string, e.g. `-rw-r--r--` -> `0644`.
pub fn mode_from_permissions(permissions: &str) -> Option<String> {
    let bits = permissions.get(1..10)?;
    let mut mode = String::from("0");
    for group in bits.as_bytes().chunks(3) {
        let mut digit = 0;
        for (index, flag) in group.iter().enumerate() {
            digit += match (index, flag) {
                (0, b'r') => 4,
                (1, b'w') => 2,
                (2, b'x' | b's' | b't') => 1,
                (_, b'-' | b'S' | b'T') => 0,
                _ => return None,
            };
        }
        mode.push(char::from(b'0' + digit));
    }
    Some(mode)
}

fn normalize_mode(mode: &str) -> String {
    format!("{:0>4}", mode.trim())
}

fn compare_mode(actual: Option<&str>, expected: &str) -> String {
    match actual {
        Some(actual) if normalize_mode(actual) == normalize_mode(expected) => OK.to_string(),
        Some(actual) => format!("{actual} != {expected}"),
        None => format!("unknown != {expected}"),
    }
}

fn compare_owner(stat: Option<&RemoteFileStat>, file: &ConfigFile) -> String {
    match stat {
        Some(stat) if stat.owner == file.owner.name && stat.group == file.owner.group => {
            OK.to_string()
        }
        Some(stat) => format!("{}:{} != {}", stat.owner, stat.group, file.owner),
        None => format!("unknown != {}", file.owner),
    }
}

/// Compares every declared file against what each host actually serves.
/// Observational only.
pub fn check_files(
    agent: &AgentController,
    files: &[ConfigFile],
    hosts: &[String],
) -> Result<DriftReport, RolloutError> {
    let mut report = DriftReport::new();
    for file in files {
        let path = file.dest_path();
        let expected = render_expected(file)?;
        let contents = agent.read_file(hosts, &path)?;
        let stats = agent.stat(hosts, &path)?;

        let mut per_host = BTreeMap::new();
        for host in hosts {
            let actual = contents.get(host).cloned().flatten().unwrap_or_default();
            let (content, content_expected, content_actual) = compare_content(&expected, &actual);
            let stat = stats.get(host).and_then(Option::as_ref);
            let mode = stat.and_then(|stat| mode_from_permissions(&stat.permissions));
            per_host.insert(
                host.clone(),
                FileDrift {
                    content,
                    content_expected,
                    content_actual,
                    mode: compare_mode(mode.as_deref(), &file.mode),
                    owner: compare_owner(stat, file),
                    last_modify_time: stat.map(|stat| stat.modified.clone()).unwrap_or_default(),
                },
            );
        }
        report.insert(file.name.clone(), per_host);
    }
    Ok(report)
}
