// ABOUTME: Tolerant decoding of runtime CLI output, JSON preferred with a table fallback
// ABOUTME: Rows shorter than the header line parse without error; missing fields take defaults

use crate::environment::{
    CpuUsage, DiskUsage, Environment, EnvironmentStatus, MemoryUsage, ResourceUsage,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Tagged result of the parser chain: structured decode first, whitespace
/// table keyed by its header row as the fallback.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedOutput {
    Json(Value),
    Table(Vec<HashMap<String, String>>),
}

pub fn parse_output(raw: &str) -> ParsedOutput {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() || value.is_array() {
            return ParsedOutput::Json(value);
        }
    }
    ParsedOutput::Table(parse_table(trimmed))
}

/// Whitespace-delimited table with the header row as field names.
/// Rows with fewer cells than headers simply omit the trailing fields.
fn parse_table(raw: &str) -> Vec<HashMap<String, String>> {
    let mut lines = raw.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let headers: Vec<String> = header
        .split_whitespace()
        .map(|h| h.to_ascii_lowercase())
        .collect();

    lines
        .map(|line| {
            let cells: Vec<&str> = line.split_whitespace().collect();
            headers
                .iter()
                .enumerate()
                .filter_map(|(i, key)| cells.get(i).map(|cell| (key.clone(), cell.to_string())))
                .collect()
        })
        .collect()
}

/// Flatten parsed output into uniform string records.
fn records(parsed: ParsedOutput) -> Vec<HashMap<String, String>> {
    match parsed {
        ParsedOutput::Table(rows) => rows,
        ParsedOutput::Json(Value::Array(items)) => {
            items.into_iter().filter_map(object_to_record).collect()
        }
        ParsedOutput::Json(value) => object_to_record(value).into_iter().collect(),
    }
}

fn object_to_record(value: Value) -> Option<HashMap<String, String>> {
    let map = value.as_object()?;
    Some(
        map.iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), value_to_string(v)))
            .collect(),
    )
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Decode a list of environments from raw runtime output.
///
/// JSON output decodes through serde directly (tolerating partial objects);
/// table output maps header names onto environment fields. Rows without a
/// name are dropped, everything else is defaulted rather than rejected.
pub fn parse_environments(raw: &str) -> Vec<Environment> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if let Ok(envs) = serde_json::from_str::<Vec<Environment>>(trimmed) {
        return envs.into_iter().filter(|e| !e.name.is_empty()).collect();
    }
    if let Ok(env) = serde_json::from_str::<Environment>(trimmed) {
        if !env.name.is_empty() {
            return vec![env];
        }
    }

    records(parse_output(trimmed))
        .into_iter()
        .filter_map(environment_from_record)
        .collect()
}

/// Decode a single environment, taking the first record if several appear.
pub fn parse_environment(raw: &str) -> Option<Environment> {
    parse_environments(raw).into_iter().next()
}

fn environment_from_record(record: HashMap<String, String>) -> Option<Environment> {
    let name = record.get("name")?.clone();
    if name.is_empty() {
        return None;
    }

    let mut env = Environment {
        name,
        ..Default::default()
    };

    env.status = record
        .get("status")
        .map(|s| EnvironmentStatus::parse(s))
        .unwrap_or(EnvironmentStatus::Error);
    if let Some(branch) = record.get("branch") {
        if !branch.is_empty() {
            env.branch = branch.clone();
        }
    }
    if let Some(image) = record.get("image").or_else(|| record.get("baseimage")) {
        env.base_image = image.clone();
    }
    if let Some(workdir) = record
        .get("workdir")
        .or_else(|| record.get("workingdirectory"))
    {
        env.working_directory = workdir.clone();
    }
    if let Some(commit) = record.get("commit").or_else(|| record.get("gitcommit")) {
        env.git_commit = Some(commit.clone());
    }
    if let Some(created) = record.get("created").or_else(|| record.get("createdat")) {
        if let Some(ts) = parse_timestamp(created) {
            env.created_at = ts;
        }
    }
    if let Some(ports) = record.get("ports") {
        env.ports = ports
            .split(',')
            .filter_map(|p| p.trim().parse::<u16>().ok())
            .collect();
    }

    Some(env)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Decode a resource usage snapshot from the runtime's stats output.
///
/// Returns `None` when nothing usable could be extracted; the monitor maps
/// that to a zeroed snapshot so a malformed sample never crashes the host.
pub fn parse_usage(raw: &str) -> Option<ResourceUsage> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(usage) = serde_json::from_str::<ResourceUsage>(trimmed) {
        return Some(usage);
    }

    let rows = match parse_output(trimmed) {
        ParsedOutput::Table(rows) => rows,
        ParsedOutput::Json(_) => {
            debug!("Stats output was JSON but not a usage document");
            return None;
        }
    };
    let row = rows.into_iter().next()?;

    let cpu_pct = row.get("cpu").and_then(|v| parse_pct(v)).unwrap_or(0.0);
    let mem_used = row
        .get("mem_used")
        .or_else(|| row.get("memused"))
        .and_then(|v| parse_size(v))
        .unwrap_or(0);
    let mem_limit = row
        .get("mem_limit")
        .or_else(|| row.get("memlimit"))
        .and_then(|v| parse_size(v))
        .unwrap_or(0);
    let disk_used = row
        .get("disk_used")
        .or_else(|| row.get("diskused"))
        .and_then(|v| parse_size(v))
        .unwrap_or(0);
    let disk_avail = row
        .get("disk_avail")
        .or_else(|| row.get("diskavail"))
        .and_then(|v| parse_size(v))
        .unwrap_or(0);

    if cpu_pct == 0.0 && mem_used == 0 && mem_limit == 0 && disk_used == 0 && disk_avail == 0 {
        return None;
    }

    let mem_pct = if mem_limit > 0 {
        (mem_used as f64 / mem_limit as f64) * 100.0
    } else {
        0.0
    };

    Some(ResourceUsage {
        memory: MemoryUsage {
            used_bytes: mem_used,
            limit_bytes: mem_limit,
            pct: mem_pct,
        },
        cpu: CpuUsage { pct: cpu_pct },
        disk: DiskUsage {
            used_bytes: disk_used,
            available_bytes: disk_avail,
        },
    })
}

fn parse_pct(raw: &str) -> Option<f64> {
    raw.trim().trim_end_matches('%').parse::<f64>().ok()
}

/// Parse sizes like "512", "256MiB", "1.5GB" into bytes.
fn parse_size(raw: &str) -> Option<u64> {
    let s = raw.trim();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let number: f64 = s[..digits_end].parse().ok()?;
    let unit = s[digits_end..].trim().to_ascii_lowercase();
    let multiplier: f64 = match unit.as_str() {
        "" | "b" => 1.0,
        "k" | "kb" | "kib" => 1024.0,
        "m" | "mb" | "mib" => 1024.0 * 1024.0,
        "g" | "gb" | "gib" => 1024.0 * 1024.0 * 1024.0,
        "t" | "tb" | "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((number * multiplier) as u64)
}
