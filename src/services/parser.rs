//! Turns raw command output into typed metrics.
//!
//! Every function here is pure and total: malformed or empty input degrades
//! to a zero/default value instead of failing.

use crate::models::metrics::{Process, ResourceUsage, SecurityEvent, SecurityEventType, Severity};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

pub const MAX_SECURITY_EVENTS: usize = 10;
pub const MAX_PROCESSES: usize = 5;
pub const MAX_EVENT_MESSAGE_CHARS: usize = 120;

const HIGH_SEVERITY_KEYWORDS: [&str; 4] = ["Fail", "error", "invalid", "BREAK-IN"];

lazy_static! {
    static ref IPV4_RE: Regex =
        Regex::new(r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b")
            .unwrap();
}

/// Rounds to one decimal place, ties away from zero.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn parse_number(token: Option<&str>) -> f64 {
    token
        .and_then(|t| t.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
        .max(0.0)
}

pub fn parse_cpu(output: &str) -> f64 {
    round1(parse_number(output.split_whitespace().next()))
}

/// Parses a `<total> <used>` line in megabytes into gigabytes.
pub fn parse_usage(output: &str) -> ResourceUsage {
    let mut parts = output.split_whitespace();
    let total_mb = parse_number(parts.next());
    let used_mb = parse_number(parts.next());

    let percentage = if total_mb > 0.0 {
        used_mb / total_mb * 100.0
    } else {
        0.0
    };

    ResourceUsage {
        used: round1(used_mb / 1024.0),
        total: round1(total_mb / 1024.0),
        percentage: round1(percentage),
    }
}

pub fn text_or(output: &str, fallback: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn parse_load_average(output: &str) -> [f64; 3] {
    let mut parts = output.split_whitespace();
    let mut load = [0.0; 3];
    for slot in load.iter_mut() {
        *slot = parse_number(parts.next());
    }
    load
}

pub fn classify_event_type(line: &str) -> SecurityEventType {
    if line.contains("sshd") {
        SecurityEventType::SshAttempt
    } else {
        SecurityEventType::AuthFailure
    }
}

pub fn classify_severity(line: &str) -> Severity {
    if HIGH_SEVERITY_KEYWORDS.iter().any(|k| line.contains(k)) {
        Severity::High
    } else {
        Severity::Medium
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Classifies auth log lines (already newest-first) into security events.
pub fn parse_security_events(output: &str, captured_at: DateTime<Utc>) -> Vec<SecurityEvent> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(MAX_SECURITY_EVENTS)
        .enumerate()
        .map(|(idx, line)| SecurityEvent {
            id: format!("log-{}-{}", captured_at.timestamp_millis(), idx),
            event_type: classify_event_type(line),
            message: truncate_chars(line, MAX_EVENT_MESSAGE_CHARS),
            timestamp: captured_at,
            severity: classify_severity(line),
            source_ip: IPV4_RE.find(line).map(|m| m.as_str().to_string()),
        })
        .collect()
}

/// Stand-in event when none of the log sources produced output.
pub fn log_access_placeholder(captured_at: DateTime<Utc>) -> SecurityEvent {
    SecurityEvent {
        id: format!("log-{}-unavailable", captured_at.timestamp_millis()),
        event_type: SecurityEventType::AuthFailure,
        message: "No auth logs readable: the SSH user may lack permission for journalctl or /var/log/auth.log"
            .to_string(),
        timestamp: captured_at,
        severity: Severity::Low,
        source_ip: None,
    }
}

/// Parses `ps -eo pid,comm,%cpu,%mem,user` output, skipping the header line.
pub fn parse_processes(output: &str) -> Vec<Process> {
    output
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .take(MAX_PROCESSES)
        .map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            Process {
                pid: parts.first().and_then(|p| p.parse().ok()).unwrap_or(0),
                name: parts.get(1).unwrap_or(&"?").to_string(),
                cpu_percent: parse_number(parts.get(2).copied()),
                mem_percent: parse_number(parts.get(3).copied()),
                user: parts.get(4).unwrap_or(&"?").to_string(),
            }
        })
        .collect()
}

/// Splits the health probe's `<ip> <uptime...>` line.
pub fn parse_health(output: &str) -> (Option<String>, String) {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let (ip, uptime) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let ip = IPV4_RE
        .find(ip)
        .map(|m| m.as_str().to_string())
        .or_else(|| (!ip.is_empty() && ip.contains(':')).then(|| ip.to_string()));
    (ip, text_or(uptime, "Unknown"))
}
