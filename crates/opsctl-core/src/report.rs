//! Human-readable and structured diagnostics for a reconcile.
//!
//! The reconciler calls a [`Reporter`] as things happen: every mutation
//! intent before the provider call, every error right after it. An
//! interrupted run therefore leaves a complete trail.

use crate::error::OpsError;
use crate::locator::SecurityGroup;
use crate::reconcile::{NoOpKind, Outcome, ReconcileResult};
use crate::types::{Direction, Rule};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ALLOW_NOOP_MESSAGE: &str = "no changes: all IPs already present";

pub fn deny_noop_message(label: &str) -> String {
    format!("no changes: no IPs found to delete for {label}")
}

pub fn noop_message(kind: NoOpKind, label: &str) -> String {
    match kind {
        NoOpKind::AllowNoop => ALLOW_NOOP_MESSAGE.to_string(),
        NoOpKind::DenyNoop => deny_noop_message(label),
    }
}

// ---------------------------------------------------------------------------
// ReportLine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportLine {
    pub level: LineLevel,
    pub text: String,
}

impl ReportLine {
    fn info(text: String) -> Self {
        Self {
            level: LineLevel::Info,
            text,
        }
    }
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// `203.0.113.7/32 → [22, 443], 198.51.100.1/32 → [22]`
pub fn format_cidr_ports(rules: &[Rule]) -> String {
    let mut by_cidr: BTreeMap<&str, Vec<u16>> = BTreeMap::new();
    for r in rules {
        by_cidr.entry(r.cidr.as_str()).or_default().push(r.port);
    }
    by_cidr
        .into_iter()
        .map(|(cidr, mut ports)| {
            ports.sort_unstable();
            ports.dedup();
            let ports: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
            format!("{cidr} → [{}]", ports.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn format_intent(direction: Direction, label: &str, group: &SecurityGroup, rules: &[Rule]) -> String {
    format!(
        "{direction} {label} {} ({}): {}",
        group.logical_name,
        group.provider_id,
        format_cidr_ports(rules)
    )
}

pub fn format_unexpected(logical_name: &str, rule: &Rule) -> String {
    format!(
        "warning: {logical_name} has unexpected port {} for {} ({})",
        rule.port, rule.label, rule.cidr
    )
}

pub fn format_skipped(logical_name: &str, rule: &Rule) -> String {
    format!(
        "{logical_name}: {} already present on port {}",
        rule.cidr, rule.port
    )
}

pub fn format_error(logical_name: &str, provider_id: Option<&str>, error: &OpsError) -> String {
    match provider_id {
        Some(id) => format!("error: {logical_name} ({id}): {error}"),
        None => format!("error: {logical_name}: {error}"),
    }
}

/// Closing lines for a finished reconcile.
pub fn render_summary(result: &ReconcileResult) -> Vec<ReportLine> {
    let s = &result.summary;
    let tally = format!(
        "{} group(s) ok, {} group(s) failed, {} change(s)",
        s.ok_groups, s.failed_groups, s.total_changes
    );
    match result.outcome {
        Outcome::NoChanges { reason } => vec![
            ReportLine::info(noop_message(reason, &result.label)),
            ReportLine::info(tally),
        ],
        Outcome::Applied => vec![ReportLine::info(tally)],
        Outcome::PartialSuccess | Outcome::Failed => vec![ReportLine {
            level: LineLevel::Error,
            text: tally,
        }],
        Outcome::Cancelled => vec![
            ReportLine {
                level: LineLevel::Warning,
                text: format!(
                    "cancelled after {} of the environment's groups",
                    result.groups.len()
                ),
            },
            ReportLine {
                level: LineLevel::Warning,
                text: tally,
            },
        ],
    }
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

/// Receives reconcile events in the order they occur.
pub trait Reporter {
    fn unexpected_port(&mut self, logical_name: &str, rule: &Rule);
    fn skipped_existing(&mut self, logical_name: &str, rule: &Rule);
    /// Called before the provider call that applies `rules`.
    fn intent(&mut self, direction: Direction, group: &SecurityGroup, rules: &[Rule]);
    fn group_error(&mut self, logical_name: &str, provider_id: Option<&str>, error: &OpsError);
    fn finished(&mut self, result: &ReconcileResult);
}

/// Prints to stdout/stderr and emits a `tracing` event per line.
///
/// With `quiet` set only the tracing events are emitted (used for `--json`).
pub struct ConsoleReporter {
    quiet: bool,
}

impl ConsoleReporter {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl Reporter for ConsoleReporter {
    fn unexpected_port(&mut self, logical_name: &str, rule: &Rule) {
        tracing::warn!(group = logical_name, port = rule.port, label = %rule.label, cidr = %rule.cidr, "unexpected port");
        if !self.quiet {
            eprintln!("{}", format_unexpected(logical_name, rule));
        }
    }

    fn skipped_existing(&mut self, logical_name: &str, rule: &Rule) {
        tracing::info!(group = logical_name, port = rule.port, cidr = %rule.cidr, "already present");
        if !self.quiet {
            println!("{}", format_skipped(logical_name, rule));
        }
    }

    fn intent(&mut self, direction: Direction, group: &SecurityGroup, rules: &[Rule]) {
        let label = rules.first().map(|r| r.label.as_str()).unwrap_or_default();
        tracing::info!(
            direction = %direction,
            label,
            group = %group.logical_name,
            group_id = %group.provider_id,
            rules = rules.len(),
            "applying"
        );
        if !self.quiet {
            println!("{}", format_intent(direction, label, group, rules));
        }
    }

    fn group_error(&mut self, logical_name: &str, provider_id: Option<&str>, error: &OpsError) {
        tracing::error!(group = logical_name, group_id = ?provider_id, kind = ?error.kind(), "{error}");
        if !self.quiet {
            eprintln!("{}", format_error(logical_name, provider_id, error));
        }
    }

    fn finished(&mut self, result: &ReconcileResult) {
        tracing::info!(
            direction = %result.direction,
            label = %result.label,
            env = %result.environment,
            changes = result.summary.total_changes,
            failed = result.summary.failed_groups,
            "reconcile finished"
        );
        if self.quiet {
            return;
        }
        for line in render_summary(result) {
            match line.level {
                LineLevel::Info => println!("{}", line.text),
                LineLevel::Warning | LineLevel::Error => eprintln!("{}", line.text),
            }
        }
    }
}

/// Collects lines in memory; for tests and embedders that render elsewhere.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    pub lines: Vec<ReportLine>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter(|l| l.level == LineLevel::Warning)
            .map(|l| l.text.as_str())
    }

    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter(|l| l.level == LineLevel::Error)
            .map(|l| l.text.as_str())
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|l| l.text.contains(needle))
    }
}

impl Reporter for MemoryReporter {
    fn unexpected_port(&mut self, logical_name: &str, rule: &Rule) {
        self.lines.push(ReportLine {
            level: LineLevel::Warning,
            text: format_unexpected(logical_name, rule),
        });
    }

    fn skipped_existing(&mut self, logical_name: &str, rule: &Rule) {
        self.lines
            .push(ReportLine::info(format_skipped(logical_name, rule)));
    }

    fn intent(&mut self, direction: Direction, group: &SecurityGroup, rules: &[Rule]) {
        let label = rules.first().map(|r| r.label.as_str()).unwrap_or_default();
        self.lines
            .push(ReportLine::info(format_intent(direction, label, group, rules)));
    }

    fn group_error(&mut self, logical_name: &str, provider_id: Option<&str>, error: &OpsError) {
        self.lines.push(ReportLine {
            level: LineLevel::Error,
            text: format_error(logical_name, provider_id, error),
        });
    }

    fn finished(&mut self, result: &ReconcileResult) {
        self.lines.extend(render_summary(result));
    }
}
