//! Time and record budgets for one invocation.
//!
//! A run may be bounded by a record count and by two deadlines: one measured
//! from the start of the run itself (`processing_time`) and one measured from
//! an invocation start supplied by whoever drives the engine
//! (`php_process_time`), so that a chain of runs inside one scheduler slot
//! shares a single allowance.

use serde_json::Value;
use std::time::{Duration, Instant};

use crate::config::ProcessingLimit;

/// The two time bases a run is measured against.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    /// When the surrounding invocation (e.g. a cron job) started
    pub invocation_started: Instant,
    /// When this run started
    pub run_started: Instant,
}

impl RunClock {
    /// A run starting now inside an invocation that started at `invocation_started`.
    pub fn new(invocation_started: Instant) -> Self {
        Self {
            invocation_started,
            run_started: Instant::now(),
        }
    }

    /// A run that is its own invocation.
    pub fn starting_now() -> Self {
        let now = Instant::now();
        Self {
            invocation_started: now,
            run_started: now,
        }
    }
}

/// Why a run stopped before its source was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStop {
    InvocationTime,
    ProcessingTime,
    RecordCount,
}

impl std::fmt::Display for BudgetStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetStop::InvocationTime => write!(f, "invocation time limit"),
            BudgetStop::ProcessingTime => write!(f, "processing time limit"),
            BudgetStop::RecordCount => write!(f, "record count limit"),
        }
    }
}

/// Limits for one run, resolved to absolute deadlines.
///
/// Once a limit has been hit the budget stays exhausted.
#[derive(Debug, Clone, Default)]
pub struct Budget {
    invocation_deadline: Option<Instant>,
    processing_deadline: Option<Instant>,
    record_limit: Option<u64>,
    stopped: Option<BudgetStop>,
}

impl Budget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Resolve configured limits against `clock`.
    ///
    /// Unparseable time limits are logged and ignored.
    pub fn prepare(limits: &ProcessingLimit, clock: &RunClock) -> Self {
        let processing_deadline = resolve_deadline(
            "processing_time",
            limits.processing_time.as_ref(),
            clock.run_started,
        );
        let invocation_deadline = resolve_deadline(
            "php_process_time",
            limits.process_time.as_ref(),
            clock.invocation_started,
        );

        Self {
            invocation_deadline,
            processing_deadline,
            record_limit: limits.record_count,
            stopped: None,
        }
    }

    pub fn with_record_limit(mut self, limit: u64) -> Self {
        self.record_limit = (limit > 0).then_some(limit);
        self
    }

    pub fn with_processing_deadline(mut self, deadline: Instant) -> Self {
        self.processing_deadline = Some(deadline);
        self
    }

    pub fn with_invocation_deadline(mut self, deadline: Instant) -> Self {
        self.invocation_deadline = Some(deadline);
        self
    }

    /// Should another record be processed, given how many records this
    /// session has consumed so far?
    pub fn should_process_more(&mut self, session_records: u64) -> bool {
        self.check_at(Instant::now(), session_records)
    }

    /// [`Budget::should_process_more`] against an explicit clock reading.
    pub fn check_at(&mut self, now: Instant, session_records: u64) -> bool {
        if self.stopped.is_some() {
            return false;
        }

        let stop = if self.invocation_deadline.is_some_and(|d| now >= d) {
            Some(BudgetStop::InvocationTime)
        } else if self.processing_deadline.is_some_and(|d| now >= d) {
            Some(BudgetStop::ProcessingTime)
        } else if self.record_limit.is_some_and(|l| session_records >= l) {
            Some(BudgetStop::RecordCount)
        } else {
            None
        };

        if let Some(reason) = stop {
            tracing::info!(session_records, "Stopping: {} reached", reason);
            self.stopped = Some(reason);
            return false;
        }
        true
    }

    /// The limit that ended the run, if any.
    pub fn stop_reason(&self) -> Option<BudgetStop> {
        self.stopped
    }
}

fn resolve_deadline(key: &str, value: Option<&Value>, base: Instant) -> Option<Instant> {
    let value = value?;
    match parse_time_limit(value) {
        Ok(limit) => limit.and_then(|limit| base.checked_add(limit)),
        Err(reason) => {
            tracing::warn!(
                option = key,
                value = %value,
                "Ignoring unparseable time limit: {}",
                reason
            );
            None
        }
    }
}

/// Parse a time limit; `Ok(None)` means no limit (absent, null or zero).
pub fn parse_time_limit(value: &Value) -> Result<Option<Duration>, String> {
    if value.is_null() {
        return Ok(None);
    }
    if value.as_str().is_some_and(|s| s.trim().is_empty()) {
        return Ok(None);
    }
    let duration = parse_duration(value)?;
    Ok((!duration.is_zero()).then_some(duration))
}

/// Parse seconds (number or numeric string) or a time expression such as
/// `"90 sec"`, `"2 minutes"` or `"1h 30m"`.
pub fn parse_duration(value: &Value) -> Result<Duration, String> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64().ok_or_else(|| format!("'{n}' is not a number"))?;
            seconds(secs)
        }
        Value::String(s) => parse_expression(s),
        other => Err(format!("'{other}' is not a time value")),
    }
}

fn seconds(secs: f64) -> Result<Duration, String> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("'{secs}' is not a valid number of seconds"));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| format!("'{secs}' seconds is out of range"))
}

fn parse_expression(input: &str) -> Result<Duration, String> {
    let text = input.trim();
    let text = text.strip_prefix('+').unwrap_or(text).trim_start();
    if let Ok(secs) = text.parse::<f64>() {
        return seconds(secs);
    }

    let mut total = 0.0_f64;
    let mut rest = text;
    let mut terms = 0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("cannot parse time expression '{input}'"));
        }
        let amount: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("cannot parse time expression '{input}'"))?;
        rest = rest[number_len..].trim_start();

        let unit_len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let factor = unit_factor(&rest[..unit_len])
            .ok_or_else(|| format!("unknown time unit '{}' in '{input}'", &rest[..unit_len]))?;
        total += amount * factor;
        terms += 1;

        rest = rest[unit_len..].trim_start_matches(|c: char| c.is_whitespace() || c == ',');
    }

    if terms == 0 {
        return Err(format!("cannot parse time expression '{input}'"));
    }
    seconds(total)
}

fn unit_factor(unit: &str) -> Option<f64> {
    let factor = match unit.to_ascii_lowercase().as_str() {
        "ms" | "msec" | "millisecond" | "milliseconds" => 0.001,
        "s" | "sec" | "secs" | "second" | "seconds" => 1.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3600.0,
        "d" | "day" | "days" => 86400.0,
        _ => return None,
    };
    Some(factor)
}
