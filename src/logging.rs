//! Logging setup and the error/warning summary.
//!
//! nimp logs through `tracing`. Regular events go to stderr as
//! `<time> [LEVEL] message`; child process output is logged under the
//! [`CHILD_TARGET`] target and printed verbatim to stdout.
//!
//! When `--summary` is given a [`SummaryLayer`] is installed as well. It
//! keeps every error and warning, plus lines of child output matching the
//! compiler/SDK error patterns, with a few lines of context. The summary is
//! written at exit and turns a successful run into exit code 2 when
//! anything was captured.
//!
//! # Usage
//!
//! ```rust,ignore
//! let summary = nimp::logging::init(verbose, true)?;
//! summary.extend_patterns(&config.summary);
//! // ... run the command ...
//! summary.write_to("summary.txt")?;
//! ```

use anyhow::{Context as _, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter, fmt, EnvFilter, Layer};

/// Target used for lines coming from child processes.
pub const CHILD_TARGET: &str = "child_process";

/// Lines of context kept before each summary entry.
const CONTEXT_LINES: usize = 4;

const ERROR_PATTERNS: &[&str] = &[
    // GCC
    r"[/\w\W\-. ]+:\d+:\d+: (fatal )?error: .*",
    r"[/\w\W\-. ]+:\d+: undefined reference to .*",
    // Clang
    r"[/\w\W\-. ]+\(\d+,\d+\): (fatal ?)error : .*",
    r"[/\w\W\-. ]+ : error : [A-Z0-9]+: reference to undefined symbol.*",
    r"duplicate symbol \w+ in:",
    r".*: multiple definition of ",
    r"clang: error: no such file or directory:.*",
    // .NET / Mono
    r"[/\w\W\-. ]+\(\d+,\d+\) : error [A-Z\d]+: .*",
    // MSVC
    r"[/\w\W\-. ]+\(\d+\): error [A-Z\d]+: .*",
    r"[/\w\W\-. ]+ : error [A-Z\d]+: unresolved external symbol .*",
    // Orbis
    r"\[Error\]\t.*",
    // Xbox packaging
    r" - Error Code: .*",
    r"Package was not created, error = .*",
    r"Chunk [0-9]+ is invalid: it contains 0 files\.",
    r"The layout contained an invalid chunk\.",
    r"Chunks must contain at least 1 non-empty file\.",
    r"FileGroup .* did not match any files\.",
];

const WARNING_PATTERNS: &[&str] = &[
    r"[/\w\W\-.: ]+\(\d+,\d+\) : warning [A-Z\d]+: .*",
    r"[/\w\W\-.: ]+:\d+:\d+: warning: .*",
    r"[/\w\W\-.: ]+\(\d+,\d+\): warning : .*",
    r"[/\w\W\-.: ]+\(\d+\): warning [A-Z\d]+: .*",
    r"\[Warn\]\t.*",
];

const IGNORE_PATTERNS: &[&str] =
    &[r"  WARNING - appdata.bin is being created automatically for this package"];

/// Extra patterns from the `[summary]` section of `.nimp.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct SummaryConfig {
    pub error_patterns: Vec<String>,
    pub warning_patterns: Vec<String>,
    pub ignore_patterns: Vec<String>,
    /// Patterns with a `message` group used to shorten context lines.
    pub context_patterns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Error,
    Warning,
}

#[derive(Default)]
struct SummaryState {
    error_patterns: Vec<Regex>,
    warning_patterns: Vec<Regex>,
    ignore_patterns: Vec<Regex>,
    context_patterns: Vec<Regex>,
    context: VecDeque<String>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

/// Shared error/warning collector.
#[derive(Clone, Default)]
pub struct Summary {
    state: Arc<Mutex<SummaryState>>,
}

impl Summary {
    /// Collector with the built-in compiler and SDK patterns.
    pub fn new() -> Self {
        let state = SummaryState {
            error_patterns: compile_all(ERROR_PATTERNS.iter().copied()),
            warning_patterns: compile_all(WARNING_PATTERNS.iter().copied()),
            ignore_patterns: compile_all(IGNORE_PATTERNS.iter().copied()),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SummaryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add project-specific patterns. Invalid patterns are reported and skipped.
    pub fn extend_patterns(&self, config: &SummaryConfig) {
        // Compiling may log, and logging takes the lock.
        let errors = compile_all(config.error_patterns.iter().map(String::as_str));
        let warnings = compile_all(config.warning_patterns.iter().map(String::as_str));
        let ignores = compile_all(config.ignore_patterns.iter().map(String::as_str));
        let contexts = compile_all(config.context_patterns.iter().map(String::as_str));

        let mut state = self.lock();
        state.error_patterns.extend(errors);
        state.warning_patterns.extend(warnings);
        state.ignore_patterns.extend(ignores);
        state.context_patterns.extend(contexts);
    }

    /// Classify one log line.
    pub fn record(&self, level: Level, message: &str) {
        let mut state = self.lock();

        if state.ignore_patterns.iter().any(|p| p.is_match(message)) {
            state.push_context(message);
            return;
        }

        if level == Level::ERROR {
            state.push_entry(Severity::Error, message.to_string());
            return;
        }
        if level == Level::WARN {
            state.push_entry(Severity::Warning, message.to_string());
            return;
        }

        state.push_context(message);
        if let Some(text) = match_message(&state.error_patterns, message) {
            state.push_entry(Severity::Error, text);
        } else if let Some(text) = match_message(&state.warning_patterns, message) {
            state.push_entry(Severity::Warning, text);
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.lock().errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.lock().warnings.is_empty()
    }

    /// Summary text: errors first, then warnings.
    pub fn render(&self) -> String {
        let state = self.lock();
        let mut out = String::new();
        for line in state.errors.iter().chain(state.warnings.iter()) {
            out.push_str(line);
        }
        out
    }

    /// Write the summary to `stdout` (case-insensitive) or to a file.
    pub fn write_to(&self, destination: &str) -> Result<()> {
        let text = self.render();
        if destination.eq_ignore_ascii_case("stdout") {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(text.as_bytes())?;
            stdout.flush()?;
        } else {
            fs::write(Path::new(destination), text)
                .with_context(|| format!("Failed to write summary to {}", destination))?;
        }
        Ok(())
    }
}

impl SummaryState {
    fn push_context(&mut self, message: &str) {
        let mut text = message.to_string();
        for pattern in &self.context_patterns {
            if let Some(captures) = pattern.captures(message) {
                if let Some(m) = captures.name("message") {
                    text = m.as_str().to_string();
                    break;
                }
            }
        }
        if self.context.len() == CONTEXT_LINES {
            self.context.pop_front();
        }
        self.context.push_back(text);
    }

    fn push_entry(&mut self, severity: Severity, message: String) {
        let mut lines = vec!["\n *********************************************\n".to_string()];
        if self.context.len() == CONTEXT_LINES {
            while let Some(line) = self.context.pop_front() {
                lines.push(format!("[  NOTIF  ] {}\n", line));
            }
        }
        let tag = match severity {
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
        };
        lines.push(format!("[ {} ] {}\n", tag, message));

        let entries = match severity {
            Severity::Error => &mut self.errors,
            Severity::Warning => &mut self.warnings,
        };
        entries.extend(lines);
    }
}

fn match_message(patterns: &[Regex], message: &str) -> Option<String> {
    patterns.iter().find_map(|pattern| {
        pattern.captures(message).map(|captures| {
            captures
                .name("message")
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| message.to_string())
        })
    })
}

/// Patterns match from the start of the line.
fn compile_all<'a>(patterns: impl Iterator<Item = &'a str>) -> Vec<Regex> {
    patterns
        .filter_map(|pattern| match Regex::new(&format!("^(?:{})", pattern)) {
            Ok(regex) => Some(regex),
            Err(e) => {
                tracing::error!("Error while compiling pattern {}: {}", pattern, e);
                None
            }
        })
        .collect()
}

/// Layer feeding every event into a [`Summary`].
pub struct SummaryLayer {
    summary: Summary,
}

impl SummaryLayer {
    pub fn new(summary: Summary) -> Self {
        Self { summary }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for SummaryLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.summary.record(*event.metadata().level(), &visitor.message);
    }
}

/// Install the global subscriber.
///
/// The filter comes from `NIMP_LOG`, defaulting to `info` (`debug` with
/// `verbose`). `NIMP_LOG_FILE` appends every event to a file. The returned
/// [`Summary`] only collects when `collect_summary` is set.
pub fn init(verbose: bool, collect_summary: bool) -> Result<Summary> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_env("NIMP_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let is_child = |metadata: &tracing::Metadata<'_>| metadata.target() == CHILD_TARGET;

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter::filter_fn(move |metadata| !is_child(metadata)));

    let child_output = fmt::layer()
        .with_writer(std::io::stdout)
        .without_time()
        .with_level(false)
        .with_target(false)
        .with_filter(filter::filter_fn(is_child));

    let log_file = match std::env::var_os("NIMP_LOG_FILE") {
        Some(path) => {
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", Path::new(&path).display()))?;
            Some(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        }
        None => None,
    };

    let summary = Summary::new();
    let summary_layer = collect_summary.then(|| SummaryLayer::new(summary.clone()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(child_output)
        .with(log_file)
        .with(summary_layer)
        .try_init()
        .context("Failed to install the logging subscriber")?;

    Ok(summary)
}

/// Exit code for a run that returned successfully.
pub fn success_exit_code(summary: &Summary, collect_summary: bool) -> i32 {
    if collect_summary && (summary.has_errors() || summary.has_warnings()) {
        2
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_level_is_captured() {
        let summary = Summary::new();
        summary.record(Level::ERROR, "Cook failed");
        assert!(summary.has_errors());
        assert!(!summary.has_warnings());
        assert!(summary.render().contains("[ ERROR ] Cook failed"));
    }

    #[test]
    fn test_compiler_output_matches_patterns() {
        let summary = Summary::new();
        summary.record(Level::INFO, "Source/Game.cpp(12): error C2065: 'x': undeclared identifier");
        summary.record(Level::INFO, "src/main.c:3:7: warning: unused variable 'y'");
        assert!(summary.has_errors());
        assert!(summary.has_warnings());
    }

    #[test]
    fn test_ignore_patterns_take_precedence() {
        let summary = Summary::new();
        summary.record(
            Level::WARN,
            "  WARNING - appdata.bin is being created automatically for this package",
        );
        assert!(!summary.has_warnings());
    }

    #[test]
    fn test_context_lines_precede_entry() {
        let summary = Summary::new();
        for i in 0..5 {
            summary.record(Level::INFO, &format!("line {}", i));
        }
        summary.record(Level::WARN, "Package validation failed");

        let text = summary.render();
        assert!(!text.contains("line 0"));
        assert!(text.contains("[  NOTIF  ] line 1"));
        assert!(text.contains("[  NOTIF  ] line 4"));
        assert!(text.contains("[ WARNING ] Package validation failed"));
    }

    #[test]
    fn test_extra_patterns_with_message_group() {
        let summary = Summary::new();
        summary.extend_patterns(&SummaryConfig {
            error_patterns: vec![r"LogCook: Error: (?P<message>.*)".to_string()],
            ..Default::default()
        });
        summary.record(Level::INFO, "LogCook: Error: missing asset");
        assert!(summary.render().contains("[ ERROR ] missing asset"));
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let summary = Summary::new();
        summary.extend_patterns(&SummaryConfig {
            warning_patterns: vec!["(unclosed".to_string()],
            ..Default::default()
        });
        summary.record(Level::INFO, "(unclosed");
        assert!(!summary.has_warnings());
    }

    #[test]
    fn test_success_exit_code() {
        let summary = Summary::new();
        assert_eq!(success_exit_code(&summary, true), 0);
        summary.record(Level::WARN, "careful");
        assert_eq!(success_exit_code(&summary, true), 2);
        assert_eq!(success_exit_code(&summary, false), 0);
    }
}
