//! Child process execution.
//!
//! [`Cmd`] launches an external tool and streams its output through the
//! logging pipeline under [`crate::logging::CHILD_TARGET`]. Each output
//! stream gets its own reader thread feeding a channel; the calling thread
//! consumes lines, polls the child and enforces the timeout and the
//! parent-death watchdog.
//!
//! # Usage
//!
//! ```rust,ignore
//! use nimp::process::Cmd;
//!
//! let code = Cmd::new(&editor)
//!     .args([project, "-Run=Cook"])
//!     .heartbeat(60)
//!     .dry_run(run.dry_run)
//!     .call()?;
//!
//! let output = Cmd::new("git").args(["rev-parse", "HEAD"]).hide_output().capture()?;
//! ```

#[cfg(windows)]
mod windows;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::NimpError;
use crate::logging::CHILD_TARGET;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long leftover output is collected once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
    /// OutputDebugString payload (Windows only).
    Debug,
}

/// Exit code and collected output of a captured call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Builder for one external tool invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
    heartbeat: Option<Duration>,
    timeout: Option<Duration>,
    dry_run: bool,
    hide_output: bool,
    capture_debug: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
            heartbeat: None,
            timeout: None,
            dry_run: false,
            hide_output: false,
            capture_debug: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_string_lossy().into_owned();
        self.arg(path)
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Bytes written to the child's stdin by a feeder thread.
    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    /// Log a keepalive line when the child stays silent this long.
    pub fn heartbeat(mut self, seconds: u64) -> Self {
        self.heartbeat = (seconds > 0).then(|| Duration::from_secs(seconds));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn hide_output(mut self) -> Self {
        self.hide_output = true;
        self
    }

    /// Capture OutputDebugString from the child (Windows only).
    pub fn capture_debug(mut self) -> Self {
        self.capture_debug = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Command line as logged.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| {
                if part.is_empty() || part.contains(' ') {
                    format!("\"{}\"", part)
                } else {
                    part.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run and return the exit code. A missing executable logs an error
    /// and returns 1.
    pub fn call(&self) -> Result<i32> {
        self.execute(&mut |_, _| {})
    }

    /// Run, invoking `on_line` for every decoded line.
    pub fn call_with(&self, mut on_line: impl FnMut(Stream, &str)) -> Result<i32> {
        self.execute(&mut on_line)
    }

    /// Run and collect stdout and stderr.
    pub fn capture(&self) -> Result<CapturedOutput> {
        let mut stdout = String::new();
        let mut stderr = String::new();
        let code = self.execute(&mut |stream, line| {
            let target = match stream {
                Stream::Stdout => &mut stdout,
                Stream::Stderr => &mut stderr,
                Stream::Debug => return,
            };
            target.push_str(line);
            target.push('\n');
        })?;
        Ok(CapturedOutput { code, stdout, stderr })
    }

    /// Run and fail with [`NimpError::Tool`] on a non-zero exit code.
    pub fn check(&self) -> Result<()> {
        let code = self.call()?;
        if code != 0 {
            return Err(NimpError::tool(self.program_name(), code).into());
        }
        Ok(())
    }

    fn program_name(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone())
    }

    fn execute(&self, on_line: &mut dyn FnMut(Stream, &str)) -> Result<i32> {
        let cwd = match &self.cwd {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };

        if !self.hide_output {
            tracing::info!(
                "{} \"{}\" in \"{}\"",
                if self.dry_run { "[DRY-RUN]" } else { "Running" },
                self.display(),
                cwd.display()
            );
        }
        if self.dry_run {
            return Ok(0);
        }

        #[cfg(windows)]
        let debug_capture = if self.capture_debug && !self.hide_output {
            windows::disable_error_dialogs();
            windows::DebugStringCapture::create()
        } else {
            None
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.stdin.is_some() { Stdio::piped() } else { Stdio::null() });
        for (key, value) in &self.env {
            command.env(key, value);
        }
        #[cfg(unix)]
        {
            // Own process group, so the whole tree can be signalled at once.
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::error!("{}: {}", self.program, e);
                return Ok(1);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to start {}", self.program));
            }
        };

        let (tx, rx) = unbounded::<(Stream, String)>();
        let last_output = Arc::new(AtomicU64::new(0));
        let started = Instant::now();
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        if let Some(stdout) = child.stdout.take() {
            workers.push(spawn_reader(Stream::Stdout, stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            workers.push(spawn_reader(Stream::Stderr, stderr, tx.clone()));
        }
        if let (Some(data), Some(mut pipe)) = (self.stdin.clone(), child.stdin.take()) {
            workers.push(thread::spawn(move || {
                let _ = pipe.write_all(&data);
            }));
        }

        #[cfg(windows)]
        let debug_capture = debug_capture.map(|capture| capture.start(child.id(), tx.clone()));
        drop(tx);

        let done = Arc::new(AtomicBool::new(false));
        let heartbeat = self.heartbeat.map(|interval| {
            spawn_heartbeat(
                self.program.clone(),
                interval,
                started,
                Arc::clone(&last_output),
                Arc::clone(&done),
            )
        });
        let parent_gone = watch_parent(Arc::clone(&done));

        let mut state = PumpState::default();
        let outcome = self.pump(&mut child, &rx, on_line, &mut state, started, &last_output, &parent_gone);

        done.store(true, Ordering::SeqCst);
        #[cfg(windows)]
        if let Some(capture) = debug_capture {
            capture.stop();
        }
        // Descendants may still hold the pipes open, so draining is bounded.
        let drain_deadline = Instant::now() + DRAIN_GRACE;
        loop {
            let wait = drain_deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok((stream, line)) => self.dispatch(stream, &line, on_line, &mut state),
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::debug!("{} left processes holding its output open", self.program);
                    break;
                }
            }
        }
        for worker in workers {
            if worker.is_finished() {
                let _ = worker.join();
            }
        }
        if let Some(heartbeat) = heartbeat {
            let _ = heartbeat.join();
        }

        let code = outcome?;
        if !self.hide_output {
            tracing::info!("Finished with exit code {} (0x{:08x})", code, code as u32);
        }
        Ok(code)
    }

    fn pump(
        &self,
        child: &mut Child,
        rx: &Receiver<(Stream, String)>,
        on_line: &mut dyn FnMut(Stream, &str),
        state: &mut PumpState,
        started: Instant,
        last_output: &AtomicU64,
        parent_gone: &AtomicBool,
    ) -> Result<i32> {
        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok((stream, line)) => {
                    last_output.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                    self.dispatch(stream, &line, on_line, state);
                    continue;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }

            if let Some(status) = child.try_wait()? {
                return Ok(exit_code(status));
            }

            if parent_gone.load(Ordering::SeqCst) {
                tracing::debug!("Parent process is gone, killing {}", self.program);
                kill_tree(child);
                let _ = child.wait();
                return Ok(1);
            }

            if let Some(timeout) = self.timeout {
                if started.elapsed() > timeout {
                    kill_tree(child);
                    let _ = child.wait();
                    return Err(NimpError::Timeout {
                        program: self.program_name(),
                        after: timeout,
                    }
                    .into());
                }
            }
        }
    }

    fn dispatch(
        &self,
        stream: Stream,
        line: &str,
        on_line: &mut dyn FnMut(Stream, &str),
        state: &mut PumpState,
    ) {
        match stream {
            Stream::Debug => state.debug_active = true,
            Stream::Stdout if state.debug_active => {
                if !state.stdout_muted {
                    tracing::info!("Stopping stdout monitoring (OutputDebugString is active)");
                    state.stdout_muted = true;
                }
                return;
            }
            _ => {}
        }
        on_line(stream, line);
        if !self.hide_output {
            tracing::info!(target: CHILD_TARGET, "{}", line);
        }
    }
}

#[derive(Default)]
struct PumpState {
    debug_active: bool,
    stdout_muted: bool,
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: Stream,
    source: R,
    tx: Sender<(Stream, String)>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send((stream, decode_line(&buffer))).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_heartbeat(
    program: String,
    interval: Duration,
    started: Instant,
    last_output: Arc<AtomicU64>,
    done: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut last_beat = Instant::now();
        while !done.load(Ordering::SeqCst) {
            thread::sleep(POLL_INTERVAL);
            let since_output =
                started.elapsed().saturating_sub(Duration::from_millis(last_output.load(Ordering::Relaxed)));
            if since_output >= interval && last_beat.elapsed() >= interval {
                tracing::info!("Keepalive for {}", program);
                last_beat = Instant::now();
            }
        }
    })
}

/// Flag raised when the process that launched nimp disappears.
fn watch_parent(done: Arc<AtomicBool>) -> Arc<AtomicBool> {
    let gone = Arc::new(AtomicBool::new(false));

    #[cfg(unix)]
    {
        let original = std::os::unix::process::parent_id();
        let flag = Arc::clone(&gone);
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                // Orphans are re-parented to init or a subreaper.
                if std::os::unix::process::parent_id() != original {
                    flag.store(true, Ordering::SeqCst);
                    break;
                }
                thread::sleep(Duration::from_millis(500));
            }
        });
    }

    #[cfg(windows)]
    windows::watch_parent(done, Arc::clone(&gone));

    gone
}

fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        // The child leads its own group (see `execute`).
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: killpg only sends a signal to the given process group.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
    #[cfg(windows)]
    {
        let _ = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &child.id().to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    let _ = child.kill();
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Decode one raw output line: UTF-8 (BOM stripped) first, then Latin-1,
/// which accepts any byte sequence. Trailing line breaks are removed.
pub fn decode_line(raw: &[u8]) -> String {
    let mut bytes = raw;
    while let Some((last, rest)) = bytes.split_last() {
        if *last == b'\n' || *last == b'\r' {
            bytes = rest;
        } else {
            break;
        }
    }
    let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Split a command line option string the way a POSIX shell would
/// (whitespace separation, single and double quotes, backslash escapes).
pub fn split_options(input: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => return Err(NimpError::config(format!("Unterminated quote in '{}'", input)).into()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped @ ('"' | '\\' | '$' | '`')) => current.push(escaped),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => return Err(NimpError::config(format!("Unterminated quote in '{}'", input)).into()),
                        },
                        Some(inner) => current.push(inner),
                        None => return Err(NimpError::config(format!("Unterminated quote in '{}'", input)).into()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Find an executable on `PATH`.
pub fn which(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let extensions: &[&str] = if cfg!(windows) { &["", ".exe", ".cmd", ".bat"] } else { &[""] };
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).find_map(|dir| {
        extensions.iter().find_map(|ext| {
            let full = dir.join(format!("{}{}", program, ext));
            full.is_file().then_some(full)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_utf8_with_bom() {
        assert_eq!(decode_line(b"\xef\xbb\xbfhello\r\n"), "hello");
    }

    #[test]
    fn test_decode_falls_back_to_latin1() {
        assert_eq!(decode_line(b"caf\xe9\n"), "café");
    }

    #[test]
    fn test_split_options() {
        assert_eq!(
            split_options(r#"-ini:Game:[/Script/X]:Y=1 "-Map=My Map" 'a b' c\ d"#).unwrap(),
            vec!["-ini:Game:[/Script/X]:Y=1", "-Map=My Map", "a b", "c d"]
        );
        assert!(split_options("\"unterminated").is_err());
        assert!(split_options("   ").unwrap().is_empty());
    }

    #[test]
    fn test_display_quotes_spaces() {
        let cmd = Cmd::new("tool").args(["a", "b c"]);
        assert_eq!(cmd.display(), "tool a \"b c\"");
    }

    #[test]
    fn test_dry_run_does_not_spawn() {
        let code = Cmd::new("definitely_not_a_real_command_12345")
            .dry_run(true)
            .call()
            .unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn test_missing_executable_returns_one() {
        let code = Cmd::new("definitely_not_a_real_command_12345").call().unwrap();
        assert_eq!(code, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_capture_output() {
        let output = Cmd::new("sh")
            .args(["-c", "echo out; echo err 1>&2; exit 3"])
            .capture()
            .unwrap();
        assert_eq!(output.code, 3);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_stdin_is_fed() {
        let output = Cmd::new("cat").stdin("piped\n").capture().unwrap();
        assert_eq!(output.stdout, "piped\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_check_reports_tool_failure() {
        let err = Cmd::new("sh").args(["-c", "exit 5"]).check().unwrap_err();
        assert_eq!(crate::error::tool_exit_code(&err), Some(5));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_child() {
        let err = Cmd::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(200))
            .call()
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_grandchildren() {
        let started = Instant::now();
        let mut lines = Vec::new();
        let err = Cmd::new("sh")
            .args(["-c", "sleep 4; echo late"])
            .timeout(Duration::from_millis(300))
            .call_with(|_, line| lines.push(line.to_string()))
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(err.to_string().contains("timed out after 300ms"));
        assert!(lines.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_background_descendant_does_not_block_return() {
        let started = Instant::now();
        let mut lines = Vec::new();
        let code = Cmd::new("sh")
            .args(["-c", "sleep 4 & echo hi"])
            .call_with(|_, line| lines.push(line.to_string()))
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(lines, vec!["hi".to_string()]);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_debug_output_keeps_stdout_muted_while_draining() {
        let cmd = Cmd::new("tool").hide_output();
        let mut state = PumpState::default();
        let mut seen = Vec::new();
        cmd.dispatch(Stream::Debug, "debug", &mut |s, l| seen.push((s, l.to_string())), &mut state);
        cmd.dispatch(Stream::Stdout, "muted", &mut |s, l| seen.push((s, l.to_string())), &mut state);
        assert!(state.stdout_muted);
        assert_eq!(seen, vec![(Stream::Debug, "debug".to_string())]);
    }

    #[cfg(unix)]
    #[test]
    fn test_stream_order_is_preserved() {
        let mut lines = Vec::new();
        Cmd::new("sh")
            .args(["-c", "for i in 1 2 3 4 5; do echo $i; done"])
            .call_with(|stream, line| {
                if stream == Stream::Stdout {
                    lines.push(line.to_string());
                }
            })
            .unwrap();
        assert_eq!(lines, vec!["1", "2", "3", "4", "5"]);
    }
}
