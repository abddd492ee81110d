//! Shell Command Units
//!
//! Wraps a shell command as a task unit so workflow plans can be
//! written in YAML. Commands run through `bash` with `set -e`, after
//! substituting the `{target}` placeholder.
//!
//! The child process is polled, so a cancelled task context (timeout or
//! executor cancellation) kills the command.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use log::{debug, error};
use serde_json::{json, Value};

use crate::task::{unit, TaskContext, TaskFn, UnitResult};

/// How often a running command checks for exit or cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Most stderr bytes carried into an error message.
const STDERR_TAIL: usize = 512;

/// A shell command bound to a target.
#[derive(Debug, Clone)]
pub struct CommandUnit {
    command: String,
    working_dir: Option<PathBuf>,
    dry_run: bool,
}

impl CommandUnit {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
            dry_run: false,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Report the rendered command instead of running it.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Substitutes `{target}` in the command text.
    pub fn render(&self, target: &str) -> String {
        self.command.replace("{target}", target)
    }

    /// Builds the task unit for one target.
    pub fn for_target(&self, target: &str) -> TaskFn {
        let rendered = self.render(target);
        let working_dir = self.working_dir.clone();
        let dry_run = self.dry_run;

        unit(move |ctx| {
            if dry_run {
                println!("[DRY RUN] {}: {}", ctx.task_name, rendered);
                return Ok(json!({ "command": rendered, "dry_run": true }));
            }
            run_command(ctx, &rendered, working_dir.as_ref())
        })
    }
}

fn run_command(ctx: &TaskContext, command: &str, working_dir: Option<&PathBuf>) -> UnitResult {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(format!("set -e\n{}", command))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
        debug!("Executing in directory: {}", dir.display());
    }

    debug!("Task '{}' running: {}", ctx.task_name, command);
    let mut child = cmd.spawn()?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                kill(&mut child);
                return Err(e.into());
            }
        }
        if ctx.is_cancelled() {
            kill(&mut child);
            return Err(format!("command for '{}' cancelled", ctx.task_name).into());
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();

    if !status.success() {
        error!(
            "Task '{}' command failed with exit code: {:?}",
            ctx.task_name,
            status.code()
        );
        let tail = tail(&stderr, STDERR_TAIL);
        return Err(match status.code() {
            Some(code) => format!("exit code {}: {}", code, tail.trim()),
            None => format!("terminated by signal: {}", tail.trim()),
        }
        .into());
    }

    let data = serde_json::from_str::<Value>(stdout.trim()).unwrap_or(Value::Null);
    Ok(json!({
        "command": command,
        "exit_code": status.code(),
        "stdout": stdout,
        "data": data,
    }))
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("Failed to kill command: {}", e);
    }
    let _ = child.wait();
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
