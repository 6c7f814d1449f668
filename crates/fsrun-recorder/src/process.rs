//! Records one run of a child process.
//!
//! Stdout is captured line by line and pushed through heartbeats; a line
//! that is a JSON object with a numeric `progress` field becomes the live
//! result, which drives the ETA estimate. A zero exit completes the run
//! with the last stdout line when it is a JSON object, a non-zero exit
//! fails it with the tail of stderr, and death by signal interrupts it.

use chrono::Utc;
use fsrun_core::RunStatus;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{RecorderError, Result};
use crate::observer::{RunObserver, RunStart};
use crate::RunRecorder;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct CommandRun {
    pub program: String,
    pub args: Vec<String>,
    pub start: RunStart,
    /// Recorded before the child is spawned.
    pub resources: Vec<PathBuf>,
    /// `(name, path)` pairs copied into the run directory after exit.
    pub artifacts: Vec<(String, PathBuf)>,
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
}

pub fn record_command(recorder: &mut RunRecorder, run: CommandRun) -> Result<CommandOutcome> {
    let run_id = recorder.start(run.start)?;
    let driven = drive_child(
        recorder,
        &run.program,
        &run.args,
        &run.resources,
        &run.artifacts,
        run.heartbeat_interval,
    );
    match driven {
        Ok(exit_code) => {
            let run_dir = recorder
                .run_dir()
                .map(PathBuf::from)
                .unwrap_or_else(|| recorder.base_dir().join(&run_id));
            let status = recorder
                .record()
                .map(|r| r.status.clone())
                .unwrap_or(RunStatus::Running);
            Ok(CommandOutcome {
                run_id,
                run_dir,
                status,
                exit_code,
            })
        }
        Err(err) => {
            if let Err(fail_err) = recorder.fail(Utc::now(), &err.to_string()) {
                warn!(error = %fail_err, "could not mark run as failed");
            }
            Err(err)
        }
    }
}

fn drive_child(
    recorder: &mut RunRecorder,
    program: &str,
    args: &[String],
    resources: &[PathBuf],
    artifacts: &[(String, PathBuf)],
    heartbeat_interval: Duration,
) -> Result<Option<i32>> {
    for resource in resources {
        recorder.record_resource(resource)?;
    }

    let spawn_err = |source: std::io::Error| RecorderError::Spawn {
        program: program.to_string(),
        source,
    };
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_err)?;

    let stderr_reader = child.stderr.take().map(|mut stderr| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    });

    let pumped = match child.stdout.take() {
        Some(stdout) => pump_stdout(recorder, stdout, heartbeat_interval),
        None => Ok((String::new(), Value::Null)),
    };
    let (captured, progress) = match pumped {
        Ok(pumped) => pumped,
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            if let Some(handle) = stderr_reader {
                let _ = handle.join();
            }
            return Err(err);
        }
    };
    let status = child.wait().map_err(spawn_err)?;
    let stderr = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    recorder.heartbeat(&Value::Null, &captured, Utc::now(), progress)?;

    for (name, path) in artifacts {
        recorder.record_artifact(name, path)?;
    }

    let exit_code = status.code();
    debug!(program, ?exit_code, "child exited");
    match exit_code {
        Some(0) => recorder.complete(Utc::now(), result_from_output(&captured))?,
        Some(code) => recorder.fail(Utc::now(), &failure_trace(code, &stderr))?,
        None => recorder.interrupt(Utc::now(), RunStatus::INTERRUPTED)?,
    }
    Ok(exit_code)
}

/// Reads stdout to the end, heartbeating at most once per interval. Bytes
/// that are not UTF-8 are replaced rather than treated as a read failure.
fn pump_stdout(
    recorder: &mut RunRecorder,
    stdout: ChildStdout,
    heartbeat_interval: Duration,
) -> Result<(String, Value)> {
    let mut reader = BufReader::new(stdout);
    let mut captured = String::new();
    let mut progress = Value::Null;
    let mut last_beat = Instant::now();
    let mut raw = Vec::new();
    loop {
        raw.clear();
        let n = reader
            .read_until(b'\n', &mut raw)
            .map_err(RecorderError::ChildOutput)?;
        if n == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end_matches(['\n', '\r']);
        if let Some(p) = progress_of(line) {
            progress = p;
        }
        captured.push_str(line);
        captured.push('\n');
        if last_beat.elapsed() >= heartbeat_interval {
            recorder.heartbeat(&Value::Null, &captured, Utc::now(), progress.clone())?;
            last_beat = Instant::now();
        }
    }
    Ok((captured, progress))
}

fn progress_of(line: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    let progress = value.as_object()?.get("progress")?;
    progress.is_number().then(|| progress.clone())
}

fn result_from_output(captured: &str) -> Value {
    captured
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| serde_json::from_str::<Value>(l.trim()).ok())
        .filter(|v| v.is_object())
        .unwrap_or_else(|| json!({ "exit_code": 0 }))
}

fn failure_trace(code: i32, stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().collect();
    let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
    if tail.trim().is_empty() {
        format!("process exited with status {}", code)
    } else {
        format!("process exited with status {}\n{}", code, tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines_are_recognised() {
        assert_eq!(progress_of(r#"{"progress": 0.5}"#), Some(json!(0.5)));
        assert_eq!(progress_of(r#"  {"progress": 1, "step": 9}  "#), Some(json!(1)));
        assert_eq!(progress_of(r#"{"progress": "half"}"#), None);
        assert_eq!(progress_of("epoch 3 done"), None);
        assert_eq!(progress_of("0.5"), None);
    }

    #[test]
    fn result_comes_from_last_json_object_line() {
        let out = "starting\n{\"loss\": 0.1, \"acc\": 0.9}\n\n";
        assert_eq!(result_from_output(out), json!({"loss": 0.1, "acc": 0.9}));
        assert_eq!(result_from_output("done\n"), json!({"exit_code": 0}));
        assert_eq!(result_from_output("[1, 2]\n"), json!({"exit_code": 0}));
        assert_eq!(result_from_output(""), json!({"exit_code": 0}));
    }

    #[test]
    fn failure_trace_keeps_stderr_tail() {
        let stderr: String = (0..30).map(|i| format!("line {}\n", i)).collect();
        let trace = failure_trace(3, &stderr);
        assert!(trace.starts_with("process exited with status 3\n"));
        assert!(trace.contains("line 29"));
        assert!(!trace.contains("line 9\n"));
        assert_eq!(failure_trace(1, "  \n"), "process exited with status 1");
    }
}
