//! External encoder process supervision: spawn, progress-stream
//! parsing, and graceful-then-forcible termination.
//!
//! Generalizes the teacher's `ProgressParser` (`engine/core/types.rs`,
//! since removed) to the `out_time_ms`/`out_time`/`progress=end`
//! key=value stream spec.md §4.5 describes, and the teacher's
//! `WorkerPool::kill_all_running` SIGTERM-then-SIGKILL idiom for the
//! force-stop grace window — corrected to the 5-second window
//! `worker/client.py`'s `_terminate_process` actually uses.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

const RING_CAPACITY: usize = 50;
const TAIL_LINES: usize = 10;
const FORCE_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct ProgressTick {
    pub fraction: f64,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

#[derive(Debug)]
pub struct JobOutcome {
    pub success: bool,
    pub return_code: Option<i32>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub error_message: Option<String>,
}

struct RingBuffer {
    lines: VecDeque<String>,
}

impl RingBuffer {
    fn new() -> Self {
        Self { lines: VecDeque::with_capacity(RING_CAPACITY) }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == RING_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn tail(&self, n: usize) -> String {
        self.lines.iter().rev().take(n).rev().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Runs the probe tool with the argv the original reference
/// implementation uses (`_probe_duration`), returning the parsed
/// duration in seconds, or `None` if the probe fails or its stdout does
/// not parse as a float — progress then degrades to coarse milestones.
pub async fn probe_duration_secs(ffprobe_path: &str, input: &str) -> Option<f64> {
    let output = Command::new(ffprobe_path)
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
            input,
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    String::from_utf8_lossy(&output.stdout).trim().parse::<f64>().ok()
}

/// Spawn the encoder and drive it to completion, reporting progress on
/// `progress_tx` as it is observed and honoring `force_stop` per the
/// grace-window termination policy.
pub async fn execute(
    ffmpeg_path: &str,
    argv: &[String],
    duration_secs: Option<f64>,
    force_stop: Arc<AtomicBool>,
    progress_tx: watch::Sender<ProgressTick>,
) -> JobOutcome {
    let mut child = match Command::new(ffmpeg_path)
        .args(argv)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            tracing::warn!(%err, path = ffmpeg_path, "failed to spawn encoder");
            return JobOutcome {
                success: false,
                return_code: Some(-1),
                stdout_tail: String::new(),
                stderr_tail: String::new(),
                error_message: Some("FFmpeg failed".to_string()),
            };
        }
    };

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let stdout_buf = Arc::new(Mutex::new(RingBuffer::new()));
    let stderr_buf = Arc::new(Mutex::new(RingBuffer::new()));
    let progress = Arc::new(Mutex::new(0.0f64));

    let stdout_task = tokio::spawn(read_stdout(
        stdout,
        duration_secs,
        stdout_buf.clone(),
        stderr_buf.clone(),
        progress.clone(),
        progress_tx.clone(),
    ));
    let stderr_task = tokio::spawn(read_stderr(
        stderr,
        duration_secs,
        stderr_buf.clone(),
        stdout_buf.clone(),
        progress.clone(),
        progress_tx,
    ));

    let status = tokio::select! {
        status = child.wait() => status,
        _ = wait_for_force_stop(force_stop.clone()) => {
            terminate(&mut child).await
        }
    };

    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let return_code = status.as_ref().ok().and_then(exit_code);
    let forced = force_stop.load(Ordering::SeqCst);
    let success = !forced && return_code == Some(0);

    let error_message = if success {
        None
    } else if forced {
        Some("aborted by force stop".to_string())
    } else {
        Some(format!("ffmpeg exited with code {:?}", return_code))
    };

    JobOutcome {
        success,
        return_code,
        stdout_tail: stdout_buf.lock().unwrap().tail(TAIL_LINES),
        stderr_tail: stderr_buf.lock().unwrap().tail(TAIL_LINES),
        error_message,
    }
}

/// `ExitStatus::code()` is `None` when the child died to a signal rather
/// than exiting normally (always true after our own SIGTERM/SIGKILL), so
/// fall back to the signal number — reported as a negative code, matching
/// `_terminate_process`'s convention — to keep a force-killed job's
/// `return_code` non-zero.
fn exit_code(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|sig| -sig))
}

async fn wait_for_force_stop(flag: Arc<AtomicBool>) {
    loop {
        if flag.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn terminate(child: &mut tokio::process::Child) -> std::io::Result<std::process::ExitStatus> {
    if let Some(pid) = child.id() {
        // SAFETY: signaling our own child process by pid; a benign no-op
        // if it has already exited.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    match tokio::time::timeout(FORCE_STOP_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!("encoder ignored SIGTERM past grace window, sending SIGKILL");
            child.kill().await?;
            child.wait().await
        }
    }
}

async fn read_stdout(
    stdout: tokio::process::ChildStdout,
    duration_secs: Option<f64>,
    stdout_buf: Arc<Mutex<RingBuffer>>,
    stderr_buf: Arc<Mutex<RingBuffer>>,
    progress: Arc<Mutex<f64>>,
    progress_tx: watch::Sender<ProgressTick>,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        stdout_buf.lock().unwrap().push(line.clone());
        if let Some((key, value)) = line.split_once('=') {
            let mut p = progress.lock().unwrap();
            match key {
                "progress" if value == "end" => *p = 1.0,
                "out_time_ms" => {
                    if let (Some(duration), Ok(micros)) = (duration_secs, value.trim().parse::<f64>()) {
                        *p = ((micros / 1_000_000.0) / duration).clamp(0.0, 0.999);
                    }
                }
                "out_time" => {
                    if let (Some(duration), Some(seconds)) = (duration_secs, parse_out_time(value.trim())) {
                        *p = (seconds / duration).clamp(0.0, 0.999);
                    }
                }
                _ => {}
            }
        }
        emit(&progress, &stdout_buf, &stderr_buf, &progress_tx);
    }
}

async fn read_stderr(
    stderr: tokio::process::ChildStderr,
    duration_secs: Option<f64>,
    stderr_buf: Arc<Mutex<RingBuffer>>,
    stdout_buf: Arc<Mutex<RingBuffer>>,
    progress: Arc<Mutex<f64>>,
    progress_tx: watch::Sender<ProgressTick>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        stderr_buf.lock().unwrap().push(line.clone());
        // Fallback progress source when the structured stdout stream is
        // silent: the reference implementation's `PROGRESS_PATTERN`.
        if let Some(seconds) = extract_fallback_time(&line) {
            if let Some(duration) = duration_secs {
                let mut p = progress.lock().unwrap();
                if *p == 0.0 {
                    *p = (seconds / duration).clamp(0.0, 0.999);
                }
            }
        }
        emit(&progress, &stdout_buf, &stderr_buf, &progress_tx);
    }
}

fn emit(
    progress: &Arc<Mutex<f64>>,
    stdout_buf: &Arc<Mutex<RingBuffer>>,
    stderr_buf: &Arc<Mutex<RingBuffer>>,
    progress_tx: &watch::Sender<ProgressTick>,
) {
    let tick = ProgressTick {
        fraction: *progress.lock().unwrap(),
        stdout_tail: stdout_buf.lock().unwrap().tail(TAIL_LINES),
        stderr_tail: stderr_buf.lock().unwrap().tail(TAIL_LINES),
    };
    let _ = progress_tx.send(tick);
}

/// Parses ffmpeg's `-progress` `out_time` field, `H:MM:SS.frac`.
fn parse_out_time(value: &str) -> Option<f64> {
    let mut parts = value.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// The stderr fallback pattern, `time=H:MM:SS.frac`, matching
/// `worker/client.py`'s `PROGRESS_PATTERN` regex.
fn extract_fallback_time(line: &str) -> Option<f64> {
    let idx = line.find("time=")?;
    let rest = &line[idx + "time=".len()..];
    let token: String = rest.chars().take_while(|c| c.is_ascii_digit() || *c == ':' || *c == '.').collect();
    parse_out_time(&token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_keeps_only_the_last_n_lines() {
        let mut buf = RingBuffer::new();
        for i in 0..60 {
            buf.push(format!("line {i}"));
        }
        let tail = buf.tail(10);
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[9], "line 59");
        assert_eq!(lines[0], "line 50");
    }

    #[test]
    fn parse_out_time_reads_hms_fraction() {
        assert_eq!(parse_out_time("01:02:03.500"), Some(3723.5));
    }

    #[test]
    fn fallback_time_is_extracted_from_a_noisy_stderr_line() {
        let line = "frame=  120 fps=30 q=24.0 size=    256kB time=00:00:04.00 bitrate= 524.3kbits/s";
        assert_eq!(extract_fallback_time(line), Some(4.0));
    }
}
