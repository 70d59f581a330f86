use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::EngineError;

/// How often a running engine process is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured output of a finished engine process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` with `args`, blocking until it exits or `timeout` elapses.
///
/// A process still running at the deadline is killed and reported as
/// [`EngineError::Timeout`]. A non-zero exit becomes [`EngineError::Failed`]
/// carrying the trimmed stderr text.
pub fn run(program: &Path, args: &[String], timeout: Duration) -> Result<ProcessOutput, EngineError> {
    let name = program.display().to_string();
    log::debug!("Running: {} {}", name, args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::NotFound {
                program: name.clone(),
            },
            _ => EngineError::Io(e),
        })?;

    // Pipes are drained on their own threads so a chatty process can't block on a full buffer.
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= timeout {
            log::warn!(
                "{} still running after {:.1}s, killing it",
                name,
                timeout.as_secs_f64()
            );
            child.kill().ok();
            child.wait().ok();
            return Err(EngineError::Timeout {
                program: name,
                secs: timeout.as_secs_f64(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = collect(stdout);
    let stderr = collect(stderr);

    if !status.success() {
        return Err(EngineError::Failed {
            program: name,
            status: status.code(),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(ProcessOutput { stdout, stderr })
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).ok();
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}
