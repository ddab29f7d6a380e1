//! Subprocess execution with an optional deadline, shared by hook scripts and
//! verification commands.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const TRANSCRIPT_LIMIT: usize = 10 * 1024;

/// Everything a finished child wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    /// Non-empty streams joined by a newline, keeping only the last 10KB.
    pub fn transcript(&self) -> String {
        let joined = [self.stdout.trim(), self.stderr.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if joined.len() <= TRANSCRIPT_LIMIT {
            return joined;
        }
        let mut cut = joined.len() - TRANSCRIPT_LIMIT;
        while !joined.is_char_boundary(cut) {
            cut += 1;
        }
        joined[cut..].to_string()
    }
}

/// What happened to a child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Exited {
        success: bool,
        code: Option<i32>,
        output: Captured,
    },
    TimedOut {
        after: Duration,
    },
    SpawnFailed(String),
}

/// Run `cmd` to completion, feeding `stdin` when given.
///
/// Every pipe is serviced on its own thread: the payload writer and both
/// readers. The calling thread only polls for exit, so the deadline holds even
/// when the child never reads its input. On timeout the child is killed and
/// reaped; threads still blocked on a pipe held by a grandchild are left to
/// finish on their own.
pub fn run(mut cmd: Command, stdin: Option<&[u8]>, timeout: Option<Duration>) -> ProcessOutcome {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return ProcessOutcome::SpawnFailed(e.to_string()),
    };

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let data = data.to_vec();
        // Broken pipe here means the child exited without reading; its exit
        // status decides the outcome.
        std::thread::spawn(move || {
            let _ = pipe.write_all(&data);
        });
    }

    let status = match timeout {
        None => child.wait(),
        Some(after) => match wait_until(&mut child, Instant::now() + after) {
            Ok(Some(status)) => Ok(status),
            Ok(None) => {
                if let Err(e) = child.kill() {
                    tracing::warn!(pid = child.id(), error = %e, "cannot kill timed-out process");
                }
                let _ = child.wait();
                return ProcessOutcome::TimedOut { after };
            }
            Err(e) => Err(e),
        },
    };

    match status {
        Ok(status) => ProcessOutcome::Exited {
            success: status.success(),
            code: status.code(),
            output: Captured {
                stdout: stdout.join().unwrap_or_default(),
                stderr: stderr.join().unwrap_or_default(),
            },
        },
        Err(e) => ProcessOutcome::SpawnFailed(format!("wait failed: {e}")),
    }
}

/// Poll until the child exits or `deadline` passes (`Ok(None)`).
fn wait_until(child: &mut Child, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut r) = pipe {
            let _ = r.read_to_string(&mut buf);
        }
        buf
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_status() {
        match run(sh("echo hello; exit 3"), None, Some(Duration::from_secs(10))) {
            ProcessOutcome::Exited {
                success,
                code,
                output,
            } => {
                assert!(!success);
                assert_eq!(code, Some(3));
                assert_eq!(output.stdout.trim(), "hello");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn feeds_stdin() {
        let outcome = run(sh("cat"), Some(b"{\"a\":1}"), Some(Duration::from_secs(10)));
        assert!(matches!(
            outcome,
            ProcessOutcome::Exited { ref output, .. } if output.stdout == "{\"a\":1}"
        ));
    }

    #[test]
    fn feeds_stdin_larger_than_a_pipe_buffer() {
        let payload = vec![b'y'; 1 << 20];
        let outcome = run(sh("wc -c"), Some(&payload), Some(Duration::from_secs(10)));
        match outcome {
            ProcessOutcome::Exited { output, .. } => {
                assert_eq!(output.stdout.trim(), (1 << 20).to_string());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn times_out() {
        let outcome = run(sh("sleep 5"), None, Some(Duration::from_millis(200)));
        assert!(matches!(outcome, ProcessOutcome::TimedOut { .. }));
    }

    #[test]
    fn deadline_holds_when_child_ignores_a_large_payload() {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let payload = vec![b'x'; 1 << 20];
            let _ = tx.send(run(sh("sleep 30"), Some(&payload), Some(Duration::from_millis(200))));
        });
        let outcome = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("run should return soon after its deadline");
        assert!(matches!(outcome, ProcessOutcome::TimedOut { .. }));
    }

    #[test]
    fn spawn_failure_is_reported() {
        let outcome = run(
            Command::new("/definitely/not/a/binary"),
            None,
            Some(Duration::from_secs(1)),
        );
        assert!(matches!(outcome, ProcessOutcome::SpawnFailed(_)));
    }

    #[test]
    fn transcript_joins_streams_and_keeps_the_tail() {
        let both = Captured {
            stdout: "out\n".into(),
            stderr: "err".into(),
        };
        assert_eq!(both.transcript(), "out\nerr");

        let long = Captured {
            stdout: format!("head{}", "x".repeat(20 * 1024)),
            stderr: String::new(),
        };
        let t = long.transcript();
        assert_eq!(t.len(), 10 * 1024);
        assert!(!t.starts_with("head"));
    }
}
