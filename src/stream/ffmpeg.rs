//! FFmpeg subprocess handling.
//!
//! Each session owns exactly one FFmpeg child: stdout piped into the HTTP
//! response, stderr drained into a bounded ring buffer for diagnostics, stdin
//! closed. Termination is cooperative: SIGINT first, SIGKILL after the grace
//! period, and the reap always runs.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};

/// Last 64 KiB of stderr kept per session.
pub const STDERR_RING_CAPACITY: usize = 64 * 1024;

/// Error types for the FFmpeg lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum FfmpegError {
    #[error("failed to spawn ffmpeg: {0}")]
    SpawnFailed(String),

    #[error("ffmpeg startup failed: {0}")]
    StartupFailed(String),

    #[error("ffmpeg exited mid-stream (code {exit_code:?}): {stderr_tail}")]
    CrashedDuringStream {
        exit_code: Option<i32>,
        stderr_tail: String,
    },
}

/// Bounded ring buffer holding the tail of a child's stderr.
#[derive(Debug)]
pub struct StderrRing {
    buf: Mutex<VecDeque<u8>>,
}

impl StderrRing {
    pub fn new() -> Self {
        Self {
            buf: Mutex::new(VecDeque::with_capacity(4096)),
        }
    }

    pub fn push(&self, bytes: &[u8]) {
        let mut buf = self.buf.lock().expect("stderr ring lock poisoned");
        for &b in bytes {
            if buf.len() == STDERR_RING_CAPACITY {
                buf.pop_front();
            }
            buf.push_back(b);
        }
    }

    /// Current contents as lossy UTF-8.
    pub fn tail(&self) -> String {
        let buf = self.buf.lock().expect("stderr ring lock poisoned");
        String::from_utf8_lossy(&buf.iter().copied().collect::<Vec<u8>>()).into_owned()
    }
}

impl Default for StderrRing {
    fn default() -> Self {
        Self::new()
    }
}

/// A running FFmpeg process with its stderr drainer attached.
#[derive(Debug)]
pub struct FfmpegChild {
    child: Child,
    pub pid: Option<u32>,
    pub stderr: Arc<StderrRing>,
}

/// Spawn FFmpeg with the resolved argv. Returns the handle and the piped
/// stdout the session streams from.
pub fn spawn(ffmpeg_path: &str, argv: &[String]) -> Result<(FfmpegChild, ChildStdout), FfmpegError> {
    let mut child = Command::new(ffmpeg_path)
        .args(argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| FfmpegError::SpawnFailed(e.to_string()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| FfmpegError::SpawnFailed("stdout pipe missing".into()))?;

    let stderr_ring = Arc::new(StderrRing::new());
    if let Some(mut stderr) = child.stderr.take() {
        let ring = Arc::clone(&stderr_ring);
        tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => ring.push(&chunk[..n]),
                }
            }
        });
    }

    let pid = child.id();
    Ok((
        FfmpegChild {
            child,
            pid,
            stderr: stderr_ring,
        },
        stdout,
    ))
}

impl FfmpegChild {
    /// Deliver SIGINT so FFmpeg can flush and close its outputs.
    pub fn signal_int(&self) {
        if let Some(pid) = self.pid {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
                tracing::debug!(pid, error = %e, "SIGINT delivery failed");
            }
        }
    }

    /// Whether the child already exited, without blocking.
    pub fn try_exit_code(&mut self) -> Option<Option<i32>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            _ => None,
        }
    }

    /// Cooperative shutdown: SIGINT, wait up to `grace`, SIGKILL, reap.
    ///
    /// Always reaps; the returned pair is the exit code (None when killed by
    /// signal) and the stderr tail captured for diagnostics.
    pub async fn shutdown(mut self, grace: Duration) -> (Option<i32>, String) {
        self.signal_int();

        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::warn!(pid = ?self.pid, error = %e, "wait on ffmpeg failed");
                None
            }
            Err(_) => {
                tracing::warn!(pid = ?self.pid, "ffmpeg ignored SIGINT, killing");
                let _ = self.child.start_kill();
                self.child.wait().await.ok()
            }
        };

        (status.and_then(|s| s.code()), self.stderr.tail())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_ring_keeps_tail() {
        let ring = StderrRing::new();
        ring.push(b"hello ");
        ring.push(b"world");
        assert_eq!(ring.tail(), "hello world");
    }

    #[test]
    fn test_stderr_ring_caps_at_capacity() {
        let ring = StderrRing::new();
        let big = vec![b'a'; STDERR_RING_CAPACITY + 100];
        ring.push(&big);
        ring.push(b"END");
        let tail = ring.tail();
        assert_eq!(tail.len(), STDERR_RING_CAPACITY);
        assert!(tail.ends_with("END"));
    }

    #[test]
    fn test_spawn_failure_is_classified() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let err = spawn("/nonexistent/ffmpeg-binary", &["-version".to_string()]).unwrap_err();
        assert!(matches!(err, FfmpegError::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn test_shutdown_reaps_an_exited_child() {
        let (child, _stdout) = spawn("/bin/true", &[]).unwrap();
        // Let the child exit on its own before shutdown runs the reap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let (code, _stderr) = child.shutdown(Duration::from_secs(5)).await;
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn test_shutdown_kills_a_child_that_ignores_sigint() {
        let (child, _stdout) = spawn(
            "/bin/sh",
            &["-c".to_string(), "trap '' INT; sleep 30".to_string()],
        )
        .unwrap();
        let started = std::time::Instant::now();
        let (code, _stderr) = child.shutdown(Duration::from_millis(100)).await;
        // Killed by SIGKILL: no exit code, and well before the 30s sleep.
        assert_eq!(code, None);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
