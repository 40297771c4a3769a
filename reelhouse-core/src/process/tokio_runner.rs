use async_trait::async_trait;
use std::{process::ExitStatus, process::Stdio, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ProcessOutput, ProcessRunner, ProcessSpec, RunnerError};

/// Largest stdout payload kept in memory (probe JSON, detector output).
const MAX_STDOUT_BYTES: usize = 4 * 1024 * 1024;
/// Only the end of stderr is interesting for failure reports.
const MAX_STDERR_TAIL_BYTES: usize = 16 * 1024;
/// How long to wait for pipe readers once the child itself is gone. A
/// grandchild that inherited the pipes can otherwise hold them open forever.
const READER_DRAIN_LIMIT: Duration = Duration::from_secs(1);

/// [`ProcessRunner`] backed by `tokio::process`.
///
/// On unix each child is placed in its own process group so that the
/// termination signal also reaches helpers the tool forked.
#[derive(Debug, Clone)]
pub struct TokioProcessRunner {
    grace_period: Duration,
}

impl Default for TokioProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

enum Exit {
    Finished(std::io::Result<ExitStatus>),
    Deadline,
    Cancelled,
}

impl TokioProcessRunner {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    async fn terminate(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        #[cfg(unix)]
        signal_group(child, nix::sys::signal::Signal::SIGTERM);
        #[cfg(not(unix))]
        let _ = child.start_kill();

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                debug!(
                    pid = ?child.id(),
                    "process ignored termination request; killing"
                );
                #[cfg(unix)]
                signal_group(child, nix::sys::signal::Signal::SIGKILL);
                let _ = child.start_kill();
                child.wait().await
            }
        }
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        spec: ProcessSpec,
        cancel: CancellationToken,
    ) -> Result<ProcessOutput, RunnerError> {
        let program = spec.display_name();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.limits.env())
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|err| RunnerError::from_spawn(program.clone(), err))?;
        debug!(program = %program, pid = ?child.id(), timeout = ?spec.timeout, "spawned tool");

        let stdout = spawn_reader(child.stdout.take(), |r| {
            read_capped(r, MAX_STDOUT_BYTES)
        });
        let stderr = spawn_reader(child.stderr.take(), |r| {
            read_tail(r, MAX_STDERR_TAIL_BYTES)
        });

        let exit = tokio::select! {
            status = child.wait() => Exit::Finished(status),
            _ = tokio::time::sleep(spec.timeout) => Exit::Deadline,
            _ = cancel.cancelled() => Exit::Cancelled,
        };

        let (status, timed_out, cancelled) = match exit {
            Exit::Finished(status) => (status, false, false),
            Exit::Deadline => {
                warn!(program = %program, timeout = ?spec.timeout, "tool timed out; terminating");
                (self.terminate(&mut child).await, true, false)
            }
            Exit::Cancelled => {
                debug!(program = %program, "cancellation requested; terminating tool");
                (self.terminate(&mut child).await, false, true)
            }
        };

        let exit_code = match status {
            Ok(status) => status.code(),
            Err(err) => {
                warn!(program = %program, error = %err, "failed to reap tool process");
                None
            }
        };

        let stdout = drain(stdout).await;
        let stderr = drain(stderr).await;

        Ok(ProcessOutput {
            exit_code,
            stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            timed_out,
            cancelled,
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: nix::sys::signal::Signal) {
    use nix::{sys::signal::killpg, unistd::Pid};

    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(pid), signal) {
        debug!(pid, ?signal, error = %err, "failed to signal process group");
    }
}

fn spawn_reader<R, F, Fut>(pipe: Option<R>, read: F) -> Option<JoinHandle<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnOnce(R) -> Fut,
    Fut: std::future::Future<Output = Vec<u8>> + Send + 'static,
{
    pipe.map(|pipe| tokio::spawn(read(pipe)))
}

async fn drain(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(mut handle) = handle else {
        return Vec::new();
    };
    match tokio::time::timeout(READER_DRAIN_LIMIT, &mut handle).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            handle.abort();
            Vec::new()
        }
    }
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut chunk = vec![0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                // keep draining past the cap so the child never blocks on a full pipe
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    kept
}

async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut chunk = vec![0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > cap {
                    let excess = tail.len() - cap;
                    tail.drain(..excess);
                }
            }
        }
    }
    tail
}
