//! Process invocation primitive.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::output::LineSink;

/// Runs one target's command and streams its output.
///
/// Implementations return the process exit code, or an error when the
/// process could not be run at all. Both sinks must be dropped by the time
/// `invoke` returns.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn invoke(
        &self,
        command: &str,
        cwd: &Path,
        stdout: LineSink,
        stderr: LineSink,
    ) -> Result<i32>;
}

/// Runs commands through the platform shell (`sh -c`, or `cmd /C` on
/// Windows).
///
/// On Unix the shell leads its own process group. Whatever the command
/// starts is killed with it when the invocation is dropped, and once the
/// shell has exited.
#[derive(Debug, Default, Clone)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(command: &str) -> Command {
        if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(command);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command);
            #[cfg(unix)]
            c.process_group(0);
            c
        }
    }
}

/// Kills a process group when dropped.
struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<u32>,
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.and_then(|id| libc::pid_t::try_from(id).ok()) {
            // SAFETY: killpg has no memory effects; a stale group yields ESRCH.
            if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    debug!(pgid, error = %err, "failed to kill process group");
                }
            }
        }
    }
}

/// Output reader tasks, aborted when dropped so their sinks are released.
struct Readers(Vec<JoinHandle<()>>);

impl Drop for Readers {
    fn drop(&mut self) {
        for reader in &self.0 {
            reader.abort();
        }
    }
}

#[async_trait]
impl ProcessRunner for ShellRunner {
    async fn invoke(
        &self,
        command: &str,
        cwd: &Path,
        stdout: LineSink,
        stderr: LineSink,
    ) -> Result<i32> {
        let mut child = Self::command(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Invocation {
                target: cwd.display().to_string(),
                message: format!("Failed to spawn '{}': {}", command, e),
            })?;

        let group = ProcessGroup { pgid: child.id() };
        let mut readers = Readers(Vec::with_capacity(2));
        if let Some(pipe) = child.stdout.take() {
            readers.0.push(tokio::spawn(forward_lines(pipe, stdout)));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.0.push(tokio::spawn(forward_lines(pipe, stderr)));
        }

        let status = child.wait().await;
        // Leftover background processes would hold the pipes open.
        drop(group);

        for reader in readers.0.drain(..) {
            if let Err(e) = reader.await {
                warn!(error = %e, "output reader task failed");
            }
        }

        let status = status.map_err(|e| Error::Invocation {
            target: cwd.display().to_string(),
            message: format!("Failed to wait for process: {}", e),
        })?;

        let code = status.code().unwrap_or(-1);
        debug!(command, cwd = %cwd.display(), exit_code = code, "process exited");
        Ok(code)
    }
}

/// Reads `pipe` line by line into `sink`. Invalid UTF-8 is replaced rather
/// than aborting the stream.
async fn forward_lines<R>(pipe: R, sink: LineSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if sink.send_line(line).await.is_err() {
                    // Nobody is listening; keep draining so the child doesn't block.
                    continue;
                }
            }
            Err(e) => {
                debug!(error = %e, stream = ?sink.stream(), "error reading process output");
                break;
            }
        }
    }
}
