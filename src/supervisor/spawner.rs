use crate::ipc::{ChannelReceiver, ChannelSender, Envelope, MessageChannel};
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Subcommand that runs the child side of a bridge.
pub const CHILD_SUBCOMMAND: &str = "child-bridge";

/// How long a terminated child gets before it is killed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ChildExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// A running child: its message channel, a one-shot terminate trigger and
/// a one-shot exit report.
pub struct SpawnedChild {
    pub pid: Option<u32>,
    pub sender: ChannelSender<Envelope>,
    pub receiver: ChannelReceiver<Envelope>,
    pub terminate: oneshot::Sender<()>,
    pub exited: oneshot::Receiver<ChildExit>,
}

pub trait ChildSpawner: Send + Sync {
    fn spawn(&self, args: &[String]) -> io::Result<SpawnedChild>;
}

/// Spawns child bridges as OS processes talking over stdin/stdout.
/// Stderr is inherited so child logs reach the host's log sink.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    base_args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    /// Re-run the current executable in child bridge mode.
    pub fn current() -> io::Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            vec![CHILD_SUBCOMMAND.to_string()],
        ))
    }
}

impl ChildSpawner for ProcessSpawner {
    fn spawn(&self, args: &[String]) -> io::Result<SpawnedChild> {
        let mut child = Command::new(&self.program)
            .args(&self.base_args)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin is not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout is not piped"))?;

        let pid = child.id();
        let label = match pid {
            Some(pid) => format!("child-{pid}"),
            None => "child".to_string(),
        };
        let (sender, receiver) = MessageChannel::open(stdout, stdin, label);
        let (terminate, terminate_rx) = oneshot::channel();
        let (exit_tx, exited) = oneshot::channel();
        tokio::spawn(watch_child(child, terminate_rx, exit_tx));

        debug!(pid, program = %self.program.display(), "Spawned child bridge process");
        Ok(SpawnedChild {
            pid,
            sender,
            receiver,
            terminate,
            exited,
        })
    }
}

fn send_sigterm(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
}

async fn watch_child(
    mut child: Child,
    mut terminate: oneshot::Receiver<()>,
    exited: oneshot::Sender<ChildExit>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut terminate => {
            send_sigterm(&mut child);
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(pid = child.id(), "Child bridge did not exit in time, force killing");
                    let _ = child.kill().await;
                    child.wait().await
                }
            }
        }
    };

    let exit = match status {
        Ok(status) => ChildExit::from(status),
        Err(e) => {
            warn!("Failed to wait for child bridge process: {}", e);
            ChildExit::default()
        }
    };
    let _ = exited.send(exit);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_pass_through_process_and_terminate_signals() {
        let spawner = ProcessSpawner::new("cat", Vec::new());
        let mut child = spawner.spawn(&[]).unwrap();
        assert!(child.pid.is_some());

        child.sender.send(Envelope::Ready).unwrap();
        assert_eq!(child.receiver.recv().await, Some(Envelope::Ready));

        child.terminate.send(()).unwrap();
        let exit = child.exited.await.unwrap();
        assert_eq!(exit.signal, Some(libc::SIGTERM));
        assert_eq!(exit.code, None);
    }

    #[tokio::test]
    async fn exit_is_reported_without_terminate() {
        let spawner = ProcessSpawner::new("sh", vec!["-c".into(), "exit 3".into()]);
        let child = spawner.spawn(&[]).unwrap();
        let exit = child.exited.await.unwrap();
        assert_eq!(exit.code, Some(3));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let spawner = ProcessSpawner::new("/nonexistent/hanna-child", Vec::new());
        assert!(spawner.spawn(&[]).is_err());
    }
}
