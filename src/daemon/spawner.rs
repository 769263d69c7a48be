//! Starting worker processes.
//!
//! A worker is a fresh execution of the daemon binary in worker role:
//! `taskd [--config PATH] worker --task <name> --parent-pid <pid>`.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    /// Terminating signal, when killed by one.
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signalled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Parent-side handle on one running worker.
pub trait WorkerHandle: Send {
    fn id(&self) -> u32;

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> io::Result<Option<WorkerExit>>;

    /// Ask the worker to finish its current item and exit (SIGTERM).
    fn terminate(&mut self) -> io::Result<()>;

    /// Stop the worker immediately.
    fn kill(&mut self) -> io::Result<()>;
}

/// Duplicates the daemon into a worker for one task.
pub trait WorkerSpawner: Send {
    fn spawn(&mut self, task: &str, parent_id: u32) -> io::Result<Box<dyn WorkerHandle>>;
}

/// Spawns workers by re-running a program, normally the current executable.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    config: Option<PathBuf>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>, config: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config,
        }
    }

    /// Spawner re-running this binary, forwarding the configuration path.
    pub fn current_exe(config: Option<PathBuf>) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, config))
    }

    pub fn args(&self, task: &str, parent_id: u32) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.display().to_string());
        }
        args.extend([
            "worker".to_string(),
            "--task".to_string(),
            task.to_string(),
            "--parent-pid".to_string(),
            parent_id.to_string(),
        ]);
        args
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&mut self, task: &str, parent_id: u32) -> io::Result<Box<dyn WorkerHandle>> {
        let child = Command::new(&self.program)
            .args(self.args(task, parent_id))
            .stdin(Stdio::null())
            .spawn()?;
        let id = child
            .id()
            .ok_or_else(|| io::Error::other("spawned worker exited before reporting a pid"))?;
        Ok(Box::new(ChildHandle { id, child }))
    }
}

struct ChildHandle {
    id: u32,
    child: Child,
}

impl WorkerHandle for ChildHandle {
    fn id(&self) -> u32 {
        self.id
    }

    fn try_wait(&mut self) -> io::Result<Option<WorkerExit>> {
        Ok(self.child.try_wait()?.map(WorkerExit::from))
    }

    fn terminate(&mut self) -> io::Result<()> {
        send_terminate(self.id)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid).map_err(|_| io::Error::other("pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "graceful termination needs unix signals",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_args_forward_config() {
        let spawner = CommandSpawner::new("/usr/bin/taskd", Some(PathBuf::from("/etc/taskd.toml")));
        assert_eq!(
            spawner.args("reports/daily", 77),
            vec![
                "--config",
                "/etc/taskd.toml",
                "worker",
                "--task",
                "reports/daily",
                "--parent-pid",
                "77"
            ]
        );

        let bare = CommandSpawner::new("taskd", None);
        assert_eq!(bare.args("x", 1)[0], "worker");
    }

    #[test]
    fn exit_display() {
        assert_eq!(WorkerExit::code(0).to_string(), "exit code 0");
        assert!(WorkerExit::code(0).success());
        assert_eq!(WorkerExit::signalled(9).to_string(), "signal 9");
        assert!(!WorkerExit::signalled(15).success());
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let mut spawner = CommandSpawner::new("/nonexistent/taskd-binary", None);
        assert!(spawner.spawn("example", std::process::id()).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_process_can_be_terminated() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let id = child.id().unwrap();
        let mut handle = ChildHandle { id, child };
        assert_eq!(handle.try_wait().unwrap(), None);

        handle.terminate().unwrap();
        let status = handle.child.wait().await.unwrap();
        assert_eq!(WorkerExit::from(status).signal, Some(libc::SIGTERM));
    }
}
