//! Supervised child processes
//!
//! A [`SupervisedProcess`] is created only once the child is running, and its
//! termination action runs exactly once: either through [`SupervisedProcess::terminate`]
//! or when the guard is dropped. On unix the child leads its own process
//! group, and termination targets the whole group: SIGTERM, a short grace
//! period, then SIGKILL, then reap. Descendants started through wrappers
//! (`sh -c`, launcher scripts) go down with it. Failures are logged, never
//! returned.
//!
//! Xvfb removes its `/tmp/.X<n>-lock` file only when it gets to shut down
//! cleanly, which is why SIGTERM comes first.

use std::fmt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::error::{HarnessError, Result};
use crate::teardown::{TeardownEvent, TeardownLog};

/// How long a child gets to exit after SIGTERM before it is killed
const TERM_GRACE: Duration = Duration::from_millis(500);

/// How long to wait for the group to vanish after SIGKILL
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Poll interval while waiting for a terminated child
const REAP_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    DisplayServer,
    Subject,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::DisplayServer => f.write_str("display server"),
            ProcessRole::Subject => f.write_str("subject"),
        }
    }
}

/// Where the child's stdout/stderr go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChildOutput {
    #[default]
    Inherit,
    Discard,
}

/// Command line and environment of a process to supervise
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub output: ChildOutput,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            output: ChildOutput::Inherit,
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn output(mut self, output: ChildOutput) -> Self {
        self.output = output;
        self
    }

    /// Split a whitespace separated command line ("xeyes -geometry 50x50")
    pub fn parse_command_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| HarnessError::Config("empty command line".into()))?;
        Ok(Self::new(program).args(parts))
    }

    /// Program and arguments as one printable string
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A running child that is terminated when this guard goes away
pub struct SupervisedProcess {
    child: Child,
    role: ProcessRole,
    command: String,
    terminated: bool,
    teardown: Option<TeardownLog>,
}

impl SupervisedProcess {
    /// Start `spec` with `DISPLAY` pointing at `display`
    ///
    /// # Errors
    /// Returns [`HarnessError::ProcessStart`] if the executable cannot be spawned.
    pub fn start(
        spec: &ProcessSpec,
        role: ProcessRole,
        display: &str,
        teardown: Option<TeardownLog>,
    ) -> Result<Self> {
        let command = spec.command_line();

        let mut cmd = Command::new(&spec.program);
        // DISPLAY goes last so extra variables cannot retarget the child
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("DISPLAY", display)
            .stdin(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        if spec.output == ChildOutput::Discard {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let child = cmd.spawn().map_err(|source| HarnessError::ProcessStart {
            command: command.clone(),
            source,
        })?;

        log::info!("🚀 Started {} `{}` (pid {}) on {}", role, command, child.id(), display);

        Ok(Self {
            child,
            role,
            command,
            terminated: false,
            teardown,
        })
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    #[must_use]
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// Exit status if the child has already exited, without blocking
    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Run the termination action now. Later calls (and drop) do nothing.
    pub fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        let pid = self.child.id();
        if let Ok(Some(status)) = self.child.try_wait() {
            log::debug!("{} `{}` already exited: {}", self.role, self.command, status);
        }
        // The leader may be gone while descendants in its group still run
        self.stop_group();
        if let Err(e) = self.child.wait() {
            log::warn!("Failed to reap {} (pid {}): {}", self.role, pid, e);
        }
        log::info!("🛑 Stopped {} `{}` (pid {})", self.role, self.command, pid);

        if let Some(log) = &self.teardown {
            log.record(TeardownEvent::ProcessKilled { role: self.role, pid });
        }
    }

    /// SIGTERM the process group, wait out the grace period, then SIGKILL it
    #[cfg(unix)]
    fn stop_group(&mut self) {
        let Ok(pgid) = libc::pid_t::try_from(self.child.id()) else {
            if let Err(e) = self.child.kill() {
                log::warn!("Failed to kill {} `{}`: {}", self.role, self.command, e);
            }
            return;
        };

        if !signal_group(pgid, libc::SIGTERM) || self.wait_group_exit(pgid, TERM_GRACE) {
            return;
        }
        log::debug!("{} group {} ignored SIGTERM, sending SIGKILL", self.role, pgid);
        if signal_group(pgid, libc::SIGKILL) && !self.wait_group_exit(pgid, KILL_GRACE) {
            log::warn!("{} group {} still present after SIGKILL", self.role, pgid);
        }
    }

    /// Reap the leader while polling until no member of the group is left
    #[cfg(unix)]
    fn wait_group_exit(&mut self, pgid: libc::pid_t, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let _ = self.child.try_wait();
            if !group_exists(pgid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(REAP_POLL);
        }
    }

    #[cfg(not(unix))]
    fn stop_group(&mut self) {
        if let Err(e) = self.child.kill() {
            log::warn!("Failed to kill {} `{}`: {}", self.role, self.command, e);
        }
    }
}

/// Send `signal` to every process in group `pgid`. False if the group is gone.
#[cfg(unix)]
fn signal_group(pgid: libc::pid_t, signal: libc::c_int) -> bool {
    // SAFETY: negative pid targets the group this guard created for its child
    if unsafe { libc::kill(-pgid, signal) } == 0 {
        return true;
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        log::warn!("Failed to signal process group {}: {}", pgid, err);
    }
    false
}

#[cfg(unix)]
fn group_exists(pgid: libc::pid_t) -> bool {
    // SAFETY: signal 0 only checks for existence
    unsafe { libc::kill(-pgid, 0) == 0 }
}

impl Drop for SupervisedProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl fmt::Debug for SupervisedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisedProcess")
            .field("role", &self.role)
            .field("command", &self.command)
            .field("pid", &self.child.id())
            .field("terminated", &self.terminated)
            .finish()
    }
}

/// Whether a pid still names a live (non-zombie) process
#[cfg(unix)]
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks for existence
    if unsafe { libc::kill(raw, 0) } != 0 {
        return false;
    }
    !is_zombie(pid)
}

/// Orphans wait as zombies until init reaps them
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            // state follows the parenthesised command name
            let (_, rest) = stat.rsplit_once(')')?;
            rest.trim_start().chars().next()
        })
        .is_some_and(|state| state == 'Z')
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}
