//! Child processes that take their descendants down with them.
//!
//! A command spawned after [`isolate`] leads a fresh process group, so
//! anything it forks (`sh -c 'server &'`, the `ssh` behind `sshpass`)
//! can be signalled through [`ProcessGroup`] even after the leader exits.

use tokio::process::{Child, Command};

/// Make the spawned child the leader of a new process group.
pub fn isolate(command: &mut Command) -> &mut Command {
    #[cfg(unix)]
    command.process_group(0);
    command
}

/// Signal sent to the group when a [`ProcessGroup`] is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropSignal {
    /// SIGKILL: nothing in the group gets to clean up.
    Kill,
    /// SIGTERM: wrappers such as `sshpass` forward it to their own child.
    Terminate,
}

/// Handle on the process group of a child spawned with [`isolate`].
#[derive(Debug)]
pub struct ProcessGroup {
    pgid: Option<i32>,
    on_drop: DropSignal,
}

impl ProcessGroup {
    /// Track the group led by `child`. Dropping the handle kills the group.
    pub fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|pid| i32::try_from(pid).ok()),
            on_drop: DropSignal::Kill,
        }
    }

    pub fn on_drop(mut self, signal: DropSignal) -> Self {
        self.on_drop = signal;
        self
    }

    pub fn id(&self) -> Option<i32> {
        self.pgid
    }

    /// Ask every process in the group to exit.
    pub fn terminate(&self) {
        self.signal(DropSignal::Terminate);
    }

    /// Kill every process in the group. Later calls and drop do nothing.
    pub fn kill(&mut self) {
        self.signal(DropSignal::Kill);
        self.pgid = None;
    }

    #[cfg(unix)]
    fn signal(&self, signal: DropSignal) {
        let Some(pgid) = self.pgid else {
            return;
        };
        let signo = match signal {
            DropSignal::Kill => libc::SIGKILL,
            DropSignal::Terminate => libc::SIGTERM,
        };
        // SAFETY: killpg only sends a signal; the pgid came from a child we spawned.
        if unsafe { libc::killpg(pgid, signo) } == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::debug!(pgid, error = %err, "Failed to signal process group");
            }
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, _signal: DropSignal) {}
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        match self.on_drop {
            DropSignal::Kill => self.kill(),
            DropSignal::Terminate => self.terminate(),
        }
    }
}
