//! Child-process builder that carries inherited file descriptors.
//!
//! The parent side allocates the control pipes and a list of extra files,
//! then relocates them to a contiguous fd range in the child between fork
//! and exec. The child side reconstructs the control channel from the fixed
//! fd numbers.
//!
//! Inherited fd layout in the child:
//!
//! - 0..=2  stdin, stdout, stderr, inherited from the parent
//! - 3      read end of the parent-to-child control pipe
//! - 4      write end of the child-to-parent control pipe
//! - 5..    one fd per extra file, in insertion order

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::PipeError;
use crate::pipe::{anon_pipe, FramedPipe};

/// First fd slot assigned to inherited files in the child.
pub const CHILD_FD_BASE: RawFd = 3;

/// Control-pipe read end as seen by the child.
pub const CONTROL_READ_FD: RawFd = 3;

/// Control-pipe write end as seen by the child.
pub const CONTROL_WRITE_FD: RawFd = 4;

/// One inherited file: either a pipe end this command owns outright, or a
/// listener fd the parent retains across successive children.
enum InheritedFd {
    Owned(OwnedFd),
    Borrowed(RawFd),
}

impl InheritedFd {
    fn raw(&self) -> RawFd {
        match self {
            Self::Owned(fd) => fd.as_raw_fd(),
            Self::Borrowed(fd) => *fd,
        }
    }
}

/// A single fd relocation step executed in the child before exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FdMove {
    src: RawFd,
    tmp: RawFd,
    dst: RawFd,
}

/// One child-process invocation and its control channel.
pub struct ChildCmd {
    command: Option<Command>,
    pipe: FramedPipe,
    inherited: Vec<InheritedFd>,
    next_fd: RawFd,
    pid: Option<u32>,
}

impl ChildCmd {
    /// Parent side: build a command with a fresh pair of control pipes.
    ///
    /// The child's pipe ends occupy the first two extra-file slots, so the
    /// first file added with [`ChildCmd::add_file`] lands on fd 5.
    pub fn new(program: &str, args: &[String]) -> io::Result<Self> {
        let (down_read, down_write) = anon_pipe()?;
        let (up_read, up_write) = anon_pipe()?;

        let pipe = FramedPipe::from_owned_fds(Some(up_read), Some(down_write))?;

        let mut command = Command::new(program);
        command.args(args);

        let inherited = vec![InheritedFd::Owned(down_read), InheritedFd::Owned(up_write)];
        Ok(Self {
            command: Some(command),
            pipe,
            next_fd: CHILD_FD_BASE + inherited.len() as RawFd,
            inherited,
            pid: None,
        })
    }

    /// Child side: reconstruct the control channel from the inherited fds.
    ///
    /// No subprocess is attached; only the pipe operations are usable.
    pub fn from_raw_fds(read_fd: RawFd, write_fd: RawFd) -> io::Result<Self> {
        Ok(Self {
            command: None,
            pipe: FramedPipe::from_raw_fds(read_fd, write_fd)?,
            inherited: Vec::new(),
            next_fd: CONTROL_WRITE_FD + 1,
            pid: None,
        })
    }

    /// Append an argument to the child's argv.
    pub fn arg(&mut self, arg: impl AsRef<str>) -> &mut Self {
        if let Some(command) = self.command.as_mut() {
            command.arg(arg.as_ref());
        }
        self
    }

    /// Set an environment variable for the child.
    pub fn env(&mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> &mut Self {
        if let Some(command) = self.command.as_mut() {
            command.env(key.as_ref(), value.as_ref());
        }
        self
    }

    /// Append an inherited file and return the fd number it will occupy in
    /// the child. The caller keeps ownership of the descriptor.
    pub fn add_file(&mut self, fd: RawFd) -> RawFd {
        self.inherited.push(InheritedFd::Borrowed(fd));
        let assigned = self.next_fd;
        self.next_fd += 1;
        assigned
    }

    /// The fd the next [`ChildCmd::add_file`] call would assign.
    pub fn next_fd(&self) -> RawFd {
        self.next_fd
    }

    /// Launch the child with stdio inherited from this process.
    ///
    /// Returns the process handle; the caller owns waiting on it. The
    /// command's copies of the child-destined pipe ends are released once
    /// the spawn succeeds.
    pub fn start(&mut self) -> io::Result<Child> {
        let command = self.command.as_mut().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "child-side command has no subprocess to start",
            )
        })?;

        let plan = relocation_plan(&self.inherited.iter().map(InheritedFd::raw).collect::<Vec<_>>());

        command
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // SAFETY: the hook runs between fork and exec and only performs
        // async-signal-safe calls (dup2, fcntl, close, prctl) over a plan
        // computed before the fork.
        unsafe {
            command.pre_exec(move || {
                apply_relocation(&plan)?;
                #[cfg(target_os = "linux")]
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        self.pid = child.id();
        // The child holds its own copies now; drop the pipe ends that were
        // staged for it.
        self.inherited.clear();
        Ok(child)
    }

    /// Pid of the spawned child, once started.
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Deliver SIGKILL to the child. A child that already exited is not an
    /// error; waiting on the process handle still reaps it.
    pub fn kill(&self) -> io::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        // SAFETY: sending a signal to a pid is memory-safe.
        if unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Write one frame to the peer.
    pub async fn write(&self, payload: &[u8]) -> Result<(), PipeError> {
        self.pipe.write(payload).await
    }

    /// Stream frames from the peer. See [`FramedPipe::read`].
    pub async fn read<F>(&self, visit: F) -> Result<(), PipeError>
    where
        F: FnMut(&[u8]) -> bool,
    {
        self.pipe.read(visit).await
    }

    /// Close both control-pipe halves. Idempotent.
    pub async fn close(&self) {
        self.pipe.close().await;
    }
}

/// Plan the two-phase relocation of inherited fds onto `3..3+n`.
///
/// Sources are first duplicated into a temporary range above every source
/// and every target, then moved onto their final slots. Without the staging
/// pass, a source sitting inside the target range would be clobbered before
/// it is copied.
fn relocation_plan(fds: &[RawFd]) -> Vec<FdMove> {
    let highest = fds.iter().copied().max().unwrap_or(0);
    let temp_base = (highest + 1)
        .max(CHILD_FD_BASE + fds.len() as RawFd)
        .max(100);
    fds.iter()
        .enumerate()
        .map(|(i, &src)| FdMove {
            src,
            tmp: temp_base + i as RawFd,
            dst: CHILD_FD_BASE + i as RawFd,
        })
        .collect()
}

/// Execute a relocation plan. Runs post-fork, so clobbered descriptors only
/// affect the child's table. `dup2` clears close-on-exec on the target fd,
/// which is what lets the files survive the exec.
fn apply_relocation(plan: &[FdMove]) -> io::Result<()> {
    for mv in plan {
        // SAFETY: dup2 on descriptor numbers, no memory involved.
        if unsafe { libc::dup2(mv.src, mv.tmp) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    for mv in plan {
        // SAFETY: as above.
        unsafe {
            if libc::dup2(mv.tmp, mv.dst) < 0 {
                return Err(io::Error::last_os_error());
            }
            libc::close(mv.tmp);
        }
    }
    Ok(())
}
