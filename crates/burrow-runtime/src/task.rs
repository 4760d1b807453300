//! Running tasks and their stdio.
//!
//! Each task gets two pipes: one for stdin, one shared by stdout and
//! stderr. The parent keeps the write end of stdin and the read end of
//! the output. Both are non-blocking so readers and writers can poll them
//! without holding a lock, and notice when the task is closed.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use burrow_common::error::{BurrowError, Result};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Pid, pipe2};

use crate::attach::Attacher;
use crate::backend::{ProcessSpec, RuntimeContainer, TaskStdio};

/// Longest single wait on a pipe before re-checking for closure.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Parent-side pipe ends of one task.
#[derive(Debug)]
struct TaskIo {
    stdin: Mutex<Option<Arc<File>>>,
    output: File,
    closed: AtomicBool,
}

/// A spawned task process.
#[derive(Debug)]
pub struct Task {
    pid: i32,
    io: Arc<TaskIo>,
}

impl Task {
    /// Spawns a task in `container` and returns it with the process handle
    /// the caller reaps.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipes cannot be created or the container
    /// fails to spawn the process.
    pub fn spawn(container: &dyn RuntimeContainer, process: &ProcessSpec) -> Result<(Self, Child)> {
        let (stdin_read, stdin_write) = pipe()?;
        let (output_read, output_write) = pipe()?;
        let _ = fcntl(&output_read, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(pipe_error)?;
        let _ = fcntl(&stdin_write, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(pipe_error)?;

        let child = container.run(
            process,
            TaskStdio {
                stdin: stdin_read,
                output: output_write,
            },
        )?;
        let pid = i32::try_from(child.id()).map_err(|_| BurrowError::Internal {
            message: format!("pid {} out of range", child.id()),
        })?;
        let task = Self {
            pid,
            io: Arc::new(TaskIo {
                stdin: Mutex::new(Some(Arc::new(File::from(stdin_write)))),
                output: File::from(output_read),
                closed: AtomicBool::new(false),
            }),
        };
        Ok((task, child))
    }

    /// Process id on the host.
    pub const fn pid(&self) -> i32 {
        self.pid
    }

    /// Task id: the decimal host pid.
    pub fn id(&self) -> String {
        self.pid.to_string()
    }

    /// Signals the task's process group. A task that already exited is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    pub fn signal(&self, kill: bool) -> Result<()> {
        let signal = if kill { Signal::SIGKILL } else { Signal::SIGTERM };
        match killpg(Pid::from_raw(self.pid), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(BurrowError::Runtime {
                message: format!("cannot signal task {}: {e}", self.pid),
            }),
        }
    }

    /// Closes the task's stdin so it sees end of input.
    pub fn close_stdin(&self) {
        close_stdin(&self.io);
    }

    /// Closes stdin and makes readers report end of output once what is
    /// buffered has been drained.
    pub fn close(&self) {
        self.io.closed.store(true, Ordering::Release);
        close_stdin(&self.io);
    }

    /// Opens a handle onto the task's stdio.
    pub fn attacher(&self) -> Box<dyn Attacher> {
        Box::new(TaskAttacher {
            io: Arc::clone(&self.io),
            read_timeout: None,
            write_timeout: None,
        })
    }
}

/// Blocks until the process has exited without reaping it, so its pid
/// cannot be reused while the caller still tracks it.
#[cfg(target_os = "linux")]
pub(crate) fn wait_exited(pid: i32) {
    use nix::sys::wait::{Id, WaitPidFlag, waitid};

    loop {
        match waitid(Id::Pid(Pid::from_raw(pid)), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Err(Errno::EINTR) => {}
            _ => return,
        }
    }
}

/// Non-Linux fallback; the caller reaps directly.
#[cfg(not(target_os = "linux"))]
pub(crate) fn wait_exited(_pid: i32) {}

/// Reaps a task whose [`Child`] handle was lost, blocking until it exits.
pub(crate) fn reap_pid(pid: i32) {
    use nix::sys::wait::waitpid;

    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Err(Errno::EINTR) => {}
            _ => return,
        }
    }
}

fn stdin(io: &TaskIo) -> MutexGuard<'_, Option<Arc<File>>> {
    match io.stdin.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn close_stdin(io: &TaskIo) {
    drop(stdin(io).take());
}

/// Waits up to `slice`, or until `deadline` if that is sooner, for `fd` to
/// report one of `events`. Fails with `timed_out` once the deadline passed.
fn poll_slice(fd: BorrowedFd<'_>, events: PollFlags, deadline: Option<Instant>, timed_out: io::Error) -> io::Result<()> {
    let mut slice = POLL_SLICE;
    if let Some(deadline) = deadline {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(timed_out);
        }
        slice = slice.min(left);
    }
    let millis = u16::try_from(slice.as_millis()).unwrap_or(u16::MAX);
    let mut fds = [PollFd::new(fd, events)];
    match poll(&mut fds, PollTimeout::from(millis.max(1))) {
        Ok(_) | Err(Errno::EINTR) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_CLOEXEC).map_err(pipe_error)
}

fn pipe_error(err: Errno) -> BurrowError {
    BurrowError::Runtime {
        message: format!("cannot set up task pipes: {err}"),
    }
}

/// [`Attacher`] reading and writing a local task's pipes.
#[derive(Debug)]
struct TaskAttacher {
    io: Arc<TaskIo>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl Read for TaskAttacher {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = self.read_timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let closed = self.io.closed.load(Ordering::Acquire);
            match (&self.io.output).read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if closed {
                        return Ok(0);
                    }
                    poll_slice(self.io.output.as_fd(), PollFlags::POLLIN, deadline, e)?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Write for TaskAttacher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let deadline = self.write_timeout.map(|timeout| Instant::now() + timeout);
        loop {
            // Never hold the lock across the write.
            let Some(file) = stdin(&self.io).clone() else {
                return Err(io::ErrorKind::BrokenPipe.into());
            };
            if self.io.closed.load(Ordering::Acquire) {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            match (&*file).write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    poll_slice(file.as_fd(), PollFlags::POLLOUT, deadline, e)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Attacher for TaskAttacher {
    fn close_write(&mut self) -> io::Result<()> {
        close_stdin(&self.io);
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.write_timeout = timeout;
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn Attacher>> {
        Ok(Box::new(Self {
            io: Arc::clone(&self.io),
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HostRuntime, Runtime};
    use crate::baseline::{BaselineOptions, assemble};
    use burrow_common::meta::Metainfo;
    use std::path::Path;

    fn host_container() -> Box<dyn RuntimeContainer> {
        let config = assemble(
            &Metainfo::default(),
            Path::new("/"),
            &BaselineOptions::current(true),
        );
        HostRuntime::new().create("test,1", &config).expect("create")
    }

    fn process(args: &[&str]) -> ProcessSpec {
        ProcessSpec {
            args: args.iter().map(|a| (*a).to_string()).collect(),
            env: vec![(
                "PATH".into(),
                burrow_common::constants::DEFAULT_TASK_PATH.into(),
            )],
            cwd: "/".into(),
            init_pid: None,
            capabilities: Vec::new(),
            rlimits: Vec::new(),
        }
    }

    fn read_all(attacher: &mut dyn Attacher) -> Vec<u8> {
        let mut out = Vec::new();
        let _ = attacher.read_to_end(&mut out).expect("read");
        out
    }

    #[test]
    fn echoes_stdin_until_closed() {
        let container = host_container();
        let (task, mut child) = Task::spawn(container.as_ref(), &process(&["cat"])).expect("spawn");
        let mut attacher = task.attacher();
        attacher.write_all(b"hello\n").unwrap();
        attacher.close_write().unwrap();
        assert_eq!(read_all(attacher.as_mut()), b"hello\n");
        assert!(child.wait().unwrap().success());
    }

    #[test]
    fn stderr_shares_the_output_pipe() {
        let container = host_container();
        let (task, mut child) =
            Task::spawn(container.as_ref(), &process(&["sh", "-c", "echo out; echo err >&2"]))
                .expect("spawn");
        let mut attacher = task.attacher();
        let _ = child.wait().unwrap();
        assert_eq!(read_all(attacher.as_mut()), b"out\nerr\n");
    }

    #[test]
    fn read_timeout_reports_would_block() {
        let container = host_container();
        let (task, mut child) = Task::spawn(container.as_ref(), &process(&["cat"])).expect("spawn");
        let mut attacher = task.attacher();
        attacher
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut buf = [0_u8; 8];
        let err = attacher.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        task.close();
        let _ = child.wait().unwrap();
    }

    #[test]
    fn closed_task_reads_eof_even_with_live_writers() {
        let container = host_container();
        let (task, mut child) =
            Task::spawn(container.as_ref(), &process(&["sleep", "5"])).expect("spawn");
        let mut attacher = task.attacher();
        task.close();
        let mut buf = [0_u8; 8];
        assert_eq!(attacher.read(&mut buf).unwrap(), 0);
        task.signal(true).unwrap();
        let _ = child.wait().unwrap();
    }

    #[test]
    fn write_after_close_is_broken_pipe() {
        let container = host_container();
        let (task, mut child) = Task::spawn(container.as_ref(), &process(&["cat"])).expect("spawn");
        let mut attacher = task.attacher();
        task.close_stdin();
        let err = attacher.write(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let _ = child.wait().unwrap();
    }

    #[test]
    fn signalling_an_exited_task_succeeds() {
        let container = host_container();
        let (task, mut child) = Task::spawn(container.as_ref(), &process(&["true"])).expect("spawn");
        let _ = child.wait().unwrap();
        task.signal(false).unwrap();
    }
}
