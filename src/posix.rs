use std::ffi::CString;
use std::fs::File;
use std::io::{Error, Result};
use std::mem::MaybeUninit;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::ptr;

pub use libc::{EAGAIN, ECHILD, EMFILE, ENFILE, ENOENT};

fn check_err<T: Ord + Default>(num: T) -> Result<T> {
    if num < T::default() {
        return Err(Error::last_os_error());
    }
    Ok(num)
}

/// Creates an anonymous pipe, returning `(read_end, write_end)`.
pub fn pipe() -> Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    check_err(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
}

/// Marks the descriptor close-on-exec.
pub fn set_cloexec(f: &File) -> Result<()> {
    let fd = f.as_raw_fd();
    let old = check_err(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    check_err(unsafe { libc::fcntl(fd, libc::F_SETFD, old | libc::FD_CLOEXEC) })?;
    Ok(())
}

/// Switches the descriptor between blocking and non-blocking mode.
#[allow(dead_code)]
pub fn set_nonblocking(f: &File, nonblocking: bool) -> Result<()> {
    let fd = f.as_raw_fd();
    let old = check_err(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    let new = if nonblocking {
        old | libc::O_NONBLOCK
    } else {
        old & !libc::O_NONBLOCK
    };
    check_err(unsafe { libc::fcntl(fd, libc::F_SETFL, new) })?;
    Ok(())
}

pub fn dup2(oldfd: i32, newfd: i32) -> Result<()> {
    check_err(unsafe { libc::dup2(oldfd, newfd) })?;
    Ok(())
}

/// Forks the process.  Returns `Ok(Some(child_pid))` in the parent and
/// `Ok(None)` in the child.
///
/// # Safety
///
/// The caller must ensure that the child only executes async-signal-safe
/// operations until it calls `exec` or `_exit`.
pub unsafe fn fork() -> Result<Option<u32>> {
    let pid = check_err(unsafe { libc::fork() })?;
    Ok(if pid == 0 { None } else { Some(pid as u32) })
}

pub fn _exit(status: u8) -> ! {
    unsafe { libc::_exit(status as libc::c_int) }
}

/// Exit status of a reaped child.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ExitStatus {
    /// The child exited voluntarily with the given code.
    Exited(u32),
    /// The child was terminated by the given signal.
    Signaled(u8),
    /// Other `waitpid` statuses (stopped, continued).
    Other(i32),
    /// The child is known to have finished, but its status was collected
    /// elsewhere (e.g. by the process-wide reaper).
    Undetermined,
}

impl ExitStatus {
    /// True if the child exited with code 0.
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

fn decode_exit_status(status: i32) -> ExitStatus {
    if libc::WIFEXITED(status) {
        ExitStatus::Exited(libc::WEXITSTATUS(status) as u32)
    } else if libc::WIFSIGNALED(status) {
        ExitStatus::Signaled(libc::WTERMSIG(status) as u8)
    } else {
        ExitStatus::Other(status)
    }
}

/// Waits for the given child.  `flags` is 0 or `libc::WNOHANG`.
pub fn waitpid(pid: u32, flags: i32) -> Result<(u32, ExitStatus)> {
    let mut status = 0 as libc::c_int;
    let pid = check_err(unsafe {
        libc::waitpid(pid as libc::pid_t, &mut status as *mut libc::c_int, flags)
    })?;
    Ok((pid as u32, decode_exit_status(status)))
}

/// Waits for any child.  Used to release process and descriptor slots when
/// `fork` or `pipe` report transient exhaustion.
pub fn wait_any_child() -> Result<u32> {
    let mut status = 0 as libc::c_int;
    let pid = check_err(unsafe { libc::waitpid(-1, &mut status as *mut libc::c_int, 0) })?;
    Ok(pid as u32)
}

fn str_to_cstring(s: &str) -> Result<CString> {
    if s.as_bytes().contains(&0) {
        return Err(Error::from_raw_os_error(libc::EINVAL));
    }
    // not expected to fail after the NUL check above
    Ok(CString::new(s).expect("converting to C string"))
}

fn cstring_ptr(s: &CString) -> *const libc::c_char {
    s.as_bytes_with_nul().as_ptr() as _
}

/// Replaces the process image with `cmd`, passing `args` as its argument
/// vector and exactly `env` as its environment.
///
/// Unlike `execvp(3)`, the executable search uses the `PATH` entry of the
/// *passed* environment (falling back to the server default), so per-session
/// bindings take effect without touching the process environment.  Returns
/// only on failure; an `ENOENT` error means the command was found nowhere on
/// the search path.
pub fn execvpe(cmd: &str, args: &[String], env: &[(String, String)]) -> Result<()> {
    let args_cstring: Vec<CString> = args
        .iter()
        .map(|a| str_to_cstring(a))
        .collect::<Result<_>>()?;
    let mut args_ptr: Vec<*const libc::c_char> = args_cstring.iter().map(cstring_ptr).collect();
    args_ptr.push(ptr::null());

    let env_cstring: Vec<CString> = env
        .iter()
        .map(|(k, v)| str_to_cstring(&format!("{}={}", k, v)))
        .collect::<Result<_>>()?;
    let mut env_ptr: Vec<*const libc::c_char> = env_cstring.iter().map(cstring_ptr).collect();
    env_ptr.push(ptr::null());

    if cmd.contains('/') {
        let cmd_cstring = str_to_cstring(cmd)?;
        check_err(unsafe {
            libc::execve(cstring_ptr(&cmd_cstring), args_ptr.as_ptr(), env_ptr.as_ptr())
        })?;
        return Ok(());
    }

    let search = env
        .iter()
        .rev()
        .find(|(k, _)| k == "PATH")
        .map(|(_, v)| v.as_str())
        .unwrap_or(crate::session::DEFAULT_PATH);
    let mut last_err = Error::from_raw_os_error(ENOENT);
    for dir in search.split(':') {
        let candidate = if dir.is_empty() {
            cmd.to_string()
        } else {
            format!("{}/{}", dir, cmd)
        };
        let candidate = str_to_cstring(&candidate)?;
        unsafe { libc::execve(cstring_ptr(&candidate), args_ptr.as_ptr(), env_ptr.as_ptr()) };
        let err = Error::last_os_error();
        if err.raw_os_error() != Some(ENOENT) {
            last_err = err;
        }
    }
    Err(last_err)
}

/// Installs the process-wide auto-reap disposition for children the server
/// never waits on (stages whose sink is a pipe).
pub fn ignore_sigchld() -> Result<()> {
    unsafe {
        if libc::signal(libc::SIGCHLD, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

/// Called after forking to reset SIGPIPE handling to the defaults that Unix
/// programs expect.  Quoting std::process::Command::do_exec:
///
/// """
/// libstd ignores SIGPIPE, and signal-handling libraries often set a mask.
/// Child processes inherit ignored signals and the signal mask from their
/// parent, but most UNIX programs do not reset these things on their own, so
/// we need to clean things up now to avoid confusing the program we're about
/// to run.
/// """
pub fn reset_sigpipe() -> Result<()> {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        check_err(libc::sigemptyset(set.as_mut_ptr()))?;
        check_err(libc::pthread_sigmask(
            libc::SIG_SETMASK,
            set.as_ptr(),
            ptr::null_mut(),
        ))?;
        if libc::signal(libc::SIGPIPE, libc::SIG_DFL) == libc::SIG_ERR {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

pub struct PollFd(libc::pollfd);

impl PollFd {
    pub fn new(fd: Option<i32>, events: i16) -> PollFd {
        PollFd(libc::pollfd {
            fd: fd.unwrap_or(-1),
            events,
            revents: 0,
        })
    }
    pub fn test(&self, mask: i16) -> bool {
        self.0.revents & mask != 0
    }
}

pub use libc::{POLLHUP, POLLIN};

pub fn poll(fds: &mut [PollFd], timeout: i32) -> Result<usize> {
    let cnt;
    unsafe {
        let fds_ptr = &mut fds[0].0 as *mut libc::pollfd;
        cnt = check_err(libc::poll(fds_ptr, fds.len() as libc::nfds_t, timeout))?;
    }
    Ok(cnt as usize)
}
