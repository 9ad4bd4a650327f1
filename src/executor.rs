use std::fs::File;
use std::io::{Error, ErrorKind, Result};
use std::os::unix::io::AsRawFd;

use crate::posix::{self, ExitStatus};
use crate::stage::{Stage, StderrSink, StdinSource, StdoutSink};

// Transient fork failures are resolved by reaping a finished child; give up
// after this many attempts.
const FORK_RETRIES: usize = 64;

/// What happened to a launched stage.
#[derive(Debug)]
pub enum LaunchOutcome {
    /// The sink was a terminal or a file, so the parent blocked until the
    /// child finished.
    Waited(ExitStatus),
    /// The sink is a pipe; the child runs concurrently and will be
    /// collected by the process-wide reaper.
    Detached {
        /// The child's pid.
        pid: u32,
    },
}

/// Launches one pipeline stage.
///
/// The child dup2s the stage's ends over its standard streams, closes the
/// originals, and execs the command under the given environment.  The
/// parent drops every descriptor the stage carried, then blocks on the
/// child exactly when the stdout sink is not a pipe: a pipe-sinked stage
/// must keep running while later stages drain it, while a terminal- or
/// file-sinked stage must finish before the session sees its next prompt.
///
/// A command that cannot be found reports `Unknown command: [NAME].` on the
/// stage's stderr and exits 0; that is shell output, not an error.
pub fn launch(stage: Stage, env: &[(String, String)]) -> Result<LaunchOutcome> {
    if stage.argv.is_empty() {
        return Err(Error::new(ErrorKind::InvalidInput, "argv must not be empty"));
    }
    let block = !stage.stdout.is_pipe();
    match fork_reaping()? {
        None => run_child(stage, env),
        Some(pid) => {
            // Close the parent's copies of the stage's ends promptly, so
            // pipe readers can see EOF and blocking waits cannot deadlock.
            drop(stage);
            if block {
                Ok(LaunchOutcome::Waited(wait_child(pid)?))
            } else {
                Ok(LaunchOutcome::Detached { pid })
            }
        }
    }
}

// fork(2) with the reap-and-retry policy for the per-user process cap.
fn fork_reaping() -> Result<Option<u32>> {
    let mut attempts = 0;
    loop {
        match unsafe { posix::fork() } {
            Ok(forked) => return Ok(forked),
            Err(e) if attempts < FORK_RETRIES && e.raw_os_error() == Some(posix::EAGAIN) => {
                attempts += 1;
                posix::wait_any_child().ok();
            }
            Err(e) => return Err(e),
        }
    }
}

fn wait_child(pid: u32) -> Result<ExitStatus> {
    match posix::waitpid(pid, 0) {
        Ok((_, status)) => Ok(status),
        // The process-wide reaper can win the race for the status; the
        // child is gone either way.
        Err(e) if e.raw_os_error() == Some(posix::ECHILD) => Ok(ExitStatus::Undetermined),
        Err(e) => Err(e),
    }
}

fn run_child(stage: Stage, env: &[(String, String)]) -> ! {
    let name = stage.argv[0].clone();
    match child_exec(stage, env) {
        Ok(()) => unreachable!(),
        Err(e) if e.raw_os_error() == Some(posix::ENOENT) => {
            eprintln!("Unknown command: [{}].", name);
            posix::_exit(0);
        }
        Err(_) => posix::_exit(1),
    }
}

// Child side: wire the standard streams and exec.  Returns only on failure.
fn child_exec(stage: Stage, env: &[(String, String)]) -> Result<()> {
    let Stage {
        argv,
        stdin,
        stdout,
        stderr,
    } = stage;

    match &stdin {
        StdinSource::Inherit => {}
        StdinSource::Pipe { read, .. } => dup2_over(read, 0)?,
        StdinSource::File(f) | StdinSource::Null(f) => dup2_over(f, 0)?,
    }
    match &stdout {
        StdoutSink::Terminal(f)
        | StdoutSink::Pipe(f)
        | StdoutSink::File(f)
        | StdoutSink::Null(f) => dup2_over(f, 1)?,
    }
    match &stderr {
        StderrSink::Terminal(f) => dup2_over(f, 2)?,
        StderrSink::MergeWithStdout => posix::dup2(1, 2)?,
    }

    // Close the original ends; the dup2ed 0/1/2 survive the exec.
    drop(stdin);
    drop(stdout);
    drop(stderr);

    posix::reset_sigpipe()?;
    posix::execvpe(&argv[0], &argv, env)?;
    unreachable!();
}

fn dup2_over(f: &File, target: i32) -> Result<()> {
    if f.as_raw_fd() != target {
        posix::dup2(f.as_raw_fd(), target)?;
    }
    Ok(())
}
