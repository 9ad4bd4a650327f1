use std::fs::{File, OpenOptions};
use std::io::Result;

/// The null device used for bit-bucket wiring.
pub const NULL_DEVICE: &str = "/dev/null";

/// Opens the null device read-write, for draining input or discarding output
/// of a stage whose data flow was invalidated by a user error.
pub fn open_null() -> Result<File> {
    OpenOptions::new().read(true).write(true).open(NULL_DEVICE)
}

/// Where a stage reads its standard input from.
///
/// Every descriptor is a move-only owned [`File`]; dropping a source closes
/// the parent's copies, so descriptor hygiene reduces to dropping the
/// [`Stage`] after fork.
#[derive(Debug)]
pub enum StdinSource {
    /// Inherit the server process's stdin.
    Inherit,
    /// Read end of an anonymous pipe (numbered, intra-line, or user pipe).
    ///
    /// `write` is the parent's last copy of the matching write end, carried
    /// here so it is closed when the stage is dropped after fork; until then
    /// the reader could never see EOF.
    Pipe {
        /// Read end, dup2ed over the child's stdin.
        read: File,
        /// Leftover write end to close once the stage is launched.
        write: Option<File>,
    },
    /// An opened regular file (`< name`).
    File(File),
    /// Bit bucket: reads see immediate EOF.
    Null(File),
}

/// Where a stage sends its standard output.
#[derive(Debug)]
pub enum StdoutSink {
    /// The acting session's terminal (a dup of the client socket).
    Terminal(File),
    /// Write end (a dup) of an anonymous pipe.  The stage is launched
    /// without blocking so a later stage can drain the pipe.
    Pipe(File),
    /// An opened regular file (`> name` or `>> name`).
    File(File),
    /// Bit bucket: output is discarded.
    Null(File),
}

impl StdoutSink {
    /// True if the sink is a pipe, in which case the parent must not block
    /// on the stage.
    pub fn is_pipe(&self) -> bool {
        matches!(self, StdoutSink::Pipe(_))
    }
}

/// Where a stage sends its standard error.
#[derive(Debug)]
pub enum StderrSink {
    /// The acting session's terminal.
    Terminal(File),
    /// Share the stdout sink, as requested by the `!` operator family.
    MergeWithStdout,
}

/// One unit of execution: an external command with fully resolved standard
/// streams.
///
/// A stage is assembled by the line engine, consumed exactly once by the
/// executor, and discarded.  All pipe ends it holds are the parent's copies;
/// the executor drops them right after fork.
#[derive(Debug)]
pub struct Stage {
    /// Argument vector; the first word is the command name.
    pub argv: Vec<String>,
    /// Standard input source.
    pub stdin: StdinSource,
    /// Standard output sink.
    pub stdout: StdoutSink,
    /// Standard error sink.
    pub stderr: StderrSink,
}
