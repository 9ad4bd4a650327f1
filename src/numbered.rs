use std::collections::HashMap;
use std::fs::File;
use std::io::Result;

use crate::posix;

// Transient descriptor exhaustion is resolved by reaping a finished child;
// give up after this many attempts so a genuinely exhausted process cannot
// spin forever.
const PIPE_RETRIES: usize = 64;

struct Entry {
    read: File,
    write: File,
}

/// Per-session table of numbered pipes.
///
/// Each entry carries the output of an already-launched stage toward a stage
/// on a future command line.  The key is the remaining *delay* in line
/// boundaries; the table is aged once per stage-submission boundary (except
/// after an intra-line `|`, whose pipe is consumed by the very next stage of
/// the same line), and the entry that reaches delay 0 becomes the stdin of
/// the next submitted stage.
#[derive(Default)]
pub struct NumberedPipeTable {
    entries: HashMap<u32, Entry>,
}

impl NumberedPipeTable {
    /// Creates an empty table.
    pub fn new() -> NumberedPipeTable {
        NumberedPipeTable::default()
    }

    /// Returns a write end for the pipe scheduled `delay` stage-submission
    /// boundaries ahead, creating the pipe on first use.
    ///
    /// The returned descriptor is a dup owned by the caller; the table keeps
    /// both original ends until the entry is taken or retired.
    pub fn open_for_writer(&mut self, delay: u32) -> Result<File> {
        if !self.entries.contains_key(&delay) {
            let (read, write) = create_pipe_reaping()?;
            // The table's ends must not ride along into unrelated children:
            // every fork copies the whole descriptor table, and a leaked
            // write end would hold off EOF for this pipe's eventual reader.
            posix::set_cloexec(&read)?;
            posix::set_cloexec(&write)?;
            self.entries.insert(delay, Entry { read, write });
        }
        self.entries[&delay].write.try_clone()
    }

    /// Takes the entry whose delay has run out, if any.
    ///
    /// Returns `(read_end, write_end)`: the read end becomes the next
    /// stage's stdin, and the write end is the parent's last copy, to be
    /// closed once the stage has been launched.
    pub fn take_zero_reader(&mut self) -> Option<(File, File)> {
        self.entries.remove(&0).map(|e| (e.read, e.write))
    }

    /// Rekeys every entry from `delay` to `delay - 1`.
    ///
    /// An entry still sitting at delay 0 had its chance to be consumed and
    /// is retired; dropping it closes both ends, so a stage left writing
    /// into it sees EPIPE instead of filling the kernel buffer of a pipe no
    /// one will ever read.
    pub fn age(&mut self) {
        self.entries = std::mem::take(&mut self.entries)
            .into_iter()
            .filter_map(|(delay, entry)| delay.checked_sub(1).map(|aged| (aged, entry)))
            .collect();
    }

    /// True if an entry with the given delay exists.
    pub fn contains(&self, delay: u32) -> bool {
        self.entries.contains_key(&delay)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the table has no live entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// pipe(2) with the reap-and-retry policy for descriptor exhaustion: a
// finished child holds descriptors the kernel releases on reap.
fn create_pipe_reaping() -> Result<(File, File)> {
    let mut attempts = 0;
    loop {
        match posix::pipe() {
            Ok(ends) => return Ok(ends),
            Err(e)
                if attempts < PIPE_RETRIES
                    && matches!(e.raw_os_error(), Some(posix::EMFILE) | Some(posix::ENFILE)) =>
            {
                attempts += 1;
                posix::wait_any_child().ok();
            }
            Err(e) => return Err(e),
        }
    }
}
