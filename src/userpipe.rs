use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::fs::File;
use std::io;

use crate::posix;
use crate::session::{SessionId, SessionRegistry};

const PIPE_RETRIES: usize = 64;

struct Entry {
    read: File,
    write: File,
}

/// Why a user-pipe operation could not proceed.
#[derive(Debug)]
pub enum UserPipeError {
    /// The named endpoint is not a logged-in session.
    NoSuchUser(SessionId),
    /// A `sender -> receiver` pipe already exists.
    AlreadyExists {
        /// Sending session.
        sender: SessionId,
        /// Receiving session.
        receiver: SessionId,
    },
    /// No `sender -> receiver` pipe exists to consume.
    DoesNotExist {
        /// Sending session.
        sender: SessionId,
        /// Receiving session.
        receiver: SessionId,
    },
    /// Channel creation failed at the OS level.
    Io(io::Error),
}

impl UserPipeError {
    /// The exact notice shown to the acting session, or `None` for OS-level
    /// failures, which are not user errors.
    pub fn user_message(&self) -> Option<String> {
        match *self {
            UserPipeError::NoSuchUser(id) => {
                Some(format!("*** Error: user #{} does not exist yet. ***\n", id))
            }
            UserPipeError::AlreadyExists { sender, receiver } => Some(format!(
                "*** Error: the pipe #{}->#{} already exists. ***\n",
                sender, receiver
            )),
            UserPipeError::DoesNotExist { sender, receiver } => Some(format!(
                "*** Error: the pipe #{}->#{} does not exist yet. ***\n",
                sender, receiver
            )),
            UserPipeError::Io(_) => None,
        }
    }
}

impl From<io::Error> for UserPipeError {
    fn from(err: io::Error) -> UserPipeError {
        UserPipeError::Io(err)
    }
}

impl fmt::Display for UserPipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserPipeError::NoSuchUser(id) => write!(f, "user #{} does not exist", id),
            UserPipeError::AlreadyExists { sender, receiver } => {
                write!(f, "pipe #{}->#{} already exists", sender, receiver)
            }
            UserPipeError::DoesNotExist { sender, receiver } => {
                write!(f, "pipe #{}->#{} does not exist", sender, receiver)
            }
            UserPipeError::Io(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl StdError for UserPipeError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            UserPipeError::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// Cross-session byte channels keyed by `(sender, receiver)`.
///
/// An entry is created by the sender's `>N`, holds both pipe ends until the
/// receiver's `<N` consumes it, and is torn down with the session of either
/// endpoint.  At most one entry exists per key.
#[derive(Default)]
pub struct UserPipeRegistry {
    entries: HashMap<(SessionId, SessionId), Entry>,
}

impl UserPipeRegistry {
    /// Creates an empty registry.
    pub fn new() -> UserPipeRegistry {
        UserPipeRegistry::default()
    }

    /// Creates the `sender -> receiver` channel and returns a write end for
    /// the sending stage.
    ///
    /// Fails with [`UserPipeError::NoSuchUser`] if the receiver is not
    /// logged in and [`UserPipeError::AlreadyExists`] if the channel is
    /// already pending; in both cases no state changes.
    pub fn create(
        &mut self,
        sender: SessionId,
        receiver: SessionId,
        sessions: &SessionRegistry,
    ) -> Result<File, UserPipeError> {
        if !sessions.is_logged_in(receiver) {
            return Err(UserPipeError::NoSuchUser(receiver));
        }
        if self.entries.contains_key(&(sender, receiver)) {
            return Err(UserPipeError::AlreadyExists { sender, receiver });
        }
        let (read, write) = create_pipe_reaping()?;
        posix::set_cloexec(&read)?;
        posix::set_cloexec(&write)?;
        let stage_end = write.try_clone().map_err(UserPipeError::Io)?;
        self.entries.insert((sender, receiver), Entry { read, write });
        Ok(stage_end)
    }

    /// Consumes the `sender -> receiver` channel for the receiving stage.
    ///
    /// Returns `(read_end, write_end)`; the read end becomes the stage's
    /// stdin and the write end is the registry's last copy, to be closed
    /// once the stage is launched so the reader can see EOF.
    pub fn consume(
        &mut self,
        sender: SessionId,
        receiver: SessionId,
        sessions: &SessionRegistry,
    ) -> Result<(File, File), UserPipeError> {
        if !sessions.is_logged_in(sender) {
            return Err(UserPipeError::NoSuchUser(sender));
        }
        match self.entries.remove(&(sender, receiver)) {
            Some(entry) => Ok((entry.read, entry.write)),
            None => Err(UserPipeError::DoesNotExist { sender, receiver }),
        }
    }

    /// True if a `sender -> receiver` entry is pending.
    pub fn contains(&self, sender: SessionId, receiver: SessionId) -> bool {
        self.entries.contains_key(&(sender, receiver))
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no entries are pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry in which `id` is an endpoint, closing the ends.
    /// Called on logout.
    pub fn drop_for_session(&mut self, id: SessionId) {
        self.entries
            .retain(|&(sender, receiver), _| sender != id && receiver != id);
    }
}

/// `*** <sender> (#<sid>) just piped '<line>' to <receiver> (#<rid>) ***`
pub fn piped_message(
    sender_name: &str,
    sender: SessionId,
    line: &str,
    receiver_name: &str,
    receiver: SessionId,
) -> String {
    format!(
        "*** {} (#{}) just piped '{}' to {} (#{}) ***\n",
        sender_name, sender, line, receiver_name, receiver
    )
}

/// `*** <receiver> (#<rid>) just received from <sender> (#<sid>) by '<line>' ***`
pub fn received_message(
    receiver_name: &str,
    receiver: SessionId,
    sender_name: &str,
    sender: SessionId,
    line: &str,
) -> String {
    format!(
        "*** {} (#{}) just received from {} (#{}) by '{}' ***\n",
        receiver_name, receiver, sender_name, sender, line
    )
}

fn create_pipe_reaping() -> Result<(File, File), UserPipeError> {
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
            Err(e) => return Err(UserPipeError::Io(e)),
        }
    }
}
