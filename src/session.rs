use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Result, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::numbered::NumberedPipeTable;

/// Maximum number of concurrently logged-in sessions.
pub const MAX_SESSIONS: usize = 30;

/// Initial `PATH` binding of every session.
pub const DEFAULT_PATH: &str = "bin:.";

/// Name a session carries until it runs `name`.
pub const DEFAULT_NAME: &str = "(no name)";

/// Prompt written after every processed line.  No trailing newline.
pub const PROMPT: &str = "% ";

/// Banner written to a client right after the connection is accepted.
pub const WELCOME_BANNER: &str = "****************************************\n\
                                  ** Welcome to the information server. **\n\
                                  ****************************************\n";

/// Session identifier, 1 through [`MAX_SESSIONS`].
pub type SessionId = usize;

/// State of one connected client.
pub struct Session {
    /// Identifier, stable for the lifetime of the connection.
    pub id: SessionId,
    /// Display name.
    pub name: String,
    /// Peer address as `ip:port`.
    pub peer: String,
    /// Environment bindings applied to this session's external commands.
    pub env: HashMap<String, String>,
    /// This session's numbered-pipe table.
    pub pipes: NumberedPipeTable,
    terminal: File,
}

impl Session {
    fn new(id: SessionId, peer: String, terminal: File) -> Session {
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), DEFAULT_PATH.to_string());
        Session {
            id,
            name: DEFAULT_NAME.to_string(),
            peer,
            env,
            pipes: NumberedPipeTable::new(),
            terminal,
        }
    }

    /// A dup of the terminal, for wiring a stage's standard streams.
    pub fn terminal_dup(&self) -> Result<File> {
        self.terminal.try_clone()
    }

    /// Raw descriptor of the terminal, for readiness polling.
    pub fn terminal_fd(&self) -> RawFd {
        self.terminal.as_raw_fd()
    }

    /// Reads client bytes from the terminal.
    pub fn read_terminal(&self, buf: &mut [u8]) -> Result<usize> {
        (&self.terminal).read(buf)
    }

    /// Writes text to the session's terminal.  A dead peer is not an error
    /// worth surfacing mid-broadcast, so callers usually ignore the result.
    pub fn write_text(&self, text: &str) -> Result<()> {
        (&self.terminal).write_all(text.as_bytes())
    }

    /// The environment as the slice shape the executor consumes.
    pub fn env_vec(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// All logged-in sessions, indexed by id.
///
/// The registry is an explicit value threaded through the line engine and
/// the server loop; nothing about session presence lives in global state.
pub struct SessionRegistry {
    slots: Vec<Option<Session>>,
}

impl Default for SessionRegistry {
    fn default() -> SessionRegistry {
        SessionRegistry::new()
    }
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> SessionRegistry {
        let mut slots = Vec::with_capacity(MAX_SESSIONS + 1);
        slots.resize_with(MAX_SESSIONS + 1, || None);
        SessionRegistry { slots }
    }

    /// Logs a new client in, assigning the smallest free id.
    ///
    /// Returns `None` when all [`MAX_SESSIONS`] slots are taken.
    pub fn login(&mut self, peer: String, terminal: File) -> Option<SessionId> {
        let id = (1..=MAX_SESSIONS).find(|&id| self.slots[id].is_none())?;
        self.slots[id] = Some(Session::new(id, peer, terminal));
        Some(id)
    }

    /// Removes a session, returning it so the caller can compose the leave
    /// broadcast before the terminal is closed.
    pub fn logout(&mut self, id: SessionId) -> Option<Session> {
        self.slots.get_mut(id).and_then(Option::take)
    }

    /// Looks a session up.
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    /// Looks a session up for mutation.
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    /// True if `id` names a currently logged-in session.
    pub fn is_logged_in(&self, id: usize) -> bool {
        self.get(id).is_some()
    }

    /// Logged-in sessions in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// `(id, terminal_fd)` for every logged-in session, for the poll loop.
    pub fn ids_and_fds(&self) -> Vec<(SessionId, RawFd)> {
        self.iter().map(|s| (s.id, s.terminal_fd())).collect()
    }

    /// True if any logged-in session already carries `name`.
    pub fn name_taken(&self, name: &str) -> bool {
        self.iter().any(|s| s.name == name)
    }

    /// Delivers a notice to every logged-in session.
    pub fn broadcast(&self, text: &str) {
        for session in self.iter() {
            session.write_text(text).ok();
        }
    }

    /// Delivers text to one session, if logged in.
    pub fn send_to(&self, id: SessionId, text: &str) {
        if let Some(session) = self.get(id) {
            session.write_text(text).ok();
        }
    }

    /// The `who` table: a tab-separated header followed by one row per
    /// logged-in session in id order, the acting session's row marked
    /// `<-me`.
    pub fn who_table(&self, me: SessionId) -> String {
        let mut out = String::from("<ID>\t<nickname>\t<IP:port>\t<indicate me>\n");
        for session in self.iter() {
            out.push_str(&format!("{}\t{}\t{}", session.id, session.name, session.peer));
            if session.id == me {
                out.push_str("\t<-me");
            }
            out.push('\n');
        }
        out
    }
}

/// `*** User '<name>' entered from <ip:port>. ***`
pub fn entered_message(name: &str, peer: &str) -> String {
    format!("*** User '{}' entered from {}. ***\n", name, peer)
}

/// `*** User '<name>' left. ***`
pub fn left_message(name: &str) -> String {
    format!("*** User '{}' left. ***\n", name)
}

/// `*** User from <ip:port> is named '<new>'. ***`
pub fn named_message(peer: &str, new_name: &str) -> String {
    format!("*** User from {} is named '{}'. ***\n", peer, new_name)
}

/// `*** User '<new>' already exists. ***`
pub fn name_taken_message(name: &str) -> String {
    format!("*** User '{}' already exists. ***\n", name)
}

/// `*** <name> yelled ***: <message>`
pub fn yell_message(name: &str, words: &str) -> String {
    format!("*** {} yelled ***: {}\n", name, words)
}

/// `*** <name> told you ***: <message>`
pub fn tell_message(name: &str, words: &str) -> String {
    format!("*** {} told you ***: {}\n", name, words)
}

/// `*** Error: user #<id> does not exist yet. ***`
pub fn user_missing_message(id: usize) -> String {
    format!("*** Error: user #{} does not exist yet. ***\n", id)
}
