use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Result, Write};
use std::net::TcpListener;
use std::os::fd::OwnedFd;
use std::os::unix::io::AsRawFd;

use tracing::{error, info, warn};

use crate::engine::{LineEngine, LineOutcome};
use crate::posix::{self, POLLHUP, POLLIN, PollFd};
use crate::session::{self, PROMPT, SessionId, SessionRegistry, WELCOME_BANNER};
use crate::userpipe::UserPipeRegistry;

/// Longest accepted input line, in bytes.
pub const MAX_LINE: usize = 15_000;

/// The concurrent single-process server: one readiness-polled loop over the
/// listen socket and every client socket.
///
/// Each client becomes a [`Session`](crate::Session) whose terminal is its
/// socket; lines are buffered per session, handed to the
/// [`LineEngine`](crate::LineEngine), and answered with a prompt.
pub struct Server {
    listener: TcpListener,
    sessions: SessionRegistry,
    user_pipes: UserPipeRegistry,
    buffers: HashMap<SessionId, Vec<u8>>,
}

impl Server {
    /// Binds the listen socket and installs the process-wide child reaper.
    pub fn bind(port: u16) -> Result<Server> {
        posix::ignore_sigchld()?;
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        info!(port, "listening for clients");
        Ok(Server {
            listener,
            sessions: SessionRegistry::new(),
            user_pipes: UserPipeRegistry::new(),
            buffers: HashMap::new(),
        })
    }

    /// Serves clients until the process is terminated.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let clients = self.sessions.ids_and_fds();
            let mut fds = Vec::with_capacity(clients.len() + 1);
            fds.push(PollFd::new(Some(self.listener.as_raw_fd()), POLLIN));
            for &(_, fd) in &clients {
                fds.push(PollFd::new(Some(fd), POLLIN));
            }
            match posix::poll(&mut fds, -1) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            if fds[0].test(POLLIN) {
                self.accept_client();
            }
            for (i, &(id, _)) in clients.iter().enumerate() {
                if fds[i + 1].test(POLLIN | POLLHUP) {
                    self.service_session(id);
                }
            }
        }
    }

    fn accept_client(&mut self) {
        let (stream, addr) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        };
        let peer = addr.to_string();
        let terminal = File::from(OwnedFd::from(stream));
        if let Err(e) = (&terminal).write_all(WELCOME_BANNER.as_bytes()) {
            warn!(peer = %peer, error = %e, "client gone before welcome");
            return;
        }
        match self.sessions.login(peer.clone(), terminal) {
            Some(id) => {
                self.sessions
                    .broadcast(&session::entered_message(session::DEFAULT_NAME, &peer));
                self.sessions.send_to(id, PROMPT);
                self.buffers.insert(id, Vec::new());
                info!(session = id, peer = %peer, "client connected");
            }
            // Dropping the socket closes the connection.
            None => warn!(peer = %peer, "connection refused: session table full"),
        }
    }

    fn service_session(&mut self, id: SessionId) {
        let mut chunk = [0u8; 4096];
        let n = match self.sessions.get(id) {
            Some(s) => match s.read_terminal(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => return,
                Err(e) => {
                    warn!(session = id, error = %e, "read failed");
                    0
                }
            },
            None => return,
        };
        if n == 0 {
            self.logout(id);
            return;
        }
        self.buffers
            .entry(id)
            .or_default()
            .extend_from_slice(&chunk[..n]);
        loop {
            let line_bytes = {
                let buf = self.buffers.entry(id).or_default();
                if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    buf.drain(..=pos).collect::<Vec<u8>>()
                } else if buf.len() >= MAX_LINE {
                    std::mem::take(buf)
                } else {
                    break;
                }
            };
            let text = String::from_utf8_lossy(&line_bytes).into_owned();
            let line = text.trim_end_matches(|c| matches!(c, ' ' | '\n' | '\r' | '\t'));
            if !self.handle_line(id, line) {
                self.logout(id);
                return;
            }
        }
    }

    fn handle_line(&mut self, id: SessionId, line: &str) -> bool {
        if line.is_empty() {
            self.sessions.send_to(id, PROMPT);
            return true;
        }
        match LineEngine::run(&mut self.sessions, &mut self.user_pipes, id, line) {
            Ok(LineOutcome::Exit) => false,
            Ok(LineOutcome::Continue) => {
                self.sessions.send_to(id, PROMPT);
                true
            }
            Err(e) => {
                error!(session = id, error = %e, "command line failed");
                self.sessions.send_to(id, PROMPT);
                true
            }
        }
    }

    fn logout(&mut self, id: SessionId) {
        if let Some(leaving) = self.sessions.logout(id) {
            let notice = session::left_message(&leaving.name);
            // Close the socket before telling everyone else.
            drop(leaving);
            self.sessions.broadcast(&notice);
            self.user_pipes.drop_for_session(id);
            self.buffers.remove(&id);
            info!(session = id, "client disconnected");
        }
    }
}
