//! Core of a multi-user remote shell server.
//!
//! Clients connect over TCP, get a prompt, and type shell-like command
//! lines.  Besides ordinary pipes and file redirection, the line syntax
//! supports *numbered* pipes (`|N`, `!N`) that carry a stage's output across
//! the next N command lines of the same session, and *user* pipes (`>N`,
//! `<N`) that carry bytes between sessions.
//!
//! The crate is organized around four cooperating pieces:
//!
//! * [`LineEngine`] parses one line into stages, wiring each stage's
//!   standard streams from the session's numbered-pipe table and the
//!   cross-session pipe registry;
//! * [`NumberedPipeTable`] holds pipes scheduled for future lines and ages
//!   them at stage-submission boundaries;
//! * [`UserPipeRegistry`] holds pending `sender -> receiver` channels and
//!   enforces their uniqueness and existence rules;
//! * the executor forks each [`Stage`], dup2s its ends over the child's
//!   standard streams, and blocks on the child exactly when its output does
//!   not feed a pipe.
//!
//! [`Server`] drives all of this from a single readiness-polled process,
//! one [`Session`] per client.

#![warn(missing_docs)]

mod engine;
mod executor;
mod numbered;
mod posix;
mod server;
mod session;
mod stage;
mod userpipe;

pub use engine::{LineEngine, LineOutcome, Token, classify};
pub use executor::{LaunchOutcome, launch};
pub use numbered::NumberedPipeTable;
pub use posix::ExitStatus;
pub use server::{MAX_LINE, Server};
pub use session::{
    DEFAULT_NAME, DEFAULT_PATH, MAX_SESSIONS, PROMPT, Session, SessionId, SessionRegistry,
    WELCOME_BANNER,
};
pub use stage::{Stage, StderrSink, StdinSource, StdoutSink};
pub use userpipe::{UserPipeError, UserPipeRegistry};

#[cfg(test)]
mod tests {
    mod common;
    mod engine;
    mod executor;
    mod numbered;
    mod session;
    mod tokenize;
    mod userpipe;
}
