use std::fs::File;
use std::io::{ErrorKind, Read};

use crate::posix;
use crate::session::SessionRegistry;

/// `PATH` pointing at the real system directories, so test stages can find
/// `echo`, `cat`, and friends.
pub const TEST_PATH: &str = "/usr/bin:/bin";

/// Builds a registry with `n` logged-in sessions whose terminals are pipe
/// write ends.  Returns the matching read ends; index 0 observes session 1.
pub fn registry_with(n: usize) -> (SessionRegistry, Vec<File>) {
    let mut sessions = SessionRegistry::new();
    let mut observers = Vec::new();
    for i in 0..n {
        let (read, write) = posix::pipe().unwrap();
        let id = sessions
            .login(format!("127.0.0.1:{}", 5001 + i), write)
            .unwrap();
        assert_eq!(id, i + 1);
        observers.push(read);
    }
    (sessions, observers)
}

/// Points a session's `PATH` at [`TEST_PATH`].
pub fn set_test_path(sessions: &mut SessionRegistry, id: usize) {
    sessions
        .get_mut(id)
        .unwrap()
        .env
        .insert("PATH".to_string(), TEST_PATH.to_string());
}

/// Drains whatever is currently buffered on a terminal observer.
pub fn drain(observer: &File) -> String {
    posix::set_nonblocking(observer, true).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let mut handle: &File = observer;
        match handle.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => panic!("drain: {}", e),
        }
    }
    posix::set_nonblocking(observer, false).unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

/// Reads a pipe to EOF.
pub fn read_to_eof(mut f: File) -> String {
    let mut content = String::new();
    f.read_to_string(&mut content).unwrap();
    content
}
