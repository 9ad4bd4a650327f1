use std::fs;

use tempfile::TempDir;

use super::common::{drain, registry_with, set_test_path};
use crate::{LineEngine, LineOutcome, SessionRegistry, UserPipeRegistry};

fn run(
    sessions: &mut SessionRegistry,
    pipes: &mut UserPipeRegistry,
    sid: usize,
    line: &str,
) -> LineOutcome {
    LineEngine::run(sessions, pipes, sid, line).unwrap()
}

fn single_session() -> (SessionRegistry, UserPipeRegistry, std::fs::File) {
    let (mut sessions, mut observers) = registry_with(1);
    set_test_path(&mut sessions, 1);
    (sessions, UserPipeRegistry::new(), observers.remove(0))
}

#[test]
fn setenv_printenv_round_trip() {
    let (mut sessions, mut pipes, observer) = single_session();
    run(&mut sessions, &mut pipes, 1, "setenv FOO bar");
    assert_eq!(drain(&observer), "");
    run(&mut sessions, &mut pipes, 1, "printenv FOO");
    assert_eq!(drain(&observer), "bar\n");
}

#[test]
fn printenv_of_unset_variable_prints_nothing() {
    let (mut sessions, mut pipes, observer) = single_session();
    run(&mut sessions, &mut pipes, 1, "printenv NOPE");
    assert_eq!(drain(&observer), "");
}

#[test]
fn plain_command_writes_to_the_terminal() {
    let (mut sessions, mut pipes, observer) = single_session();
    run(&mut sessions, &mut pipes, 1, "echo hello");
    assert_eq!(drain(&observer), "hello\n");
}

#[test]
fn intra_line_pipe() {
    let (mut sessions, mut pipes, observer) = single_session();
    run(&mut sessions, &mut pipes, 1, "echo foo | cat");
    assert_eq!(drain(&observer), "foo\n");
    assert!(sessions.get(1).unwrap().pipes.is_empty());
}

#[test]
fn numbered_pipe_reaches_the_next_line() {
    let (mut sessions, mut pipes, observer) = single_session();
    run(&mut sessions, &mut pipes, 1, "echo hello |1");
    assert_eq!(drain(&observer), "");
    run(&mut sessions, &mut pipes, 1, "cat");
    assert_eq!(drain(&observer), "hello\n");
    assert!(sessions.get(1).unwrap().pipes.is_empty());
}

#[test]
fn numbered_pipe_skips_intervening_lines() {
    let (mut sessions, mut pipes, observer) = single_session();
    run(&mut sessions, &mut pipes, 1, "echo deep |2");
    run(&mut sessions, &mut pipes, 1, "echo between");
    assert_eq!(drain(&observer), "between\n");
    run(&mut sessions, &mut pipes, 1, "cat");
    assert_eq!(drain(&observer), "deep\n");
}

#[test]
fn intra_line_pipe_does_not_age_the_table() {
    let (mut sessions, mut pipes, observer) = single_session();
    // `|` between stages must not age; the trailing `|1` ages once
    run(&mut sessions, &mut pipes, 1, "echo x | cat |1");
    assert!(sessions.get(1).unwrap().pipes.contains(0));
    run(&mut sessions, &mut pipes, 1, "cat");
    assert_eq!(drain(&observer), "x\n");
}

#[test]
fn stderr_joins_a_numbered_pipe() {
    let (mut sessions, mut pipes, observer) = single_session();
    // the failed exec reports on stderr, which `!1` captures
    run(&mut sessions, &mut pipes, 1, "nosuchcmd-zzz !1");
    assert_eq!(drain(&observer), "");
    run(&mut sessions, &mut pipes, 1, "cat");
    assert_eq!(drain(&observer), "Unknown command: [nosuchcmd-zzz].\n");
}

#[test]
fn file_redirection_truncates_and_appends() {
    let (mut sessions, mut pipes, observer) = single_session();
    let tmpdir = TempDir::new().unwrap();
    let path = tmpdir.path().join("out.txt");
    let shown = path.display();

    run(&mut sessions, &mut pipes, 1, &format!("echo one > {}", shown));
    assert_eq!(fs::read_to_string(&path).unwrap(), "one\n");

    run(&mut sessions, &mut pipes, 1, &format!("echo two > {}", shown));
    assert_eq!(fs::read_to_string(&path).unwrap(), "two\n");

    run(&mut sessions, &mut pipes, 1, &format!("echo three >> {}", shown));
    assert_eq!(fs::read_to_string(&path).unwrap(), "two\nthree\n");
    assert_eq!(drain(&observer), "");
}

#[test]
fn file_input_redirection() {
    let (mut sessions, mut pipes, observer) = single_session();
    let tmpdir = TempDir::new().unwrap();
    let path = tmpdir.path().join("in.txt");
    fs::write(&path, "stored\n").unwrap();
    run(
        &mut sessions,
        &mut pipes,
        1,
        &format!("cat < {}", path.display()),
    );
    assert_eq!(drain(&observer), "stored\n");
}

#[test]
fn operator_with_no_command_is_discarded() {
    let (mut sessions, mut pipes, observer) = single_session();
    run(&mut sessions, &mut pipes, 1, "| echo ok");
    assert_eq!(drain(&observer), "ok\n");
}

#[test]
fn exit_ends_the_session() {
    let (mut sessions, mut pipes, _observer) = single_session();
    assert_eq!(run(&mut sessions, &mut pipes, 1, "exit"), LineOutcome::Exit);
}

#[test]
fn who_lists_sessions_with_a_me_marker() {
    let (mut sessions, observers) = registry_with(2);
    let mut pipes = UserPipeRegistry::new();
    run(&mut sessions, &mut pipes, 2, "who");
    assert_eq!(
        drain(&observers[1]),
        "<ID>\t<nickname>\t<IP:port>\t<indicate me>\n\
         1\t(no name)\t127.0.0.1:5001\n\
         2\t(no name)\t127.0.0.1:5002\t<-me\n"
    );
    assert_eq!(drain(&observers[0]), "");
}

#[test]
fn rename_broadcasts_then_duplicate_errors_privately() {
    let (mut sessions, observers) = registry_with(2);
    let mut pipes = UserPipeRegistry::new();

    run(&mut sessions, &mut pipes, 1, "name bob");
    let notice = "*** User from 127.0.0.1:5001 is named 'bob'. ***\n";
    assert_eq!(drain(&observers[0]), notice);
    assert_eq!(drain(&observers[1]), notice);

    run(&mut sessions, &mut pipes, 1, "name bob");
    assert_eq!(drain(&observers[0]), "*** User 'bob' already exists. ***\n");
    assert_eq!(drain(&observers[1]), "");
}

#[test]
fn yell_reaches_everyone_verbatim() {
    let (mut sessions, observers) = registry_with(2);
    let mut pipes = UserPipeRegistry::new();
    run(&mut sessions, &mut pipes, 1, "yell hi > there |1");
    let notice = "*** (no name) yelled ***: hi > there |1\n";
    assert_eq!(drain(&observers[0]), notice);
    assert_eq!(drain(&observers[1]), notice);
    // the payload is data, not operators
    assert!(sessions.get(1).unwrap().pipes.is_empty());
}

#[test]
fn tell_is_private() {
    let (mut sessions, observers) = registry_with(3);
    let mut pipes = UserPipeRegistry::new();
    run(&mut sessions, &mut pipes, 1, "tell 2 your eyes only");
    assert_eq!(drain(&observers[0]), "");
    assert_eq!(
        drain(&observers[1]),
        "*** (no name) told you ***: your eyes only\n"
    );
    assert_eq!(drain(&observers[2]), "");
}

#[test]
fn tell_to_a_missing_session_errors_privately() {
    let (mut sessions, observers) = registry_with(2);
    let mut pipes = UserPipeRegistry::new();
    run(&mut sessions, &mut pipes, 1, "tell 7 anyone");
    assert_eq!(
        drain(&observers[0]),
        "*** Error: user #7 does not exist yet. ***\n"
    );
    assert_eq!(drain(&observers[1]), "");
}

#[test]
fn user_pipe_pair_of_broadcasts_and_data() {
    let (mut sessions, observers) = registry_with(2);
    set_test_path(&mut sessions, 1);
    set_test_path(&mut sessions, 2);
    let mut pipes = UserPipeRegistry::new();

    run(&mut sessions, &mut pipes, 1, "echo data >2");
    let piped = "*** (no name) (#1) just piped 'echo data >2' to (no name) (#2) ***\n";
    assert_eq!(drain(&observers[0]), piped);
    assert_eq!(drain(&observers[1]), piped);
    assert!(pipes.contains(1, 2));

    run(&mut sessions, &mut pipes, 2, "cat <1");
    let received = "*** (no name) (#2) just received from (no name) (#1) by 'cat <1' ***\n";
    assert_eq!(drain(&observers[0]), received);
    assert_eq!(drain(&observers[1]), format!("{}data\n", received));
    assert!(pipes.is_empty());
}

#[test]
fn receive_and_resend_on_one_line_orders_broadcasts() {
    let (mut sessions, observers) = registry_with(3);
    for id in 1..=3 {
        set_test_path(&mut sessions, id);
    }
    let mut pipes = UserPipeRegistry::new();

    run(&mut sessions, &mut pipes, 1, "echo relay >2");
    drain(&observers[0]);
    drain(&observers[1]);
    drain(&observers[2]);

    // session 2 consumes from 1 and pipes onward to 3, in one stage
    run(&mut sessions, &mut pipes, 2, "cat <1 >3");
    let received = "*** (no name) (#2) just received from (no name) (#1) by 'cat <1 >3' ***\n";
    let piped = "*** (no name) (#2) just piped 'cat <1 >3' to (no name) (#3) ***\n";
    let both = format!("{}{}", received, piped);
    assert_eq!(drain(&observers[0]), both);
    assert_eq!(drain(&observers[1]), both);
    assert_eq!(drain(&observers[2]), both);

    run(&mut sessions, &mut pipes, 3, "cat <2");
    let out = drain(&observers[2]);
    assert!(out.ends_with("relay\n"), "missing data: {:?}", out);
}

#[test]
fn piping_to_a_missing_user_errors_privately_and_discards_output() {
    let (mut sessions, observers) = registry_with(2);
    set_test_path(&mut sessions, 1);
    let mut pipes = UserPipeRegistry::new();

    run(&mut sessions, &mut pipes, 1, "echo lost >9");
    assert_eq!(
        drain(&observers[0]),
        "*** Error: user #9 does not exist yet. ***\n"
    );
    assert_eq!(drain(&observers[1]), "");
    assert!(pipes.is_empty());
}

#[test]
fn duplicate_user_pipe_errors_privately() {
    let (mut sessions, observers) = registry_with(2);
    set_test_path(&mut sessions, 1);
    let mut pipes = UserPipeRegistry::new();

    run(&mut sessions, &mut pipes, 1, "echo first >2");
    drain(&observers[0]);
    drain(&observers[1]);

    run(&mut sessions, &mut pipes, 1, "echo second >2");
    assert_eq!(
        drain(&observers[0]),
        "*** Error: the pipe #1->#2 already exists. ***\n"
    );
    assert_eq!(drain(&observers[1]), "");
    assert_eq!(pipes.len(), 1);
}

#[test]
fn reading_a_missing_user_pipe_errors_privately() {
    let (mut sessions, observers) = registry_with(2);
    set_test_path(&mut sessions, 2);
    let mut pipes = UserPipeRegistry::new();

    run(&mut sessions, &mut pipes, 2, "cat <1");
    assert_eq!(
        drain(&observers[1]),
        "*** Error: the pipe #1->#2 does not exist yet. ***\n"
    );
    assert_eq!(drain(&observers[0]), "");
}
