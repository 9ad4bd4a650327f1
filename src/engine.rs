use std::fs::{File, OpenOptions};
use std::io::Result;
use std::os::unix::fs::OpenOptionsExt;

use crate::executor;
use crate::session::{self, Session, SessionId, SessionRegistry};
use crate::stage::{self, Stage, StderrSink, StdinSource, StdoutSink};
use crate::userpipe::{self, UserPipeError, UserPipeRegistry};

/// What a processed line means for the session.
#[derive(Debug, PartialEq, Eq)]
pub enum LineOutcome {
    /// Keep the session; emit a fresh prompt.
    Continue,
    /// The session asked to leave.
    Exit,
}

/// One whitespace-separated word, classified.
///
/// A token is an operator iff its first byte is one of `| ! > <` and its
/// tail matches the operator grammar; any other tail leaves the word an
/// ordinary argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// An argument word.
    Word(String),
    /// `|`: pipe stdout to the next stage of the same line.
    Pipe,
    /// `|N` / `!` / `!N`: pipe stdout (and stderr, for `!`) into the
    /// numbered-pipe table with the given delay.
    NumberedPipe {
        /// Line boundaries until the pipe feeds a stage's stdin.
        delay: u32,
        /// Whether stderr joins the sink (`!` family).
        with_stderr: bool,
    },
    /// `>` / `>>`: stdout to the file named by the next word.
    RedirectOut {
        /// `>>` appends instead of truncating.
        append: bool,
    },
    /// `<`: stdin from the file named by the next word.
    RedirectIn,
    /// `>N`: user pipe to session N.
    UserPipeTo(SessionId),
    /// `<N`: user pipe from session N.
    UserPipeFrom(SessionId),
}

/// Classifies a single word.
pub fn classify(word: &str) -> Token {
    let first = match word.as_bytes().first() {
        Some(&b) if matches!(b, b'|' | b'!' | b'>' | b'<') => b,
        _ => return Token::Word(word.to_string()),
    };
    let tail = &word[1..];
    let as_word = || Token::Word(word.to_string());
    match first {
        b'|' if tail.is_empty() => Token::Pipe,
        b'|' => match parse_number(tail) {
            Some(delay) => Token::NumberedPipe {
                delay,
                with_stderr: false,
            },
            None => as_word(),
        },
        b'!' if tail.is_empty() => Token::NumberedPipe {
            delay: 0,
            with_stderr: true,
        },
        b'!' => match parse_number(tail) {
            Some(delay) => Token::NumberedPipe {
                delay,
                with_stderr: true,
            },
            None => as_word(),
        },
        b'>' if tail.is_empty() => Token::RedirectOut { append: false },
        b'>' if tail == ">" => Token::RedirectOut { append: true },
        b'>' => match parse_number(tail) {
            Some(id) => Token::UserPipeTo(id as SessionId),
            None => as_word(),
        },
        _ if tail.is_empty() => Token::RedirectIn,
        _ => match parse_number(tail) {
            Some(id) => Token::UserPipeFrom(id as SessionId),
            None => as_word(),
        },
    }
}

fn parse_number(tail: &str) -> Option<u32> {
    if tail.is_empty() || !tail.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    tail.parse().ok()
}

fn is_input_op(token: &Token) -> bool {
    matches!(token, Token::RedirectIn | Token::UserPipeFrom(_))
}

fn is_output_op(token: &Token) -> bool {
    matches!(
        token,
        Token::Pipe | Token::NumberedPipe { .. } | Token::RedirectOut { .. } | Token::UserPipeTo(_)
    )
}

// Classified tokens plus the raw words they came from, consumed left to
// right with one-token lookahead.  Raw words back the verbatim rules:
// redirect filenames and tell/yell payloads.
struct Parser {
    tokens: Vec<Token>,
    raw: Vec<String>,
    pos: usize,
}

impl Parser {
    fn new(line: &str) -> Parser {
        let raw: Vec<String> = line.split_ascii_whitespace().map(str::to_string).collect();
        let tokens = raw.iter().map(|word| classify(word)).collect();
        Parser {
            tokens,
            raw,
            pos: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn next_raw(&mut self) -> Option<String> {
        let word = self.raw.get(self.pos).cloned();
        if word.is_some() {
            self.pos += 1;
        }
        word
    }

    fn remaining_raw(&mut self) -> Vec<String> {
        let rest = self.raw[self.pos..].to_vec();
        self.pos = self.raw.len();
        rest
    }
}

// Per-stage wiring accumulated while the stage's operators are resolved.
struct Wiring {
    stdin: StdinSource,
    stdout: Option<StdoutSink>,
    stderr_merge: bool,
    // false only for the intra-line `|`, whose pipe the next stage of the
    // same line consumes and which therefore must not be aged
    ages: bool,
    in_invalid: bool,
    out_invalid: bool,
    pipe_note: Option<String>,
}

impl Wiring {
    fn new(stdin: StdinSource) -> Wiring {
        Wiring {
            stdin,
            stdout: None,
            stderr_merge: false,
            ages: true,
            in_invalid: false,
            out_invalid: false,
            pipe_note: None,
        }
    }
}

/// The line engine: parses one command line and drives the numbered-pipe
/// table, the user-pipe registry, and the stage executor.
pub struct LineEngine<'a> {
    sessions: &'a mut SessionRegistry,
    user_pipes: &'a mut UserPipeRegistry,
    sid: SessionId,
    line: String,
}

impl<'a> LineEngine<'a> {
    /// Processes one already-trimmed command line on behalf of session
    /// `sid`.
    ///
    /// Stages are assembled and launched strictly left to right; every
    /// broadcast a line produces is delivered before this returns, so the
    /// caller can emit the next prompt immediately.
    pub fn run(
        sessions: &'a mut SessionRegistry,
        user_pipes: &'a mut UserPipeRegistry,
        sid: SessionId,
        line: &str,
    ) -> Result<LineOutcome> {
        if !sessions.is_logged_in(sid) {
            return Ok(LineOutcome::Continue);
        }
        let mut engine = LineEngine {
            sessions,
            user_pipes,
            sid,
            line: line.to_string(),
        };
        engine.process()
    }

    fn process(&mut self) -> Result<LineOutcome> {
        let mut parser = Parser::new(&self.line);
        let mut args: Vec<String> = Vec::new();
        while let Some(token) = parser.next() {
            match token {
                Token::Word(word) => {
                    if args.is_empty() && (word == "tell" || word == "yell") {
                        // the rest of the line is the payload, verbatim
                        let payload = parser.remaining_raw();
                        self.run_message_builtin(&word, payload);
                        return Ok(LineOutcome::Continue);
                    }
                    args.push(word);
                }
                op => {
                    if args.is_empty() {
                        discard_operand(&op, &mut parser);
                        continue;
                    }
                    if let LineOutcome::Exit =
                        self.submit_stage(&mut parser, std::mem::take(&mut args), Some(op))?
                    {
                        return Ok(LineOutcome::Exit);
                    }
                }
            }
        }
        if !args.is_empty() {
            return self.submit_stage(&mut parser, args, None);
        }
        Ok(LineOutcome::Continue)
    }

    // Resolve stdin and the terminating operator(s), then run the stage.
    fn submit_stage(
        &mut self,
        parser: &mut Parser,
        argv: Vec<String>,
        first_op: Option<Token>,
    ) -> Result<LineOutcome> {
        let mut wiring = Wiring::new(self.take_zero_stdin());

        if let Some(op) = first_op {
            // One-token lookahead: a stage's input and output redirections
            // may appear in either order (`<N >M`, `>FILE <N`, `<N |`).
            if is_input_op(&op) {
                self.apply_input(op, &mut wiring, parser)?;
                if parser.peek().is_some_and(is_output_op) {
                    if let Some(out_op) = parser.next() {
                        self.apply_output(out_op, &mut wiring, parser)?;
                    }
                }
            } else {
                self.apply_output(op, &mut wiring, parser)?;
                if parser.peek().is_some_and(is_input_op) {
                    if let Some(in_op) = parser.next() {
                        self.apply_input(in_op, &mut wiring, parser)?;
                    }
                }
            }
        }

        // User errors invalidate data flow but the stage still runs; wire
        // the dead directions to a single null allocation.
        if wiring.out_invalid {
            let null = stage::open_null()?;
            wiring.stdin = StdinSource::Null(null.try_clone()?);
            wiring.stdout = Some(StdoutSink::Null(null));
        } else if wiring.in_invalid {
            wiring.stdin = StdinSource::Null(stage::open_null()?);
        }

        // The "just piped" notice goes out only after the stage's operators
        // are fully resolved, so a "just received" on the same stage always
        // precedes it.
        if let Some(note) = wiring.pipe_note.take() {
            self.sessions.broadcast(&note);
        }

        let ages = wiring.ages;
        let outcome = match self.dispatch_builtin(&argv) {
            Some(outcome) => outcome,
            None => {
                self.launch_stage(argv, wiring)?;
                LineOutcome::Continue
            }
        };
        if outcome == LineOutcome::Exit {
            return Ok(LineOutcome::Exit);
        }
        if ages {
            self.session_mut().pipes.age();
        }
        Ok(outcome)
    }

    fn apply_input(&mut self, op: Token, wiring: &mut Wiring, parser: &mut Parser) -> Result<()> {
        match op {
            Token::UserPipeFrom(sender) => {
                match self.user_pipes.consume(sender, self.sid, self.sessions) {
                    Ok((read, write)) => {
                        wiring.stdin = StdinSource::Pipe {
                            read,
                            write: Some(write),
                        };
                        let msg = userpipe::received_message(
                            &self.name_of(self.sid),
                            self.sid,
                            &self.name_of(sender),
                            sender,
                            &self.line,
                        );
                        self.sessions.broadcast(&msg);
                    }
                    Err(err) => self.note_user_error(err, &mut wiring.in_invalid)?,
                }
            }
            Token::RedirectIn => match parser.next_raw() {
                // the next word is the filename, whatever it looks like
                Some(name) => match File::open(&name) {
                    Ok(file) => wiring.stdin = StdinSource::File(file),
                    Err(_) => wiring.in_invalid = true,
                },
                None => wiring.in_invalid = true,
            },
            _ => {}
        }
        Ok(())
    }

    fn apply_output(&mut self, op: Token, wiring: &mut Wiring, parser: &mut Parser) -> Result<()> {
        match op {
            Token::Pipe => {
                let write = self.session_mut().pipes.open_for_writer(0)?;
                wiring.stdout = Some(StdoutSink::Pipe(write));
                wiring.ages = false;
            }
            Token::NumberedPipe { delay, with_stderr } => {
                let write = self.session_mut().pipes.open_for_writer(delay)?;
                wiring.stdout = Some(StdoutSink::Pipe(write));
                wiring.stderr_merge = with_stderr;
            }
            Token::RedirectOut { append } => match parser.next_raw() {
                Some(name) => {
                    let mut opts = OpenOptions::new();
                    opts.write(true).create(true).mode(0o664);
                    if append {
                        opts.append(true);
                    } else {
                        opts.truncate(true);
                    }
                    wiring.stdout = Some(match opts.open(&name) {
                        Ok(file) => StdoutSink::File(file),
                        Err(_) => StdoutSink::Null(stage::open_null()?),
                    });
                }
                None => wiring.stdout = Some(StdoutSink::Null(stage::open_null()?)),
            },
            Token::UserPipeTo(receiver) => {
                match self.user_pipes.create(self.sid, receiver, self.sessions) {
                    Ok(write) => {
                        wiring.stdout = Some(StdoutSink::Pipe(write));
                        wiring.pipe_note = Some(userpipe::piped_message(
                            &self.name_of(self.sid),
                            self.sid,
                            &self.line,
                            &self.name_of(receiver),
                            receiver,
                        ));
                    }
                    Err(err) => self.note_user_error(err, &mut wiring.out_invalid)?,
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn note_user_error(&self, err: UserPipeError, invalid: &mut bool) -> Result<()> {
        match err {
            UserPipeError::Io(err) => Err(err),
            user => {
                if let Some(msg) = user.user_message() {
                    self.sessions.send_to(self.sid, &msg);
                }
                *invalid = true;
                Ok(())
            }
        }
    }

    // Built-ins run in place of a stage launch; their wiring is dropped.
    fn dispatch_builtin(&mut self, argv: &[String]) -> Option<LineOutcome> {
        match argv[0].as_str() {
            "exit" => Some(LineOutcome::Exit),
            "setenv" => {
                if let (Some(key), Some(val)) = (argv.get(1), argv.get(2)) {
                    self.session_mut().env.insert(key.clone(), val.clone());
                }
                Some(LineOutcome::Continue)
            }
            "printenv" => {
                if let Some(key) = argv.get(1) {
                    if let Some(val) = self.session().env.get(key) {
                        let msg = format!("{}\n", val);
                        self.sessions.send_to(self.sid, &msg);
                    }
                }
                Some(LineOutcome::Continue)
            }
            "who" => {
                let table = self.sessions.who_table(self.sid);
                self.sessions.send_to(self.sid, &table);
                Some(LineOutcome::Continue)
            }
            "name" => {
                if let Some(new_name) = argv.get(1) {
                    if self.sessions.name_taken(new_name) {
                        self.sessions
                            .send_to(self.sid, &session::name_taken_message(new_name));
                    } else {
                        let peer = {
                            let acting = self.session_mut();
                            acting.name = new_name.clone();
                            acting.peer.clone()
                        };
                        self.sessions
                            .broadcast(&session::named_message(&peer, new_name));
                    }
                }
                Some(LineOutcome::Continue)
            }
            _ => None,
        }
    }

    // tell/yell swallow the rest of the line as payload; they still consume
    // a ripe numbered pipe and count as a submitted stage for aging.
    fn run_message_builtin(&mut self, kind: &str, payload: Vec<String>) {
        drop(self.session_mut().pipes.take_zero_reader());
        match kind {
            "yell" => {
                let msg = session::yell_message(&self.name_of(self.sid), &payload.join(" "));
                self.sessions.broadcast(&msg);
            }
            _ => {
                if let Some(target) = payload.first().and_then(|word| word.parse::<usize>().ok()) {
                    let words = payload[1..].join(" ");
                    if self.sessions.is_logged_in(target) {
                        let msg = session::tell_message(&self.name_of(self.sid), &words);
                        self.sessions.send_to(target, &msg);
                    } else {
                        self.sessions
                            .send_to(self.sid, &session::user_missing_message(target));
                    }
                }
            }
        }
        self.session_mut().pipes.age();
    }

    fn launch_stage(&mut self, argv: Vec<String>, wiring: Wiring) -> Result<()> {
        let stdout = match wiring.stdout {
            Some(sink) => sink,
            None => StdoutSink::Terminal(self.terminal_dup()?),
        };
        let stderr = if wiring.stderr_merge {
            StderrSink::MergeWithStdout
        } else {
            StderrSink::Terminal(self.terminal_dup()?)
        };
        let stage = Stage {
            argv,
            stdin: wiring.stdin,
            stdout,
            stderr,
        };
        let env = self.session().env_vec();
        executor::launch(stage, &env)?;
        Ok(())
    }

    fn take_zero_stdin(&mut self) -> StdinSource {
        match self.session_mut().pipes.take_zero_reader() {
            Some((read, write)) => StdinSource::Pipe {
                read,
                write: Some(write),
            },
            None => StdinSource::Inherit,
        }
    }

    fn session(&self) -> &Session {
        self.sessions
            .get(self.sid)
            .expect("acting session is logged in")
    }

    fn session_mut(&mut self) -> &mut Session {
        self.sessions
            .get_mut(self.sid)
            .expect("acting session is logged in")
    }

    fn name_of(&self, id: SessionId) -> String {
        self.sessions
            .get(id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| session::DEFAULT_NAME.to_string())
    }

    fn terminal_dup(&self) -> Result<File> {
        self.session().terminal_dup()
    }
}

// A stage with no argument words is not submitted; its operator (and the
// filename operand of a redirect) is consumed without effect.
fn discard_operand(op: &Token, parser: &mut Parser) {
    if matches!(op, Token::RedirectOut { .. } | Token::RedirectIn) {
        parser.next_raw();
    }
}
