use crate::{Token, classify};

#[test]
fn words_pass_through() {
    assert_eq!(classify("ls"), Token::Word("ls".to_string()));
    assert_eq!(classify("a|b"), Token::Word("a|b".to_string()));
    assert_eq!(classify("-l"), Token::Word("-l".to_string()));
}

#[test]
fn plain_pipe() {
    assert_eq!(classify("|"), Token::Pipe);
}

#[test]
fn numbered_pipes() {
    assert_eq!(
        classify("|1"),
        Token::NumberedPipe {
            delay: 1,
            with_stderr: false
        }
    );
    assert_eq!(
        classify("|10"),
        Token::NumberedPipe {
            delay: 10,
            with_stderr: false
        }
    );
    assert_eq!(
        classify("!3"),
        Token::NumberedPipe {
            delay: 3,
            with_stderr: true
        }
    );
}

#[test]
fn bare_bang_merges_stderr_at_delay_zero() {
    assert_eq!(
        classify("!"),
        Token::NumberedPipe {
            delay: 0,
            with_stderr: true
        }
    );
}

#[test]
fn redirects() {
    assert_eq!(classify(">"), Token::RedirectOut { append: false });
    assert_eq!(classify(">>"), Token::RedirectOut { append: true });
    assert_eq!(classify("<"), Token::RedirectIn);
}

#[test]
fn user_pipes() {
    assert_eq!(classify(">2"), Token::UserPipeTo(2));
    assert_eq!(classify("<30"), Token::UserPipeFrom(30));
}

#[test]
fn malformed_tails_become_words() {
    assert_eq!(classify("|x"), Token::Word("|x".to_string()));
    assert_eq!(classify("!2x"), Token::Word("!2x".to_string()));
    assert_eq!(classify(">a,b"), Token::Word(">a,b".to_string()));
    assert_eq!(classify("<f"), Token::Word("<f".to_string()));
    assert_eq!(classify(">>>"), Token::Word(">>>".to_string()));
}
