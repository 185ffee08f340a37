//! Backtick command grammar.
//!
//! A command line is the marker followed by whitespace-separated tokens.
//! Single-quoted substrings form one token. Tokens are typed as numbers
//! (decimal, `$` hex, `%` binary, `_` separators allowed), quoted strings, or
//! bare words (instance names, window-type keywords, verbs).

use std::fmt;

use thiserror::Error;

use crate::extract::WINDOW_MARKER;

/// Verb that tears an instance down.
pub const CLOSE_VERB: &str = "close";

/// Errors raised while tokenizing a command line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("line does not start with the window marker")]
    MissingMarker,

    #[error("window command has no tokens")]
    Empty,

    #[error("unterminated quote starting at column {column}")]
    UnterminatedQuote { column: usize },

    #[error("{window_type} creation is missing an instance name")]
    MissingInstanceName { window_type: WindowType },

    #[error("window command must start with a name, found {found}")]
    ExpectedName { found: String },
}

/// Window kinds the terminal can instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowType {
    Logic,
    Scope,
    ScopeXy,
    Fft,
    Spectro,
    Plot,
    Term,
    Bitmap,
    Midi,
}

impl WindowType {
    /// Returns the wire keyword.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Logic => "LOGIC",
            Self::Scope => "SCOPE",
            Self::ScopeXy => "SCOPE_XY",
            Self::Fft => "FFT",
            Self::Spectro => "SPECTRO",
            Self::Plot => "PLOT",
            Self::Term => "TERM",
            Self::Bitmap => "BITMAP",
            Self::Midi => "MIDI",
        }
    }

    /// Matches a creation keyword, ignoring ASCII case.
    pub fn from_keyword(word: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(word))
    }

    pub const fn all() -> &'static [Self] {
        &[
            Self::Logic,
            Self::Scope,
            Self::ScopeXy,
            Self::Fft,
            Self::Spectro,
            Self::Plot,
            Self::Term,
            Self::Bitmap,
            Self::Midi,
        ]
    }
}

impl fmt::Display for WindowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One command token, borrowing from the record text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    Number(i64),
    /// Quoted string without its quotes.
    Str(&'a str),
    Word(&'a str),
}

impl<'a> Token<'a> {
    pub fn as_word(&self) -> Option<&'a str> {
        match *self {
            Self::Word(w) => Some(w),
            _ => None,
        }
    }

    pub fn is_word(&self, expected: &str) -> bool {
        self.as_word()
            .is_some_and(|w| w.eq_ignore_ascii_case(expected))
    }
}

impl fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "'{s}'"),
            Self::Word(w) => f.write_str(w),
        }
    }
}

/// Returns the text after the marker, ignoring leading whitespace.
pub fn command_body(line: &str) -> Result<&str, CommandError> {
    line.trim_start()
        .strip_prefix(WINDOW_MARKER as char)
        .ok_or(CommandError::MissingMarker)
}

/// Splits a command body into tokens.
pub fn tokenize(body: &str) -> Result<Vec<Token<'_>>, CommandError> {
    let mut tokens = Vec::new();
    let bytes = body.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i].is_ascii_whitespace() {
            i += 1;
            continue;
        }

        if bytes[i] == b'\'' {
            let start = i + 1;
            let Some(len) = body[start..].find('\'') else {
                return Err(CommandError::UnterminatedQuote { column: i });
            };
            tokens.push(Token::Str(&body[start..start + len]));
            i = start + len + 1;
            continue;
        }

        let start = i;
        while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'\'' {
            i += 1;
        }
        let word = &body[start..i];
        tokens.push(match parse_number(word) {
            Some(n) => Token::Number(n),
            None => Token::Word(word),
        });
    }

    if tokens.is_empty() {
        return Err(CommandError::Empty);
    }
    Ok(tokens)
}

/// Parses `123`, `-5`, `$FF`, `%1010`, with optional `_` separators.
pub fn parse_number(word: &str) -> Option<i64> {
    let (negative, rest) = match word.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, word),
    };

    let (radix, digits) = if let Some(hex) = rest.strip_prefix('$') {
        (16, hex)
    } else if let Some(bin) = rest.strip_prefix('%') {
        (2, bin)
    } else {
        (10, rest)
    };

    let mut value: i64 = 0;
    let mut seen_digit = false;
    for c in digits.chars() {
        if c == '_' {
            continue;
        }
        let d = c.to_digit(radix)?;
        value = value.checked_mul(i64::from(radix))?.checked_add(i64::from(d))?;
        seen_digit = true;
    }

    if !seen_digit {
        return None;
    }
    Some(if negative { -value } else { value })
}
