//! implements a parser for the gateway's line protocol.
use std::fmt;

use crate::types::protocol::Command;
use crate::types::serialisable::WireSerialisable;

/// Longest URL accepted by `put`, in bytes.
pub const MAX_URL_LEN: usize = 2048;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParsingError {
    BadFormat,
    UnknownCommand,
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::BadFormat => "bad format",
            Self::UnknownCommand => "unknown command",
        })
    }
}

impl WireSerialisable for ParsingError {
    fn serialise_wire(&self) -> Vec<u8> {
        match self {
            ParsingError::BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            ParsingError::UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
        }
    }
}

/// Provides a custom, minimal, zero-copy parser of byte slices.
struct ParseState<'a> {
    from: &'a [u8],
}

impl ParseState<'_> {
    /// Asserts there's no more input to take, returning `result` if so, and a
    /// `BadFormat` error otherwise.
    fn expect_done_and<R>(&self, result: R) -> Result<R, ParsingError> {
        if self.from.is_empty() {
            Ok(result)
        } else {
            Err(ParsingError::BadFormat)
        }
    }

    /// Consumes from the input, expecting a token of non-zero length.
    fn expect_next_token(&mut self) -> Result<&[u8], ParsingError> {
        match self.next_token() {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes from the input, expecting a space then a u64.
    fn expect_next_u64(&mut self) -> Result<u64, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        token.iter().try_fold(0u64, |acc, v| match v {
            b'0'..=b'9' => acc
                .checked_mul(10)
                .and_then(|acc| acc.checked_add((*v - b'0') as u64))
                .ok_or(ParsingError::BadFormat),
            _ => Err(ParsingError::BadFormat),
        })
    }

    /// Consumes from the input, expecting a space then a URL-shaped token:
    /// printable, non-space ASCII of at most `MAX_URL_LEN` bytes. Whether
    /// it's actually a usable URL is for the job store to decide.
    fn expect_next_url(&mut self) -> Result<String, ParsingError> {
        self.expect_space()?;

        let token = self.expect_next_token()?;

        if token.len() > MAX_URL_LEN
            || !token.iter().all(|c| c.is_ascii_graphic())
        {
            return Err(ParsingError::BadFormat);
        }

        String::from_utf8(token.to_vec()).map_err(|_| ParsingError::BadFormat)
    }

    /// Consumes a space.
    fn expect_space(&mut self) -> Result<(), ParsingError> {
        match self.from.split_first() {
            Some((b' ', rest)) => {
                self.from = rest;
                Ok(())
            },
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes from this ParseState until reaching a space byte or the end of
    /// the input. It returns None at the end of the input. On consecutive space
    /// bytes, it returns a zero-length slice.
    fn next_token(&mut self) -> Option<&[u8]> {
        if self.from.is_empty() {
            return None;
        }

        let idx = self
            .from
            .iter()
            .position(|c| *c == b' ')
            .unwrap_or(self.from.len());

        let (token, rest) = self.from.split_at(idx);
        self.from = rest;

        Some(token)
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        ParseState { from }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        use Command::*;

        let mut ps: ParseState = value.into();

        let cmd = match ps.expect_next_token()? {
            // <cmd>
            b"drain" => Drain,
            b"quit" => Quit,
            b"stats" => Stats,

            // <cmd> <id>
            b"stats-job" => StatsJob {
                id: ps.expect_next_u64()?,
            },

            // <cmd> <url>
            b"put" => Put {
                url: ps.expect_next_url()?,
            },

            _ => return Err(ParsingError::UnknownCommand),
        };

        ps.expect_done_and(cmd)
    }
}
