//! # Text Protocol Parser
//!
//! Incremental parser for the command line grammar:
//!
//! ```text
//! put <key> <nbytes>\r\n<payload>\r\n     insert or overwrite
//! add <key> <nbytes>\r\n<payload>\r\n     insert if absent
//! replace <key> <nbytes>\r\n<payload>\r\n overwrite if present
//! get <key>\r\n
//! delete <key>\r\n
//! stats\r\n
//! ```
//!
//! The parser only frames and validates the command line; payload bytes
//! are the worker's job. `parse` consumes input up to and including the
//! newline of one command line, then reports completion; `build` hands
//! out the command plus the declared payload length, and `reset` rearms
//! for the next command.
//!
//! A declared length of zero carries no payload line at all: the next
//! bytes on the wire are the next command.

use bytes::BytesMut;

use skv_common::{SkvError, SkvResult};

use crate::execute::Command;

/// Longest accepted command line, terminator included.
pub const MAX_LINE: usize = 1024;

/// Longest accepted key, matching the usual memcached ceiling.
pub const MAX_KEY: usize = 250;

/// Largest accepted payload declaration.
pub const MAX_VALUE: usize = 8 * 1024 * 1024;

/// Incremental command-line parser.
#[derive(Debug, Default)]
pub struct Parser {
    line: BytesMut,
    parsed: Option<(Command, usize)>,
}

impl Parser {
    pub fn new() -> Self {
        Parser::default()
    }

    /// Feeds bytes into the parser.
    ///
    /// Returns `(complete, consumed)`. While the line is incomplete every
    /// offered byte is consumed; once the terminating newline arrives the
    /// parser consumes through it, validates the line, and leaves the rest
    /// of `data` untouched for the caller.
    pub fn parse(&mut self, data: &[u8]) -> SkvResult<(bool, usize)> {
        if self.parsed.is_some() {
            return Ok((true, 0));
        }

        match data.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let consumed = pos + 1;
                self.check_line_budget(consumed)?;
                self.line.extend_from_slice(&data[..consumed]);

                if !self.line.ends_with(b"\r\n") {
                    return Err(SkvError::Protocol(
                        "command line must end with CRLF".to_string(),
                    ));
                }
                let line = self.line[..self.line.len() - 2].to_vec();
                self.parsed = Some(Self::parse_line(&line)?);
                Ok((true, consumed))
            }
            None => {
                self.check_line_budget(data.len())?;
                self.line.extend_from_slice(data);
                Ok((false, data.len()))
            }
        }
    }

    /// Verb of the parsed command, for logging.
    pub fn name(&self) -> Option<&'static str> {
        self.parsed.as_ref().map(|(command, _)| command.name())
    }

    /// Hands out the parsed command and its declared payload length.
    ///
    /// A non-zero length means the worker must read that many payload
    /// bytes plus the two-byte terminator before executing.
    pub fn build(&mut self) -> SkvResult<(Command, usize)> {
        self.parsed
            .take()
            .ok_or_else(|| SkvError::Protocol("no complete command to build".to_string()))
    }

    /// Rearms the parser for the next command.
    pub fn reset(&mut self) {
        self.line.clear();
        self.parsed = None;
    }

    fn check_line_budget(&self, incoming: usize) -> SkvResult<()> {
        if self.line.len() + incoming > MAX_LINE {
            return Err(SkvError::Protocol("command line too long".to_string()));
        }
        Ok(())
    }

    fn parse_line(line: &[u8]) -> SkvResult<(Command, usize)> {
        let mut tokens = line.split(|&b| b == b' ').filter(|t| !t.is_empty());
        let verb = tokens
            .next()
            .ok_or_else(|| SkvError::Protocol("empty command line".to_string()))?;

        let command = match verb {
            b"put" | b"add" | b"replace" => {
                let key = parse_key(tokens.next())?;
                let len = parse_len(tokens.next())?;
                ensure_no_trailing(tokens.next())?;
                let command = match verb {
                    b"put" => Command::Put { key },
                    b"add" => Command::Add { key },
                    _ => Command::Replace { key },
                };
                return Ok((command, len));
            }
            b"get" => Command::Get {
                key: parse_key(tokens.next())?,
            },
            b"delete" => Command::Delete {
                key: parse_key(tokens.next())?,
            },
            b"stats" => Command::Stats,
            other => {
                return Err(SkvError::Protocol(format!(
                    "unknown command: {}",
                    String::from_utf8_lossy(other)
                )))
            }
        };

        ensure_no_trailing(tokens.next())?;
        Ok((command, 0))
    }
}

fn parse_key(token: Option<&[u8]>) -> SkvResult<Vec<u8>> {
    let key = token.ok_or_else(|| SkvError::Protocol("missing key".to_string()))?;
    if key.is_empty() || key.len() > MAX_KEY {
        return Err(SkvError::Protocol("key must be 1..=250 bytes".to_string()));
    }
    if key.iter().any(|&b| b.is_ascii_control()) {
        return Err(SkvError::Protocol(
            "key must not contain control bytes".to_string(),
        ));
    }
    Ok(key.to_vec())
}

fn parse_len(token: Option<&[u8]>) -> SkvResult<usize> {
    let digits = token.ok_or_else(|| SkvError::Protocol("missing payload length".to_string()))?;
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        return Err(SkvError::Protocol("malformed payload length".to_string()));
    }
    let text = std::str::from_utf8(digits).expect("digits are ascii");
    let len: usize = text
        .parse()
        .map_err(|_| SkvError::Protocol("payload length out of range".to_string()))?;
    if len > MAX_VALUE {
        return Err(SkvError::Protocol("payload too large".to_string()));
    }
    Ok(len)
}

fn ensure_no_trailing(token: Option<&[u8]>) -> SkvResult<()> {
    match token {
        None => Ok(()),
        Some(_) => Err(SkvError::Protocol("trailing arguments".to_string())),
    }
}
