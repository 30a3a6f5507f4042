//! # Synchronous Client API
//!
//! Purpose: expose a compact, blocking API for issuing StrandKV text
//! commands over TCP.
//!
//! ## Design Principles
//! 1. **Borrow-Friendly API**: keys and values are `&[u8]`.
//! 2. **Fail Fast**: protocol violations surface immediately as errors.
//! 3. **One Connection**: no pooling; the protocol is strictly serial per
//!    connection, so a client is one socket plus a buffered reader.

use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Result type for the sync client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the sync client.
#[derive(Debug)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    Io(std::io::Error),
    /// The server's reply did not follow the protocol.
    Protocol(String),
    /// The server answered with a `SERVER_ERROR` line.
    Server { message: String },
    /// The key is empty or contains bytes the line protocol cannot carry.
    InvalidKey,
    /// Address could not be resolved into a socket address.
    InvalidAddress,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Io(err) => write!(f, "io error: {}", err),
            ClientError::Protocol(message) => write!(f, "protocol error: {}", message),
            ClientError::Server { message } => write!(f, "server error: {}", message),
            ClientError::InvalidKey => write!(f, "invalid key"),
            ClientError::InvalidAddress => write!(f, "invalid address"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err)
    }
}

/// Configuration for the synchronous client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, e.g. "127.0.0.1:8080".
    pub addr: String,
    /// Optional TCP read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "127.0.0.1:8080".to_string(),
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// Blocking client for the StrandKV text protocol.
pub struct CacheClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl CacheClient {
    /// Connects with default settings.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> ClientResult<Self> {
        let addr = addr
            .to_socket_addrs()
            .map_err(|_| ClientError::InvalidAddress)?
            .next()
            .ok_or(ClientError::InvalidAddress)?;
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream)
    }

    /// Connects using a full configuration.
    pub fn with_config(config: &ClientConfig) -> ClientResult<Self> {
        let mut client = Self::connect(config.addr.as_str())?;
        client.stream.set_read_timeout(config.read_timeout)?;
        client.stream.set_write_timeout(config.write_timeout)?;
        Ok(client)
    }

    fn from_stream(stream: TcpStream) -> ClientResult<Self> {
        let reader = BufReader::new(stream.try_clone()?);
        Ok(CacheClient { stream, reader })
    }

    /// Insert or overwrite. True when the server stored the entry.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> ClientResult<bool> {
        self.storage(b"put", key, value)
    }

    /// Insert only if the key is absent.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> ClientResult<bool> {
        self.storage(b"add", key, value)
    }

    /// Overwrite only if the key is present.
    pub fn replace(&mut self, key: &[u8], value: &[u8]) -> ClientResult<bool> {
        self.storage(b"replace", key, value)
    }

    /// Look up a key.
    pub fn get(&mut self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        check_key(key)?;
        let mut request = Vec::with_capacity(key.len() + 8);
        request.extend_from_slice(b"get ");
        request.extend_from_slice(key);
        request.extend_from_slice(b"\r\n");
        self.stream.write_all(&request)?;

        let line = self.read_line()?;
        if line == b"NOT_FOUND" {
            return Ok(None);
        }
        let len = parse_value_header(&line)?;
        let mut value = vec![0u8; len];
        self.reader.read_exact(&mut value)?;
        let mut crlf = [0u8; 2];
        self.reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(ClientError::Protocol("value missing terminator".to_string()));
        }
        Ok(Some(value))
    }

    /// Remove a key. True when an entry was deleted.
    pub fn delete(&mut self, key: &[u8]) -> ClientResult<bool> {
        check_key(key)?;
        let mut request = Vec::with_capacity(key.len() + 16);
        request.extend_from_slice(b"delete ");
        request.extend_from_slice(key);
        request.extend_from_slice(b"\r\n");
        self.stream.write_all(&request)?;

        match self.read_line()?.as_slice() {
            b"DELETED" => Ok(true),
            b"NOT_FOUND" => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    /// Fetch the server's `stats` counters as (name, value) pairs.
    pub fn stats(&mut self) -> ClientResult<Vec<(String, u64)>> {
        self.stream.write_all(b"stats\r\n")?;
        let mut stats = Vec::new();
        loop {
            let line = self.read_line()?;
            if line == b"END" {
                return Ok(stats);
            }
            let text = String::from_utf8(line)
                .map_err(|_| ClientError::Protocol("stats line not utf-8".to_string()))?;
            let mut parts = text.split(' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("STAT"), Some(name), Some(value)) => {
                    let value = value
                        .parse()
                        .map_err(|_| ClientError::Protocol("bad stat value".to_string()))?;
                    stats.push((name.to_string(), value));
                }
                _ => return Err(ClientError::Protocol("malformed stats line".to_string())),
            }
        }
    }

    fn storage(&mut self, verb: &[u8], key: &[u8], value: &[u8]) -> ClientResult<bool> {
        check_key(key)?;
        let mut request = Vec::with_capacity(verb.len() + key.len() + value.len() + 24);
        request.extend_from_slice(verb);
        request.push(b' ');
        request.extend_from_slice(key);
        request.push(b' ');
        request.extend_from_slice(value.len().to_string().as_bytes());
        request.extend_from_slice(b"\r\n");
        // A declared length of zero carries no payload line at all.
        if !value.is_empty() {
            request.extend_from_slice(value);
            request.extend_from_slice(b"\r\n");
        }
        self.stream.write_all(&request)?;

        match self.read_line()?.as_slice() {
            b"STORED" => Ok(true),
            b"NOT_STORED" => Ok(false),
            other => Err(unexpected(other)),
        }
    }

    /// Reads one CRLF-terminated line, terminator stripped.
    fn read_line(&mut self) -> ClientResult<Vec<u8>> {
        let mut line = Vec::new();
        let read = self.reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )));
        }
        if !line.ends_with(b"\r\n") {
            return Err(ClientError::Protocol("line missing CRLF".to_string()));
        }
        line.truncate(line.len() - 2);
        Ok(line)
    }
}

fn check_key(key: &[u8]) -> ClientResult<()> {
    if key.is_empty() || key.iter().any(|&b| b == b' ' || b.is_ascii_control()) {
        return Err(ClientError::InvalidKey);
    }
    Ok(())
}

fn parse_value_header(line: &[u8]) -> ClientResult<usize> {
    let rest = line
        .strip_prefix(b"VALUE ")
        .ok_or_else(|| unexpected(line))?;
    std::str::from_utf8(rest)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| ClientError::Protocol("malformed VALUE header".to_string()))
}

fn unexpected(line: &[u8]) -> ClientError {
    let text = String::from_utf8_lossy(line);
    match text.strip_prefix("SERVER_ERROR ") {
        Some(message) => ClientError::Server {
            message: message.to_string(),
        },
        None => ClientError::Protocol(format!("unexpected response: {}", text)),
    }
}
