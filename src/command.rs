use std::fmt;
use std::str;

use bytes::{BufMut, Bytes, BytesMut};
use itertools::Itertools;
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

/// A command sent by a client, in argv form.
///
/// The first part is the directive name (`GET`, `PING`, ...) and the rest are its arguments.
/// Every part is a binary-safe byte string. A command always has at least one part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    parts: Vec<Bytes>,
}

#[derive(Debug, ThisError, PartialEq)]
#[error("a command needs at least a name")]
pub struct EmptyCommand;

impl Command {
    pub fn new(name: impl Into<Bytes>) -> Command {
        Command {
            parts: vec![name.into()],
        }
    }

    /// Appends an argument, builder style.
    pub fn with_arg(mut self, arg: impl Into<Bytes>) -> Command {
        self.parts.push(arg.into());
        self
    }

    pub fn name(&self) -> &Bytes {
        &self.parts[0]
    }

    /// Part at `index`, where index `0` is the name.
    pub fn get(&self, index: usize) -> Option<&Bytes> {
        self.parts.get(index)
    }

    /// Same as [`Command::get`], as UTF-8. `None` when missing or not valid UTF-8.
    pub fn get_str(&self, index: usize) -> Option<&str> {
        self.get(index).and_then(|part| str::from_utf8(part).ok())
    }

    /// Arguments after the name.
    pub fn args(&self) -> &[Bytes] {
        &self.parts[1..]
    }

    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    pub fn into_parts(self) -> Vec<Bytes> {
        self.parts
    }

    /// Number of parts, name included.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Writes the multi-bulk encoding of the command: `*<argc>\r\n` followed by one
    /// `$<len>\r\n<bytes>\r\n` per part.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(b'*');
        dst.put_slice(self.parts.len().to_string().as_bytes());
        dst.put_slice(CRLF);
        for part in &self.parts {
            dst.put_u8(b'$');
            dst.put_slice(part.len().to_string().as_bytes());
            dst.put_slice(CRLF);
            dst.put_slice(part);
            dst.put_slice(CRLF);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::new();
        self.encode(&mut dst);
        dst.freeze()
    }
}

impl TryFrom<Vec<Bytes>> for Command {
    type Error = EmptyCommand;

    fn try_from(parts: Vec<Bytes>) -> Result<Self, Self::Error> {
        if parts.is_empty() {
            return Err(EmptyCommand);
        }
        Ok(Command { parts })
    }
}

impl From<Command> for Vec<u8> {
    fn from(command: Command) -> Self {
        command.to_bytes().to_vec()
    }
}

// Meant for logs: line breaks are escaped so one command stays on one line.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self.parts.iter().map(|part| escape_crlf(part)).join(" ");
        write!(f, "\"{}\"", parts)
    }
}

pub(crate) fn escape_crlf(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .replace('\r', "\\r")
        .replace('\n', "\\n")
}
