// https://redis.io/docs/reference/protocol-spec

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::command::escape_crlf;

static CRLF: &[u8; 2] = b"\r\n";

/// A reply already encoded for the wire.
///
/// Replies are built through the constructors below, one per RESP2 reply kind, and are never
/// mutated afterwards. A pipelined batch is the plain concatenation of its replies.
#[derive(Clone, PartialEq, Eq)]
pub struct Reply(Bytes);

impl Reply {
    /// `+<s>\r\n`. The caller guarantees `s` holds no `\r` or `\n`.
    pub fn simple(s: impl AsRef<str>) -> Reply {
        Reply(line(DataType::SimpleString, s.as_ref().as_bytes()))
    }

    /// `-<s>\r\n`.
    pub fn error(s: impl AsRef<str>) -> Reply {
        Reply(line(DataType::SimpleError, s.as_ref().as_bytes()))
    }

    /// `:<i>\r\n`.
    pub fn integer(i: i64) -> Reply {
        Reply(line(DataType::Integer, i.to_string().as_bytes()))
    }

    /// `$<len>\r\n<data>\r\n`.
    pub fn bulk(data: impl AsRef<[u8]>) -> Reply {
        let mut bytes = BytesMut::new();
        put_bulk(&mut bytes, Some(data.as_ref()));
        Reply(bytes.freeze())
    }

    /// The null bulk string, `$-1\r\n`.
    pub fn null() -> Reply {
        Reply(Bytes::from_static(b"$-1\r\n"))
    }

    /// `Some` maps to a bulk string and `None` to the null bulk string.
    pub fn optional_bulk<B: AsRef<[u8]>>(data: Option<B>) -> Reply {
        match data {
            Some(data) => Reply::bulk(data),
            None => Reply::null(),
        }
    }

    /// An array of bulk strings, where `None` elements are encoded as null bulk strings.
    pub fn array<I, B>(elements: I) -> Reply
    where
        I: IntoIterator<Item = Option<B>>,
        B: AsRef<[u8]>,
    {
        let elements: Vec<Option<B>> = elements.into_iter().collect();

        let mut bytes = BytesMut::new();
        put_header(&mut bytes, DataType::Array, elements.len());
        for element in &elements {
            put_bulk(&mut bytes, element.as_ref().map(|e| e.as_ref()));
        }
        Reply(bytes.freeze())
    }

    /// An array of bulk strings with no null elements.
    pub fn strings<I, B>(elements: I) -> Reply
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        Reply::array(elements.into_iter().map(Some))
    }

    /// An array of arbitrary replies, nested arrays included.
    pub fn nested(elements: impl IntoIterator<Item = Reply>) -> Reply {
        let elements: Vec<Reply> = elements.into_iter().collect();

        let mut bytes = BytesMut::new();
        put_header(&mut bytes, DataType::Array, elements.len());
        for element in &elements {
            bytes.put_slice(&element.0);
        }
        Reply(bytes.freeze())
    }

    /// The null array, `*-1\r\n`.
    pub fn null_array() -> Reply {
        Reply(Bytes::from_static(b"*-1\r\n"))
    }

    /// Wraps bytes the caller has already encoded. Nothing is validated.
    pub fn raw(bytes: impl Into<Bytes>) -> Reply {
        Reply(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Reply {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Reply> for Bytes {
    fn from(reply: Reply) -> Self {
        reply.0
    }
}

impl From<Reply> for Vec<u8> {
    fn from(reply: Reply) -> Self {
        reply.0.to_vec()
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&escape_crlf(&self.0))
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reply({})", self)
    }
}

#[derive(Debug, Clone, Copy)]
enum DataType {
    SimpleString, // '+'
    SimpleError,  // '-'
    Integer,      // ':'
    BulkString,   // '$'
    Array,        // '*'
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::BulkString => b'$',
            DataType::Array => b'*',
        }
    }
}

fn line(data_type: DataType, content: &[u8]) -> Bytes {
    let mut bytes = BytesMut::with_capacity(1 + content.len() + CRLF.len());
    bytes.put_u8(u8::from(data_type));
    bytes.put_slice(content);
    bytes.put_slice(CRLF);
    bytes.freeze()
}

fn put_header(bytes: &mut BytesMut, data_type: DataType, len: usize) {
    bytes.put_u8(u8::from(data_type));
    bytes.put_slice(len.to_string().as_bytes());
    bytes.put_slice(CRLF);
}

fn put_bulk(bytes: &mut BytesMut, data: Option<&[u8]>) {
    match data {
        Some(data) => {
            put_header(bytes, DataType::BulkString, data.len());
            bytes.put_slice(data);
            bytes.put_slice(CRLF);
        }
        None => bytes.put_slice(b"$-1\r\n"),
    }
}
