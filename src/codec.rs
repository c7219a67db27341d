// https://redis.io/docs/reference/protocol-spec/#sending-commands-to-a-redis-server

use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Cursor};
use thiserror::Error as ThisError;
use tokio_util::codec::{Decoder, Encoder};

use crate::command::Command;

static CRLF: &[u8; 2] = b"\r\n";

/// Upper bound for the parts vector allocated up front from an untrusted `*<argc>` header.
const MAX_PREALLOCATED_PARTS: usize = 1024;

/// A malformed byte stream. Once returned, nothing after the offending frame can be trusted.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("protocol error; expected '{expected}', got '{}'", .actual.escape_ascii())]
    UnexpectedByte { expected: char, actual: u8 },
    #[error("protocol error; invalid length {0:?}")]
    InvalidLength(String),
    #[error("protocol error; line is not terminated by CRLF")]
    MissingCrlf,
    #[error("protocol error; {pending} pending bytes exceed the frame size limit of {limit}")]
    FrameTooLarge { pending: usize, limit: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Internal parse outcome. Running out of bytes is the normal way a parse ends on a stream, so
/// it is kept apart from the public [`Error`].
enum ParseError {
    Incomplete,
    Format(Error),
}

impl From<Error> for ParseError {
    fn from(err: Error) -> ParseError {
        ParseError::Format(err)
    }
}

/// Result of decoding a whole buffer window with [`decode`].
#[derive(Debug, Default, PartialEq)]
pub struct Decoded {
    /// Commands in arrival order.
    pub commands: Vec<Command>,
    /// Bytes fully decoded from the start of the window. They can be discarded.
    pub consumed: usize,
    /// Bytes after `consumed` that do not form a complete frame yet.
    pub pending: usize,
}

impl Decoded {
    /// The window ended in the middle of a frame: more bytes are needed to make progress.
    pub fn needs_more_data(&self) -> bool {
        self.pending > 0
    }
}

/// Decodes every complete command in `src`.
///
/// Decoding stops at the first incomplete frame, which is reported through
/// [`Decoded::pending`] instead of an error. The result only depends on the bytes, not on how
/// they were split across reads.
pub fn decode(src: &[u8]) -> Result<Decoded, Error> {
    let mut cursor = Cursor::new(src);
    let mut decoded = Decoded::default();

    while decoded.consumed < src.len() {
        match parse(&mut cursor) {
            Ok(command) => {
                decoded.consumed = cursor.position() as usize;
                decoded.commands.extend(command);
            }
            Err(ParseError::Incomplete) => break,
            Err(ParseError::Format(err)) => return Err(err),
        }
    }

    decoded.pending = src.len() - decoded.consumed;
    Ok(decoded)
}

/// Parses one frame starting at the cursor position.
///
/// `Ok(None)` is a frame that carries no command (a blank inline line or `*0\r\n`); its bytes
/// are still consumed.
fn parse(src: &mut Cursor<&[u8]>) -> Result<Option<Command>, ParseError> {
    let first = src.get_ref().get(src.position() as usize).copied();
    match first {
        None => Err(ParseError::Incomplete),
        Some(b'*') => parse_multi_bulk(src),
        Some(_) => parse_inline(src),
    }
}

// *<argc>\r\n$<len>\r\n<data>\r\n...
fn parse_multi_bulk(src: &mut Cursor<&[u8]>) -> Result<Option<Command>, ParseError> {
    let argc = get_number(src, b'*')?;

    let mut parts = Vec::with_capacity(argc.min(MAX_PREALLOCATED_PARTS));
    for _ in 0..argc {
        let len = get_number(src, b'$')?;
        let data = get_payload(src, len)?;
        parts.push(Bytes::copy_from_slice(data));
    }

    // Only `*0\r\n` yields no parts.
    Ok(Command::try_from(parts).ok())
}

// Anything up to '\n', split on whitespace.
fn parse_inline(src: &mut Cursor<&[u8]>) -> Result<Option<Command>, ParseError> {
    let start = src.position() as usize;
    let buf = *src.get_ref();

    let newline = buf[start..]
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(ParseError::Incomplete)?;
    let line = &buf[start..start + newline];
    src.set_position((start + newline + 1) as u64);

    let parts: Vec<Bytes> = line
        .split(|&b| is_space(b))
        .filter(|field| !field.is_empty())
        .map(Bytes::copy_from_slice)
        .collect();

    Ok(Command::try_from(parts).ok())
}

/// Reads `<prefix><digits>\r\n`.
fn get_number(src: &mut Cursor<&[u8]>, prefix: u8) -> Result<usize, ParseError> {
    let byte = get_byte(src)?;
    if byte != prefix {
        return Err(Error::UnexpectedByte {
            expected: prefix as char,
            actual: byte,
        }
        .into());
    }

    let line = get_line(src)?;
    parse_decimal(line).ok_or_else(|| {
        Error::InvalidLength(String::from_utf8_lossy(line).into_owned()).into()
    })
}

/// Unsigned ASCII decimal. Signs, blanks and values that overflow `usize` are rejected.
fn parse_decimal(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() {
        return None;
    }

    digits.iter().try_fold(0usize, |acc, &b| {
        if !b.is_ascii_digit() {
            return None;
        }
        acc.checked_mul(10)?.checked_add(usize::from(b - b'0'))
    })
}

/// Returns the line at the cursor without its terminator, which must be `\r\n`.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ParseError> {
    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();

    let newline = buf[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|index| start + index)
        .ok_or(ParseError::Incomplete)?;

    if newline == start || buf[newline - 1] != b'\r' {
        return Err(Error::MissingCrlf.into());
    }

    src.set_position((newline + 1) as u64);
    Ok(&buf[start..newline - 1])
}

/// Returns `len` raw bytes, which must be followed by `\r\n`.
fn get_payload<'a>(src: &mut Cursor<&'a [u8]>, len: usize) -> Result<&'a [u8], ParseError> {
    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();

    let end = start.checked_add(len).ok_or(ParseError::Incomplete)?;
    if buf.len().saturating_sub(end) < CRLF.len() {
        return Err(ParseError::Incomplete);
    }
    if &buf[end..end + CRLF.len()] != CRLF {
        return Err(Error::MissingCrlf.into());
    }

    src.set_position((end + CRLF.len()) as u64);
    Ok(&buf[start..end])
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, ParseError> {
    if !src.has_remaining() {
        return Err(ParseError::Incomplete);
    }
    Ok(src.get_u8())
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n' | 0x0b | 0x0c)
}

/// Streaming version of [`decode`]: yields one command per call and drains its bytes from the
/// buffer. Frames without a command are skipped.
#[derive(Debug, Clone)]
pub struct CommandCodec {
    max_frame_size: usize,
}

impl CommandCodec {
    pub fn new() -> CommandCodec {
        CommandCodec {
            max_frame_size: 512 * 1024 * 1024,
        }
    }

    /// Pending bytes reaching `max_frame_size` without forming a complete frame make
    /// [`Decoder::decode`] fail with [`Error::FrameTooLarge`].
    pub fn with_max_frame_size(max_frame_size: usize) -> CommandCodec {
        CommandCodec { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for CommandCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while !src.is_empty() {
            let (parsed, position) = {
                let mut cursor = Cursor::new(&src[..]);
                let parsed = parse(&mut cursor);
                (parsed, cursor.position() as usize)
            };

            match parsed {
                Ok(command) => {
                    src.advance(position);
                    if command.is_some() {
                        return Ok(command);
                    }
                }
                Err(ParseError::Incomplete) => {
                    // Check if the frame size exceeds a certain limit to prevent DoS attacks
                    if src.len() >= self.max_frame_size {
                        return Err(Error::FrameTooLarge {
                            pending: src.len(),
                            limit: self.max_frame_size,
                        });
                    }
                    return Ok(None);
                }
                Err(ParseError::Format(err)) => return Err(err),
            }
        }

        Ok(None)
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Command {
        let parts: Vec<Bytes> = parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect();
        Command::try_from(parts).unwrap()
    }

    #[test]
    fn decode_multi_bulk_frames() {
        let data = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n*2\r\n$3\r\nGET\r\n$3\r\nbar\r\n";

        let decoded = decode(data).unwrap();

        assert_eq!(decoded.commands, vec![cmd(&["GET", "foo"]), cmd(&["GET", "bar"])]);
        assert_eq!(decoded.consumed, data.len());
        assert!(!decoded.needs_more_data());
    }

    #[test]
    fn decode_retains_partial_frame() {
        let data = b"*1\r\n$4\r\nPING\r\n*2\r\n$3GET\r";

        let decoded = decode(data).unwrap();

        assert_eq!(decoded.commands, vec![cmd(&["PING"])]);
        assert_eq!(&data[decoded.consumed..], b"*2\r\n$3GET\r");
        assert_eq!(decoded.pending, 10);
        assert!(decoded.needs_more_data());
    }

    #[test]
    fn decode_only_partial_frame() {
        let data = b"*2\r\n$3GET\r";

        let decoded = decode(data).unwrap();

        assert!(decoded.commands.is_empty());
        assert_eq!(decoded.consumed, 0);
        assert_eq!(decoded.pending, data.len());
    }

    #[test]
    fn decode_inline_commands() {
        let data = b"GET foo\r\nGET bar\n";

        let decoded = decode(data).unwrap();

        assert_eq!(decoded.commands, vec![cmd(&["GET", "foo"]), cmd(&["GET", "bar"])]);
        assert_eq!(decoded.consumed, data.len());
    }

    #[test]
    fn decode_inline_retains_unterminated_line() {
        let data = b"GET foo\r\nGET";

        let decoded = decode(data).unwrap();

        assert_eq!(decoded.commands, vec![cmd(&["GET", "foo"])]);
        assert_eq!(&data[decoded.consumed..], b"GET");
    }

    #[test]
    fn decode_inline_skips_blank_lines() {
        let data = b"\r\n   \n\t PING \r\n\n";

        let decoded = decode(data).unwrap();

        assert_eq!(decoded.commands, vec![cmd(&["PING"])]);
        assert_eq!(decoded.consumed, data.len());
    }

    #[test]
    fn decode_inline_collapses_whitespace() {
        let decoded = decode(b"  SET   key\tvalue  \r\n").unwrap();
        assert_eq!(decoded.commands, vec![cmd(&["SET", "key", "value"])]);
    }

    #[test]
    fn decode_mixed_framing() {
        let data = b"PING\r\n*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\nQUIT\n";

        let decoded = decode(data).unwrap();

        assert_eq!(
            decoded.commands,
            vec![cmd(&["PING"]), cmd(&["ECHO", "hi"]), cmd(&["QUIT"])]
        );
    }

    #[test]
    fn decode_empty_multi_bulk_is_skipped() {
        let decoded = decode(b"*0\r\n*1\r\n$4\r\nPING\r\n").unwrap();

        assert_eq!(decoded.commands, vec![cmd(&["PING"])]);
        assert_eq!(decoded.consumed, 18);
    }

    #[test]
    fn decode_binary_payload() {
        let data = b"*2\r\n$3\r\nSET\r\n$4\r\n\r\n\x00\xff\r\n";

        let decoded = decode(data).unwrap();

        assert_eq!(decoded.commands.len(), 1);
        assert_eq!(decoded.commands[0].get(1).unwrap().as_ref(), b"\r\n\x00\xff");
    }

    #[test]
    fn decode_empty_argument() {
        let decoded = decode(b"*2\r\n$4\r\nECHO\r\n$0\r\n\r\n").unwrap();
        assert_eq!(decoded.commands, vec![cmd(&["ECHO", ""])]);
    }

    #[test]
    fn decode_garbled_length_line() {
        let err = decode(b"*2\r\nhello").unwrap_err();

        assert!(matches!(
            err,
            Error::UnexpectedByte {
                expected: '$',
                actual: b'h'
            }
        ));
    }

    #[test]
    fn decode_non_numeric_count() {
        assert!(matches!(
            decode(b"*x\r\n"),
            Err(Error::InvalidLength(ref s)) if s == "x"
        ));
        assert!(matches!(decode(b"*\r\n"), Err(Error::InvalidLength(_))));
    }

    #[test]
    fn decode_rejects_signed_lengths() {
        assert!(matches!(decode(b"*+1\r\n"), Err(Error::InvalidLength(_))));
        assert!(matches!(decode(b"*-1\r\n"), Err(Error::InvalidLength(_))));
        assert!(matches!(
            decode(b"*1\r\n$-1\r\n"),
            Err(Error::InvalidLength(_))
        ));
    }

    #[test]
    fn decode_rejects_overflowing_length() {
        assert!(matches!(
            decode(b"*99999999999999999999999\r\n"),
            Err(Error::InvalidLength(_))
        ));
    }

    #[test]
    fn decode_line_without_carriage_return() {
        assert!(matches!(decode(b"*1\n"), Err(Error::MissingCrlf)));
    }

    #[test]
    fn decode_payload_without_crlf() {
        assert!(matches!(
            decode(b"*1\r\n$4\r\nPINGxx"),
            Err(Error::MissingCrlf)
        ));
    }

    #[test]
    fn decode_payload_waits_for_trailing_crlf() {
        let decoded = decode(b"*1\r\n$4\r\nPING\r").unwrap();
        assert!(decoded.commands.is_empty());
        assert_eq!(decoded.pending, 13);
    }

    #[test]
    fn decode_error_after_valid_frames() {
        // A format error anywhere poisons the batch.
        assert!(decode(b"*1\r\n$4\r\nPING\r\n*1\r\n!").is_err());
    }

    #[test]
    fn decoder_yields_one_command_per_call() {
        let mut codec = CommandCodec::new();
        let mut buf = BytesMut::from(&b"PING\r\n\r\n*1\r\n$4\r\nQUIT\r\n*1\r\n$3"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(cmd(&["PING"])));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(cmd(&["QUIT"])));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(&buf[..], b"*1\r\n$3");
    }

    #[test]
    fn decoder_skips_trailing_blank_frames() {
        let mut codec = CommandCodec::new();
        let mut buf = BytesMut::from(&b"\r\n*0\r\n"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn decoder_rejects_oversized_frame() {
        let mut codec = CommandCodec::with_max_frame_size(8);
        let mut buf = BytesMut::from(&b"*1\r\n$100\r\n"[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::FrameTooLarge {
                pending: 10,
                limit: 8
            })
        ));
    }

    #[test]
    fn decoder_accepts_complete_frame_at_limit() {
        let mut codec = CommandCodec::with_max_frame_size(14);
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(cmd(&["PING"])));
    }

    #[test]
    fn encoder_writes_multi_bulk() {
        let mut codec = CommandCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(cmd(&["GET", "bar"]), &mut buf).unwrap();

        assert_eq!(&buf[..], b"*2\r\n$3\r\nGET\r\n$3\r\nbar\r\n");
    }
}
