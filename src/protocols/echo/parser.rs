//! Echo protocol parser.

use crate::runtime::frame::{Frame, HEADER_SIZE};

/// Payload is echoed back.
pub const FLAG_ECHO: u8 = 0;
/// Payload is the client's auth token.
pub const FLAG_HELLO: u8 = 1;
/// Client is leaving.
pub const FLAG_QUIT: u8 = 2;

/// Hello reply payload when the token was accepted.
pub const HELLO_OK: &[u8] = b"ok";
/// Hello reply payload when the token was rejected.
pub const HELLO_DENIED: &[u8] = b"denied";

/// Parsed echo command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// Echo the payload back.
    Echo(&'a [u8]),
    /// Handshake carrying the auth token.
    Hello { token: &'a [u8] },
    /// Quit command.
    Quit,
}

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult<'a> {
    /// Successfully parsed command.
    Complete(Command<'a>),
    /// Header length does not match the frame.
    Malformed,
    /// Flag byte is not part of the protocol.
    UnknownFlag(u8),
}

/// Parse one complete frame, header included.
pub fn parse(bytes: &[u8]) -> ParseResult<'_> {
    let frame = match Frame::new(bytes) {
        Some(frame) => frame,
        None => return ParseResult::Malformed,
    };

    match frame.flag() {
        FLAG_ECHO => ParseResult::Complete(Command::Echo(frame.payload())),
        FLAG_HELLO => ParseResult::Complete(Command::Hello {
            token: frame.payload(),
        }),
        FLAG_QUIT => ParseResult::Complete(Command::Quit),
        other => ParseResult::UnknownFlag(other),
    }
}

/// Payload length of a frame, for logging.
pub fn payload_len(bytes: &[u8]) -> usize {
    bytes.len().saturating_sub(HEADER_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::frame::{encode, MAX_FRAME_SIZE};

    #[test]
    fn test_parse_echo() {
        let frame = encode(FLAG_ECHO, b"ping", MAX_FRAME_SIZE).unwrap();
        assert_eq!(parse(&frame), ParseResult::Complete(Command::Echo(b"ping")));
    }

    #[test]
    fn test_parse_hello() {
        let frame = encode(FLAG_HELLO, b"token", MAX_FRAME_SIZE).unwrap();
        match parse(&frame) {
            ParseResult::Complete(Command::Hello { token }) => assert_eq!(token, b"token"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_quit() {
        assert_eq!(parse(&[0, 0, 4, FLAG_QUIT]), ParseResult::Complete(Command::Quit));
    }

    #[test]
    fn test_unknown_flag() {
        assert_eq!(parse(&[0, 0, 4, 0x7f]), ParseResult::UnknownFlag(0x7f));
    }

    #[test]
    fn test_malformed() {
        assert_eq!(parse(&[0, 0, 9, 0, b'x']), ParseResult::Malformed);
        assert_eq!(payload_len(&[0, 0, 6, 0, b'a', b'b']), 2);
    }
}
