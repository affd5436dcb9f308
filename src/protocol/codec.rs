//! Protocol codec for framing messages
//!
//! [`MessageParser`] reconstructs one message at a time from a byte stream
//! delivered in arbitrary chunks.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::message::{Command, Message, COMMAND_SIZE, HEADER_SIZE};
use super::profile::NetworkProfile;

/// Initial payload buffer reservation, regardless of the declared length
const PAYLOAD_RESERVE: usize = 64 * 1024;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid magic bytes: expected {expected:#010x}, found {found:#010x}")]
    InvalidMagic { expected: u32, found: u32 },

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Truncated record: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Outcome of feeding a chunk to a parser
#[derive(Debug)]
pub enum Feed {
    /// The chunk was consumed; the message is not complete yet
    NeedMore,
    /// A message was completed. `remainder` is the unconsumed tail of the
    /// chunk and may hold the start of further messages.
    Complete { message: Message, remainder: Bytes },
}

/// Decoded message header
#[derive(Debug, Clone, Copy)]
struct Header {
    magic: u32,
    command: Command,
    length: usize,
    checksum: [u8; 4],
}

impl Header {
    fn parse(buf: &[u8]) -> Self {
        let mut command = [0u8; COMMAND_SIZE];
        command.copy_from_slice(&buf[4..16]);
        Self {
            magic: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            command: Command::from_bytes(command),
            length: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]) as usize,
            checksum: [buf[20], buf[21], buf[22], buf[23]],
        }
    }
}

#[derive(Debug)]
enum ParseState {
    Header { buf: BytesMut },
    Payload { header: Header, body: BytesMut },
}

/// Strict incremental parser for a single message
///
/// The parser accepts a chunk boundary at any byte offset. Magic and
/// declared length are checked as soon as the header is complete; the
/// checksum is left to [`Message::is_valid`].
#[derive(Debug)]
pub struct MessageParser {
    magic: u32,
    max_message_size: usize,
    state: ParseState,
}

impl MessageParser {
    pub fn new(profile: &NetworkProfile) -> Self {
        Self::with_limits(profile.magic, profile.max_message_size)
    }

    pub fn with_limits(magic: u32, max_message_size: usize) -> Self {
        Self {
            magic,
            max_message_size,
            state: ParseState::Header {
                buf: BytesMut::with_capacity(HEADER_SIZE),
            },
        }
    }

    /// Number of bytes buffered for the message in progress
    pub fn buffered(&self) -> usize {
        match &self.state {
            ParseState::Header { buf } => buf.len(),
            ParseState::Payload { body, .. } => HEADER_SIZE + body.len(),
        }
    }

    /// Feed the next chunk of the stream
    ///
    /// After `Complete` the parser is back at the start of a new header.
    /// After an error the parser must be discarded.
    pub fn feed(&mut self, mut chunk: Bytes) -> CodecResult<Feed> {
        let magic = self.magic;
        let max_message_size = self.max_message_size;

        loop {
            match &mut self.state {
                ParseState::Header { buf } => {
                    fill(buf, &mut chunk, HEADER_SIZE);
                    if buf.len() < HEADER_SIZE {
                        return Ok(Feed::NeedMore);
                    }

                    let header = Header::parse(&buf[..]);
                    if header.magic != magic {
                        return Err(CodecError::InvalidMagic {
                            expected: magic,
                            found: header.magic,
                        });
                    }
                    if header.length > max_message_size {
                        return Err(CodecError::MessageTooLarge(header.length, max_message_size));
                    }

                    self.state = ParseState::Payload {
                        header,
                        body: BytesMut::with_capacity(header.length.min(PAYLOAD_RESERVE)),
                    };
                }
                ParseState::Payload { header, body } => {
                    fill(body, &mut chunk, header.length);
                    if body.len() < header.length {
                        return Ok(Feed::NeedMore);
                    }

                    let message = Message::from_parts(
                        header.magic,
                        header.command,
                        body.split().freeze(),
                        header.checksum,
                    );
                    self.state = ParseState::Header {
                        buf: BytesMut::with_capacity(HEADER_SIZE),
                    };

                    return Ok(Feed::Complete {
                        message,
                        remainder: chunk,
                    });
                }
            }
        }
    }
}

/// Move bytes from `chunk` into `buf` until `buf` holds `target` bytes
fn fill(buf: &mut BytesMut, chunk: &mut Bytes, target: usize) {
    let take = target.saturating_sub(buf.len()).min(chunk.len());
    if take > 0 {
        buf.extend_from_slice(&chunk.split_to(take));
    }
}
