//! Message assembly over a chunked byte stream
//!
//! The assembler is either idle or holds exactly one partial message.
//! A fresh parser is started for every message, and a parser that failed
//! is dropped rather than reused.

use bytes::Bytes;

use crate::protocol::{CodecResult, Feed, Message, MessageParser, NetworkProfile};

/// Incremental message assembler for one connection
#[derive(Debug)]
pub struct Assembler {
    magic: u32,
    max_message_size: usize,
    parser: Option<MessageParser>,
}

impl Assembler {
    /// `max_message_size` can only tighten the profile's ceiling
    pub fn new(profile: &NetworkProfile, max_message_size: usize) -> Self {
        Self {
            magic: profile.magic,
            max_message_size: max_message_size.min(profile.max_message_size),
            parser: None,
        }
    }

    /// Whether a partial message is buffered
    pub fn is_assembling(&self) -> bool {
        self.parser.is_some()
    }

    /// Bytes buffered for the partial message
    pub fn buffered(&self) -> usize {
        self.parser.as_ref().map_or(0, MessageParser::buffered)
    }

    /// Feed one chunk. On `Complete` the assembler returns to idle; on error
    /// the partial message is discarded.
    pub fn feed(&mut self, chunk: Bytes) -> CodecResult<Feed> {
        if chunk.is_empty() && self.parser.is_none() {
            return Ok(Feed::NeedMore);
        }

        let (magic, max_message_size) = (self.magic, self.max_message_size);
        let parser = self
            .parser
            .get_or_insert_with(|| MessageParser::with_limits(magic, max_message_size));

        match parser.feed(chunk) {
            Ok(Feed::NeedMore) => Ok(Feed::NeedMore),
            Ok(complete) => {
                self.parser = None;
                Ok(complete)
            }
            Err(error) => {
                self.parser = None;
                Err(error)
            }
        }
    }

    /// Yield every message completed by `chunk`, draining remainders in a
    /// loop. Iteration stops at the first error.
    pub fn drain(&mut self, chunk: Bytes) -> Drain<'_> {
        Drain {
            assembler: self,
            pending: Some(chunk),
        }
    }
}

/// Iterator over the messages completed by one chunk
#[derive(Debug)]
pub struct Drain<'a> {
    assembler: &'a mut Assembler,
    pending: Option<Bytes>,
}

impl Iterator for Drain<'_> {
    type Item = CodecResult<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.pending.take()?;
        match self.assembler.feed(chunk) {
            Ok(Feed::NeedMore) => None,
            Ok(Feed::Complete { message, remainder }) => {
                if !remainder.is_empty() {
                    self.pending = Some(remainder);
                }
                Some(Ok(message))
            }
            Err(error) => Some(Err(error)),
        }
    }
}
