//! Connection-level housekeeping replies
//!
//! Replies produced here are sent without involving the application.
//! Higher-level commands are left to whoever awaits messages.

use crate::protocol::{commands, Message};

/// Decides whether a received message warrants an automatic reply
pub trait AutoRespond: Send + Sync {
    fn on_message(&self, message: &Message) -> Option<Message>;
}

/// Answers every `ping` with a `pong` carrying the same nonce
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepaliveResponder;

impl AutoRespond for KeepaliveResponder {
    fn on_message(&self, message: &Message) -> Option<Message> {
        match message.command() {
            commands::PING => Some(Message::pong_from_ping(message)),
            _ => None,
        }
    }
}
