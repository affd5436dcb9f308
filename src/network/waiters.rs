//! Pending waiters for the next message
//!
//! Every waiter is settled exactly once: resolved with a message, rejected
//! with an error, or rejected with [`ConnectionError::Closed`] if the queue
//! goes away first. Subscribers are settled by every pass until they hang up.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

use super::connection::ConnectionError;
use crate::protocol::Message;

pub type WaitResult = Result<Message, ConnectionError>;

#[derive(Debug)]
struct Pending {
    id: u64,
    tx: oneshot::Sender<WaitResult>,
}

/// Ordered collection of pending waiters
#[derive(Debug, Default)]
pub struct WaiterQueue {
    next_id: u64,
    pending: Vec<Pending>,
    subscribers: Vec<mpsc::UnboundedSender<WaitResult>>,
}

impl WaiterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the next message. Waiters whose handle was
    /// dropped are pruned first.
    pub fn register(&mut self) -> Waiter {
        self.pending.retain(|p| !p.tx.is_closed());

        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.pending.push(Pending { id, tx });
        Waiter { id, rx }
    }

    /// Receive the outcome of every pass from now on, in order
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<WaitResult> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Resolve every registered waiter with `message` and clear the queue.
    /// Returns how many waiters were still listening.
    pub fn resolve_all(&mut self, message: &Message) -> usize {
        self.settle(|| Ok(message.clone()))
    }

    /// Reject every registered waiter with `error` and clear the queue
    pub fn reject_all(&mut self, error: &ConnectionError) -> usize {
        self.settle(|| Err(error.clone()))
    }

    fn settle(&mut self, mut outcome: impl FnMut() -> WaitResult) -> usize {
        let mut delivered = 0;
        for pending in std::mem::take(&mut self.pending) {
            if !pending.tx.is_closed() && pending.tx.send(outcome()).is_ok() {
                delivered += 1;
            }
        }
        self.subscribers.retain(|tx| tx.send(outcome()).is_ok());
        delivered + self.subscribers.len()
    }

    /// Remove a waiter without settling it
    pub fn abandon(&mut self, id: u64) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.id != id);
        self.pending.len() != before
    }

    pub fn len(&self) -> usize {
        self.pending.iter().filter(|p| !p.tx.is_closed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle for one pending waiter; resolves with the next message
#[derive(Debug)]
pub struct Waiter {
    id: u64,
    rx: oneshot::Receiver<WaitResult>,
}

impl Waiter {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for Waiter {
    type Output = WaitResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ConnectionError::Closed)))
    }
}
