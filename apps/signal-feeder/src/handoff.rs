//! Stage-to-stage handoff with an explicit capacity.
//!
//! Capacity 0 is a rendezvous: `send` resolves only once the receiving stage
//! has taken the item. Any other capacity is a bounded queue.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("handoff receiver dropped")]
pub struct HandoffClosed;

type Rendezvous<T> = (T, oneshot::Sender<()>);

enum SenderKind<T> {
    Rendezvous(mpsc::Sender<Rendezvous<T>>),
    Buffered(mpsc::Sender<T>),
}

enum ReceiverKind<T> {
    Rendezvous(mpsc::Receiver<Rendezvous<T>>),
    Buffered(mpsc::Receiver<T>),
}

pub struct HandoffSender<T> {
    kind: SenderKind<T>,
}

pub struct HandoffReceiver<T> {
    kind: ReceiverKind<T>,
}

pub fn channel<T>(capacity: usize) -> (HandoffSender<T>, HandoffReceiver<T>) {
    if capacity == 0 {
        let (tx, rx) = mpsc::channel(1);
        (
            HandoffSender {
                kind: SenderKind::Rendezvous(tx),
            },
            HandoffReceiver {
                kind: ReceiverKind::Rendezvous(rx),
            },
        )
    } else {
        let (tx, rx) = mpsc::channel(capacity);
        (
            HandoffSender {
                kind: SenderKind::Buffered(tx),
            },
            HandoffReceiver {
                kind: ReceiverKind::Buffered(rx),
            },
        )
    }
}

impl<T> HandoffSender<T> {
    pub async fn send(&self, item: T) -> Result<(), HandoffClosed> {
        match &self.kind {
            SenderKind::Rendezvous(tx) => {
                let (taken_tx, taken_rx) = oneshot::channel();
                tx.send((item, taken_tx)).await.map_err(|_| HandoffClosed)?;
                // The receiver dropping the item unread also lands here.
                taken_rx.await.map_err(|_| HandoffClosed)
            }
            SenderKind::Buffered(tx) => tx.send(item).await.map_err(|_| HandoffClosed),
        }
    }
}

impl<T> HandoffReceiver<T> {
    /// Returns `None` once every sender is dropped and nothing is pending.
    pub async fn recv(&mut self) -> Option<T> {
        match &mut self.kind {
            ReceiverKind::Rendezvous(rx) => {
                let (item, taken) = rx.recv().await?;
                let _ = taken.send(());
                Some(item)
            }
            ReceiverKind::Buffered(rx) => rx.recv().await,
        }
    }
}
