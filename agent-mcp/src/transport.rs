//! In-process duplex transport carrying text frames.

use tokio::sync::mpsc;

use crate::error::{McpError, McpResult};

/// Sending half of a transport.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<String>,
}

impl FrameSender {
    /// Queues one frame for the peer.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::ConnectionClosed`] once the peer's receiver is gone.
    pub fn send(&self, frame: String) -> McpResult<()> {
        self.tx.send(frame).map_err(|_| McpError::ConnectionClosed)
    }

    /// Whether the peer's receiver was dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a transport.
#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::UnboundedReceiver<String>,
}

impl FrameReceiver {
    /// Waits for the next frame. `None` once every peer sender is dropped.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// One endpoint: frames go out through `sender` and arrive on `receiver`.
#[derive(Debug)]
pub struct Transport {
    /// Outbound half.
    pub sender: FrameSender,
    /// Inbound half.
    pub receiver: FrameReceiver,
}

impl Transport {
    /// Splits the endpoint into its halves.
    #[must_use]
    pub fn split(self) -> (FrameSender, FrameReceiver) {
        (self.sender, self.receiver)
    }
}

/// Creates two connected endpoints. Frames sent on one arrive in order on
/// the other.
#[must_use]
pub fn duplex() -> (Transport, Transport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        Transport {
            sender: FrameSender { tx: a_tx },
            receiver: FrameReceiver { rx: b_rx },
        },
        Transport {
            sender: FrameSender { tx: b_tx },
            receiver: FrameReceiver { rx: a_rx },
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_in_order() {
        let (left, right) = duplex();
        let (left_tx, _left_rx) = left.split();
        let (_right_tx, mut right_rx) = right.split();

        left_tx.send("one".into()).unwrap();
        left_tx.send("two".into()).unwrap();
        assert_eq!(right_rx.recv().await.as_deref(), Some("one"));
        assert_eq!(right_rx.recv().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn dropping_a_side_closes_the_other() {
        let (left, right) = duplex();
        let (left_tx, _left_rx) = left.split();
        drop(right);
        assert!(left_tx.is_closed());
        assert!(matches!(
            left_tx.send("late".into()),
            Err(McpError::ConnectionClosed)
        ));
    }
}
