//! In-memory duplex streams
//!
//! Channel-backed endpoints implementing the transport stream traits.
//! Tests drive the managers through these; the agent side of a pair is
//! used directly via `send`/`recv`.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{DockerChannel, DockerFrame, ShellStream, StateAck, StateFrame, StateStream,
            StreamError};

/// One endpoint of an in-memory bidirectional stream
pub struct Duplex<In, Out> {
    rx: mpsc::Receiver<In>,
    tx: mpsc::Sender<Out>,
}

/// Create a connected pair of endpoints
pub fn pair<A: Send, B: Send>(capacity: usize) -> (Duplex<A, B>, Duplex<B, A>) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        Duplex { rx: a_rx, tx: b_tx },
        Duplex { rx: b_rx, tx: a_tx },
    )
}

impl<In: Send, Out: Send> Duplex<In, Out> {
    /// Receive the next inbound message; `None` when the peer is gone
    pub async fn recv(&mut self) -> Option<In> {
        self.rx.recv().await
    }

    /// Send a message to the peer
    pub async fn send(&mut self, msg: Out) -> Result<(), StreamError> {
        self.tx.send(msg).await.map_err(|_| StreamError::Closed)
    }

    /// Close the outbound side, signalling end of stream to the peer
    pub fn close(self) {
        drop(self);
    }
}

#[async_trait]
impl StateStream for Duplex<StateFrame, StateAck> {
    async fn recv(&mut self) -> Result<Option<StateFrame>, StreamError> {
        Ok(self.rx.recv().await)
    }

    async fn send(&mut self, ack: StateAck) -> Result<(), StreamError> {
        self.tx.send(ack).await.map_err(|_| StreamError::Closed)
    }
}

#[async_trait]
impl ShellStream for Duplex<Vec<u8>, Vec<u8>> {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        Ok(self.rx.recv().await)
    }

    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), StreamError> {
        self.tx.send(bytes).await.map_err(|_| StreamError::Closed)
    }
}

#[async_trait]
impl DockerChannel for Duplex<DockerFrame, DockerFrame> {
    async fn recv(&mut self) -> Result<Option<DockerFrame>, StreamError> {
        Ok(self.rx.recv().await)
    }

    async fn send(&mut self, frame: DockerFrame) -> Result<(), StreamError> {
        self.tx.send(frame).await.map_err(|_| StreamError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_round_trips_messages() {
        let (mut server, mut agent) = pair::<String, u32>(4);
        agent.send("hello".to_string()).await.unwrap();
        assert_eq!(server.recv().await.as_deref(), Some("hello"));

        server.send(7).await.unwrap();
        assert_eq!(agent.recv().await, Some(7));
    }

    #[tokio::test]
    async fn dropping_one_end_closes_the_other() {
        let (server, mut agent) = pair::<String, u32>(4);
        server.close();
        assert!(agent.recv().await.is_none());
    }
}
