use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::netaddr::ClientKey;
use crate::pipeline::{Direction, Pipeline};
use crate::transport::{Transport, TransportEvent};

/// Lifecycle of one proxied connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Client socket accepted; upstream transport exists but is not
    /// connected. The client's receive loop is deliberately not running
    /// yet: no client packet is processed before an upstream can take it.
    Accepted,
    /// Pre-connect hook resolved a target; the upstream dial is underway.
    Connecting,
    /// Both receive loops running, packets flowing through the pipeline.
    Active,
    Closing,
    Closed,
}

/// What packet handlers see of the session they run inside.
#[derive(Clone)]
pub struct SessionHandle {
    pub client: Arc<Transport>,
    pub upstream: Arc<Transport>,
    pub client_addr: SocketAddr,
    pub client_key: ClientKey,
}

/// One client-facing and one upstream-facing transport, created together
/// and destroyed together.
pub struct Session {
    handle: SessionHandle,
    state: SessionState,
    client_rx: mpsc::UnboundedReceiver<TransportEvent>,
    upstream_rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Session {
    pub fn accept(
        handle: SessionHandle,
        client_rx: mpsc::UnboundedReceiver<TransportEvent>,
        upstream_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            handle,
            state: SessionState::Accepted,
            client_rx,
            upstream_rx,
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Dial the upstream target. Success starts both receive loops and
    /// enters `Active`; failure closes the client transport whose loops
    /// never ran and goes straight to `Closing`.
    pub async fn connect_upstream(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        self.state = SessionState::Connecting;
        match self.handle.upstream.connect(host, port, timeout).await {
            Ok(()) => {
                self.handle.upstream.start().await;
                self.handle.client.start().await;
                self.state = SessionState::Active;
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::Closing;
                self.handle.client.close();
                self.handle.upstream.close();
                self.state = SessionState::Closed;
                Err(err)
            }
        }
    }

    /// Pump both transports through the pipeline until either side
    /// disconnects, then cascade the close. Returns with both transports
    /// closed and the state at `Closed`.
    pub async fn run(&mut self, pipeline: &Pipeline) {
        loop {
            tokio::select! {
                event = self.client_rx.recv() => match event {
                    Some(TransportEvent::Packet(packet)) => {
                        pipeline
                            .dispatch(Direction::FromClient, packet, &self.handle)
                            .await;
                    }
                    Some(TransportEvent::Disconnected) | None => break,
                },
                event = self.upstream_rx.recv() => match event {
                    Some(TransportEvent::Packet(packet)) => {
                        pipeline
                            .dispatch(Direction::FromServer, packet, &self.handle)
                            .await;
                    }
                    Some(TransportEvent::Disconnected) | None => break,
                },
            }
        }
        self.state = SessionState::Closing;
        self.handle.client.close();
        self.handle.upstream.close();
        self.state = SessionState::Closed;
    }
}
