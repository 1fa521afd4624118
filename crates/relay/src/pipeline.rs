use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use crate::netaddr::ClientKey;
use crate::opcode;
use crate::packet::Packet;
use crate::session::SessionHandle;

/// Which way a packet is travelling through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to upstream server.
    FromClient,
    /// Upstream server to client.
    FromServer,
}

/// Mutable context handed to every handler registered for a packet's
/// opcode. Setting `cancel` withholds the forward; it never stops the
/// remaining handlers from running.
pub struct Transfer<'a> {
    pub packet: Packet,
    pub cancel: bool,
    pub session: &'a SessionHandle,
}

pub trait PacketHandler: Send + Sync {
    fn handle<'a>(
        &'a self,
        transfer: &'a mut Transfer<'_>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Outcome of the pre-connect hook. `Default` keeps the listener's own
/// upstream target; `Refuse` drops the accepted socket with no protocol
/// interaction at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectDecision {
    Default,
    Redirect { host: String, port: u16 },
    Refuse,
}

/// Single-shot seam fired once per session before the upstream dial.
/// Deliberately separate from the packet chains: it decides a target,
/// not a forward, and shares none of the cancel machinery.
pub trait ConnectHook: Send + Sync {
    fn before_connect<'a>(
        &'a self,
        key: &'a ClientKey,
        peer: SocketAddr,
    ) -> Pin<Box<dyn Future<Output = ConnectDecision> + Send + 'a>>;
}

/// Unconditionally withholds the packet. Pre-registered for the opcodes
/// the codec owns outright.
struct Suppress;

impl PacketHandler for Suppress {
    fn handle<'a>(
        &'a self,
        transfer: &'a mut Transfer<'_>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            transfer.cancel = true;
        })
    }
}

/// Opcode-keyed handler chains for one listener, one chain set per
/// direction. All handlers registered for an opcode run in registration
/// order on every matching packet.
pub struct Pipeline {
    chains: HashMap<(Direction, u16), Vec<Arc<dyn PacketHandler>>>,
}

impl Pipeline {
    /// Empty pipeline plus the built-in suppressors: handshake traffic in
    /// both directions and the client's identification packet never
    /// leak through (the codec speaks those itself).
    pub fn new() -> Self {
        let mut pipeline = Self {
            chains: HashMap::new(),
        };
        let suppress: Arc<dyn PacketHandler> = Arc::new(Suppress);
        for op in [opcode::GLOBAL_HANDSHAKE, opcode::GLOBAL_HANDSHAKE_OK] {
            pipeline.register(Direction::FromClient, op, suppress.clone());
            pipeline.register(Direction::FromServer, op, suppress.clone());
        }
        pipeline.register(Direction::FromClient, opcode::GLOBAL_IDENTIFICATION, suppress);
        pipeline
    }

    pub fn register(
        &mut self,
        direction: Direction,
        opcode: u16,
        handler: Arc<dyn PacketHandler>,
    ) {
        self.chains
            .entry((direction, opcode))
            .or_default()
            .push(handler);
    }

    /// Run the chain for `packet` and forward it to the destination
    /// transport unless some handler cancelled. No chain means an
    /// unmodified forward.
    pub async fn dispatch(&self, direction: Direction, packet: Packet, session: &SessionHandle) {
        let destination = match direction {
            Direction::FromClient => &session.upstream,
            Direction::FromServer => &session.client,
        };

        let Some(chain) = self.chains.get(&(direction, packet.opcode)) else {
            destination.send(&packet).await;
            return;
        };

        let mut transfer = Transfer {
            packet,
            cancel: false,
            session,
        };
        // Every registered handler runs; cancellation only affects the
        // final forward decision.
        for handler in chain {
            handler.handle(&mut transfer).await;
        }
        if !transfer.cancel {
            destination.send(&transfer.packet).await;
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, PlainCodec};
    use crate::netaddr::ClientKey;
    use crate::transport::{Transport, TransportEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    struct Count {
        hits: Arc<AtomicUsize>,
        cancel: bool,
    }

    impl PacketHandler for Count {
        fn handle<'a>(
            &'a self,
            transfer: &'a mut Transfer<'_>,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            Box::pin(async move {
                self.hits.fetch_add(1, Ordering::SeqCst);
                if self.cancel {
                    transfer.cancel = true;
                }
            })
        }
    }

    async fn loopback_session() -> anyhow::Result<(SessionHandle, TcpStream, TcpStream)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (client_far, client_accept) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (client_near, client_addr) = client_accept?;
        let (upstream_far, upstream_accept) =
            tokio::join!(TcpStream::connect(addr), listener.accept());
        let (upstream_near, _) = upstream_accept?;

        let (client_tx, _rx1) = mpsc::unbounded_channel::<TransportEvent>();
        let (upstream_tx, _rx2) = mpsc::unbounded_channel::<TransportEvent>();
        let client =
            Transport::from_stream(client_near, Box::new(PlainCodec::new()), client_tx, "client")?;
        let upstream = Transport::from_stream(
            upstream_near,
            Box::new(PlainCodec::new()),
            upstream_tx,
            "upstream",
        )?;
        client.start().await;
        upstream.start().await;

        let handle = SessionHandle {
            client,
            upstream,
            client_addr,
            client_key: ClientKey::local(),
        };
        Ok((handle, client_far?, upstream_far?))
    }

    async fn read_frame(stream: &mut TcpStream) -> anyhow::Result<Packet> {
        let mut codec = PlainCodec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = stream.read(&mut buf).await?;
            anyhow::ensure!(n > 0, "peer closed before a frame arrived");
            let mut packets = codec.feed(&buf[..n])?;
            if let Some(packet) = packets.pop() {
                return Ok(packet);
            }
        }
    }

    #[tokio::test]
    async fn unregistered_opcode_forwards_byte_identical() -> anyhow::Result<()> {
        let (handle, _client_far, mut upstream_far) = loopback_session().await?;
        let pipeline = Pipeline::new();

        let packet = Packet::new(0x7005, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        pipeline
            .dispatch(Direction::FromClient, packet.clone(), &handle)
            .await;

        let forwarded = read_frame(&mut upstream_far).await?;
        assert_eq!(forwarded.payload, packet.payload);
        assert_eq!(forwarded.opcode, packet.opcode);
        Ok(())
    }

    #[tokio::test]
    async fn every_handler_runs_even_when_one_cancels() -> anyhow::Result<()> {
        let (handle, _client_far, mut upstream_far) = loopback_session().await?;
        let hits = Arc::new(AtomicUsize::new(0));

        let mut pipeline = Pipeline::new();
        for cancel in [false, true, false] {
            pipeline.register(
                Direction::FromClient,
                0x7010,
                Arc::new(Count {
                    hits: hits.clone(),
                    cancel,
                }),
            );
        }

        pipeline
            .dispatch(Direction::FromClient, Packet::new(0x7010, vec![1]), &handle)
            .await;

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        let nothing = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            upstream_far.read(&mut [0u8; 16]),
        )
        .await;
        assert!(nothing.is_err(), "cancelled packet must not be forwarded");
        Ok(())
    }

    #[tokio::test]
    async fn handshake_opcodes_never_cross_the_relay() -> anyhow::Result<()> {
        let (handle, mut client_far, mut upstream_far) = loopback_session().await?;
        let pipeline = Pipeline::new();

        pipeline
            .dispatch(
                Direction::FromClient,
                Packet::new(opcode::GLOBAL_HANDSHAKE, vec![]),
                &handle,
            )
            .await;
        pipeline
            .dispatch(
                Direction::FromServer,
                Packet::new(opcode::GLOBAL_HANDSHAKE_OK, vec![]),
                &handle,
            )
            .await;
        pipeline
            .dispatch(
                Direction::FromClient,
                Packet::new(opcode::GLOBAL_IDENTIFICATION, vec![]),
                &handle,
            )
            .await;

        let deadline = std::time::Duration::from_millis(100);
        assert!(tokio::time::timeout(deadline, upstream_far.read(&mut [0u8; 16]))
            .await
            .is_err());
        assert!(tokio::time::timeout(deadline, client_far.read(&mut [0u8; 16]))
            .await
            .is_err());
        Ok(())
    }
}
