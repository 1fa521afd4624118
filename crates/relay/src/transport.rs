use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::{Mutex, Notify};

use crate::codec::{Codec, HandshakeConfig};
use crate::packet::Packet;

const READ_BUFFER_LEN: usize = 8192;

/// What a transport reports to its session.
#[derive(Debug)]
pub enum TransportEvent {
    /// One decoded packet, delivered in wire order.
    Packet(Packet),
    /// The socket is gone. Emitted exactly once.
    Disconnected,
}

enum WriteCmd {
    Buf(Vec<u8>),
    Shutdown,
}

struct Wires {
    peer: SocketAddr,
    writer_tx: mpsc::UnboundedSender<WriteCmd>,
    read_half: Option<OwnedReadHalf>,
}

/// One TCP socket plus its codec context. Reads run on their own task
/// once [`start`](Transport::start) is called; writes are queued onto a
/// writer task and complete fire-and-forget.
///
/// A transport can be built around an accepted socket, or created
/// unconnected and dialed later with [`connect`](Transport::connect).
pub struct Transport {
    label: &'static str,
    codec: Mutex<Box<dyn Codec>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
    close_signal: Arc<Notify>,
    wires: StdMutex<Option<Wires>>,
}

impl Transport {
    /// Transport for an already-accepted socket. The receive loop does
    /// not run until `start`.
    pub fn from_stream(
        stream: TcpStream,
        codec: Box<dyn Codec>,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
        label: &'static str,
    ) -> anyhow::Result<Arc<Self>> {
        let transport = Arc::new(Self::shell(codec, event_tx, label));
        transport.install(stream)?;
        Ok(transport)
    }

    /// Unconnected transport; pair of `connect`.
    pub fn pending(
        codec: Box<dyn Codec>,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
        label: &'static str,
    ) -> Arc<Self> {
        Arc::new(Self::shell(codec, event_tx, label))
    }

    fn shell(
        codec: Box<dyn Codec>,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
        label: &'static str,
    ) -> Self {
        Self {
            label,
            codec: Mutex::new(codec),
            event_tx,
            closed: Arc::new(AtomicBool::new(false)),
            close_signal: Arc::new(Notify::new()),
            wires: StdMutex::new(None),
        }
    }

    /// Dial `host:port`. The attempt is never aborted mid-flight; a
    /// completion that lands after `timeout` is treated as a failure.
    pub async fn connect(&self, host: &str, port: u16, timeout: Duration) -> anyhow::Result<()> {
        let started = Instant::now();
        let stream = TcpStream::connect((host, port))
            .await
            .with_context(|| format!("connect {host}:{port}"))?;
        let elapsed = started.elapsed();
        if elapsed > timeout {
            bail!("connect {host}:{port} completed after {elapsed:?} (limit {timeout:?})");
        }
        self.install(stream)
    }

    fn install(&self, stream: TcpStream) -> anyhow::Result<()> {
        let peer = stream.peer_addr().context("peer address")?;
        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let mut wires = self.wires.lock().expect("wires lock");
        if wires.is_some() {
            bail!("transport already connected");
        }
        *wires = Some(Wires {
            peer,
            writer_tx,
            read_half: Some(read_half),
        });
        drop(wires);

        tokio::spawn(run_writer(
            write_half,
            writer_rx,
            self.closed.clone(),
            self.close_signal.clone(),
            self.event_tx.clone(),
            self.label,
        ));
        Ok(())
    }

    /// Apply the handshake configuration for this connection. Any bytes
    /// the codec prepares stay pending until `start` flushes them.
    pub async fn configure(&self, config: HandshakeConfig) {
        self.codec.lock().await.configure(config);
    }

    /// Flush whatever the codec has pending (its opening handshake) and
    /// spawn the receive loop.
    pub async fn start(self: &Arc<Self>) {
        let pending = self.codec.lock().await.take_pending();
        for buf in pending {
            self.queue_write(buf);
        }

        let read_half = {
            let mut wires = self.wires.lock().expect("wires lock");
            wires.as_mut().and_then(|w| w.read_half.take())
        };
        let Some(read_half) = read_half else {
            eprintln!(
                "relay.transport.start_skipped label={} reason=not_connected",
                self.label
            );
            return;
        };
        tokio::spawn(self.clone().run_reader(read_half));
    }

    /// Encode and queue a packet. Completion is not synchronized with
    /// the caller; a failed write tears the transport down on its own.
    pub async fn send(&self, packet: &Packet) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let encoded = self.codec.lock().await.encode(packet);
        match encoded {
            Ok(buffers) => {
                for buf in buffers {
                    self.queue_write(buf);
                }
            }
            Err(err) => {
                eprintln!(
                    "relay.transport.encode_error label={} opcode=0x{:04X} error={err:#}",
                    self.label, packet.opcode
                );
                self.close();
            }
        }
    }

    /// Idempotent. First call emits `Disconnected`, wakes the receive
    /// loop and shuts the socket down.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_signal.notify_waiters();
        if let Some(wires) = self.wires.lock().expect("wires lock").as_ref() {
            let _ = wires.writer_tx.send(WriteCmd::Shutdown);
        }
        let _ = self.event_tx.send(TransportEvent::Disconnected);
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.wires.lock().expect("wires lock").is_some()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.wires.lock().expect("wires lock").as_ref().map(|w| w.peer)
    }

    fn queue_write(&self, buf: Vec<u8>) {
        if let Some(wires) = self.wires.lock().expect("wires lock").as_ref() {
            let _ = wires.writer_tx.send(WriteCmd::Buf(buf));
        }
    }

    async fn run_reader(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        let mut buf = vec![0u8; READ_BUFFER_LEN];
        loop {
            // A transport closed elsewhere must not issue another read.
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            let n = tokio::select! {
                _ = self.close_signal.notified() => break,
                result = read_half.read(&mut buf) => match result {
                    Ok(0) => {
                        self.close();
                        break;
                    }
                    Ok(n) => n,
                    Err(err) => {
                        eprintln!(
                            "relay.transport.read_error label={} error={err}",
                            self.label
                        );
                        self.close();
                        break;
                    }
                },
            };

            let fed = {
                let mut codec = self.codec.lock().await;
                codec.feed(&buf[..n]).map(|packets| (packets, codec.take_pending()))
            };
            let (packets, replies) = match fed {
                Ok(out) => out,
                Err(err) => {
                    eprintln!(
                        "relay.transport.decode_error label={} error={err:#}",
                        self.label
                    );
                    self.close();
                    break;
                }
            };
            for packet in packets {
                let _ = self.event_tx.send(TransportEvent::Packet(packet));
            }
            for reply in replies {
                self.queue_write(reply);
            }
        }
    }
}

async fn run_writer(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WriteCmd>,
    closed: Arc<AtomicBool>,
    close_signal: Arc<Notify>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    label: &'static str,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriteCmd::Buf(buf) => {
                if let Err(err) = write_half.write_all(&buf).await {
                    eprintln!("relay.transport.write_error label={label} error={err}");
                    if !closed.swap(true, Ordering::SeqCst) {
                        close_signal.notify_waiters();
                        let _ = event_tx.send(TransportEvent::Disconnected);
                    }
                    break;
                }
            }
            WriteCmd::Shutdown => {
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }
}
