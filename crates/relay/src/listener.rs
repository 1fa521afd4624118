use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::codec::{Codec, HandshakeConfig};
use crate::netaddr::AddressClassifier;
use crate::pipeline::{ConnectDecision, ConnectHook, Pipeline};
use crate::session::{Session, SessionHandle};
use crate::transport::Transport;

/// Outstanding accept operations kept in flight so a connect burst is
/// not serialized behind one accept completion.
pub const ACCEPT_POOL: usize = 5;

/// Budget for the upstream dial; a completion past this is discarded.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub type CodecFactory = Arc<dyn Fn() -> Box<dyn Codec> + Send + Sync>;

/// Everything a listener needs wired up before it binds.
pub struct ListenerSpec {
    /// Role name used in log lines ("gateway", "agent", "download").
    pub role: &'static str,
    pub pipeline: Arc<Pipeline>,
    /// Fixed upstream for this role, if it has one. Roles served purely
    /// by handoff leave this unset.
    pub default_target: Option<(String, u16)>,
    /// Pre-connect hook; for handoff-gated roles this is the queue
    /// consult, and a miss refuses the connection outright.
    pub hook: Option<Arc<dyn ConnectHook>>,
    pub classifier: Arc<dyn AddressClassifier>,
    pub codec_factory: CodecFactory,
}

/// Accepts connections for one server role and owns their sessions.
pub struct Listener {
    spec: ListenerSpec,
    active: Mutex<HashMap<u64, SessionHandle>>,
    next_id: AtomicU64,
    socket: StdMutex<Option<Arc<TokioTcpListener>>>,
    accept_tasks: StdMutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Listener {
    pub fn new(spec: ListenerSpec) -> Arc<Self> {
        Arc::new(Self {
            spec,
            active: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            socket: StdMutex::new(None),
            accept_tasks: StdMutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Bind and start accepting. Port 0 picks a free port; the bound
    /// port is returned either way.
    pub async fn start(self: &Arc<Self>, port: u16) -> anyhow::Result<u16> {
        let listener = TokioTcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("bind {} listener on port {port}", self.spec.role))?;
        let bound = listener.local_addr().context("listener local addr")?.port();
        let listener = Arc::new(listener);
        *self.socket.lock().expect("socket lock") = Some(listener.clone());

        let mut tasks = self.accept_tasks.lock().expect("accept tasks lock");
        for _ in 0..ACCEPT_POOL {
            tasks.push(tokio::spawn(self.clone().accept_loop(listener.clone())));
        }
        println!("relay.{}.started port={bound}", self.spec.role);
        Ok(bound)
    }

    /// Close every active session and the listening socket. Safe to call
    /// more than once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.accept_tasks.lock().expect("accept tasks lock").drain(..) {
            task.abort();
        }
        *self.socket.lock().expect("socket lock") = None;

        let handles: Vec<SessionHandle> = self.active.lock().await.values().cloned().collect();
        for handle in handles {
            handle.client.close();
            handle.upstream.close();
        }
        println!("relay.{}.stopped", self.spec.role);
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    async fn accept_loop(self: Arc<Self>, listener: Arc<TokioTcpListener>) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    // Hand the session off; this slot goes straight back
                    // to accepting.
                    tokio::spawn(self.clone().handle_accept(stream, peer));
                }
                Err(err) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    eprintln!("relay.{}.accept_error error={err}", self.spec.role);
                }
            }
        }
    }

    async fn handle_accept(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let role = self.spec.role;
        println!("relay.{role}.accepted client={peer}");

        let key = self.spec.classifier.key_for(peer.ip());
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();

        let client = match Transport::from_stream(
            stream,
            (self.spec.codec_factory)(),
            client_tx,
            "client",
        ) {
            Ok(transport) => transport,
            Err(err) => {
                eprintln!("relay.{role}.accept_error client={peer} error={err:#}");
                return;
            }
        };
        client.configure(HandshakeConfig::server_default()).await;
        let upstream = Transport::pending((self.spec.codec_factory)(), upstream_tx, "upstream");

        let mut session = Session::accept(
            SessionHandle {
                client,
                upstream,
                client_addr: peer,
                client_key: key.clone(),
            },
            client_rx,
            upstream_rx,
        );
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.active.lock().await.insert(id, session.handle().clone());

        let decision = match &self.spec.hook {
            Some(hook) => hook.before_connect(&key, peer).await,
            None => ConnectDecision::Default,
        };
        let (host, port) = match decision {
            ConnectDecision::Redirect { host, port } => (host, port),
            ConnectDecision::Default => match &self.spec.default_target {
                Some((host, port)) => (host.clone(), *port),
                None => {
                    // No fixed upstream and nothing pending for this
                    // client: refuse with no protocol interaction.
                    println!("relay.{role}.refused client={peer} key={key} reason=no_target");
                    session.handle().client.close();
                    self.active.lock().await.remove(&id);
                    return;
                }
            },
            ConnectDecision::Refuse => {
                println!("relay.{role}.refused client={peer} key={key}");
                session.handle().client.close();
                self.active.lock().await.remove(&id);
                return;
            }
        };

        match session.connect_upstream(&host, port, CONNECT_TIMEOUT).await {
            Ok(()) => {
                println!("relay.{role}.connected client={peer} upstream={host}:{port}");
                session.run(&self.spec.pipeline).await;
                println!("relay.{role}.closed client={peer}");
            }
            Err(err) => {
                eprintln!("relay.{role}.connect_error client={peer} error={err:#}");
            }
        }
        self.active.lock().await.remove(&id);
    }
}
