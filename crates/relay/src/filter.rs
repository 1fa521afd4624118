//! The concrete relay: a gateway listener in front of the real gateway
//! server, plus handoff-gated agent and download listeners that pick up
//! the connections the gateway's redirect packets promise.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::handoff::{HandoffHook, HandoffQueue};
use crate::listener::{CodecFactory, Listener, ListenerSpec};
use crate::netaddr::{self, AddressClassifier};
use crate::opcode;
use crate::packet::PacketWriter;
use crate::pipeline::{Direction, PacketHandler, Pipeline, Transfer};

/// How long a redirect target waits for its client to come back.
pub const DEFAULT_HANDOFF_TTL: Duration = Duration::from_secs(5);

/// Host written into redirect packets for clients on this machine or
/// its local network.
const LOCAL_REDIRECT_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// The real gateway server every gateway-role connection relays to.
    pub upstream_host: String,
    pub upstream_port: u16,
    /// Bind ports per role; 0 lets the OS pick.
    pub bind_gateway: u16,
    pub bind_agent: u16,
    pub bind_download: u16,
    /// Host external clients are told to reconnect to. Defaults to the
    /// address this machine uses to reach the outside world.
    pub public_host: Option<String>,
    pub handoff_ttl: Duration,
}

impl RelaySettings {
    pub fn new(upstream_host: String, upstream_port: u16) -> Self {
        Self {
            upstream_host,
            upstream_port,
            bind_gateway: 0,
            bind_agent: 0,
            bind_download: 0,
            public_host: None,
            handoff_ttl: DEFAULT_HANDOFF_TTL,
        }
    }
}

/// Rewrites one redirect-carrying gateway response: remembers the real
/// target on the handoff queue under the client's key, then sends the
/// client a copy pointing at this relay instead and cancels the
/// original. The true backend address never reaches an external client.
struct RedirectRewrite {
    /// Which redirect packet this instance understands.
    kind: RedirectKind,
    queue: Arc<HandoffQueue>,
    /// The relay listener port the client is sent to.
    relay_port: u16,
    public_host: String,
}

#[derive(Debug, Clone, Copy)]
enum RedirectKind {
    /// 0xA100: patch required, carries the download server address.
    Patch,
    /// 0xA102: login success, carries the agent server address.
    Login,
}

impl RedirectRewrite {
    async fn rewrite(&self, transfer: &mut Transfer<'_>) -> anyhow::Result<()> {
        let packet = &transfer.packet;
        let mut reader = packet.reader();

        let mut writer = PacketWriter::with_flags(packet.opcode, packet.encrypted, packet.massive);
        let (host, port) = match self.kind {
            RedirectKind::Patch => {
                // result=2 (error), code=2 (download required), host, port.
                if reader.read_u8()? != 2 || reader.read_u8()? != 2 {
                    return Ok(());
                }
                let host = reader.read_ascii()?;
                let port = reader.read_u16()?;
                writer.write_u8(2).write_u8(2);
                (host, port)
            }
            RedirectKind::Login => {
                // result=1 (success), queue id, host, port.
                if reader.read_u8()? != 1 {
                    return Ok(());
                }
                let queue_id = reader.read_u32()?;
                let host = reader.read_ascii()?;
                let port = reader.read_u16()?;
                writer.write_u8(1).write_u32(queue_id);
                (host, port)
            }
        };
        // Only the patch response carries data past the address block;
        // the login response ends at the port.
        let rest = match self.kind {
            RedirectKind::Patch => reader.read_remaining()?,
            RedirectKind::Login => Vec::new(),
        };

        let key = &transfer.session.client_key;
        self.queue.enqueue(key, host.clone(), port).await;

        let redirect_host = if key.is_local() {
            LOCAL_REDIRECT_HOST.to_string()
        } else {
            self.public_host.clone()
        };
        println!(
            "relay.gateway.redirect opcode=0x{:04X} key={key} target={host}:{port} rewritten={redirect_host}:{}",
            transfer.packet.opcode, self.relay_port
        );

        writer
            .write_ascii(&redirect_host)
            .write_u16(self.relay_port)
            .write_bytes(&rest);
        transfer.session.client.send(&writer.finish()).await;
        transfer.cancel = true;
        Ok(())
    }
}

impl PacketHandler for RedirectRewrite {
    fn handle<'a>(
        &'a self,
        transfer: &'a mut Transfer<'_>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if let Err(err) = self.rewrite(transfer).await {
                // A shape we do not understand is forwarded untouched.
                eprintln!(
                    "relay.gateway.redirect_parse_error opcode=0x{:04X} error={err:#}",
                    transfer.packet.opcode
                );
            }
        })
    }
}

/// The three listeners making up a running relay.
pub struct Relay {
    gateway: Arc<Listener>,
    agent: Arc<Listener>,
    download: Arc<Listener>,
    gateway_port: u16,
    agent_port: u16,
    download_port: u16,
}

impl Relay {
    /// Bind all three roles and wire the gateway's redirect interception
    /// into the agent and download handoff queues. The handoff-gated
    /// listeners bind first so the gateway pipeline knows their ports.
    pub async fn start(
        settings: RelaySettings,
        classifier: Arc<dyn AddressClassifier>,
        codec_factory: CodecFactory,
    ) -> anyhow::Result<Self> {
        let public_host = match settings.public_host.clone() {
            Some(host) => host,
            None => netaddr::outbound_local_addr()
                .await
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| LOCAL_REDIRECT_HOST.to_string()),
        };
        println!("relay.public_host host={public_host}");

        let agent_queue = Arc::new(HandoffQueue::new(settings.handoff_ttl));
        let download_queue = Arc::new(HandoffQueue::new(settings.handoff_ttl));

        let download = Listener::new(ListenerSpec {
            role: "download",
            pipeline: Arc::new(Pipeline::new()),
            default_target: None,
            hook: Some(Arc::new(HandoffHook::new(download_queue.clone()))),
            classifier: classifier.clone(),
            codec_factory: codec_factory.clone(),
        });
        let download_port = download.start(settings.bind_download).await?;

        let agent = Listener::new(ListenerSpec {
            role: "agent",
            pipeline: Arc::new(Pipeline::new()),
            default_target: None,
            hook: Some(Arc::new(HandoffHook::new(agent_queue.clone()))),
            classifier: classifier.clone(),
            codec_factory: codec_factory.clone(),
        });
        let agent_port = agent.start(settings.bind_agent).await?;

        let mut gateway_pipeline = Pipeline::new();
        gateway_pipeline.register(
            Direction::FromServer,
            opcode::GATEWAY_PATCH_RESPONSE,
            Arc::new(RedirectRewrite {
                kind: RedirectKind::Patch,
                queue: download_queue,
                relay_port: download_port,
                public_host: public_host.clone(),
            }),
        );
        gateway_pipeline.register(
            Direction::FromServer,
            opcode::GATEWAY_LOGIN_RESPONSE,
            Arc::new(RedirectRewrite {
                kind: RedirectKind::Login,
                queue: agent_queue,
                relay_port: agent_port,
                public_host,
            }),
        );

        let gateway = Listener::new(ListenerSpec {
            role: "gateway",
            pipeline: Arc::new(gateway_pipeline),
            default_target: Some((settings.upstream_host.clone(), settings.upstream_port)),
            hook: None,
            classifier,
            codec_factory,
        });
        let gateway_port = gateway.start(settings.bind_gateway).await?;

        Ok(Self {
            gateway,
            agent,
            download,
            gateway_port,
            agent_port,
            download_port,
        })
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway_port
    }

    pub fn agent_port(&self) -> u16 {
        self.agent_port
    }

    pub fn download_port(&self) -> u16 {
        self.download_port
    }

    pub async fn active_sessions(&self) -> usize {
        self.gateway.active_count().await
            + self.agent.active_count().await
            + self.download.active_count().await
    }

    pub async fn stop(&self) {
        self.gateway.stop().await;
        self.agent.stop().await;
        self.download.stop().await;
    }
}
