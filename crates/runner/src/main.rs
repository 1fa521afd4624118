mod config;

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::lookup_host;

use sro_relay::codec::PlainCodec;
use sro_relay::filter::{Relay, RelaySettings};
use sro_relay::listener::CodecFactory;
use sro_relay::netaddr::LocalInterfaces;

use crate::config::{Config, ConfigLoader};

const DEFAULT_CONFIG: &str = "relay.toml";

fn print_usage() {
    eprintln!("Usage: sro-relay [config.toml]   (default: {DEFAULT_CONFIG})");
    eprintln!();
    eprintln!("Config keys:");
    eprintln!("  [upstream] host  * Host or IP of the real gateway server");
    eprintln!("  [upstream] port  * Port of the real gateway server");
    eprintln!("  [bind] gateway     Port to listen on as the gateway server (recommended)");
    eprintln!("  [bind] agent       Port to listen on as the agent server");
    eprintln!("  [bind] download    Port to listen on as the download server");
    eprintln!("  public_host        Host or IP external clients should reconnect to");
    eprintln!();
    eprintln!("Example relay.toml:");
    eprintln!("  [upstream]");
    eprintln!("  host = \"192.168.1.121\"");
    eprintln!("  port = 15779");
    eprintln!();
    eprintln!("  [bind]");
    eprintln!("  gateway = 15778");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());

    let config: Config = match ConfigLoader::parse_from_file(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err:#}");
            print_usage();
            anyhow::bail!("invalid configuration");
        }
    };

    let Some(upstream) = config.upstream else {
        eprintln!("Error: missing [upstream] section (gateway host and port).");
        print_usage();
        anyhow::bail!("invalid configuration");
    };

    // Resolve before binding anything; an unreachable name is fatal.
    if let Err(err) = lookup_host((upstream.host.as_str(), upstream.port))
        .await
        .with_context(|| format!("resolve upstream {}:{}", upstream.host, upstream.port))
    {
        eprintln!("Error: {err:#}");
        print_usage();
        anyhow::bail!("invalid configuration");
    }

    let mut settings = RelaySettings::new(upstream.host, upstream.port);
    settings.bind_gateway = config.bind.gateway;
    settings.bind_agent = config.bind.agent;
    settings.bind_download = config.bind.download;
    settings.public_host = config.public_host;

    let classifier = Arc::new(LocalInterfaces::discover().await);
    let codec_factory: CodecFactory = Arc::new(|| Box::new(PlainCodec::new()));
    let relay = Relay::start(settings, classifier, codec_factory).await?;

    println!(
        "relay.ready gateway={} agent={} download={}",
        relay.gateway_port(),
        relay.agent_port(),
        relay.download_port()
    );
    println!("Press ENTER to exit . . .");

    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    let _ = stdin.read_line(&mut line).await;

    relay.stop().await;
    Ok(())
}
