use std::net::IpAddr;

use tokio::net::UdpSocket;

/// Handoff-table key derived from a peer address. Every address owned by
/// this host collapses to the single `local` sentinel so loopback and
/// co-located clients are indistinguishable from "local".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

const LOCAL_SENTINEL: &str = "local";

impl ClientKey {
    pub fn local() -> Self {
        Self(LOCAL_SENTINEL.to_string())
    }

    pub fn is_local(&self) -> bool {
        self.0 == LOCAL_SENTINEL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decides whether a peer address belongs to this host. Injectable so
/// tests can pin the answer without touching real interfaces.
pub trait AddressClassifier: Send + Sync {
    fn is_own_address(&self, ip: IpAddr) -> bool;

    fn key_for(&self, ip: IpAddr) -> ClientKey {
        if ip.is_loopback() || self.is_own_address(ip) {
            ClientKey::local()
        } else {
            ClientKey(ip.to_string())
        }
    }
}

/// Classifier backed by the host's discovered interface addresses.
pub struct LocalInterfaces {
    addrs: Vec<IpAddr>,
}

impl LocalInterfaces {
    pub async fn discover() -> Self {
        let mut addrs = Vec::new();
        if let Some(ip) = outbound_local_addr().await {
            addrs.push(ip);
        }
        Self { addrs }
    }

    pub fn with_addrs(addrs: Vec<IpAddr>) -> Self {
        Self { addrs }
    }
}

impl AddressClassifier for LocalInterfaces {
    fn is_own_address(&self, ip: IpAddr) -> bool {
        self.addrs.contains(&ip)
    }
}

/// The address this host would use to reach the outside world. Connecting
/// a UDP socket sends nothing; it only asks the kernel for a route.
pub async fn outbound_local_addr() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:53").await.ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_and_own_addresses_normalize_to_local() {
        let own: IpAddr = "192.168.1.50".parse().unwrap();
        let classifier = LocalInterfaces::with_addrs(vec![own]);

        assert_eq!(classifier.key_for("127.0.0.1".parse().unwrap()), ClientKey::local());
        assert_eq!(classifier.key_for(own), ClientKey::local());
        assert!(classifier.key_for(own).is_local());
    }

    #[test]
    fn external_addresses_key_on_the_address_itself() {
        let classifier = LocalInterfaces::with_addrs(Vec::new());
        let key = classifier.key_for("203.0.113.9".parse().unwrap());
        assert!(!key.is_local());
        assert_eq!(key.as_str(), "203.0.113.9");
    }
}
