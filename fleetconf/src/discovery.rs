//! Subnet discovery by TCP probing of the SSH port.
//!
//! Best-effort: hosts that do not accept a connection within the probe
//! timeout are skipped. Concurrency is bounded by a semaphore so a /16 does
//! not open thousands of sockets at once.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use log::{debug, info};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::ConfigError;

/// Probe settings.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Port probed on each host (default: 22).
    pub port: u16,

    /// Maximum probes in flight (default: 64).
    pub concurrency: usize,

    /// Per-probe timeout (default: 500ms).
    pub timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            port: 22,
            concurrency: 64,
            timeout: Duration::from_millis(500),
        }
    }
}

/// Parse an IPv4 CIDR such as `"192.168.1.0/24"`.
pub fn parse_subnet(subnet: &str) -> Result<Ipv4Net, ConfigError> {
    subnet
        .trim()
        .parse()
        .map_err(|e: ipnet::AddrParseError| ConfigError::InvalidSubnet {
            subnet: subnet.to_string(),
            message: e.to_string(),
        })
}

/// Probe every host address of `subnet` and return those accepting a TCP
/// connection on the probe port, in ascending order.
pub async fn discover(subnet: &str, options: &DiscoveryOptions) -> Result<Vec<Ipv4Addr>, ConfigError> {
    let net = parse_subnet(subnet)?;
    if options.concurrency == 0 {
        return Err(ConfigError::InvalidConcurrency(0));
    }

    info!("Probing {} on port {}", net, options.port);

    // A permit is taken before each spawn: at most `concurrency` probes exist
    let semaphore = Arc::new(Semaphore::new(options.concurrency));
    let mut probes = JoinSet::new();
    let mut found = Vec::new();
    let mut probed = 0usize;
    for ip in net.hosts() {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let (port, timeout) = (options.port, options.timeout);
        probes.spawn(async move {
            let _permit = permit;
            probe(ip, port, timeout).await.then_some(ip)
        });
        probed += 1;

        while let Some(joined) = probes.try_join_next() {
            collect(joined, options.port, &mut found);
        }
    }
    while let Some(joined) = probes.join_next().await {
        collect(joined, options.port, &mut found);
    }
    found.sort_unstable();

    info!("Discovery complete: {} of {} hosts reachable", found.len(), probed);
    Ok(found)
}

fn collect(
    joined: Result<Option<Ipv4Addr>, tokio::task::JoinError>,
    port: u16,
    found: &mut Vec<Ipv4Addr>,
) {
    if let Ok(Some(ip)) = joined {
        debug!("{}:{} is reachable", ip, port);
        found.push(ip);
    }
}

async fn probe(ip: Ipv4Addr, port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from((ip, port));
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn test_invalid_subnet() {
        let err = parse_subnet("10.0.0.0/33").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSubnet { .. }));
        assert!(parse_subnet("not-a-subnet").is_err());
        assert_eq!(parse_subnet(" 10.1.0.0/24 ").unwrap().prefix_len(), 24);
    }

    #[tokio::test]
    async fn test_discover_rejects_bad_subnet() {
        let result = discover("192.168.1.0/99", &DiscoveryOptions::default()).await;
        assert!(matches!(result, Err(ConfigError::InvalidSubnet { .. })));
    }

    #[tokio::test]
    async fn test_discover_finds_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let options = DiscoveryOptions {
            port,
            ..DiscoveryOptions::default()
        };

        let found = discover("127.0.0.1/32", &options).await.unwrap();
        assert_eq!(found, vec![Ipv4Addr::LOCALHOST]);
    }

    #[tokio::test]
    async fn test_discover_streams_through_one_permit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let options = DiscoveryOptions {
            port,
            concurrency: 1,
            timeout: Duration::from_millis(200),
        };

        let found = discover("127.0.0.0/29", &options).await.unwrap();
        assert_eq!(found, vec![Ipv4Addr::LOCALHOST]);
    }

    #[tokio::test]
    async fn test_discover_rejects_zero_concurrency() {
        let options = DiscoveryOptions {
            concurrency: 0,
            ..DiscoveryOptions::default()
        };
        let result = discover("127.0.0.1/32", &options).await;
        assert!(matches!(result, Err(ConfigError::InvalidConcurrency(0))));
    }

    #[tokio::test]
    async fn test_discover_closed_port() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let options = DiscoveryOptions {
            port,
            timeout: Duration::from_millis(200),
            ..DiscoveryOptions::default()
        };

        let found = discover("127.0.0.1/32", &options).await.unwrap();
        assert!(found.is_empty());
    }
}
