use std::sync::atomic::{AtomicUsize, Ordering};

use spectra_core::config::ProxyConfig;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Socks5,
    Socks4,
    Http,
}

impl ProxyKind {
    fn parse(s: &str) -> Option<ProxyKind> {
        match s.to_ascii_lowercase().as_str() {
            "socks5" => Some(ProxyKind::Socks5),
            "socks4" => Some(ProxyKind::Socks4),
            "http" => Some(ProxyKind::Http),
            _ => None,
        }
    }
}

/// One concrete egress endpoint handed to a gateway connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
}

/// Round-robin over the configured single-host-many-ports endpoint list.
/// `next()` returns `None` when no proxy is configured, in which case
/// connections go direct.
pub struct ProxyCycler {
    endpoints: Vec<ProxyEndpoint>,
    cursor: AtomicUsize,
}

impl ProxyCycler {
    pub fn from_config(config: Option<&ProxyConfig>) -> Self {
        let mut endpoints = Vec::new();

        if let Some(cfg) = config.filter(|c| c.enabled) {
            match ProxyKind::parse(&cfg.kind) {
                Some(kind) => {
                    let mut ports: Vec<u16> = cfg.ports.clone();
                    if ports.is_empty() {
                        ports.extend(cfg.port);
                    }
                    for port in ports {
                        endpoints.push(ProxyEndpoint {
                            kind,
                            host: cfg.host.clone(),
                            port,
                            user: cfg.user.clone(),
                            pass: cfg.pass.clone(),
                        });
                    }
                    if endpoints.is_empty() {
                        warn!("proxy enabled but no ports configured, going direct");
                    }
                }
                None => warn!(kind = %cfg.kind, "unsupported proxy type, going direct"),
            }
        }

        Self {
            endpoints,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn next(&self) -> Option<ProxyEndpoint> {
        if self.endpoints.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        Some(self.endpoints[idx].clone())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(ports: Vec<u16>) -> ProxyConfig {
        ProxyConfig {
            enabled: true,
            kind: "socks5".into(),
            host: "127.0.0.1".into(),
            port: None,
            user: Some("u".into()),
            pass: Some("p".into()),
            ports,
        }
    }

    #[test]
    fn no_config_yields_none() {
        let cycler = ProxyCycler::from_config(None);
        assert!(cycler.next().is_none());
        assert!(cycler.is_empty());
    }

    #[test]
    fn disabled_config_yields_none() {
        let mut c = cfg(vec![9050]);
        c.enabled = false;
        assert!(ProxyCycler::from_config(Some(&c)).next().is_none());
    }

    #[test]
    fn cycles_round_robin_over_ports() {
        let cycler = ProxyCycler::from_config(Some(&cfg(vec![9050, 9051, 9052])));
        let ports: Vec<u16> = (0..6).map(|_| cycler.next().unwrap().port).collect();
        assert_eq!(ports, vec![9050, 9051, 9052, 9050, 9051, 9052]);
    }

    #[test]
    fn single_port_field_is_used_when_list_empty() {
        let mut c = cfg(vec![]);
        c.port = Some(1080);
        let cycler = ProxyCycler::from_config(Some(&c));
        assert_eq!(cycler.len(), 1);
        assert_eq!(cycler.next().unwrap().port, 1080);
    }

    #[test]
    fn unknown_kind_goes_direct() {
        let mut c = cfg(vec![9050]);
        c.kind = "carrier-pigeon".into();
        assert!(ProxyCycler::from_config(Some(&c)).next().is_none());
    }
}
