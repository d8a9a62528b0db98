use anyhow::{bail, Context};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Which front-end speaks to the MTA on the data listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Milter,
    Smtp,
}

/// A listener address: `inet:PORT@HOST` or `unix:PATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerSpec {
    Inet { port: u16, host: String },
    Unix { path: PathBuf },
}

impl FromStr for ListenerSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        if let Some(rest) = s.strip_prefix("inet:") {
            let (port, host) = rest
                .split_once('@')
                .with_context(|| format!("invalid inet listener \"{s}\", expected inet:PORT@HOST"))?;
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port in listener \"{s}\""))?;
            if host.is_empty() {
                bail!("empty host in listener \"{s}\"");
            }
            Ok(ListenerSpec::Inet {
                port,
                host: host.to_string(),
            })
        } else if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                bail!("empty path in listener \"{s}\"");
            }
            Ok(ListenerSpec::Unix {
                path: PathBuf::from(path),
            })
        } else {
            bail!("invalid listener \"{s}\", expected inet:PORT@HOST or unix:PATH");
        }
    }
}

impl fmt::Display for ListenerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerSpec::Inet { port, host } => write!(f, "inet:{port}@{host}"),
            ListenerSpec::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

/// A named additional listener with an optional bind umask (octal string).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraListener {
    pub connection: String,
    #[serde(default)]
    pub umask: Option<String>,
}

/// SMTP front-end settings: where processed messages are forwarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpProxyConfig {
    /// Upstream MTA listener spec, same grammar as `connection`.
    pub forward: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Handler modules to activate, in configuration order. Unknown names
    /// are fatal at worker startup.
    pub load_handlers: Vec<String>,
    /// Per-handler option subtrees, keyed by handler name.
    pub handler_config: BTreeMap<String, serde_yaml::Value>,

    /// Primary data listener; required.
    pub connection: String,
    /// Additional named data listeners.
    pub connections: BTreeMap<String, ExtraListener>,
    /// Metrics sideband listener.
    pub metric_connection: Option<String>,
    /// Deprecated alias pair for `metric_connection`.
    pub metric_port: Option<u16>,
    pub metric_host: Option<String>,

    pub min_children: usize,
    pub max_children: usize,
    pub min_spare_children: usize,
    pub max_spare_children: usize,
    pub max_requests_per_child: usize,
    pub listen_backlog: i32,

    pub error_log: String,
    pub runas: Option<String>,
    pub rungroup: Option<String>,
    pub chroot: Option<String>,
    pub debug: bool,
    pub protocol: Protocol,

    /// Clients in these networks are the machine itself.
    pub local_ip_addresses: Vec<String>,
    /// Clients in these networks are trusted relays.
    pub trusted_ip_addresses: Vec<String>,

    /// Identifier used in Authentication-Results; defaults to the host name.
    pub authserv_id: Option<String>,

    pub dns_timeout: u64,
    pub dns_cache_size: usize,
    /// Socket read/write deadline for one MTA conversation, seconds.
    pub message_timeout: u64,

    pub smtp: Option<SmtpProxyConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            load_handlers: vec![
                "ptr".to_string(),
                "spf".to_string(),
                "dkim".to_string(),
                "dmarc".to_string(),
            ],
            handler_config: BTreeMap::new(),
            connection: "inet:8893@localhost".to_string(),
            connections: BTreeMap::new(),
            metric_connection: None,
            metric_port: None,
            metric_host: None,
            min_children: 20,
            max_children: 100,
            min_spare_children: 10,
            max_spare_children: 20,
            max_requests_per_child: 200,
            listen_backlog: 20,
            error_log: "/var/log/authmilter.err".to_string(),
            runas: None,
            rungroup: None,
            chroot: None,
            debug: false,
            protocol: Protocol::Milter,
            local_ip_addresses: vec!["127.0.0.0/8".to_string(), "::1".to_string()],
            trusted_ip_addresses: Vec::new(),
            authserv_id: None,
            dns_timeout: 5,
            dns_cache_size: 1024,
            message_timeout: 300,
            smtp: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {path}"))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("parsing configuration file {path}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// All data listeners: the primary plus any named extras, with their
    /// bind umasks.
    pub fn data_listeners(&self) -> anyhow::Result<Vec<(String, ListenerSpec, Option<u32>)>> {
        let mut out = vec![("default".to_string(), self.connection.parse()?, None)];
        for (name, extra) in &self.connections {
            let umask = match &extra.umask {
                Some(text) => Some(
                    u32::from_str_radix(text.trim_start_matches("0o"), 8)
                        .with_context(|| format!("invalid umask \"{text}\" for listener {name}"))?,
                ),
                None => None,
            };
            out.push((name.clone(), extra.connection.parse()?, umask));
        }
        Ok(out)
    }

    /// The metrics listener, honoring the deprecated `metric_port` /
    /// `metric_host` aliases.
    pub fn metric_listener(&self) -> anyhow::Result<Option<ListenerSpec>> {
        if let Some(spec) = &self.metric_connection {
            return Ok(Some(spec.parse()?));
        }
        if let Some(port) = self.metric_port {
            log::warn!("metric_port/metric_host are deprecated, use metric_connection");
            let host = self.metric_host.clone().unwrap_or_else(|| "localhost".to_string());
            return Ok(Some(ListenerSpec::Inet { port, host }));
        }
        Ok(None)
    }

    pub fn local_networks(&self) -> anyhow::Result<Vec<IpNet>> {
        parse_cidr_list(&self.local_ip_addresses).context("local_ip_addresses")
    }

    pub fn trusted_networks(&self) -> anyhow::Result<Vec<IpNet>> {
        parse_cidr_list(&self.trusted_ip_addresses).context("trusted_ip_addresses")
    }

    pub fn handler_options(&self, name: &str) -> Option<&serde_yaml::Value> {
        self.handler_config.get(name)
    }

    pub fn effective_server_id(&self) -> String {
        if let Some(id) = &self.authserv_id {
            return id.clone();
        }
        hostname().unwrap_or_else(|| "localhost".to_string())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let data = self.data_listeners()?;
        if let Some(metric) = self.metric_listener()? {
            // A data listener and the metrics listener sharing an address
            // is a misconfiguration; refuse to start rather than guess.
            for (name, spec, _) in &data {
                if *spec == metric {
                    bail!(
                        "metric_connection {metric} collides with data listener {name}; refusing to start"
                    );
                }
            }
        }
        if self.min_children == 0 || self.max_children < self.min_children {
            bail!(
                "invalid worker sizing: min_children={} max_children={}",
                self.min_children,
                self.max_children
            );
        }
        if self.max_spare_children < self.min_spare_children {
            bail!(
                "invalid spare sizing: min_spare_children={} max_spare_children={}",
                self.min_spare_children,
                self.max_spare_children
            );
        }
        if self.max_requests_per_child == 0 {
            bail!("max_requests_per_child must be at least 1");
        }
        self.local_networks()?;
        self.trusted_networks()?;
        if self.protocol == Protocol::Smtp && self.smtp.is_none() {
            bail!("protocol smtp requires an smtp.forward target");
        }
        if let Some(smtp) = &self.smtp {
            smtp.forward.parse::<ListenerSpec>().context("smtp.forward")?;
        }
        Ok(())
    }
}

/// CIDR blocks, accepting bare addresses as host-length networks.
fn parse_cidr_list(entries: &[String]) -> anyhow::Result<Vec<IpNet>> {
    let mut nets = Vec::with_capacity(entries.len());
    for entry in entries {
        let net = if entry.contains('/') {
            entry
                .parse::<IpNet>()
                .with_context(|| format!("invalid network \"{entry}\""))?
        } else {
            IpNet::from(
                entry
                    .parse::<IpAddr>()
                    .with_context(|| format!("invalid address \"{entry}\""))?,
            )
        };
        nets.push(net);
    }
    Ok(nets)
}

pub fn ip_in_networks(ip: IpAddr, nets: &[IpNet]) -> bool {
    nets.iter().any(|net| net.contains(&ip))
}

/// Parsed local/trusted networks, built once per worker and consulted at
/// every connect.
#[derive(Debug, Clone, Default)]
pub struct NetworkClassifier {
    local: Vec<IpNet>,
    trusted: Vec<IpNet>,
}

impl NetworkClassifier {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(NetworkClassifier {
            local: config.local_networks()?,
            trusted: config.trusted_networks()?,
        })
    }

    /// `(is_local, is_trusted)` for a client address.
    pub fn classify(&self, ip: IpAddr) -> (bool, bool) {
        (
            ip_in_networks(ip, &self.local),
            ip_in_networks(ip, &self.trusted),
        )
    }
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0)?;
    String::from_utf8(buf[..end].to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_spec_parsing() {
        assert_eq!(
            "inet:8893@localhost".parse::<ListenerSpec>().unwrap(),
            ListenerSpec::Inet {
                port: 8893,
                host: "localhost".to_string()
            }
        );
        assert_eq!(
            "unix:/var/run/authmilter.sock".parse::<ListenerSpec>().unwrap(),
            ListenerSpec::Unix {
                path: PathBuf::from("/var/run/authmilter.sock")
            }
        );
        assert!("tcp:25@host".parse::<ListenerSpec>().is_err());
        assert!("inet:notaport@host".parse::<ListenerSpec>().is_err());
        assert!("inet:25".parse::<ListenerSpec>().is_err());
    }

    #[test]
    fn test_listener_spec_round_trips() {
        for spec in ["inet:12345@0.0.0.0", "unix:/tmp/x.sock"] {
            assert_eq!(spec.parse::<ListenerSpec>().unwrap().to_string(), spec);
        }
    }

    #[test]
    fn test_default_worker_sizing() {
        let config = Config::default();
        assert_eq!(config.min_children, 20);
        assert_eq!(config.max_children, 100);
        assert_eq!(config.min_spare_children, 10);
        assert_eq!(config.max_spare_children, 20);
        assert_eq!(config.max_requests_per_child, 200);
        assert_eq!(config.listen_backlog, 20);
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
connection: "inet:8893@localhost"
load_handlers: [dkim, ptr]
handler_config:
  dkim:
    check_dkim: 2
min_children: 2
max_children: 4
min_spare_children: 1
max_spare_children: 2
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.load_handlers, vec!["dkim", "ptr"]);
        assert_eq!(config.min_children, 2);
        assert!(config.handler_options("dkim").is_some());
        assert!(config.handler_options("spf").is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_metric_collision_is_refused() {
        let mut config = Config::default();
        config.metric_connection = Some(config.connection.clone());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("collides"));
    }

    #[test]
    fn test_legacy_metric_aliases() {
        let mut config = Config::default();
        config.metric_port = Some(9999);
        assert_eq!(
            config.metric_listener().unwrap(),
            Some(ListenerSpec::Inet {
                port: 9999,
                host: "localhost".to_string()
            })
        );
    }

    #[test]
    fn test_cidr_lists() {
        let nets = parse_cidr_list(&[
            "10.0.0.0/8".to_string(),
            "192.168.1.1".to_string(),
            "fd00::/8".to_string(),
        ])
        .unwrap();
        assert!(ip_in_networks("10.1.2.3".parse().unwrap(), &nets));
        assert!(ip_in_networks("192.168.1.1".parse().unwrap(), &nets));
        assert!(!ip_in_networks("192.168.1.2".parse().unwrap(), &nets));
        assert!(ip_in_networks("fd00::1".parse().unwrap(), &nets));
        assert!(parse_cidr_list(&["not-an-ip".to_string()]).is_err());
    }

    #[test]
    fn test_smtp_protocol_requires_forward() {
        let mut config = Config::default();
        config.protocol = Protocol::Smtp;
        assert!(config.validate().is_err());
        config.smtp = Some(SmtpProxyConfig {
            forward: "inet:10025@127.0.0.1".to_string(),
        });
        config.validate().unwrap();
    }
}
