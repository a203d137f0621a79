//! GMCast configuration.
//!
//! A node is configured from a single URI of the form
//! `gmcast://host[:port]?gmcast.group=NAME[&gmcast.listen_addr=tcp://IP:PORT]`.
//! The authority part names the initial seed to contact (omit the host for
//! the first node of a group). Name resolution is blocking and happens only
//! here, at construction time.

use std::net::ToSocketAddrs;

/// URI scheme of a GMCast endpoint configuration.
pub const GMCAST_SCHEME: &str = "gmcast";

/// Scheme of resolved stream addresses.
pub const TCP_SCHEME: &str = "tcp";

/// Default TCP port when the URI carries none.
pub const DEFAULT_PORT: u16 = 4567;

/// Default reconnect budget: an address whose retry count exceeds this is
/// forgotten. Override with the `gmcast.max_retry_cnt` option.
pub const DEFAULT_MAX_RETRY_CNT: i32 = 30;

const OPT_GROUP: &str = "gmcast.group";
const OPT_LISTEN_ADDR: &str = "gmcast.listen_addr";
const OPT_MAX_RETRY_CNT: &str = "gmcast.max_retry_cnt";

/// Parsed and resolved node configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GmcastConfig {
    /// Name of the group this node joins. Required.
    pub group_name: String,
    /// Canonical `tcp://ip:port` this node listens on and advertises.
    pub listen_addr: String,
    /// Canonical address of the initial seed, if the URI named one.
    pub initial_addr: Option<String>,
    /// Reconnect budget before an address is forgotten.
    pub max_retry_cnt: i32,
}

impl GmcastConfig {
    pub fn from_uri(uri: &str) -> Result<Self, ConfigError> {
        let parsed = Uri::parse(uri)?;
        if parsed.scheme != GMCAST_SCHEME {
            return Err(ConfigError::InvalidScheme(parsed.scheme));
        }

        let group_name = parsed
            .option(OPT_GROUP)
            .ok_or_else(|| ConfigError::MissingGroup(uri.to_string()))?
            .to_string();

        let initial_addr = if host_is_any(&parsed.host) {
            None
        } else {
            let port = parsed.port.clone().unwrap_or_else(default_port_string);
            Some(resolve_tcp(&format!(
                "{TCP_SCHEME}://{}:{port}",
                parsed.host
            ))?)
        };

        let mut listen_addr = parsed
            .option(OPT_LISTEN_ADDR)
            .unwrap_or("tcp://0.0.0.0")
            .to_string();
        if !addr_has_port(&listen_addr)? {
            // No port in the option itself; fall back to the one from the
            // authority part, then to the default.
            let port = parsed.port.clone().unwrap_or_else(default_port_string);
            listen_addr = format!("{listen_addr}:{port}");
        }
        let listen_addr = resolve_tcp(&listen_addr)?;
        tracing::debug!(listen_addr = %listen_addr, ?initial_addr, "gmcast configuration resolved");

        let max_retry_cnt = match parsed.option(OPT_MAX_RETRY_CNT) {
            Some(v) => v.parse().map_err(|_| ConfigError::InvalidOption {
                option: OPT_MAX_RETRY_CNT,
                value: v.to_string(),
            })?,
            None => DEFAULT_MAX_RETRY_CNT,
        };

        Ok(Self {
            group_name,
            listen_addr,
            initial_addr,
            max_retry_cnt,
        })
    }
}

fn default_port_string() -> String {
    DEFAULT_PORT.to_string()
}

/// An empty or wildcard host means "no initial seed".
fn host_is_any(host: &str) -> bool {
    host.is_empty() || host == "0.0.0.0" || host == "[::]" || host == "::"
}

/// Resolve a `tcp://host:port` address to its canonical `tcp://ip:port`
/// form. Uses the system resolver (blocking), like the rest of the
/// construction path.
pub fn resolve_tcp(addr: &str) -> Result<String, ConfigError> {
    let rest = addr
        .strip_prefix("tcp://")
        .ok_or_else(|| ConfigError::InvalidScheme(addr.to_string()))?;
    let resolved = rest
        .to_socket_addrs()
        .map_err(|source| ConfigError::Resolve {
            addr: addr.to_string(),
            source,
        })?
        .next()
        .ok_or_else(|| ConfigError::Unresolvable(addr.to_string()))?;
    Ok(format!("{TCP_SCHEME}://{resolved}"))
}

/// Whether the authority part of `scheme://authority` carries a port.
fn addr_has_port(addr: &str) -> Result<bool, ConfigError> {
    let rest = addr
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(addr);
    Ok(split_host_port(rest)?.1.is_some())
}

/// Split `host[:port]`, handling bracketed IPv6 literals.
fn split_host_port(authority: &str) -> Result<(String, Option<String>), ConfigError> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ConfigError::Malformed(authority.to_string()))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.to_string()),
            None if tail.is_empty() => None,
            None => return Err(ConfigError::Malformed(authority.to_string())),
        };
        return Ok((format!("[{host}]"), port));
    }
    match authority.rsplit_once(':') {
        // A second ':' means an unbracketed IPv6 literal, not a port.
        Some((host, _)) if host.contains(':') => Ok((authority.to_string(), None)),
        Some((host, port)) => Ok((host.to_string(), Some(port.to_string()))),
        None => Ok((authority.to_string(), None)),
    }
}

// ── URI splitting ────────────────────────────────────────────────────────────

/// Minimal `scheme://host[:port][/][?k=v&…]` splitter; just enough for the
/// gmcast and tcp URIs this crate consumes.
struct Uri {
    scheme: String,
    host: String,
    port: Option<String>,
    options: Vec<(String, String)>,
}

impl Uri {
    fn parse(uri: &str) -> Result<Self, ConfigError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| ConfigError::Malformed(uri.to_string()))?;
        let (authority, query) = match rest.split_once('?') {
            Some((a, q)) => (a, q),
            None => (rest, ""),
        };
        let authority = authority.trim_end_matches('/');
        let (host, port) = split_host_port(authority)?;

        let options = query
            .split('&')
            .filter(|kv| !kv.is_empty())
            .map(|kv| match kv.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (kv.to_string(), String::new()),
            })
            .collect();

        Ok(Self {
            scheme: scheme.to_string(),
            host,
            port,
            options,
        })
    }

    fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed URI: {0}")]
    Malformed(String),

    #[error("invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("group not defined in URL: {0}")]
    MissingGroup(String),

    #[error("failed to resolve {addr}: {source}")]
    Resolve {
        addr: String,
        source: std::io::Error,
    },

    #[error("address did not resolve: {0}")]
    Unresolvable(String),

    #[error("invalid value for {option}: {value}")]
    InvalidOption {
        option: &'static str,
        value: String,
    },
}

// ── Tests ────────────────────────────────────────────────────────────────────
