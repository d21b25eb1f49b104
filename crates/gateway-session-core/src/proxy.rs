//! Stringified proxies.
//!
//! A stringified proxy names an object and the single endpoint where it can
//! be reached:
//!
//! ```text
//! "Runtime/RouterFinder":tcp -p 4063 -h "gateway.example.com" -t 10000
//! ```
//!
//! The identity may be left unquoted when it contains no `:`.

use std::{fmt, str::FromStr};

use crate::{Identity, RpcError};

/// Parsed form of a stringified proxy with one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyString {
    pub identity: Identity,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    /// Connection timeout in milliseconds.
    pub timeout: Option<u64>,
}

impl ProxyString {
    #[must_use]
    pub fn new(
        identity: Identity,
        protocol: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            identity,
            protocol: protocol.into(),
            host: host.into(),
            port,
            timeout: None,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<u64>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Display for ProxyString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\":{} -p {} -h \"{}\"",
            self.identity, self.protocol, self.port, self.host
        )?;
        if let Some(timeout) = self.timeout.filter(|t| *t > 0) {
            write!(f, " -t {timeout}")?;
        }
        Ok(())
    }
}

impl FromStr for ProxyString {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| RpcError::ProxyParse(format!("{why} in `{s}`"));
        let s = s.trim();

        let (identity, rest) = if let Some(quoted) = s.strip_prefix('"') {
            quoted
                .split_once('"')
                .ok_or_else(|| invalid("unterminated identity"))?
        } else {
            let idx = s.find(':').ok_or_else(|| invalid("missing endpoint"))?;
            s.split_at(idx)
        };
        let identity: Identity = identity.parse()?;
        let endpoint = rest
            .strip_prefix(':')
            .ok_or_else(|| invalid("missing endpoint"))?;

        let mut tokens = split_options(endpoint)
            .ok_or_else(|| invalid("unterminated quote"))?
            .into_iter();
        let protocol = tokens.next().ok_or_else(|| invalid("missing protocol"))?;
        let mut host = None;
        let mut port = None;
        let mut timeout = None;
        while let Some(flag) = tokens.next() {
            let value = tokens
                .next()
                .ok_or_else(|| invalid(&format!("missing value for `{flag}`")))?;
            match flag {
                "-h" => host = Some(value.to_string()),
                "-p" => port = Some(value.parse().map_err(|_| invalid("invalid port"))?),
                "-t" => timeout = Some(value.parse().map_err(|_| invalid("invalid timeout"))?),
                other => return Err(invalid(&format!("unknown option `{other}`"))),
            }
        }

        Ok(Self {
            identity,
            protocol: protocol.to_string(),
            host: host.ok_or_else(|| invalid("missing host"))?,
            port: port.ok_or_else(|| invalid("missing port"))?,
            timeout,
        })
    }
}

/// Split endpoint options on whitespace. A quoted value is one token, with
/// its quotes removed.
fn split_options(mut rest: &str) -> Option<Vec<&str>> {
    let mut tokens = Vec::new();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            return Some(tokens);
        }
        let (token, tail) = if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted.find('"')?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            rest.split_at(rest.find(char::is_whitespace).unwrap_or(rest.len()))
        };
        tokens.push(token);
        rest = tail;
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    #[test]
    fn test_display_quotes_identity_and_host() {
        let proxy = ProxyString::new(Identity::router_finder(), "ssl", "gw.local", 4064)
            .with_timeout(Some(5000));
        assert_eq!(
            proxy.to_string(),
            "\"Runtime/RouterFinder\":ssl -p 4064 -h \"gw.local\" -t 5000"
        );
    }

    #[test]
    fn test_zero_timeout_is_omitted() {
        let proxy = ProxyString::new(Identity::default_router(), "tcp", "h", 1)
            .with_timeout(Some(0));
        assert!(!proxy.to_string().contains("-t"));
    }

    #[test]
    fn test_parse_unquoted() {
        let proxy: ProxyString = assert_ok!("Gateway/router:tcp -h localhost -p 4063".parse());
        assert_eq!(proxy.identity, Identity::default_router());
        assert_eq!(proxy.protocol, "tcp");
        assert_eq!(proxy.host, "localhost");
        assert_eq!(proxy.port, 4063);
        assert_eq!(proxy.timeout, None);
    }

    #[test]
    fn test_parse_formatted() {
        let original = ProxyString::new(Identity::router_finder(), "tcp", "10.0.0.1", 4063)
            .with_timeout(Some(250));
        let parsed: ProxyString = assert_ok!(original.to_string().parse());
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_quoted_host_keeps_spaces() {
        let original = ProxyString::new(Identity::router_finder(), "ws", "edge gateway", 4063);
        let parsed: ProxyString = assert_ok!(original.to_string().parse());
        assert_eq!(parsed.host, "edge gateway");
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for input in [
            "no-endpoint",
            "\"Gateway/router:tcp -p 1 -h x",
            "Gateway/router:tcp -p x -h host",
            "Gateway/router:tcp -p 1",
            "Gateway/router:tcp -p 1 -h host -z 3",
            "Gateway/router:tcp -p 1 -h \"host",
        ] {
            assert_err!(input.parse::<ProxyString>());
        }
    }
}
