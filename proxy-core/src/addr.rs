// Copyright (C) 2024 Strangelove Ventures
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Sentry / listener addresses. A `SentryAddr` is the stable identity of a
//! sentry across reconnects (spec.md §3): at most one running session exists
//! per address at any time, so it must `Eq`/`Hash` cleanly and round-trip
//! through `Display` for logging and Kubernetes-derived identifiers.

use std::fmt;
use std::net::TcpStream;
use std::time::Duration;

use crate::error::DialError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Tcp(String),
    Unix(String),
}

/// A parsed `tcp://host:port` or `unix:///path` address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SentryAddr {
    raw: String,
    endpoint: Endpoint,
}

impl SentryAddr {
    pub fn parse(raw: &str) -> Result<Self, DialError> {
        if let Some(rest) = raw.strip_prefix("tcp://") {
            if rest.is_empty() {
                return Err(DialError::InvalidAddress(
                    raw.to_string(),
                    "empty host:port".to_string(),
                ));
            }
            return Ok(Self {
                raw: raw.to_string(),
                endpoint: Endpoint::Tcp(rest.to_string()),
            });
        }
        if let Some(rest) = raw.strip_prefix("unix://") {
            if rest.is_empty() {
                return Err(DialError::InvalidAddress(
                    raw.to_string(),
                    "empty socket path".to_string(),
                ));
            }
            return Ok(Self {
                raw: raw.to_string(),
                endpoint: Endpoint::Unix(rest.to_string()),
            });
        }
        Err(DialError::InvalidAddress(
            raw.to_string(),
            "expected tcp:// or unix:// scheme".to_string(),
        ))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Dial this address with the given connect timeout. Unix sockets ignore
    /// the timeout since `UnixStream::connect` has no deadline parameter.
    #[cfg(unix)]
    pub fn dial(&self, timeout: Duration) -> Result<Dialed, DialError> {
        use std::net::ToSocketAddrs;
        use std::os::unix::net::UnixStream;

        match &self.endpoint {
            Endpoint::Tcp(hostport) => {
                let sock_addr = hostport
                    .to_socket_addrs()
                    .map_err(DialError::Dial)?
                    .next()
                    .ok_or_else(|| {
                        DialError::InvalidAddress(self.raw.clone(), "unresolvable host".into())
                    })?;
                let stream = TcpStream::connect_timeout(&sock_addr, timeout).map_err(DialError::Dial)?;
                Ok(Dialed::Tcp(stream))
            }
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).map_err(DialError::Dial)?;
                Ok(Dialed::Unix(stream))
            }
        }
    }

    #[cfg(not(unix))]
    pub fn dial(&self, timeout: Duration) -> Result<Dialed, DialError> {
        use std::net::ToSocketAddrs;

        match &self.endpoint {
            Endpoint::Tcp(hostport) => {
                let sock_addr = hostport
                    .to_socket_addrs()
                    .map_err(DialError::Dial)?
                    .next()
                    .ok_or_else(|| {
                        DialError::InvalidAddress(self.raw.clone(), "unresolvable host".into())
                    })?;
                let stream = TcpStream::connect_timeout(&sock_addr, timeout).map_err(DialError::Dial)?;
                Ok(Dialed::Tcp(stream))
            }
            Endpoint::Unix(_) => Err(DialError::InvalidAddress(
                self.raw.clone(),
                "unix sockets are not supported on this platform".into(),
            )),
        }
    }
}

impl fmt::Display for SentryAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A connected stream, over either transport. Both sides implement
/// `Read + Write`, which is all `secret_connection` and the codec need.
pub enum Dialed {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl std::io::Read for Dialed {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Dialed::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Dialed::Unix(s) => s.read(buf),
        }
    }
}

impl std::io::Write for Dialed {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Dialed::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Dialed::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Dialed::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Dialed::Unix(s) => s.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp() {
        let a = SentryAddr::parse("tcp://127.0.0.1:1234").unwrap();
        assert_eq!(a.endpoint(), &Endpoint::Tcp("127.0.0.1:1234".to_string()));
        assert_eq!(a.to_string(), "tcp://127.0.0.1:1234");
    }

    #[test]
    fn parses_unix() {
        let a = SentryAddr::parse("unix:///tmp/priv.sock").unwrap();
        assert_eq!(a.endpoint(), &Endpoint::Unix("/tmp/priv.sock".to_string()));
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(SentryAddr::parse("http://example.com").is_err());
    }

    #[test]
    fn identity_is_stable_across_clones() {
        use std::collections::HashSet;
        let a = SentryAddr::parse("tcp://host:1").unwrap();
        let b = a.clone();
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }
}
