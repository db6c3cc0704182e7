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

//! Error kinds for the core signing path. Mirrors the taxonomy in the design
//! doc: transient (retried locally), upstream (surfaced to the sentry),
//! configuration (fails fast at startup), shutdown, and composite (teardown).

use std::fmt;

/// Errors from the framed codec (`codec::read_msg` / `codec::write_msg`).
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("frame length {declared} exceeds max {max}")]
    FrameTooLarge { declared: usize, max: usize },
    #[error("short read: stream closed after {got} of {want} bytes")]
    ShortRead { got: usize, want: usize },
    #[error("malformed protobuf frame: {0}")]
    Malformed(#[from] prost::DecodeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the signer-listener endpoint.
#[derive(thiserror::Error, Debug)]
pub enum ListenerError {
    #[error("listener not connected")]
    NotConnected,
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("listener stopped")]
    Stopped,
}

/// Errors dialing, handshaking with, or serving a sentry.
#[derive(thiserror::Error, Debug)]
pub enum DialError {
    #[error("dial failed: {0}")]
    Dial(std::io::Error),
    #[error("invalid sentry address {0:?}: {1}")]
    InvalidAddress(String, String),
}

/// Errors from a `HorcruxConnection` implementation (load balancer or gRPC client).
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),
    #[error("upstream rpc failed: {0}")]
    Rpc(String),
    #[error("no endpoints configured")]
    NoEndpoints,
}

/// Errors from the sentry watcher and its discovery backends.
#[derive(thiserror::Error, Debug)]
pub enum WatcherError {
    #[error("failed to start remote signer for {address}: {source}")]
    SignerStart {
        address: String,
        source: DialError,
    },
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("in-cluster configuration unavailable: {0}")]
    Configuration(String),
}

/// Joins several independent teardown errors, mirroring Go's `errors.Join`
/// (used by `Stop()` across the watcher's persistent + dynamic signers).
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Box<dyn std::error::Error + Send + Sync>>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: impl std::error::Error + Send + Sync + 'static) {
        self.errors.push(Box::new(err));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns `Ok(())` if nothing was collected, else `Err(self)`.
    pub fn into_result(self) -> Result<(), Self> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) during teardown: ", self.errors.len())?;
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
