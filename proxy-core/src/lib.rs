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

//! Core primitives for a Tendermint/CometBFT remote-signing proxy: wire
//! framing, the privval message model, an authenticated encrypted
//! transport, listener and dialer endpoints, and the two shapes a horcrux
//! signing backend can take.
//!
//! The binary crate (`horcrux-proxy`) wires these together with CLI
//! parsing, configuration, and sentry discovery; everything here is
//! transport- and discovery-agnostic.

pub mod addr;
pub mod codec;
pub mod error;
pub mod grpc_client;
pub mod horcrux_connection;
pub mod identity;
pub mod load_balancer;
pub mod messages;
mod privval;
mod horcrux;
pub mod remote_signer;
pub mod secret_connection;
pub mod signer_listener;

pub use horcrux_connection::HorcruxConnection;
pub use messages::Payload;
