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

//! The seam between sentry-facing request handling and however signatures
//! actually get produced. spec.md §4.4 names this collaborator explicitly:
//! a single operation, `send_request`, with two concrete shapes behind it.

use crate::error::ClientError;
use crate::messages::Payload;

/// Delivers a privval request to wherever it is actually signed and returns
/// the response. Implementations: [`crate::load_balancer::LoadBalancer`]
/// (variant A, talking to one or more horcrux signer processes speaking the
/// privval protocol themselves) and
/// [`crate::grpc_client::HorcruxGrpcClient`] (variant B, talking to a
/// horcrux cluster's gRPC surface).
pub trait HorcruxConnection: Send + Sync {
    fn send_request(&self, request: Payload) -> Result<Payload, ClientError>;
}
