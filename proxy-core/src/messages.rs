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

//! The privval message model: a tagged union with one variant per request or
//! response kind (spec.md §3, §9 "Dispatch variants in messages"). Dispatch
//! throughout the crate is an exhaustive `match` on `Payload`, never a
//! string or type-id lookup.

use crate::privval::{self, message::Sum};

/// An unwrapped privval message. `wrap`/`unwrap` convert to and from the
/// protobuf `Message` oneof; everything else in this crate works in terms
/// of `Payload` so a reader never has to reason about the wire `oneof`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    PubKeyRequest(privval::PubKeyRequest),
    PubKeyResponse(privval::PubKeyResponse),
    SignVoteRequest(privval::SignVoteRequest),
    SignedVoteResponse(privval::SignedVoteResponse),
    SignProposalRequest(privval::SignProposalRequest),
    SignedProposalResponse(privval::SignedProposalResponse),
    PingRequest,
    PingResponse,
    /// The wire zero-value `Message{}` (no `sum` set at all). Produced only
    /// by `wrap()` for callers that need to hand back the Go source's
    /// `return &cometprotoprivval.Message{}, nil` on an unrecognized request
    /// kind; never produced by `unwrap()` of an incoming message, so the
    /// existing empty-sum-is-an-error handling on the receive path is
    /// unaffected.
    Empty,
}

impl Payload {
    /// A short label for tracing fields; never used for dispatch.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::PubKeyRequest(_) => "pub_key_request",
            Payload::PubKeyResponse(_) => "pub_key_response",
            Payload::SignVoteRequest(_) => "sign_vote_request",
            Payload::SignedVoteResponse(_) => "signed_vote_response",
            Payload::SignProposalRequest(_) => "sign_proposal_request",
            Payload::SignedProposalResponse(_) => "signed_proposal_response",
            Payload::PingRequest => "ping_request",
            Payload::PingResponse => "ping_response",
            Payload::Empty => "empty",
        }
    }
}

/// Wraps a `Payload` into the wire `privval::Message`.
pub fn wrap(payload: Payload) -> privval::Message {
    let sum = match payload {
        Payload::PubKeyRequest(r) => Sum::PubKeyRequest(r),
        Payload::PubKeyResponse(r) => Sum::PubKeyResponse(r),
        Payload::SignVoteRequest(r) => Sum::SignVoteRequest(r),
        Payload::SignedVoteResponse(r) => Sum::SignedVoteResponse(r),
        Payload::SignProposalRequest(r) => Sum::SignProposalRequest(r),
        Payload::SignedProposalResponse(r) => Sum::SignedProposalResponse(r),
        Payload::PingRequest => Sum::PingRequest(privval::PingRequest {}),
        Payload::PingResponse => Sum::PingResponse(privval::PingResponse {}),
        Payload::Empty => return privval::Message { sum: None },
    };
    privval::Message { sum: Some(sum) }
}

/// Unwraps a wire `privval::Message` into a `Payload`. Returns `None` for an
/// empty `sum` (the zero-value `Message{}` the Go source returns on an
/// unrecognized request) rather than panicking, since that value can arrive
/// over the wire from a misbehaving or future-versioned peer.
pub fn unwrap(msg: privval::Message) -> Option<Payload> {
    Some(match msg.sum? {
        Sum::PubKeyRequest(r) => Payload::PubKeyRequest(r),
        Sum::PubKeyResponse(r) => Payload::PubKeyResponse(r),
        Sum::SignVoteRequest(r) => Payload::SignVoteRequest(r),
        Sum::SignedVoteResponse(r) => Payload::SignedVoteResponse(r),
        Sum::SignProposalRequest(r) => Payload::SignProposalRequest(r),
        Sum::SignedProposalResponse(r) => Payload::SignedProposalResponse(r),
        Sum::PingRequest(_) => Payload::PingRequest,
        Sum::PingResponse(_) => Payload::PingResponse,
    })
}

/// Builds a `RemoteSignerError` from any displayable error, matching the Go
/// source's `getRemoteSignerError` (which always uses code 0 — horcrux never
/// assigned a richer error-code taxonomy upstream, so neither do we).
pub fn remote_signer_error(description: impl ToString) -> privval::RemoteSignerError {
    privval::RemoteSignerError {
        code: 0,
        description: description.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trips() {
        let msg = wrap(Payload::PingRequest);
        assert_eq!(unwrap(msg), Some(Payload::PingRequest));
    }

    #[test]
    fn empty_sum_unwraps_to_none() {
        let msg = privval::Message { sum: None };
        assert_eq!(unwrap(msg), None);
    }

    #[test]
    fn empty_payload_wraps_to_the_wire_zero_value() {
        let msg = wrap(Payload::Empty);
        assert_eq!(msg.sum, None);
    }

    #[test]
    fn sign_vote_round_trips_with_error() {
        let resp = privval::SignedVoteResponse {
            vote: None,
            error: Some(remote_signer_error("double sign detected")),
        };
        let msg = wrap(Payload::SignedVoteResponse(resp.clone()));
        match unwrap(msg) {
            Some(Payload::SignedVoteResponse(r)) => assert_eq!(r, resp),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
