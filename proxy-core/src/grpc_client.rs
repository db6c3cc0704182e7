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

//! Variant B of `HorcruxConnection`: a gRPC client translating privval
//! requests into calls against a horcrux signer cluster's `RemoteSigner`
//! service.
//!
//! Grounded on `signer/grpc_client.go` for dispatch shape (match on request
//! variant, wrap RPC failures as a `RemoteSignerError` rather than
//! propagating a transport error) and on spec.md §4.4 for the RPC surface
//! itself: the cluster never sees a full `Vote`/`Proposal`, only the
//! canonical sign-bytes (`VoteToBlock`/`ProposalToBlock`), matching how
//! CometBFT itself computes what a signer actually signs.

use prost::Message as _;
use tonic::transport::Channel;
use tracing::warn;

use crate::error::ClientError;
use crate::horcrux::remote_signer_client::RemoteSignerClient;
use crate::horcrux::{PubKeyRequest as GrpcPubKeyRequest, SignBlockRequest};
use crate::horcrux_connection::HorcruxConnection;
use crate::messages::{remote_signer_error, Payload};
use crate::privval;

/// Encodes the subset of a vote's fields that are actually covered by its
/// signature (spec.md's "VoteToBlock"), mirroring
/// `tendermint.types.CanonicalVote`.
fn vote_to_block(vote: &privval::Vote, chain_id: &str) -> Vec<u8> {
    let canonical = privval::CanonicalVote {
        r#type: vote.r#type,
        height: vote.height,
        round: vote.round as i64,
        block_id: vote.block_id.as_ref().map(|b| privval::CanonicalBlockId {
            hash: b.hash.clone(),
            part_set_header: Some(privval::CanonicalPartSetHeader {
                hash: b.part_set_header_hash.clone(),
                total: b.part_set_header_total,
            }),
        }),
        timestamp: vote.timestamp.clone(),
        chain_id: chain_id.to_string(),
    };
    canonical.encode_to_vec()
}

/// Same idea as `vote_to_block` but for proposals ("ProposalToBlock").
fn proposal_to_block(proposal: &privval::Proposal, chain_id: &str) -> Vec<u8> {
    let canonical = privval::CanonicalProposal {
        r#type: proposal.r#type,
        height: proposal.height,
        round: proposal.round as i64,
        pol_round: proposal.pol_round as i64,
        block_id: proposal.block_id.as_ref().map(|b| privval::CanonicalBlockId {
            hash: b.hash.clone(),
            part_set_header: Some(privval::CanonicalPartSetHeader {
                hash: b.part_set_header_hash.clone(),
                total: b.part_set_header_total,
            }),
        }),
        timestamp: proposal.timestamp.clone(),
        chain_id: chain_id.to_string(),
    };
    canonical.encode_to_vec()
}

/// A `tokio` runtime drives `tonic`'s async client from the otherwise
/// synchronous, thread-per-connection request path described in spec.md §5.
/// One runtime is shared across all requests through this client; building
/// a fresh one per call would defeat connection pooling.
pub struct HorcruxGrpcClient {
    client: RemoteSignerClient<Channel>,
    runtime: tokio::runtime::Handle,
}

impl HorcruxGrpcClient {
    /// Connects (lazily, matching `grpc.Dial`'s non-blocking default) to
    /// `address`, e.g. `http://127.0.0.1:8080`. Transport is intentionally
    /// insecure, matching the Go source's `insecure.NewCredentials()`; see
    /// DESIGN.md for the trust-boundary rationale.
    pub fn connect(
        address: impl Into<String>,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self, ClientError> {
        let channel = Channel::from_shared(address.into())
            .map_err(|e| ClientError::Rpc(e.to_string()))?
            .connect_lazy();
        Ok(Self {
            client: RemoteSignerClient::new(channel),
            runtime,
        })
    }
}

impl HorcruxConnection for HorcruxGrpcClient {
    fn send_request(&self, request: Payload) -> Result<Payload, ClientError> {
        let mut client = self.client.clone();
        self.runtime.block_on(async move {
            match request {
                Payload::SignVoteRequest(req) => {
                    let Some(vote) = req.vote else {
                        return Ok(Payload::SignedVoteResponse(privval::SignedVoteResponse {
                            vote: None,
                            error: Some(remote_signer_error("sign vote request missing vote")),
                        }));
                    };
                    let block = vote_to_block(&vote, &req.chain_id);
                    let rpc = client.sign_block(SignBlockRequest {
                        chain_id: req.chain_id,
                        block,
                    });
                    match rpc.await {
                        Ok(resp) => {
                            let resp = resp.into_inner();
                            let mut signed = vote;
                            signed.signature = resp.signature;
                            signed.extension_signature = resp.ext_signature;
                            signed.timestamp = Some(privval::Timestamp {
                                seconds: resp.timestamp_unix_nanos / 1_000_000_000,
                                nanos: (resp.timestamp_unix_nanos % 1_000_000_000) as i32,
                            });
                            Ok(Payload::SignedVoteResponse(privval::SignedVoteResponse {
                                vote: Some(signed),
                                error: None,
                            }))
                        }
                        Err(status) => Ok(Payload::SignedVoteResponse(privval::SignedVoteResponse {
                            vote: None,
                            error: Some(remote_signer_error(status.message())),
                        })),
                    }
                }
                Payload::SignProposalRequest(req) => {
                    let Some(proposal) = req.proposal else {
                        return Ok(Payload::SignedProposalResponse(privval::SignedProposalResponse {
                            proposal: None,
                            error: Some(remote_signer_error("sign proposal request missing proposal")),
                        }));
                    };
                    let block = proposal_to_block(&proposal, &req.chain_id);
                    let rpc = client.sign_block(SignBlockRequest {
                        chain_id: req.chain_id,
                        block,
                    });
                    match rpc.await {
                        Ok(resp) => {
                            let resp = resp.into_inner();
                            let mut signed = proposal;
                            signed.signature = resp.signature;
                            signed.timestamp = Some(privval::Timestamp {
                                seconds: resp.timestamp_unix_nanos / 1_000_000_000,
                                nanos: (resp.timestamp_unix_nanos % 1_000_000_000) as i32,
                            });
                            Ok(Payload::SignedProposalResponse(privval::SignedProposalResponse {
                                proposal: Some(signed),
                                error: None,
                            }))
                        }
                        Err(status) => Ok(Payload::SignedProposalResponse(privval::SignedProposalResponse {
                            proposal: None,
                            error: Some(remote_signer_error(status.message())),
                        })),
                    }
                }
                Payload::PubKeyRequest(req) => {
                    match client.pub_key(GrpcPubKeyRequest { chain_id: req.chain_id }).await {
                        Ok(resp) => Ok(Payload::PubKeyResponse(privval::PubKeyResponse {
                            pub_key: Some(privval::PublicKey {
                                sum: Some(privval::public_key::Sum::Ed25519(resp.into_inner().pub_key)),
                            }),
                            error: None,
                        })),
                        Err(status) => Ok(Payload::PubKeyResponse(privval::PubKeyResponse {
                            pub_key: None,
                            error: Some(remote_signer_error(status.message())),
                        })),
                    }
                }
                Payload::PingRequest => Ok(Payload::PingResponse),
                other => {
                    warn!(kind = other.kind(), "unrecognized request for gRPC signer, returning empty message");
                    Ok(Payload::Empty)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_to_block_is_deterministic() {
        let vote = privval::Vote {
            r#type: 2,
            height: 100,
            round: 0,
            block_id: Some(privval::BlockId {
                hash: vec![1, 2, 3],
                part_set_header_hash: vec![4, 5, 6],
                part_set_header_total: 1,
            }),
            timestamp: Some(privval::Timestamp { seconds: 1, nanos: 0 }),
            validator_address: vec![],
            validator_index: 0,
            signature: vec![],
            extension: vec![],
            extension_signature: vec![],
        };
        let a = vote_to_block(&vote, "test-chain");
        let b = vote_to_block(&vote, "test-chain");
        assert_eq!(a, b);
        assert_ne!(a, vote_to_block(&vote, "other-chain"));
    }

    /// A stub horcrux cluster returning a fixed signature/extension
    /// signature/timestamp, used to exercise `HorcruxGrpcClient::send_request`
    /// end to end (spec.md §8 scenario S5) rather than only the pure
    /// `vote_to_block`/`proposal_to_block` helpers above.
    struct StubSigner;

    #[tonic::async_trait]
    impl crate::horcrux::remote_signer_server::RemoteSigner for StubSigner {
        async fn sign_block(
            &self,
            _request: tonic::Request<SignBlockRequest>,
        ) -> Result<tonic::Response<crate::horcrux::SignBlockResponse>, tonic::Status> {
            Ok(tonic::Response::new(crate::horcrux::SignBlockResponse {
                signature: vec![0xAA; 4],
                ext_signature: vec![0xBB; 4],
                timestamp_unix_nanos: 42,
            }))
        }

        async fn pub_key(
            &self,
            _request: tonic::Request<GrpcPubKeyRequest>,
        ) -> Result<tonic::Response<crate::horcrux::PubKeyResponse>, tonic::Status> {
            Ok(tonic::Response::new(crate::horcrux::PubKeyResponse {
                pub_key: vec![0xCC; 32],
            }))
        }
    }

    /// Binds an in-process tonic server running `StubSigner` and returns its
    /// bound address; the server runs for the lifetime of the test binary.
    async fn spawn_stub_server() -> std::net::SocketAddr {
        use crate::horcrux::remote_signer_server::RemoteSignerServer;

        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind stub server");
        let addr = listener.local_addr().expect("local_addr");
        listener.set_nonblocking(true).expect("set_nonblocking");
        let listener = tokio::net::TcpListener::from_std(listener).expect("tokio listener");
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);

        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(RemoteSignerServer::new(StubSigner))
                .serve_with_incoming(incoming)
                .await
                .expect("stub server exited");
        });
        addr
    }

    fn empty_vote() -> privval::Vote {
        privval::Vote {
            r#type: 2,
            height: 100,
            round: 0,
            block_id: None,
            timestamp: Some(privval::Timestamp { seconds: 1, nanos: 0 }),
            validator_address: vec![],
            validator_index: 0,
            signature: vec![],
            extension: vec![],
            extension_signature: vec![],
        }
    }

    #[tokio::test]
    async fn send_request_round_trips_a_vote_through_the_stub_grpc_server() {
        let addr = spawn_stub_server().await;
        let client = HorcruxGrpcClient::connect(format!("http://{addr}"), tokio::runtime::Handle::current())
            .expect("connect to stub server");

        let request = Payload::SignVoteRequest(privval::SignVoteRequest {
            vote: Some(empty_vote()),
            chain_id: "test-chain".to_string(),
        });

        // `send_request` blocks on `self.runtime`, which would deadlock if
        // driven from a runtime worker thread; run it on the blocking pool,
        // matching how the real dial-serve thread calls it outside any
        // async context.
        let response = tokio::task::spawn_blocking(move || client.send_request(request))
            .await
            .expect("spawn_blocking join")
            .expect("send_request");

        match response {
            Payload::SignedVoteResponse(resp) => {
                let vote = resp.vote.expect("signed vote present");
                assert_eq!(vote.signature, vec![0xAA; 4]);
                assert_eq!(vote.extension_signature, vec![0xBB; 4]);
                assert_eq!(vote.timestamp, Some(privval::Timestamp { seconds: 0, nanos: 42 }));
                assert!(resp.error.is_none());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_request_round_trips_a_proposal_through_the_stub_grpc_server() {
        let addr = spawn_stub_server().await;
        let client = HorcruxGrpcClient::connect(format!("http://{addr}"), tokio::runtime::Handle::current())
            .expect("connect to stub server");

        let proposal = privval::Proposal {
            r#type: 32,
            height: 100,
            round: 0,
            pol_round: -1,
            block_id: None,
            timestamp: Some(privval::Timestamp { seconds: 1, nanos: 0 }),
            signature: vec![],
        };
        let request = Payload::SignProposalRequest(privval::SignProposalRequest {
            proposal: Some(proposal),
            chain_id: "test-chain".to_string(),
        });

        let response = tokio::task::spawn_blocking(move || client.send_request(request))
            .await
            .expect("spawn_blocking join")
            .expect("send_request");

        match response {
            Payload::SignedProposalResponse(resp) => {
                let proposal = resp.proposal.expect("signed proposal present");
                assert_eq!(proposal.signature, vec![0xAA; 4]);
                assert_eq!(proposal.timestamp, Some(privval::Timestamp { seconds: 0, nanos: 42 }));
                assert!(resp.error.is_none());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
