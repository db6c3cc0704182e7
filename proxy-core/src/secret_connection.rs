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

//! Authenticated, encrypted duplex channel over a raw byte stream.
//!
//! spec.md treats the secret connection as an external collaborator: "the
//! cryptographic primitives of the encrypted transport (treated as a black
//! box that wraps a plain byte stream)". We still need one concrete
//! implementation to have a runnable proxy, so this module does an X25519
//! ephemeral key exchange (mirroring CometBFT's own `p2p/conn.SecretConnection`
//! use of the same primitive) followed by ChaCha20Poly1305-sealed, fixed-size
//! frames. It is not wire-compatible with CometBFT's exact handshake
//! transcript — that level of interop is explicitly out of scope here — but
//! gives every caller in this crate a real `Read + Write` duplex channel with
//! the same security properties.

use std::io::{self, Read, Write};

use chacha20poly1305::aead::{Aead, KeyInit, Payload as AeadPayload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public};

/// Plaintext payload bytes per sealed frame.
const FRAME_SIZE: usize = 1024;
const TAG_SIZE: usize = 16;
const SEALED_FRAME_SIZE: usize = 4 + FRAME_SIZE + TAG_SIZE;

#[derive(Debug)]
pub struct HandshakeError(pub String);

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for HandshakeError {}

/// Wraps an inner `Read + Write` stream in an authenticated, encrypted
/// duplex channel. Construction performs the full handshake synchronously,
/// matching the Go source's `cometp2pconn.MakeSecretConnection` call, which
/// blocks the dial loop until the handshake completes or fails.
pub struct SecretConnection<IO> {
    io: IO,
    send_key: Key,
    recv_key: Key,
    send_nonce: u64,
    recv_nonce: u64,
    recv_buffer: Vec<u8>,
    /// The remote's long-term identity key, authenticated by the handshake
    /// signature. Exposed for callers that want to pin or log it.
    pub remote_pub_key: VerifyingKey,
}

impl<IO: Read + Write> SecretConnection<IO> {
    pub fn new(mut io: IO, identity: &SigningKey) -> Result<Self, HandshakeError> {
        // 1. Ephemeral X25519 key exchange.
        let local_eph_secret = EphemeralSecret::random_from_rng(OsRng);
        let local_eph_public = X25519Public::from(&local_eph_secret);

        io.write_all(local_eph_public.as_bytes())
            .map_err(|e| HandshakeError(format!("writing ephemeral key: {e}")))?;
        let mut remote_eph_bytes = [0u8; 32];
        io.read_exact(&mut remote_eph_bytes)
            .map_err(|e| HandshakeError(format!("reading ephemeral key: {e}")))?;
        let remote_eph_public = X25519Public::from(remote_eph_bytes);

        let shared_secret = local_eph_secret.diffie_hellman(&remote_eph_public);

        // 2. Derive two directional keys from the shared secret. Ordering by
        // ephemeral public key bytes gives both sides the same assignment
        // without an extra round trip.
        let hk = Hkdf::<Sha256>::new(None, shared_secret.as_bytes());
        let mut okm = [0u8; 64];
        hk.expand(b"horcrux-proxy secret connection v1", &mut okm)
            .map_err(|e| HandshakeError(format!("key derivation failed: {e}")))?;
        let (first, second) = okm.split_at(32);
        let local_is_lower = local_eph_public.as_bytes()[..] < remote_eph_bytes[..];
        let (send_key, recv_key) = if local_is_lower {
            (first, second)
        } else {
            (second, first)
        };
        let send_key = *Key::from_slice(send_key);
        let recv_key = *Key::from_slice(recv_key);

        // 3. Authenticate: each side signs the shared secret with its
        // long-term identity key and exchanges (pubkey, signature) pairs
        // over the not-yet-authenticated (but already encrypted-in-spirit)
        // channel, proving possession of the identity key advertised.
        let local_sig = identity.sign(shared_secret.as_bytes());
        let local_verifying = identity.verifying_key();

        io.write_all(local_verifying.as_bytes())
            .map_err(|e| HandshakeError(format!("writing identity key: {e}")))?;
        io.write_all(&local_sig.to_bytes())
            .map_err(|e| HandshakeError(format!("writing identity signature: {e}")))?;

        let mut remote_verifying_bytes = [0u8; 32];
        io.read_exact(&mut remote_verifying_bytes)
            .map_err(|e| HandshakeError(format!("reading identity key: {e}")))?;
        let mut remote_sig_bytes = [0u8; 64];
        io.read_exact(&mut remote_sig_bytes)
            .map_err(|e| HandshakeError(format!("reading identity signature: {e}")))?;

        let remote_verifying = VerifyingKey::from_bytes(&remote_verifying_bytes)
            .map_err(|e| HandshakeError(format!("invalid remote identity key: {e}")))?;
        let remote_sig = ed25519_dalek::Signature::from_bytes(&remote_sig_bytes);
        remote_verifying
            .verify(shared_secret.as_bytes(), &remote_sig)
            .map_err(|e| HandshakeError(format!("remote identity signature invalid: {e}")))?;

        Ok(Self {
            io,
            send_key,
            recv_key,
            send_nonce: 0,
            recv_nonce: 0,
            recv_buffer: Vec::new(),
            remote_pub_key: remote_verifying,
        })
    }

    fn nonce_bytes(counter: u64) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[..8].copy_from_slice(&counter.to_le_bytes());
        *Nonce::from_slice(&bytes)
    }

    fn seal_frame(&mut self, plaintext: &[u8]) -> io::Result<Vec<u8>> {
        debug_assert!(plaintext.len() <= FRAME_SIZE);
        let cipher = ChaCha20Poly1305::new(&self.send_key);
        let mut framed = vec![0u8; 4 + FRAME_SIZE];
        framed[..4].copy_from_slice(&(plaintext.len() as u32).to_le_bytes());
        framed[4..4 + plaintext.len()].copy_from_slice(plaintext);

        let nonce = Self::nonce_bytes(self.send_nonce);
        self.send_nonce += 1;
        cipher
            .encrypt(&nonce, AeadPayload::from(&framed[..]))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("seal failed: {e}")))
    }

    fn open_frame(&mut self, sealed: &[u8]) -> io::Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(&self.recv_key);
        let nonce = Self::nonce_bytes(self.recv_nonce);
        self.recv_nonce += 1;
        let framed = cipher
            .decrypt(&nonce, AeadPayload::from(sealed))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("open failed: {e}")))?;
        let len = u32::from_le_bytes(framed[..4].try_into().unwrap()) as usize;
        if len > FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "decrypted frame length header exceeds frame size",
            ));
        }
        Ok(framed[4..4 + len].to_vec())
    }
}

impl<IO: Read + Write> Read for SecretConnection<IO> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.recv_buffer.is_empty() {
            let mut sealed = vec![0u8; SEALED_FRAME_SIZE];
            self.io.read_exact(&mut sealed)?;
            self.recv_buffer = self.open_frame(&sealed)?;
        }
        let n = buf.len().min(self.recv_buffer.len());
        buf[..n].copy_from_slice(&self.recv_buffer[..n]);
        self.recv_buffer.drain(..n);
        Ok(n)
    }
}

impl<IO: Read + Write> Write for SecretConnection<IO> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        for chunk in buf.chunks(FRAME_SIZE) {
            let sealed = self.seal_frame(chunk)?;
            self.io.write_all(&sealed)?;
            written += chunk.len();
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.io.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::mpsc;
    use std::thread;

    /// A pipe-backed duplex stream, used because `SecretConnection` needs a
    /// real back-and-forth `Read + Write` pair for its handshake.
    struct Pipe {
        rx: mpsc::Receiver<Vec<u8>>,
        tx: mpsc::Sender<Vec<u8>>,
        buf: Cursor<Vec<u8>>,
    }

    impl Read for Pipe {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            loop {
                let n = self.buf.read(out)?;
                if n > 0 {
                    return Ok(n);
                }
                match self.rx.recv() {
                    Ok(chunk) => self.buf = Cursor::new(chunk),
                    Err(_) => return Ok(0),
                }
            }
        }
    }

    impl Write for Pipe {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.tx
                .send(data.to_vec())
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
            Ok(data.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn pipe_pair() -> (Pipe, Pipe) {
        let (tx_a, rx_b) = mpsc::channel();
        let (tx_b, rx_a) = mpsc::channel();
        (
            Pipe {
                rx: rx_a,
                tx: tx_a,
                buf: Cursor::new(Vec::new()),
            },
            Pipe {
                rx: rx_b,
                tx: tx_b,
                buf: Cursor::new(Vec::new()),
            },
        )
    }

    #[test]
    fn handshake_then_round_trip() {
        let (a, b) = pipe_pair();
        let key_a = SigningKey::generate(&mut rand::rngs::OsRng);
        let key_b = SigningKey::generate(&mut rand::rngs::OsRng);

        let handle = thread::spawn(move || {
            let mut conn = SecretConnection::new(a, &key_a).unwrap();
            conn.write_all(b"hello from a").unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).unwrap();
            String::from_utf8(buf[..n].to_vec()).unwrap()
        });

        let mut conn_b = SecretConnection::new(b, &key_b).unwrap();
        let mut buf = [0u8; 64];
        let n = conn_b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello from a");
        conn_b.write_all(b"hello from b").unwrap();

        let received = handle.join().unwrap();
        assert_eq!(received, "hello from b");
    }
}
