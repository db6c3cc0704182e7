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

//! Process identity: the long-term ed25519 keypair a proxy instance
//! authenticates its secret connections with.
//!
//! The Go source generates a fresh `cometcryptoed25519.PrivKey` at process
//! start in `signer/remote_signer.go` and never persists it — sentries only
//! need the connection to be authenticated for the lifetime of the process,
//! not for the key to be stable across restarts. We do the same.

use ed25519_dalek::SigningKey;
use rand_core::OsRng;

/// Generates a fresh identity keypair, regenerated each process start.
pub fn generate() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}
