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

fn main() -> Result<(), Box<dyn std::error::Error>> {
    prost_build::compile_protos(&["proto/privval.proto"], &["proto"])?;

    // Server code is only used by this crate's own tests, which stand up an
    // in-process stub `RemoteSigner` service to exercise `HorcruxGrpcClient`
    // end to end; the binary crate only ever needs the client.
    tonic_build::configure().compile(&["proto/remote_signer.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/privval.proto");
    println!("cargo:rerun-if-changed=proto/remote_signer.proto");

    Ok(())
}
