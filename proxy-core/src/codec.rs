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

//! Length-delimited protobuf framing: a varint byte length followed by the
//! raw encoded message. One frame per logical request/response, matching the
//! wire format CometBFT's `protoio.Delimited{Reader,Writer}` produces.

use std::io::{Read, Write};

use integer_encoding::{VarIntReader, VarIntWriter};
use prost::Message;

use crate::error::CodecError;
use crate::privval;

/// Default cap for the sentry-facing listener (spec.md §4.1).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Cap for the upstream signer-listener path, where requests are small.
pub const LISTENER_MAX_FRAME_SIZE: usize = 10 * 1024;

/// Reads one length-delimited `privval::Message` frame. `max_size` is
/// enforced against the *declared* length before any buffer is allocated, so
/// a hostile or corrupt length prefix cannot trigger an unbounded
/// allocation (spec.md invariant 6).
pub fn read_msg<R: Read>(reader: &mut R, max_size: usize) -> Result<privval::Message, CodecError> {
    let declared: u64 = reader.read_varint()?;
    let declared = declared as usize;
    if declared > max_size {
        return Err(CodecError::FrameTooLarge {
            declared,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; declared];
    let mut read_total = 0;
    while read_total < declared {
        let n = reader.read(&mut buf[read_total..])?;
        if n == 0 {
            return Err(CodecError::ShortRead {
                got: read_total,
                want: declared,
            });
        }
        read_total += n;
    }

    privval::Message::decode(&buf[..]).map_err(CodecError::Malformed)
}

/// Writes one length-delimited `privval::Message` frame in a single
/// `write_all` call so concurrent writers (serialized elsewhere by the
/// signer-listener's mutex) can never interleave partial frames.
pub fn write_msg<W: Write>(writer: &mut W, msg: &privval::Message) -> Result<(), CodecError> {
    let payload_len = msg.encoded_len();
    let mut frame = Vec::with_capacity(10 + payload_len);
    frame.write_varint(payload_len as u64)?;
    msg.encode(&mut frame).map_err(|e| {
        // `encode` into a `Vec` only fails if capacity math overflows, which
        // `encoded_len` already bounds; surface it as malformed rather than
        // inventing a new error variant for an unreachable path.
        CodecError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
    })?;
    writer.write_all(&frame)?;
    Ok(())
}
