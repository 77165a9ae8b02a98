/* Copyright 2023- The Binedge, Lda team. All rights reserved.
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *     http://www.apache.org/licenses/LICENSE-2.0
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The wire framing: a 4-byte little-endian length prefix followed by a
//! JSON body. `tokio_util::codec::LengthDelimitedCodec` defaults to
//! big-endian framing with its own header variants, so this hand-rolls the
//! exact prefix the protocol specifies on top of the same `Decoder`/
//! `Encoder` traits `tokio_util` provides.

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::DaemonError;

/// Initial buffer capacity for each session's read/write buffers.
pub const INITIAL_BUFFER_SIZE: usize = 128 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;

pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = Value;
    type Error = DaemonError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, DaemonError> {
        if src.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }

        let len = u32::from_le_bytes(src[..LENGTH_PREFIX_BYTES].try_into().unwrap()) as usize;

        if src.len() < LENGTH_PREFIX_BYTES + len {
            src.reserve(LENGTH_PREFIX_BYTES + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_BYTES);
        let body = src.split_to(len);

        let value = serde_json::from_slice(&body)
            .map_err(|err| DaemonError::Generic(format!("malformed request body: {err}")))?;
        Ok(Some(value))
    }
}

impl Encoder<Value> for WireCodec {
    type Error = DaemonError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), DaemonError> {
        let body = serde_json::to_vec(&item)
            .map_err(|err| DaemonError::Generic(format!("failed to encode response: {err}")))?;
        dst.reserve(LENGTH_PREFIX_BYTES + body.len());
        dst.put_u32_le(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_one_frame() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
        let value = serde_json::json!({"request": {"name": "echoContext", "requestId": 1}});

        codec.encode(value.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, value);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_returns_none() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u32_le(100);
        buf.put_slice(&[1, 2, 3]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn two_frames_back_to_back() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
        let a = serde_json::json!({"a": 1});
        let b = serde_json::json!({"b": 2});

        codec.encode(a.clone(), &mut buf).unwrap();
        codec.encode(b.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(a));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(b));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}
