//! Sealed-frame codec for session streams.
//!
//! Every frame on a session socket is `seal || payload`: the 4 magic bytes,
//! a big-endian u32 payload length, then the payload (packet id + body).
//! This codec plugs into `tokio_util`'s `FramedRead`/`Framed` machinery.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use cairn_core::wire::{self, MAX_FRAME_BYTES, SEAL_BYTES};

pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        if src.len() < SEAL_BYTES {
            return Ok(None);
        }
        let length = wire::read_seal(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))? as usize;
        if src.len() < SEAL_BYTES + length {
            src.reserve(SEAL_BYTES + length - src.len());
            return Ok(None);
        }
        src.advance(SEAL_BYTES);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        if payload.len() > MAX_FRAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                wire::WireError::FrameTooLarge(payload.len()),
            ));
        }
        let start = dst.len();
        dst.reserve(SEAL_BYTES + payload.len());
        dst.extend_from_slice(&[0u8; SEAL_BYTES]);
        dst.extend_from_slice(&payload);
        wire::seal(&mut dst[start..]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"\x02ping-body"), &mut buf)
            .unwrap();

        assert_eq!(&buf[..4], &wire::FRAME_MAGIC);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"\x02ping-body");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_input_waits_for_more() {
        let mut codec = FrameCodec;
        let mut full = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"\x00hello"), &mut full)
            .unwrap();

        let mut partial = BytesMut::from(&full[..5]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[5..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn back_to_back_frames_decode_separately() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"\x02"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"\x03"), &mut buf).unwrap();

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"\x02");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"\x03");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn bad_magic_is_an_error() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&b"XXXX\x00\x00\x00\x00"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn oversized_frame_is_rejected_on_encode() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        let huge = Bytes::from(vec![0u8; MAX_FRAME_BYTES + 1]);
        assert!(codec.encode(huge, &mut buf).is_err());
    }
}
