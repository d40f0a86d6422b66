//! Control frame codec for stream transports.
//!
//! Frame format:
//! `[4-byte length (little-endian)][body type u8][has timestamp u8][timestamp i64 LE]?[payload]`
//!
//! Ping/pong payloads are `[kind u8][ping id u32 LE]`; data payloads are the
//! raw bytes.

use crate::error::TransportError;
use crate::frame::{PingPongFrame, PingPongKind, SignalBody, SignalFrame};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const BODY_PING_PONG: u8 = 1;
const BODY_DATA: u8 = 2;
const KIND_PING: u8 = 1;
const KIND_PONG: u8 = 2;
const LENGTH_PREFIX: usize = 4;
const PING_PONG_PAYLOAD: usize = 5;

/// Length-prefixed codec for [`SignalFrame`]s.
#[derive(Debug, Clone)]
pub struct ControlFrameCodec {
    max_frame_size: usize,
}

impl ControlFrameCodec {
    /// Creates a codec with the specified maximum frame size.
    ///
    /// # Arguments
    /// * `max_frame_size` - Maximum allowed frame size in bytes, excluding the length prefix
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Returns the maximum frame size.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn decode_body(mut frame: BytesMut) -> Result<SignalFrame, TransportError> {
        if frame.len() < 2 {
            return Err(TransportError::invalid_frame("frame shorter than its header"));
        }
        let body_type = frame.get_u8();
        let timestamp_ms = match frame.get_u8() {
            0 => None,
            1 => {
                if frame.len() < 8 {
                    return Err(TransportError::invalid_frame("truncated timestamp"));
                }
                Some(frame.get_i64_le())
            }
            flag => {
                return Err(TransportError::invalid_frame(format!(
                    "invalid timestamp flag {flag}"
                )));
            }
        };

        let body = match body_type {
            BODY_PING_PONG => {
                if frame.len() != PING_PONG_PAYLOAD {
                    return Err(TransportError::invalid_frame(format!(
                        "ping-pong payload of {} bytes",
                        frame.len()
                    )));
                }
                let kind = match frame.get_u8() {
                    KIND_PING => PingPongKind::Ping,
                    KIND_PONG => PingPongKind::Pong,
                    other => {
                        return Err(TransportError::invalid_frame(format!(
                            "unknown ping-pong kind {other}"
                        )));
                    }
                };
                let ping_id = frame.get_u32_le();
                SignalBody::PingPong(PingPongFrame { kind, ping_id })
            }
            BODY_DATA => SignalBody::Data(frame.freeze()),
            other => {
                return Err(TransportError::invalid_frame(format!(
                    "unknown body type {other}"
                )));
            }
        };

        Ok(SignalFrame { timestamp_ms, body })
    }

    fn encoded_len(frame: &SignalFrame) -> usize {
        let timestamp = if frame.timestamp_ms.is_some() { 8 } else { 0 };
        let payload = match &frame.body {
            SignalBody::PingPong(_) => PING_PONG_PAYLOAD,
            SignalBody::Data(data) => data.len(),
        };
        2 + timestamp + payload
    }
}

impl Default for ControlFrameCodec {
    fn default() -> Self {
        Self::new(64 * 1024) // 64KB default
    }
}

impl Decoder for ControlFrameCodec {
    type Item = SignalFrame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > self.max_frame_size {
            return Err(TransportError::frame_too_large(length, self.max_frame_size).into());
        }

        if src.len() < LENGTH_PREFIX + length {
            src.reserve(LENGTH_PREFIX + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let frame = src.split_to(length);
        Self::decode_body(frame).map(Some).map_err(Into::into)
    }
}

impl Encoder<&SignalFrame> for ControlFrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: &SignalFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = Self::encoded_len(item);
        if length > self.max_frame_size {
            return Err(TransportError::frame_too_large(length, self.max_frame_size).into());
        }

        dst.reserve(LENGTH_PREFIX + length);
        dst.put_u32_le(length as u32);

        match &item.body {
            SignalBody::PingPong(_) => dst.put_u8(BODY_PING_PONG),
            SignalBody::Data(_) => dst.put_u8(BODY_DATA),
        }
        match item.timestamp_ms {
            Some(timestamp) => {
                dst.put_u8(1);
                dst.put_i64_le(timestamp);
            }
            None => dst.put_u8(0),
        }
        match &item.body {
            SignalBody::PingPong(frame) => {
                dst.put_u8(match frame.kind {
                    PingPongKind::Ping => KIND_PING,
                    PingPongKind::Pong => KIND_PONG,
                });
                dst.put_u32_le(frame.ping_id);
            }
            SignalBody::Data(data) => dst.put_slice(data),
        }

        Ok(())
    }
}

impl Encoder<SignalFrame> for ControlFrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: SignalFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&SignalFrame>>::encode(self, &item, dst)
    }
}
