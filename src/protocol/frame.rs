//! Wire frame codec.
//!
//! Every frame on the wire is `[size:u16 BE][flags:u8][payload]`, where
//! `size` counts payload bytes only. When the control flag is set the payload
//! starts with a 6-byte ASCII action code followed by an opaque (JSON) body.
//!
//! Two entry points are provided:
//! - [`Frame::encode`] / [`Frame::decode`] for one complete buffer
//!   (datagram transports)
//! - [`FrameCodec`] for reassembling frames out of a byte stream (TCP)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::warn;

use crate::error::{Error, Result};

/// Size of the fixed frame header (size + flags).
pub const HEADER_SIZE: usize = 3;

/// Width of a control action code.
pub const ACTION_SIZE: usize = 6;

/// Default upper bound for a frame payload.
pub const DEFAULT_MAX_SIZE: usize = 4096;

/// Flag bit marking a control frame.
pub const FLAG_CONTROL: u8 = 0x01;

/// Control actions carried in the first 6 payload bytes of a control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    LoginReq,
    LoginResp,
    IpAddrReq,
    IpAddrResp,
    PingReq,
    PongResp,
    LeftReq,
    SignReq,
    NeighborReq,
    NeighborResp,
}

impl Action {
    /// All known actions.
    pub const ALL: [Action; 10] = [
        Action::LoginReq,
        Action::LoginResp,
        Action::IpAddrReq,
        Action::IpAddrResp,
        Action::PingReq,
        Action::PongResp,
        Action::LeftReq,
        Action::SignReq,
        Action::NeighborReq,
        Action::NeighborResp,
    ];

    /// The stable on-wire code.
    pub fn code(&self) -> &'static [u8; ACTION_SIZE] {
        match self {
            Action::LoginReq => b"logi= ",
            Action::LoginResp => b"logi: ",
            Action::IpAddrReq => b"ipad= ",
            Action::IpAddrResp => b"ipad: ",
            Action::PingReq => b"ping= ",
            Action::PongResp => b"pong: ",
            Action::LeftReq => b"left= ",
            Action::SignReq => b"sign= ",
            Action::NeighborReq => b"neig= ",
            Action::NeighborResp => b"neig: ",
        }
    }

    /// Parse an on-wire action code.
    pub fn from_code(code: &[u8]) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.code() == code)
    }

    /// Human-readable name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Action::LoginReq => "login_req",
            Action::LoginResp => "login_resp",
            Action::IpAddrReq => "ip_req",
            Action::IpAddrResp => "ip_resp",
            Action::PingReq => "ping_req",
            Action::PongResp => "pong_resp",
            Action::LeftReq => "left_req",
            Action::SignReq => "sign_req",
            Action::NeighborReq => "neighbor_req",
            Action::NeighborResp => "neighbor_resp",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Raw Ethernet (TAP) or synthesized Ethernet (TUN) payload.
    Data(Bytes),
    /// Protocol action with its body.
    Control { action: Action, body: Bytes },
}

impl Frame {
    /// Create a data frame.
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Frame::Data(payload.into())
    }

    /// Create a control frame.
    pub fn control(action: Action, body: impl Into<Bytes>) -> Self {
        Frame::Control {
            action,
            body: body.into(),
        }
    }

    /// Create a control frame whose body is the JSON encoding of `value`.
    pub fn control_json<T: serde::Serialize>(action: Action, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(Frame::control(action, body))
    }

    /// Whether this is a control frame.
    pub fn is_control(&self) -> bool {
        matches!(self, Frame::Control { .. })
    }

    /// The action of a control frame.
    pub fn action(&self) -> Option<Action> {
        match self {
            Frame::Control { action, .. } => Some(*action),
            Frame::Data(_) => None,
        }
    }

    /// Payload length (action code included for control frames).
    pub fn payload_len(&self) -> usize {
        match self {
            Frame::Data(data) => data.len(),
            Frame::Control { body, .. } => ACTION_SIZE + body.len(),
        }
    }

    /// Total encoded length including the header.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload_len()
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf, u16::MAX as usize)?;
        Ok(buf.freeze())
    }

    /// Encode into `buf`, refusing payloads larger than `max_size`.
    pub fn encode_into(&self, buf: &mut BytesMut, max_size: usize) -> Result<()> {
        let size = self.payload_len();
        if size > max_size || size > u16::MAX as usize {
            return Err(Error::format(format!(
                "payload of {} bytes exceeds maximum {}",
                size, max_size
            )));
        }

        buf.reserve(HEADER_SIZE + size);
        buf.put_u16(size as u16);
        match self {
            Frame::Data(data) => {
                buf.put_u8(0);
                buf.put_slice(data);
            }
            Frame::Control { action, body } => {
                buf.put_u8(FLAG_CONTROL);
                buf.put_slice(action.code());
                buf.put_slice(body);
            }
        }
        Ok(())
    }

    /// Decode exactly one frame from `data`.
    ///
    /// Truncated input, trailing bytes and oversize payloads are format errors.
    pub fn decode(data: &[u8], max_size: usize) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::format(format!("truncated header: {} bytes", data.len())));
        }
        let size = u16::from_be_bytes([data[0], data[1]]) as usize;
        if size > max_size {
            return Err(Error::format(format!(
                "declared size {} exceeds maximum {}",
                size, max_size
            )));
        }
        let payload = &data[HEADER_SIZE..];
        if payload.len() < size {
            return Err(Error::format(format!(
                "truncated payload: have {}, need {}",
                payload.len(),
                size
            )));
        }
        if payload.len() > size {
            return Err(Error::format(format!(
                "{} trailing bytes after frame",
                payload.len() - size
            )));
        }
        Self::from_parts(data[2], Bytes::copy_from_slice(payload))
    }

    fn from_parts(flags: u8, payload: Bytes) -> Result<Self> {
        if flags & FLAG_CONTROL == 0 {
            return Ok(Frame::Data(payload));
        }
        if payload.len() < ACTION_SIZE {
            return Err(Error::format(format!(
                "control frame too short: {} bytes",
                payload.len()
            )));
        }
        let action = Action::from_code(&payload[..ACTION_SIZE]).ok_or_else(|| {
            Error::format(format!(
                "unknown action {:?}",
                String::from_utf8_lossy(&payload[..ACTION_SIZE])
            ))
        })?;
        Ok(Frame::Control {
            action,
            body: payload.slice(ACTION_SIZE..),
        })
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Data(data) => write!(f, "data({} bytes)", data.len()),
            Frame::Control { action, body } => write!(f, "{}({} bytes)", action, body.len()),
        }
    }
}

/// Streaming decoder for stream transports.
///
/// Bytes are fed as they arrive; complete frames are returned and partial
/// input stays buffered until the rest shows up.
#[derive(Debug)]
pub struct FrameCodec {
    buffer: BytesMut,
    max_size: usize,
    dropped: u64,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl FrameCodec {
    /// Create a codec that accepts payloads up to `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_size + HEADER_SIZE),
            max_size,
            dropped: 0,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of buffered, not yet decoded bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Return and reset the count of frames skipped as malformed.
    pub fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }

    /// Drop any partial input.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Feed received bytes and return every complete frame.
    ///
    /// A complete frame with a bad control header is logged and skipped.
    /// An oversize declaration loses the frame boundary: the error is
    /// returned and the caller is expected to drop the connection.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Decode the next well-formed buffered frame, if complete.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if self.buffer.len() < HEADER_SIZE {
                return Ok(None);
            }
            let size = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
            if size > self.max_size {
                return Err(Error::format(format!(
                    "declared size {} exceeds maximum {}",
                    size, self.max_size
                )));
            }
            if self.buffer.len() < HEADER_SIZE + size {
                return Ok(None);
            }

            let flags = self.buffer[2];
            self.buffer.advance(HEADER_SIZE);
            let payload = self.buffer.split_to(size).freeze();
            match Frame::from_parts(flags, payload) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => {
                    warn!(error = %e, "Dropping malformed frame");
                    self.dropped += 1;
                }
            }
        }
    }

    /// Encode a frame honoring this codec's size limit.
    pub fn encode(&self, frame: &Frame) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        frame.encode_into(&mut buf, self.max_size)?;
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_codes_are_unique() {
        for a in Action::ALL {
            assert_eq!(a.code().len(), ACTION_SIZE);
            assert_eq!(Action::from_code(a.code()), Some(a));
        }
        assert_eq!(Action::from_code(b"nego= "), None);
        assert_eq!(Action::LoginReq.to_string(), "login_req");
        assert_eq!(Action::IpAddrResp.to_string(), "ip_resp");
    }

    #[test]
    fn test_encode_data_frame() {
        let frame = Frame::data(vec![0xAA, 0xBB, 0xCC]);
        let wire = frame.encode().unwrap();
        assert_eq!(&wire[..], &[0x00, 0x03, 0x00, 0xAA, 0xBB, 0xCC]);
        assert_eq!(Frame::decode(&wire, DEFAULT_MAX_SIZE).unwrap(), frame);
    }

    #[test]
    fn test_encode_control_frame() {
        let frame = Frame::control(Action::LoginResp, &b"okay"[..]);
        let wire = frame.encode().unwrap();
        assert_eq!(&wire[..3], &[0x00, 10, FLAG_CONTROL]);
        assert_eq!(&wire[3..9], b"logi: ");
        assert_eq!(&wire[9..], b"okay");

        let decoded = Frame::decode(&wire, DEFAULT_MAX_SIZE).unwrap();
        assert_eq!(decoded.action(), Some(Action::LoginResp));
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_control_frame_with_empty_body() {
        let frame = Frame::control(Action::NeighborReq, Bytes::new());
        let wire = frame.encode().unwrap();
        assert_eq!(wire.len(), HEADER_SIZE + ACTION_SIZE);
        assert_eq!(Frame::decode(&wire, DEFAULT_MAX_SIZE).unwrap(), frame);
    }

    #[test]
    fn test_decode_truncated() {
        assert!(matches!(Frame::decode(&[], 100), Err(Error::Format(_))));
        assert!(matches!(Frame::decode(&[0x00, 0x05], 100), Err(Error::Format(_))));
        assert!(matches!(
            Frame::decode(&[0x00, 0x05, 0x00, 1, 2], 100),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_decode_rejects_oversize_and_trailing() {
        let big = Frame::data(vec![0u8; 200]).encode().unwrap();
        assert!(matches!(Frame::decode(&big, 100), Err(Error::Format(_))));

        let mut wire = BytesMut::from(&Frame::data(vec![1, 2]).encode().unwrap()[..]);
        wire.put_u8(9);
        assert!(matches!(Frame::decode(&wire, 100), Err(Error::Format(_))));
    }

    #[test]
    fn test_decode_bad_control() {
        // Shorter than an action code
        assert!(Frame::decode(&[0x00, 0x03, FLAG_CONTROL, b'l', b'o', b'g'], 100).is_err());

        let mut wire = vec![0x00, 0x06, FLAG_CONTROL];
        wire.extend_from_slice(b"xxxx= ");
        assert!(Frame::decode(&wire, 100).is_err());
    }

    #[test]
    fn test_encode_refuses_oversize() {
        let mut buf = BytesMut::new();
        let err = Frame::data(vec![0u8; 64]).encode_into(&mut buf, 32);
        assert!(err.is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_split_input() {
        let mut codec = FrameCodec::new(DEFAULT_MAX_SIZE);
        let a = Frame::control(Action::PingReq, &b"{}"[..]);
        let b = Frame::data(vec![7u8; 100]);

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&a.encode().unwrap());
        wire.extend_from_slice(&b.encode().unwrap());

        // Feed byte by byte up to the middle of the second frame
        let split = 20;
        let mut frames = Vec::new();
        for byte in &wire[..split] {
            frames.extend(codec.feed(&[*byte]).unwrap());
        }
        assert_eq!(frames, vec![a.clone()]);
        assert!(codec.buffered() > 0);

        frames = codec.feed(&wire[split..]).unwrap();
        assert_eq!(frames, vec![b]);
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn test_codec_multiple_frames_in_one_read() {
        let mut codec = FrameCodec::default();
        let mut wire = BytesMut::new();
        for i in 0..5u8 {
            wire.extend_from_slice(&Frame::data(vec![i; 10]).encode().unwrap());
        }
        let frames = codec.feed(&wire).unwrap();
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[4], Frame::data(vec![4u8; 10]));
    }

    #[test]
    fn test_codec_rejects_oversize_declaration() {
        let mut codec = FrameCodec::new(64);
        let result = codec.feed(&[0x01, 0x00, 0x00]);
        assert!(matches!(result, Err(Error::Format(_))));
    }

    #[test]
    fn test_codec_skips_bad_control_frame() {
        let mut codec = FrameCodec::default();
        let data = Frame::data(vec![5u8; 8]);
        let pong = Frame::control(Action::PongResp, &b"{}"[..]);

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&data.encode().unwrap());
        wire.extend_from_slice(&[0x00, 0x08, FLAG_CONTROL]);
        wire.extend_from_slice(b"nego= {}");
        wire.extend_from_slice(&[0x00, 0x03, FLAG_CONTROL, b'p', b'o', b'n']);
        wire.extend_from_slice(&pong.encode().unwrap());

        let frames = codec.feed(&wire).unwrap();
        assert_eq!(frames, vec![data, pong]);
        assert_eq!(codec.take_dropped(), 2);
        assert_eq!(codec.take_dropped(), 0);
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn test_codec_zero_length_data() {
        let mut codec = FrameCodec::default();
        let frames = codec.feed(&[0x00, 0x00, 0x00]).unwrap();
        assert_eq!(frames, vec![Frame::Data(Bytes::new())]);
    }
}
