use thiserror::Error;

use crate::varint::{self, VarIntError};

/// Default protocol version advertised in the handshake (1.21.4).
pub const PROTOCOL_VERSION: i32 = 769;

/// Frames whose declared length exceeds this are rejected outright.
pub const MAX_FRAME_BYTES: usize = 100 * 1024;

const PACKET_HANDSHAKE: i32 = 0;
const PACKET_STATUS_REQUEST: i32 = 0;
const PACKET_STATUS_RESPONSE: i32 = 0;
const PACKET_PING: i32 = 1;
const NEXT_STATE_STATUS: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("oversized packet ({0} bytes)")]
    Oversized(usize),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

impl From<VarIntError> for FrameError {
    fn from(_: VarIntError) -> Self {
        FrameError::Malformed("bad VarInt")
    }
}

fn frame(packet_id: i32, payload: &[u8]) -> Vec<u8> {
    let body_len = varint::encoding_length(packet_id) + payload.len();
    let mut out = Vec::with_capacity(varint::encoding_length(body_len as i32) + body_len);
    varint::encode(body_len as i32, &mut out);
    varint::encode(packet_id, &mut out);
    out.extend_from_slice(payload);
    out
}

/// Handshake packet: protocol version, server address, port, next state = status.
pub fn handshake_packet(protocol_version: i32, host: &str, port: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(host.len() + 8);
    varint::encode(protocol_version, &mut payload);
    varint::encode(host.len() as i32, &mut payload);
    payload.extend_from_slice(host.as_bytes());
    payload.extend_from_slice(&port.to_be_bytes());
    varint::encode(NEXT_STATE_STATUS, &mut payload);
    frame(PACKET_HANDSHAKE, &payload)
}

/// Status request packet (empty payload).
pub fn status_request_packet() -> Vec<u8> {
    frame(PACKET_STATUS_REQUEST, &[])
}

/// Ping packet carrying a caller-supplied timestamp the server echoes back.
pub fn ping_packet(payload: i64) -> Vec<u8> {
    frame(PACKET_PING, &payload.to_be_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// Status response decoded; carries the JSON string verbatim.
    Status(String),
    /// Pong observed after `expect_pong`.
    Pong,
}

/// Reassembles length-prefixed packets from arbitrary chunk boundaries.
///
/// Feed every received chunk through [`StatusFramer::push`]. The first
/// complete frame yields [`FrameEvent::Status`]; after [`StatusFramer::expect_pong`]
/// the next ping-response frame yields [`FrameEvent::Pong`]. Servers that
/// stream the pong inside the same chunk as the status body are handled: the
/// leftover bytes stay buffered and are re-examined when the pong is expected.
#[derive(Debug, Default)]
pub struct StatusFramer {
    buf: Vec<u8>,
    awaiting_pong: bool,
}

impl StatusFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and try to complete a frame.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<FrameEvent>, FrameError> {
        self.buf.extend_from_slice(chunk);
        self.drain_frames()
    }

    /// Arm pong detection. Checks bytes already buffered, so a pong that
    /// arrived glued to the status response is surfaced immediately.
    pub fn expect_pong(&mut self) -> Result<Option<FrameEvent>, FrameError> {
        self.awaiting_pong = true;
        self.drain_frames()
    }

    fn drain_frames(&mut self) -> Result<Option<FrameEvent>, FrameError> {
        loop {
            let (data_len, header_len) = match varint::decode(&self.buf, 0) {
                Ok(v) => v,
                Err(VarIntError::Incomplete) => return Ok(None),
                Err(VarIntError::TooLarge) => {
                    return Err(FrameError::Malformed("bad length prefix"))
                }
            };
            if data_len <= 0 {
                return Err(FrameError::Malformed("non-positive frame length"));
            }
            let full_len = header_len + data_len as usize;
            if full_len > MAX_FRAME_BYTES {
                return Err(FrameError::Oversized(full_len));
            }
            if self.buf.len() < full_len {
                return Ok(None);
            }

            let body = &self.buf[header_len..full_len];
            let (packet_id, id_len) = varint::decode(body, 0)?;

            if self.awaiting_pong {
                let event = (packet_id == PACKET_PING).then_some(FrameEvent::Pong);
                self.buf.drain(..full_len);
                match event {
                    Some(e) => return Ok(Some(e)),
                    // Stray frame between status and pong; skip it.
                    None => continue,
                }
            }

            if packet_id != PACKET_STATUS_RESPONSE {
                return Err(FrameError::Malformed("unexpected packet id"));
            }
            let (str_len, len_len) = varint::decode(body, id_len)?;
            if str_len < 0 {
                return Err(FrameError::Malformed("negative string length"));
            }
            let start = id_len + len_len;
            let end = start + str_len as usize;
            if end > body.len() {
                return Err(FrameError::Malformed("string exceeds frame"));
            }
            let json = String::from_utf8_lossy(&body[start..end]).into_owned();
            self.buf.drain(..full_len);
            return Ok(Some(FrameEvent::Status(json)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_response(json: &str) -> Vec<u8> {
        let mut payload = Vec::new();
        varint::encode(json.len() as i32, &mut payload);
        payload.extend_from_slice(json.as_bytes());
        frame(0, &payload)
    }

    #[test]
    fn handshake_layout() {
        let pkt = handshake_packet(769, "mc.example.com", 25565);
        let (total, off) = varint::decode(&pkt, 0).unwrap();
        assert_eq!(total as usize, pkt.len() - off);
        let (id, _) = varint::decode(&pkt, off).unwrap();
        assert_eq!(id, 0);
        // port is the two bytes before the trailing next-state VarInt
        assert_eq!(&pkt[pkt.len() - 3..pkt.len() - 1], &25565u16.to_be_bytes());
        assert_eq!(pkt[pkt.len() - 1], 1);
    }

    #[test]
    fn reassembles_any_chunking() {
        let json = r#"{"version":{"name":"Paper","protocol":769}}"#;
        let wire = status_response(json);
        for split in 1..wire.len() {
            let mut framer = StatusFramer::new();
            assert_eq!(framer.push(&wire[..split]).unwrap(), None);
            let event = framer.push(&wire[split..]).unwrap();
            assert_eq!(event, Some(FrameEvent::Status(json.to_string())));
        }
    }

    #[test]
    fn single_chunk_with_trailing_pong() {
        let json = r#"{"players":{"online":3,"max":20}}"#;
        let mut wire = status_response(json);
        wire.extend_from_slice(&ping_packet(12345));

        let mut framer = StatusFramer::new();
        let event = framer.push(&wire).unwrap();
        assert_eq!(event, Some(FrameEvent::Status(json.to_string())));
        // pong bytes were buffered; surfacing them only needs arming
        assert_eq!(framer.expect_pong().unwrap(), Some(FrameEvent::Pong));
    }

    #[test]
    fn pong_in_separate_chunk() {
        let mut framer = StatusFramer::new();
        framer.push(&status_response("{}")).unwrap();
        assert_eq!(framer.expect_pong().unwrap(), None);
        assert_eq!(
            framer.push(&ping_packet(99)).unwrap(),
            Some(FrameEvent::Pong)
        );
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut framer = StatusFramer::new();
        let mut wire = Vec::new();
        varint::encode((MAX_FRAME_BYTES + 1) as i32, &mut wire);
        assert!(matches!(
            framer.push(&wire),
            Err(FrameError::Oversized(_))
        ));
    }

    #[test]
    fn garbage_length_prefix_rejected() {
        let mut framer = StatusFramer::new();
        assert!(framer.push(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]).is_err());
    }
}
