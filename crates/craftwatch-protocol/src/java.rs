//! Minecraft Java Edition framing and the handful of packets the agent
//! answers: Handshake, Status Request/Response, Ping/Pong, Login Start and
//! Disconnect. Reference: <https://minecraft.wiki/w/Protocol>.

use std::io;

use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Hard cap on a single framed packet. Anything larger is garbage.
pub const MAX_PACKET_LEN: usize = 2 * 1024 * 1024;

/// Packet id 0x00 in the handshaking, status and login states alike.
pub const PACKET_ID_ZERO: i32 = 0x00;
/// Ping (client) / Pong (server) in the status state.
pub const PACKET_ID_PING: i32 = 0x01;

pub const NEXT_STATE_STATUS: i32 = 1;
pub const NEXT_STATE_LOGIN: i32 = 2;

// Server addresses are nominally capped at 255 chars, but modded clients
// smuggle markers after a NUL, so leave headroom.
const MAX_ADDRESS_LEN: usize = 1024;
const MAX_USERNAME_LEN: usize = 64;

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Read a VarInt (7-bit little-endian groups, continuation in the high bit,
/// at most five bytes) from an async stream.
pub async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<i32> {
    let mut value: u32 = 0;
    for i in 0..5 {
        let byte = reader.read_u8().await?;
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(invalid("VarInt longer than five bytes"))
}

/// Encode a VarInt, treating the value as unsigned 32-bit.
pub fn write_varint(value: i32, out: &mut Vec<u8>) {
    let mut v = value as u32;
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Encode a VarInt-length-prefixed UTF-8 string.
pub fn write_string(s: &str, out: &mut Vec<u8>) {
    write_varint(s.len() as i32, out);
    out.extend_from_slice(s.as_bytes());
}

/// Frame a packet: `length | packet_id | payload`, both prefixes VarInts.
pub fn frame(packet_id: i32, payload: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(payload.len() + 5);
    write_varint(packet_id, &mut inner);
    inner.extend_from_slice(payload);

    let mut out = Vec::with_capacity(inner.len() + 5);
    write_varint(inner.len() as i32, &mut out);
    out.extend_from_slice(&inner);
    out
}

/// Read one framed packet, returning `(packet_id, payload)`.
///
/// Rejects non-positive lengths and anything over [`MAX_PACKET_LEN`]; the
/// caller closes the connection on any error.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<(i32, Vec<u8>)> {
    let length = read_varint(reader).await?;
    if length <= 0 {
        return Err(invalid("non-positive packet length"));
    }
    let length = length as usize;
    if length > MAX_PACKET_LEN {
        return Err(invalid("packet exceeds length cap"));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;

    let mut payload = Payload::new(&body);
    let packet_id = payload.read_varint()?;
    Ok((packet_id, payload.rest().to_vec()))
}

/// Cursor over a decoded packet payload.
pub struct Payload<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Payload<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| invalid("payload truncated"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn read_varint(&mut self) -> io::Result<i32> {
        let mut value: u32 = 0;
        for i in 0..5 {
            let byte = self.take(1)?[0];
            value |= u32::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value as i32);
            }
        }
        Err(invalid("VarInt longer than five bytes"))
    }

    pub fn read_string(&mut self, max_len: usize) -> io::Result<String> {
        let len = self.read_varint()?;
        if len < 0 || len as usize > max_len {
            return Err(invalid("string length out of range"));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| invalid("string is not UTF-8"))
    }

    pub fn read_u16(&mut self) -> io::Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i64(&mut self) -> io::Result<i64> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(arr))
    }
}

/// Client → server handshake (packet 0x00 in the handshaking state).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: i32,
}

impl Handshake {
    pub fn parse(payload: &[u8]) -> io::Result<Self> {
        let mut p = Payload::new(payload);
        Ok(Self {
            protocol_version: p.read_varint()?,
            server_address: p.read_string(MAX_ADDRESS_LEN)?,
            server_port: p.read_u16()?,
            next_state: p.read_varint()?,
        })
    }

    /// Framed encoding; the agent never sends one, test clients do.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        write_varint(self.protocol_version, &mut payload);
        write_string(&self.server_address, &mut payload);
        payload.extend_from_slice(&self.server_port.to_be_bytes());
        write_varint(self.next_state, &mut payload);
        frame(PACKET_ID_ZERO, &payload)
    }
}

/// Client → server Login Start (packet 0x00 in the login state).
///
/// Modern protocols append a UUID; only the name matters here, the rest of
/// the payload is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStart {
    pub username: String,
}

impl LoginStart {
    pub fn parse(payload: &[u8]) -> io::Result<Self> {
        let mut p = Payload::new(payload);
        Ok(Self {
            username: p.read_string(MAX_USERNAME_LEN)?,
        })
    }
}

/// Display fields for a Status Response.
#[derive(Debug, Clone)]
pub struct StatusInfo<'a> {
    pub version_name: &'a str,
    pub protocol: i32,
    pub max_players: u32,
    pub online_players: u32,
    pub motd: &'a str,
    /// `data:image/png;base64,…` URL, passed through verbatim.
    pub favicon: Option<&'a str>,
}

/// Build a framed Status Response (0x00 in the status state).
pub fn build_status_response(info: &StatusInfo<'_>) -> Vec<u8> {
    let mut body = json!({
        "version": {"name": info.version_name, "protocol": info.protocol},
        "players": {"max": info.max_players, "online": info.online_players, "sample": []},
        "description": {"text": info.motd},
    });
    if let Some(favicon) = info.favicon {
        body["favicon"] = json!(favicon);
    }

    let text = body.to_string();
    let mut payload = Vec::with_capacity(text.len() + 5);
    write_string(&text, &mut payload);
    frame(PACKET_ID_ZERO, &payload)
}

/// Build a framed Pong (0x01 in the status state) echoing the client's
/// timestamp.
pub fn build_pong(timestamp: i64) -> Vec<u8> {
    frame(PACKET_ID_PING, &timestamp.to_be_bytes())
}

/// Build a framed Disconnect (0x00 in the login state) carrying a JSON chat
/// component.
pub fn build_disconnect(reason: &str) -> Vec<u8> {
    let chat = json!({"text": reason}).to_string();
    let mut payload = Vec::with_capacity(chat.len() + 5);
    write_string(&chat, &mut payload);
    frame(PACKET_ID_ZERO, &payload)
}
