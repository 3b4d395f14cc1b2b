//! Minimal Java Edition wire protocol
//!
//! Only what the gateway needs: the handshake, the status exchange
//! (request/response and ping/pong), the first login packet, and the login
//! disconnect. Packets are framed as `VarInt length | VarInt id | payload`
//! with no compression or encryption, which is what every client uses
//! before login completes.

use crate::error::ProtocolError;
use crate::status::StatusPayload;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on an incoming packet, well above any pre-login packet
pub const MAX_PACKET_LEN: usize = 2 * 1024 * 1024;

/// Longest string the protocol allows, in bytes (32767 UTF-16 units)
pub const MAX_STRING_LEN: usize = 32767 * 3;

/// Protocol version sent by the liveness probe. Servers answer status
/// requests for any version; -1 is the customary "just asking" value.
pub const PROBE_PROTOCOL_VERSION: i32 = -1;

/// First byte of a pre-1.7 ("legacy") server list ping
pub const LEGACY_PING_BYTE: u8 = 0xFE;

const MAX_VARINT_BYTES: usize = 5;

/// Packet ids used before login completes
pub mod packet_id {
    pub const HANDSHAKE: i32 = 0x00;
    pub const STATUS_REQUEST: i32 = 0x00;
    pub const STATUS_RESPONSE: i32 = 0x00;
    pub const PING: i32 = 0x01;
    pub const PONG: i32 = 0x01;
    pub const LOGIN_START: i32 = 0x00;
    pub const LOGIN_DISCONNECT: i32 = 0x00;
}

/// State requested by the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status,
    Login,
    /// 1.20.5+ server transfer; handled like a login
    Transfer,
}

impl NextState {
    fn from_wire(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Status),
            2 => Some(Self::Login),
            3 => Some(Self::Transfer),
            _ => None,
        }
    }

    fn to_wire(self) -> i32 {
        match self {
            Self::Status => 1,
            Self::Login => 2,
            Self::Transfer => 3,
        }
    }
}

/// A raw, unframed packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: NextState,
}

/// First packet of the login sequence; only the name matters here
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStart {
    pub username: String,
}

/// Packets a client may send in the status state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRequest {
    Request,
    Ping(i64),
}

pub fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut value = value as u32;
    loop {
        if value & !0x7F == 0 {
            buf.push(value as u8);
            return;
        }
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
}

/// Cursor over a packet body
pub struct PacketReader<'a> {
    buf: &'a [u8],
}

impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() < n {
            return Err(ProtocolError::Closed);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_varint(&mut self) -> Result<i32, ProtocolError> {
        let mut result: u32 = 0;
        for i in 0..MAX_VARINT_BYTES {
            let byte = self.take(1)?[0];
            result |= u32::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result as i32);
            }
        }
        Err(ProtocolError::VarIntTooLong)
    }

    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_varint()?;
        if len < 0 || len as usize > MAX_STRING_LEN {
            return Err(ProtocolError::InvalidString(format!("length {}", len)));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ProtocolError::InvalidString(e.to_string()))
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(arr))
    }
}

/// Builds a packet body and frames it
pub struct PacketBuilder {
    id: i32,
    body: Vec<u8>,
}

impl PacketBuilder {
    pub fn new(id: i32) -> Self {
        Self { id, body: Vec::new() }
    }

    pub fn varint(mut self, value: i32) -> Self {
        write_varint(&mut self.body, value);
        self
    }

    pub fn string(mut self, value: &str) -> Self {
        write_varint(&mut self.body, value.len() as i32);
        self.body.extend_from_slice(value.as_bytes());
        self
    }

    pub fn u16(mut self, value: u16) -> Self {
        self.body.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn i64(mut self, value: i64) -> Self {
        self.body.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Length-prefixed bytes ready for the wire
    pub fn frame(self) -> Vec<u8> {
        let mut id_and_body = Vec::with_capacity(self.body.len() + MAX_VARINT_BYTES);
        write_varint(&mut id_and_body, self.id);
        id_and_body.extend_from_slice(&self.body);

        let mut framed = Vec::with_capacity(id_and_body.len() + MAX_VARINT_BYTES);
        write_varint(&mut framed, id_and_body.len() as i32);
        framed.extend_from_slice(&id_and_body);
        framed
    }
}

pub async fn read_varint<R>(reader: &mut R) -> Result<i32, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut result: u32 = 0;
    for i in 0..MAX_VARINT_BYTES {
        let byte = read_byte(reader).await?;
        result |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(result as i32);
        }
    }
    Err(ProtocolError::VarIntTooLong)
}

async fn read_byte<R>(reader: &mut R) -> Result<u8, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    match reader.read_exact(&mut byte).await {
        Ok(_) => Ok(byte[0]),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ProtocolError::Closed),
        Err(e) => Err(e.into()),
    }
}

/// Read one framed packet
pub async fn read_packet<R>(reader: &mut R) -> Result<Packet, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = read_varint(reader).await?;
    if len <= 0 {
        return Err(ProtocolError::InvalidLength(len));
    }
    let len = len as usize;
    if len > MAX_PACKET_LEN {
        return Err(ProtocolError::PacketTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    match reader.read_exact(&mut buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::Closed)
        }
        Err(e) => return Err(e.into()),
    }

    let mut body = PacketReader::new(&buf);
    let id = body.read_varint()?;
    let consumed = len - body.remaining();
    Ok(Packet {
        id,
        data: buf[consumed..].to_vec(),
    })
}

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

impl Handshake {
    pub fn decode(packet: &Packet) -> Result<Self, ProtocolError> {
        if packet.id != packet_id::HANDSHAKE {
            return Err(ProtocolError::UnexpectedPacket {
                id: packet.id,
                state: "handshake",
            });
        }
        let mut r = PacketReader::new(&packet.data);
        let protocol_version = r.read_varint()?;
        let server_address = r.read_string()?;
        let server_port = r.read_u16()?;
        let next = r.read_varint()?;
        let next_state = NextState::from_wire(next).ok_or(ProtocolError::UnexpectedPacket {
            id: next,
            state: "handshake",
        })?;
        Ok(Self {
            protocol_version,
            server_address,
            server_port,
            next_state,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PacketBuilder::new(packet_id::HANDSHAKE)
            .varint(self.protocol_version)
            .string(&self.server_address)
            .u16(self.server_port)
            .varint(self.next_state.to_wire())
            .frame()
    }
}

impl StatusRequest {
    pub fn decode(packet: &Packet) -> Result<Self, ProtocolError> {
        match packet.id {
            packet_id::STATUS_REQUEST => Ok(Self::Request),
            packet_id::PING => {
                let mut r = PacketReader::new(&packet.data);
                Ok(Self::Ping(r.read_i64()?))
            }
            id => Err(ProtocolError::UnexpectedPacket { id, state: "status" }),
        }
    }
}

impl LoginStart {
    pub fn decode(packet: &Packet) -> Result<Self, ProtocolError> {
        if packet.id != packet_id::LOGIN_START {
            return Err(ProtocolError::UnexpectedPacket {
                id: packet.id,
                state: "login",
            });
        }
        // Later versions append a UUID and signature data; none of it is needed
        let mut r = PacketReader::new(&packet.data);
        Ok(Self {
            username: r.read_string()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        PacketBuilder::new(packet_id::LOGIN_START)
            .string(&self.username)
            .frame()
    }
}

pub fn status_response(payload: &StatusPayload) -> Result<Vec<u8>, ProtocolError> {
    let json = payload.to_json()?;
    Ok(PacketBuilder::new(packet_id::STATUS_RESPONSE)
        .string(&json)
        .frame())
}

pub fn pong(payload: i64) -> Vec<u8> {
    PacketBuilder::new(packet_id::PONG).i64(payload).frame()
}

/// Login disconnect carrying a plain text chat component
pub fn login_disconnect(message: &str) -> Vec<u8> {
    let reason = serde_json::json!({ "text": message }).to_string();
    PacketBuilder::new(packet_id::LOGIN_DISCONNECT)
        .string(&reason)
        .frame()
}

/// Run a list-ping against a server and return the JSON it answered with.
///
/// Any well-formed JSON is returned as is; interpreting it is up to the
/// caller. The caller is also responsible for bounding this with a timeout.
pub async fn query_status<S>(
    stream: &mut S,
    host: &str,
    port: u16,
) -> Result<serde_json::Value, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake = Handshake {
        protocol_version: PROBE_PROTOCOL_VERSION,
        server_address: host.to_string(),
        server_port: port,
        next_state: NextState::Status,
    };
    let mut out = handshake.encode();
    out.extend_from_slice(&PacketBuilder::new(packet_id::STATUS_REQUEST).frame());
    write_frame(stream, &out).await?;

    let packet = read_packet(stream).await?;
    if packet.id != packet_id::STATUS_RESPONSE {
        return Err(ProtocolError::UnexpectedPacket {
            id: packet.id,
            state: "status",
        });
    }
    let json = PacketReader::new(&packet.data).read_string()?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{PlayersInfo, VersionInfo};

    fn varint_bytes(value: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varint(&mut buf, value);
        buf
    }

    #[test]
    fn test_varint_known_encodings() {
        assert_eq!(varint_bytes(0), vec![0x00]);
        assert_eq!(varint_bytes(1), vec![0x01]);
        assert_eq!(varint_bytes(127), vec![0x7F]);
        assert_eq!(varint_bytes(128), vec![0x80, 0x01]);
        assert_eq!(varint_bytes(255), vec![0xFF, 0x01]);
        assert_eq!(varint_bytes(25565), vec![0xDD, 0xC7, 0x01]);
        assert_eq!(varint_bytes(2147483647), vec![0xFF, 0xFF, 0xFF, 0xFF, 0x07]);
        assert_eq!(varint_bytes(-1), vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
    }

    #[test]
    fn test_varint_decode_boundaries() {
        for value in [0, 1, 127, 128, 25565, i32::MAX, -1, i32::MIN] {
            let bytes = varint_bytes(value);
            assert_eq!(PacketReader::new(&bytes).read_varint().unwrap(), value);
        }
    }

    #[test]
    fn test_varint_too_long_rejected() {
        let bytes = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert!(matches!(
            PacketReader::new(&bytes).read_varint(),
            Err(ProtocolError::VarIntTooLong)
        ));
    }

    #[test]
    fn test_truncated_string_rejected() {
        let bytes = [0x05, b'a', b'b'];
        assert!(matches!(
            PacketReader::new(&bytes).read_string(),
            Err(ProtocolError::Closed)
        ));
    }

    #[test]
    fn test_negative_string_length_rejected() {
        let bytes = varint_bytes(-3);
        assert!(matches!(
            PacketReader::new(&bytes).read_string(),
            Err(ProtocolError::InvalidString(_))
        ));
    }

    #[tokio::test]
    async fn test_handshake_decode_from_stream() {
        let handshake = Handshake {
            protocol_version: 765,
            server_address: "play.example.com".to_string(),
            server_port: 25565,
            next_state: NextState::Login,
        };
        let bytes = handshake.encode();
        let mut reader = bytes.as_slice();

        let packet = read_packet(&mut reader).await.unwrap();
        assert_eq!(Handshake::decode(&packet).unwrap(), handshake);
    }

    #[tokio::test]
    async fn test_handshake_unknown_next_state() {
        let bytes = PacketBuilder::new(packet_id::HANDSHAKE)
            .varint(765)
            .string("localhost")
            .u16(25565)
            .varint(9)
            .frame();
        let packet = read_packet(&mut bytes.as_slice()).await.unwrap();

        assert!(Handshake::decode(&packet).is_err());
    }

    #[tokio::test]
    async fn test_oversized_packet_rejected() {
        let bytes = varint_bytes((MAX_PACKET_LEN + 1) as i32);
        let result = read_packet(&mut bytes.as_slice()).await;

        assert!(matches!(result, Err(ProtocolError::PacketTooLarge(_))));
    }

    #[tokio::test]
    async fn test_eof_mid_packet_is_closed() {
        let bytes = [0x10, 0x00, 0x01];
        let result = read_packet(&mut bytes.as_slice()).await;

        assert!(matches!(result, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn test_status_ping_decoded() {
        let bytes = PacketBuilder::new(packet_id::PING).i64(1234567890123).frame();
        let packet = read_packet(&mut bytes.as_slice()).await.unwrap();

        assert_eq!(
            StatusRequest::decode(&packet).unwrap(),
            StatusRequest::Ping(1234567890123)
        );
    }

    #[tokio::test]
    async fn test_login_start_ignores_trailing_fields() {
        let bytes = PacketBuilder::new(packet_id::LOGIN_START)
            .string("steve")
            .i64(0x1234)
            .i64(0x5678)
            .frame();
        let packet = read_packet(&mut bytes.as_slice()).await.unwrap();

        assert_eq!(LoginStart::decode(&packet).unwrap().username, "steve");
    }

    #[tokio::test]
    async fn test_login_disconnect_is_text_component() {
        let bytes = login_disconnect("Come back later");
        let packet = read_packet(&mut bytes.as_slice()).await.unwrap();
        let reason = PacketReader::new(&packet.data).read_string().unwrap();

        assert_eq!(packet.id, packet_id::LOGIN_DISCONNECT);
        assert_eq!(reason, r#"{"text":"Come back later"}"#);
    }

    #[tokio::test]
    async fn test_query_status_against_in_memory_server() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let payload = StatusPayload {
            version: VersionInfo {
                name: "1.20.4".to_string(),
                protocol: 765,
            },
            players: PlayersInfo {
                max: 10,
                online: 3,
                sample: Vec::new(),
            },
            description: serde_json::json!({"text": "Real server"}),
            favicon: None,
            extra: serde_json::Map::new(),
        };
        let expected = payload.clone();

        let server_task = tokio::spawn(async move {
            let handshake = Handshake::decode(&read_packet(&mut server).await.unwrap()).unwrap();
            assert_eq!(handshake.next_state, NextState::Status);
            assert_eq!(handshake.protocol_version, PROBE_PROTOCOL_VERSION);
            assert_eq!(handshake.server_port, 25566);

            let request = read_packet(&mut server).await.unwrap();
            assert_eq!(StatusRequest::decode(&request).unwrap(), StatusRequest::Request);

            let frame = status_response(&payload).unwrap();
            write_frame(&mut server, &frame).await.unwrap();
        });

        let received = query_status(&mut client, "mc.internal", 25566).await.unwrap();
        server_task.await.unwrap();

        assert_eq!(serde_json::from_value::<StatusPayload>(received).unwrap(), expected);
    }
}
