//! MySQL 프로토콜 패킷 처리
//!
//! 패킷 = 3 바이트 길이 + 1 바이트 시퀀스 + 본문.
//! 본문이 0xFFFFFF 바이트 이상이면 여러 패킷으로 나뉘어 오므로 이어 붙입니다.

use crate::error::{CdcError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Read;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// 한 패킷 본문의 최대 길이
pub const MAX_PACKET_LENGTH: usize = 0xFF_FFFF;

/// MySQL 패킷 채널
pub struct PacketChannel<S = TcpStream> {
    stream: S,
    sequence: u8,
}

impl PacketChannel<TcpStream> {
    /// 새 패킷 채널 생성 (TCP 연결)
    pub async fn connect(hostname: &str, port: u16) -> Result<Self> {
        let addr = format!("{}:{}", hostname, port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        debug!("Connected to MySQL at {}", addr);

        Ok(PacketChannel::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> PacketChannel<S> {
    pub fn new(stream: S) -> Self {
        PacketChannel { stream, sequence: 0 }
    }

    /// 다음에 보낼 패킷의 시퀀스 번호
    pub fn next_sequence(&self) -> u8 {
        self.sequence
    }

    /// 패킷 읽기 (분할된 패킷은 합쳐서 반환)
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut packet = Vec::new();
        loop {
            let mut header = [0u8; 4];
            tokio::io::AsyncReadExt::read_exact(&mut self.stream, &mut header)
                .await
                .map_err(|e| CdcError::IoError(format!("Failed to read packet header: {}", e)))?;
            let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.sequence = header[3].wrapping_add(1);

            let start = packet.len();
            packet.resize(start + length, 0);
            tokio::io::AsyncReadExt::read_exact(&mut self.stream, &mut packet[start..])
                .await
                .map_err(|e| CdcError::IoError(format!("Failed to read packet body: {}", e)))?;

            if length < MAX_PACKET_LENGTH {
                return Ok(packet);
            }
        }
    }

    /// 패킷 쓰기
    pub async fn write_packet(&mut self, data: &[u8], sequence: u8) -> Result<()> {
        let length = data.len() as u32;
        let mut header = length.to_le_bytes();
        header[3] = sequence;

        self.stream
            .write_all(&header)
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to write header: {}", e)))?;
        self.stream
            .write_all(data)
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to write data: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| CdcError::IoError(format!("Failed to flush: {}", e)))?;

        self.sequence = sequence.wrapping_add(1);
        Ok(())
    }

    /// 새 명령 전송 (시퀀스 0 부터)
    pub async fn write_command(&mut self, data: &[u8]) -> Result<()> {
        self.write_packet(data, 0).await
    }
}

/// Greeting 패킷 파싱
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin_name: Option<String>,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        Self::parse_inner(data)
            .map_err(|e| CdcError::ProtocolError(format!("Malformed greeting packet: {}", e)))
    }

    fn parse_inner(data: &[u8]) -> std::io::Result<Self> {
        let mut cursor = std::io::Cursor::new(data);

        let protocol_version = cursor.read_u8()?;
        let server_version = read_null_terminated_string(&mut cursor)?;
        let thread_id = cursor.read_u32::<LittleEndian>()?;

        // Auth plugin data part 1 (8 bytes)
        let mut scramble = vec![0u8; 8];
        cursor.read_exact(&mut scramble)?;

        // Filler
        cursor.read_u8()?;

        let capabilities_lower = cursor.read_u16::<LittleEndian>()?;
        let server_collation = cursor.read_u8()?;
        let server_status = cursor.read_u16::<LittleEndian>()?;
        let capabilities_upper = cursor.read_u16::<LittleEndian>()?;
        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        let auth_data_len = cursor.read_u8()?;

        // Reserved (10 bytes)
        let mut reserved = [0u8; 10];
        cursor.read_exact(&mut reserved)?;

        // Auth plugin data part 2 (최소 13 바이트, 마지막은 NUL)
        let scramble_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut scramble_part2 = vec![0u8; scramble_len];
        cursor.read_exact(&mut scramble_part2)?;
        scramble.extend_from_slice(&scramble_part2[..scramble_len - 1]);

        let auth_plugin_name = read_null_terminated_string(&mut cursor)
            .ok()
            .filter(|name| !name.is_empty());

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin_name,
        })
    }
}

/// 인증 중 서버가 다른 플러그인을 요구할 때 (0xFE)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub auth_data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.first() != Some(&0xFE) {
            return Err(CdcError::ProtocolError("Not an auth switch request".to_string()));
        }
        let mut cursor = std::io::Cursor::new(&data[1..]);
        let plugin_name = read_null_terminated_string(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Malformed auth switch request: {}", e)))?;
        let mut auth_data = data[1 + cursor.position() as usize..].to_vec();
        if auth_data.last() == Some(&0) {
            auth_data.pop();
        }
        Ok(AuthSwitchRequest {
            plugin_name,
            auth_data,
        })
    }
}

/// 에러 패킷 (0xFF)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    pub error_code: u16,
    pub sql_state: Option<String>,
    pub message: String,
}

impl ErrorPacket {
    pub fn parse(data: &[u8]) -> Self {
        let error_code = if data.len() >= 3 {
            u16::from_le_bytes([data[1], data[2]])
        } else {
            0
        };
        let rest = data.get(3..).unwrap_or_default();
        let (sql_state, message) = if rest.first() == Some(&b'#') && rest.len() >= 6 {
            (
                Some(String::from_utf8_lossy(&rest[1..6]).to_string()),
                &rest[6..],
            )
        } else {
            (None, rest)
        };

        ErrorPacket {
            error_code,
            sql_state,
            message: String::from_utf8_lossy(message).to_string(),
        }
    }
}

impl std::fmt::Display for ErrorPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sql_state {
            Some(state) => write!(f, "[{}] ({}) {}", self.error_code, state, self.message),
            None => write!(f, "[{}] {}", self.error_code, self.message),
        }
    }
}

/// null로 끝나는 문자열 읽기
fn read_null_terminated_string<R: Read>(reader: &mut R) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = reader.read_u8()?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    data.first() == Some(&0xFF)
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    data.first() == Some(&0x00)
}

/// EOF 패킷 확인 (0xFE, 9 바이트 미만)
pub fn is_eof_packet(data: &[u8]) -> bool {
    data.first() == Some(&0xFE) && data.len() < 9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_kinds() {
        assert!(is_error_packet(&[0xFF, 0x01, 0x02]));
        assert!(!is_error_packet(&[0x00, 0x01, 0x02]));
        assert!(is_ok_packet(&[0x00, 0x01, 0x02]));
        assert!(is_eof_packet(&[0xFE, 0, 0, 2, 0]));
        assert!(!is_eof_packet(&[0xFE; 20]));
        assert!(!is_ok_packet(&[]));
    }

    #[test]
    fn test_error_packet() {
        let mut data = vec![0xFF];
        data.extend_from_slice(&1236u16.to_le_bytes());
        data.extend_from_slice(b"#HY000Could not find first log file name");
        let err = ErrorPacket::parse(&data);
        assert_eq!(err.error_code, 1236);
        assert_eq!(err.sql_state.as_deref(), Some("HY000"));
        assert_eq!(err.message, "Could not find first log file name");
    }

    #[test]
    fn test_auth_switch_request() {
        let mut data = vec![0xFE];
        data.extend_from_slice(b"mysql_native_password\0");
        data.extend_from_slice(&[1u8; 20]);
        data.push(0);
        let request = AuthSwitchRequest::parse(&data).unwrap();
        assert_eq!(request.plugin_name, "mysql_native_password");
        assert_eq!(request.auth_data, vec![1u8; 20]);
    }

    #[tokio::test]
    async fn test_read_split_packet() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut channel = PacketChannel::new(client);

        let body: Vec<u8> = (0..MAX_PACKET_LENGTH + 10).map(|i| (i % 251) as u8).collect();
        let writer = tokio::spawn(async move {
            let mut first = vec![0xFF, 0xFF, 0xFF, 3];
            first.extend_from_slice(&body[..MAX_PACKET_LENGTH]);
            server.write_all(&first).await.unwrap();
            let mut second = vec![10, 0, 0, 4];
            second.extend_from_slice(&body[MAX_PACKET_LENGTH..]);
            server.write_all(&second).await.unwrap();
            body
        });

        let packet = channel.read_packet().await.unwrap();
        let body = writer.await.unwrap();
        assert_eq!(packet.len(), body.len());
        assert_eq!(packet, body);
        assert_eq!(channel.next_sequence(), 5);
    }

    #[tokio::test]
    async fn test_write_packet_header() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut channel = PacketChannel::new(client);
        channel.write_packet(b"abc", 1).await.unwrap();

        let mut buf = [0u8; 7];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, [3, 0, 0, 1, b'a', b'b', b'c']);
        assert_eq!(channel.next_sequence(), 2);
    }
}
