//! MySQL Binlog 클라이언트
//!
//! 복제 클라이언트로 접속해 COM_BINLOG_DUMP 로 이벤트 스트림을 엽니다.
//! 1. TCP 연결 + 핸드셰이크 (mysql_native_password)
//! 2. `SET @master_binlog_checksum='NONE'`
//! 3. COM_BINLOG_DUMP (파일명, 위치, server id)
//! 4. OK(0x00) 접두어가 붙은 이벤트 패킷 수신, EOF 이면 종료

use crate::auth;
use crate::binlog::BinlogParser;
use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::events::RawLogEvent;
use crate::offset::BinlogPosition;
use crate::protocol::{self, AuthSwitchRequest, ErrorPacket, GreetingPacket, PacketChannel};
use crate::replication::{BinlogEventStream, BinlogTransport};
use async_trait::async_trait;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;
use tracing::{debug, info};

/// COM_QUERY 명령어 코드
const COM_QUERY: u8 = 0x03;

/// COM_BINLOG_DUMP 명령어 코드
const COM_BINLOG_DUMP: u8 = 0x12;

/// Binlog 클라이언트
pub struct BinlogClient {
    config: ConnectionConfig,
}

impl BinlogClient {
    pub fn new(config: ConnectionConfig) -> Self {
        BinlogClient { config }
    }

    async fn connect_channel(&self) -> Result<PacketChannel> {
        let mut channel = PacketChannel::connect(&self.config.hostname, self.config.port).await?;

        let greeting = GreetingPacket::parse(&channel.read_packet().await?)?;
        info!(
            "MySQL Server version: {}, Thread ID: {}",
            greeting.server_version, greeting.thread_id
        );

        let handshake = auth::create_handshake_response(
            &self.config.username,
            &self.config.password,
            self.config.database.as_deref(),
            &greeting.scramble,
        )?;
        let sequence = channel.next_sequence();
        channel.write_packet(&handshake, sequence).await?;

        let auth_result = channel.read_packet().await?;
        match auth_result.first() {
            Some(0x00) => {}
            Some(0xFF) => {
                return Err(CdcError::AuthenticationFailed(
                    ErrorPacket::parse(&auth_result).to_string(),
                ))
            }
            Some(0xFE) => {
                let request = AuthSwitchRequest::parse(&auth_result)?;
                debug!("Server requested auth switch to {}", request.plugin_name);
                let response = auth::auth_switch_response(&request, &self.config.password)?;
                let sequence = channel.next_sequence();
                channel.write_packet(&response, sequence).await?;

                let switched = channel.read_packet().await?;
                if protocol::is_error_packet(&switched) {
                    return Err(CdcError::AuthenticationFailed(
                        ErrorPacket::parse(&switched).to_string(),
                    ));
                }
                if !protocol::is_ok_packet(&switched) {
                    return Err(CdcError::ProtocolError(
                        "Unexpected packet after auth switch".to_string(),
                    ));
                }
            }
            _ => {
                return Err(CdcError::ProtocolError(
                    "Unexpected authentication response".to_string(),
                ))
            }
        }
        debug!("Authenticated as {}", self.config.username);

        // 이벤트 끝에 CRC32 가 붙지 않도록 체크섬 비활성화
        let mut query = vec![COM_QUERY];
        query.extend_from_slice(b"SET @master_binlog_checksum='NONE'");
        channel.write_command(&query).await?;
        let checksum_result = channel.read_packet().await?;
        if protocol::is_error_packet(&checksum_result) {
            return Err(CdcError::ProtocolError(format!(
                "Failed to disable binlog checksum: {}",
                ErrorPacket::parse(&checksum_result)
            )));
        }

        Ok(channel)
    }

    /// COM_BINLOG_DUMP 명령어 생성
    fn create_binlog_dump_command(
        server_id: u32,
        binlog_filename: &str,
        binlog_position: u64,
    ) -> Result<Vec<u8>> {
        let position = u32::try_from(binlog_position).map_err(|_| {
            CdcError::ConfigError(format!("Binlog position {} exceeds 4GiB", binlog_position))
        })?;

        let mut buffer = Vec::new();
        buffer.write_u8(COM_BINLOG_DUMP)?;
        buffer.write_u32::<LittleEndian>(position)?;
        // Flags - 0 이면 새 이벤트를 기다림
        buffer.write_u16::<LittleEndian>(0)?;
        buffer.write_u32::<LittleEndian>(server_id)?;
        buffer.write_all(binlog_filename.as_bytes())?;

        Ok(buffer)
    }
}

#[async_trait]
impl BinlogTransport for BinlogClient {
    async fn open(&self, position: &BinlogPosition) -> Result<Box<dyn BinlogEventStream>> {
        let mut channel = self.connect_channel().await?;

        let dump = Self::create_binlog_dump_command(
            self.config.server_id,
            &position.filename,
            position.offset,
        )?;
        channel.write_command(&dump).await?;
        info!(
            "Sent COM_BINLOG_DUMP: file={}, position={}, server_id={}",
            position.filename, position.offset, self.config.server_id
        );

        Ok(Box::new(BinlogPacketStream { channel }))
    }
}

struct BinlogPacketStream {
    channel: PacketChannel,
}

#[async_trait]
impl BinlogEventStream for BinlogPacketStream {
    async fn next_event(&mut self) -> Result<Option<RawLogEvent>> {
        let packet = self.channel.read_packet().await?;

        if protocol::is_error_packet(&packet) {
            return Err(CdcError::ConnectionError(format!(
                "Binlog stream error: {}",
                ErrorPacket::parse(&packet)
            )));
        }
        if protocol::is_eof_packet(&packet) {
            info!("Received EOF packet - binlog stream ended");
            return Ok(None);
        }
        if !protocol::is_ok_packet(&packet) {
            return Err(CdcError::ProtocolError(format!(
                "Unexpected binlog packet marker 0x{:02x}",
                packet.first().copied().unwrap_or_default()
            )));
        }

        BinlogParser::parse_event(&packet[1..]).map(Some)
    }
}
