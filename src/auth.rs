//! MySQL 인증 처리
//!
//! mysql_native_password 만 지원합니다. 서버가 다른 플러그인으로 전환을
//! 요청하면 인증 실패로 처리합니다.

use crate::error::{CdcError, Result};
use crate::protocol::AuthSwitchRequest;
use byteorder::{LittleEndian, WriteBytesExt};
use sha1::{Digest, Sha1};
use std::io::Write;

pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
}

/// 복제 연결 문자셋 (utf8mb4_general_ci)
const UTF8MB4_GENERAL_CI: u8 = 45;

/// Native password 인증 응답 생성
///
/// XOR(SHA1(password), SHA1(scramble + SHA1(SHA1(password))))
pub fn create_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = sha1(password.as_bytes());
    let stage2 = sha1(&stage1);

    let mut combined = scramble.to_vec();
    combined.extend_from_slice(&stage2);
    let stage3 = sha1(&combined);

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

fn sha1(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// 핸드셰이크 응답 패킷 생성
pub fn create_handshake_response(
    username: &str,
    password: &str,
    database: Option<&str>,
    scramble: &[u8],
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    let mut flags = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::PLUGIN_AUTH;
    if database.is_some() {
        flags |= capabilities::CONNECT_WITH_DB;
    }

    buffer.write_u32::<LittleEndian>(flags)?;
    // Max packet size - 0 이면 기본값
    buffer.write_u32::<LittleEndian>(0)?;
    buffer.write_u8(UTF8MB4_GENERAL_CI)?;
    buffer.write_all(&[0u8; 23])?;

    buffer.write_all(username.as_bytes())?;
    buffer.write_u8(0)?;

    let auth_response = create_auth_response(password, scramble);
    buffer.write_u8(auth_response.len() as u8)?;
    buffer.write_all(&auth_response)?;

    if let Some(db) = database {
        buffer.write_all(db.as_bytes())?;
        buffer.write_u8(0)?;
    }

    buffer.write_all(NATIVE_PASSWORD_PLUGIN.as_bytes())?;
    buffer.write_u8(0)?;

    Ok(buffer)
}

/// 인증 플러그인 전환 요청에 대한 응답
pub fn auth_switch_response(request: &AuthSwitchRequest, password: &str) -> Result<Vec<u8>> {
    if request.plugin_name != NATIVE_PASSWORD_PLUGIN {
        return Err(CdcError::AuthenticationFailed(format!(
            "Unsupported authentication plugin: {}",
            request.plugin_name
        )));
    }
    Ok(create_auth_response(password, &request.auth_data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_auth_response_empty_password() {
        assert!(create_auth_response("", &[1, 2, 3, 4]).is_empty());
    }

    #[test]
    fn test_create_auth_response() {
        let scramble = vec![0x40, 0x3B, 0x57, 0x68, 0x3A, 0x77, 0x23, 0x29];
        let response = create_auth_response("password", &scramble);
        assert_eq!(response.len(), 20);
        // 같은 scramble 이면 같은 응답
        assert_eq!(response, create_auth_response("password", &scramble));
        assert_ne!(response, create_auth_response("password", &[0u8; 8]));
    }

    #[test]
    fn test_handshake_response_layout() {
        let scramble = [7u8; 20];
        let packet = create_handshake_response("repl", "secret", None, &scramble).unwrap();

        let flags = u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
        assert_eq!(flags & capabilities::CONNECT_WITH_DB, 0);
        assert_ne!(flags & capabilities::PLUGIN_AUTH, 0);
        // 4 + 4 + 1 + 23 바이트 뒤에 사용자명
        assert_eq!(&packet[32..36], b"repl");
        assert_eq!(packet[37], 20);
        assert!(packet.ends_with(b"mysql_native_password\0"));
    }

    #[test]
    fn test_auth_switch_rejects_other_plugins() {
        let request = AuthSwitchRequest {
            plugin_name: "caching_sha2_password".to_string(),
            auth_data: vec![1; 20],
        };
        assert!(matches!(
            auth_switch_response(&request, "pw"),
            Err(CdcError::AuthenticationFailed(_))
        ));

        let request = AuthSwitchRequest {
            plugin_name: NATIVE_PASSWORD_PLUGIN.to_string(),
            auth_data: vec![1; 20],
        };
        assert_eq!(auth_switch_response(&request, "pw").unwrap().len(), 20);
    }
}
