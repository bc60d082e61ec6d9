//! X.224 connection negotiation, the only part of RDP the relay parses.
//!
//! The relay terminates TLS on both legs, so it rewrites the negotiation:
//! it always offers the backend plain TLS security and always confirms
//! plain TLS to the client, regardless of what the client requested
//! (CredSSP cannot be relayed through a third party).

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{MitmError, RdpResult};

/// Standard RDP security (no TLS).
pub const PROTOCOL_RDP: u32 = 0x0000_0000;
/// TLS security.
pub const PROTOCOL_SSL: u32 = 0x0000_0001;
/// CredSSP (NLA).
pub const PROTOCOL_HYBRID: u32 = 0x0000_0002;

const TPKT_VERSION: u8 = 3;
const TPKT_HEADER_LEN: usize = 4;
const MAX_TPKT_LEN: usize = 0xFFFF;

const X224_CODE_CR: u8 = 0xE0;
const X224_CODE_CC: u8 = 0xD0;

const NEG_TYPE_REQUEST: u8 = 0x01;
const NEG_TYPE_RESPONSE: u8 = 0x02;
const NEG_TYPE_FAILURE: u8 = 0x03;
const NEG_LEN: usize = 8;

/// Parsed client connection request.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    /// The raw frame as received, TPKT header included.
    pub raw: Vec<u8>,
    /// Routing cookie (`Cookie: mstshash=...`), if the client sent one.
    pub cookie: Option<String>,
    /// Protocols the client offered; `PROTOCOL_RDP` when no negotiation
    /// structure was present (ancient clients).
    pub requested_protocols: u32,
}

/// Read one complete TPKT frame.
pub async fn read_tpkt<S>(stream: &mut S) -> RdpResult<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; TPKT_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    if header[0] != TPKT_VERSION {
        return Err(MitmError::Protocol(format!(
            "unexpected TPKT version {}",
            header[0]
        )));
    }
    let total = usize::from(u16::from_be_bytes([header[2], header[3]]));
    if total < TPKT_HEADER_LEN || total > MAX_TPKT_LEN {
        return Err(MitmError::Protocol(format!("bad TPKT length {total}")));
    }
    let mut frame = vec![0u8; total];
    frame[..TPKT_HEADER_LEN].copy_from_slice(&header);
    stream.read_exact(&mut frame[TPKT_HEADER_LEN..]).await?;
    Ok(frame)
}

fn x224_payload(frame: &[u8], expected_code: u8) -> RdpResult<&[u8]> {
    if frame.len() < TPKT_HEADER_LEN + 7 {
        return Err(MitmError::Protocol("short X.224 PDU".to_string()));
    }
    let li = usize::from(frame[TPKT_HEADER_LEN]);
    let code = frame[TPKT_HEADER_LEN + 1] & 0xF0;
    if code != expected_code {
        return Err(MitmError::Protocol(format!(
            "unexpected X.224 code {code:#x}"
        )));
    }
    let end = TPKT_HEADER_LEN + 1 + li;
    if end > frame.len() {
        return Err(MitmError::Protocol("X.224 length overruns frame".to_string()));
    }
    // Variable part follows dst-ref(2) src-ref(2) class(1).
    Ok(&frame[TPKT_HEADER_LEN + 7..end])
}

/// Parse the client's connection request frame.
pub fn parse_connection_request(frame: &[u8]) -> RdpResult<ConnectionRequest> {
    let variable = x224_payload(frame, X224_CODE_CR)?;

    let mut cookie = None;
    let mut requested_protocols = PROTOCOL_RDP;
    let mut rest = variable;

    // Optional textual cookie terminated by CRLF.
    if rest.starts_with(b"Cookie:") || rest.starts_with(b"mstshash=") {
        if let Some(pos) = rest.windows(2).position(|w| w == b"\r\n") {
            cookie = Some(String::from_utf8_lossy(&rest[..pos]).into_owned());
            rest = &rest[pos + 2..];
        }
    }

    if rest.len() >= NEG_LEN && rest[0] == NEG_TYPE_REQUEST {
        let declared = usize::from(u16::from_le_bytes([rest[2], rest[3]]));
        if declared == NEG_LEN {
            requested_protocols = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
        }
    }

    Ok(ConnectionRequest {
        raw: frame.to_vec(),
        cookie,
        requested_protocols,
    })
}

/// Parse the backend's connection confirm; returns the selected protocol.
pub fn parse_connection_confirm(frame: &[u8]) -> RdpResult<u32> {
    let variable = x224_payload(frame, X224_CODE_CC)?;
    if variable.len() >= NEG_LEN {
        match variable[0] {
            NEG_TYPE_RESPONSE => {
                return Ok(u32::from_le_bytes([
                    variable[4],
                    variable[5],
                    variable[6],
                    variable[7],
                ]));
            }
            NEG_TYPE_FAILURE => {
                let code = u32::from_le_bytes([variable[4], variable[5], variable[6], variable[7]]);
                return Err(MitmError::Protocol(format!(
                    "backend refused negotiation, failure code {code}"
                )));
            }
            other => {
                return Err(MitmError::Protocol(format!(
                    "unexpected negotiation type {other:#x}"
                )));
            }
        }
    }
    // No negotiation structure: ancient server, standard RDP security.
    Ok(PROTOCOL_RDP)
}

fn build_x224(code: u8, variable: &[u8]) -> Vec<u8> {
    let li = 6 + variable.len();
    let total = TPKT_HEADER_LEN + 1 + li;
    let mut frame = Vec::with_capacity(total);
    frame.push(TPKT_VERSION);
    frame.push(0);
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.push(li as u8);
    frame.push(code);
    frame.extend_from_slice(&[0, 0]); // dst-ref
    frame.extend_from_slice(&[0, 0]); // src-ref
    frame.push(0); // class 0
    frame.extend_from_slice(variable);
    frame
}

fn build_nego(kind: u8, protocols: u32) -> [u8; NEG_LEN] {
    let mut nego = [0u8; NEG_LEN];
    nego[0] = kind;
    nego[2..4].copy_from_slice(&(NEG_LEN as u16).to_le_bytes());
    nego[4..8].copy_from_slice(&protocols.to_le_bytes());
    nego
}

/// Connection request for the backend leg, preserving the client's
/// routing cookie but always offering TLS.
pub fn build_connection_request(cookie: Option<&str>, protocols: u32) -> Vec<u8> {
    let mut variable = Vec::new();
    if let Some(cookie) = cookie {
        variable.extend_from_slice(cookie.as_bytes());
        variable.extend_from_slice(b"\r\n");
    }
    variable.extend_from_slice(&build_nego(NEG_TYPE_REQUEST, protocols));
    build_x224(X224_CODE_CR, &variable)
}

/// Connection confirm for the client leg.
pub fn build_connection_confirm(selected: u32) -> Vec<u8> {
    build_x224(X224_CODE_CC, &build_nego(NEG_TYPE_RESPONSE, selected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_tpkt_roundtrip() {
        let frame = build_connection_confirm(PROTOCOL_SSL);
        let mut cursor = std::io::Cursor::new(frame.clone());
        let read = read_tpkt(&mut cursor).await.expect("frame");
        assert_eq!(read, frame);
    }

    #[tokio::test]
    async fn test_read_tpkt_rejects_bad_version() {
        let mut cursor = std::io::Cursor::new(vec![7u8, 0, 0, 8, 0, 0, 0, 0]);
        assert!(read_tpkt(&mut cursor).await.is_err());
    }

    #[test]
    fn test_connection_request_roundtrip_with_cookie() {
        let frame =
            build_connection_request(Some("Cookie: mstshash=alice"), PROTOCOL_SSL | PROTOCOL_HYBRID);
        let parsed = parse_connection_request(&frame).expect("parse");
        assert_eq!(parsed.cookie.as_deref(), Some("Cookie: mstshash=alice"));
        assert_eq!(parsed.requested_protocols, PROTOCOL_SSL | PROTOCOL_HYBRID);
    }

    #[test]
    fn test_connection_request_without_nego_is_classic() {
        // Bare CR: no cookie, no negotiation structure.
        let frame = build_x224(X224_CODE_CR, &[]);
        let parsed = parse_connection_request(&frame).expect("parse");
        assert_eq!(parsed.requested_protocols, PROTOCOL_RDP);
        assert!(parsed.cookie.is_none());
    }

    #[test]
    fn test_connection_confirm_roundtrip() {
        let frame = build_connection_confirm(PROTOCOL_SSL);
        assert_eq!(parse_connection_confirm(&frame).expect("parse"), PROTOCOL_SSL);
    }

    #[test]
    fn test_connection_confirm_failure() {
        let frame = build_x224(X224_CODE_CC, &build_nego(NEG_TYPE_FAILURE, 5));
        let err = parse_connection_confirm(&frame).expect_err("failure");
        assert!(err.to_string().contains("failure code 5"));
    }

    #[test]
    fn test_confirm_rejects_request_frame() {
        let frame = build_connection_request(None, PROTOCOL_SSL);
        assert!(parse_connection_confirm(&frame).is_err());
    }
}
