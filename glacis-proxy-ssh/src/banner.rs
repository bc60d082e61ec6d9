//! User-visible text: the deny banner, the shell preamble and the
//! `[gateway]` broadcast lines.

use chrono::{DateTime, Utc};
use glacis_core::DenyReason;
use glacis_store::models::TerminationReason;
use std::net::IpAddr;

const RULE: &str =
    "************************************************************";

/// Plain-text block sent before closing a denied connection.
pub fn deny_banner(source_ip: IpAddr, reason: DenyReason) -> String {
    let mut banner = String::new();
    banner.push_str("\r\n");
    banner.push_str(RULE);
    banner.push_str("\r\n*                       ACCESS DENIED                      *\r\n");
    banner.push_str(RULE);
    banner.push_str("\r\n");
    banner.push_str(&format!("  source address : {source_ip}\r\n"));
    banner.push_str(&format!("  reason         : {}\r\n", reason.as_str()));
    banner.push_str(RULE);
    banner.push_str("\r\n");
    banner
}

/// Extra lines for the case where the client authenticated with a public
/// key but the gateway has no agent to sign with.
pub fn agent_hint(login: &str, proxy_ip: IpAddr) -> String {
    format!(
        "  public key authentication requires agent forwarding\r\n\
           try: ssh -A {login}@{proxy_ip}\r\n\
           or:  ssh -o PubkeyAuthentication=no {login}@{proxy_ip}\r\n"
    )
}

/// One-line preamble announcing the stay's validity window, written before
/// the first backend byte of a shell session.
pub fn shell_preamble(backend_name: &str, expires_at: Option<DateTime<Utc>>) -> String {
    match expires_at {
        Some(deadline) => format!(
            "\x1b[1m[gateway]\x1b[0m connected to {backend_name}, access valid until {} UTC\r\n",
            deadline.format("%Y-%m-%d %H:%M")
        ),
        None => format!("\x1b[1m[gateway]\x1b[0m connected to {backend_name}\r\n"),
    }
}

/// Highlighted advance warning interleaved into the shell stream.
pub fn warning_line(minutes_left: u32) -> String {
    let unit = if minutes_left == 1 { "minute" } else { "minutes" };
    format!(
        "\r\n\x1b[1;33m[gateway] access expires in {minutes_left} {unit}\x1b[0m\r\n"
    )
}

/// Final line before the gateway closes an expired or revoked shell.
pub fn termination_line(reason: TerminationReason) -> String {
    let text = match reason {
        TerminationReason::PolicyExpired => "policy expired",
        TerminationReason::Revoked => "access revoked",
        TerminationReason::ServerClosed => "backend closed the connection",
        TerminationReason::ClientClosed => "client closed the connection",
        TerminationReason::Error => "internal error",
    };
    format!("\r\n\x1b[1;31m[gateway] session terminated: {text}\x1b[0m\r\n")
}
