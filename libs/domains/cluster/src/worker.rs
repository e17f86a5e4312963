//! Worker identity and the inbound handshake.
//!
//! A booting worker dials the master and sends, in order:
//! 1. exactly [`HDR_COOKIE_LEN`] bytes of ASCII cookie, right-padded with
//!    spaces;
//! 2. one `\n`-terminated line: base64 of a UTF-8 JSON self-description.

use crate::error::{ManagerError, ManagerResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Wire length of the cookie header.
pub const HDR_COOKIE_LEN: usize = 16;

/// Where a worker came from; carried for the whole worker lifetime and
/// consulted on kill.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerUserData {
    pub subscriptionid: String,
    pub resourcegroup: String,
    pub scalesetname: String,
    pub instanceid: String,
    pub name: String,
    #[serde(default)]
    pub mpi: bool,
    #[serde(default)]
    pub mpi_size: i64,
}

/// The worker's base64-JSON self-description line.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerHello {
    pub bind_addr: String,
    pub ppi: usize,
    /// Absent for secondary processes sharing a VM with their primary.
    #[serde(default)]
    pub userdata: Option<WorkerUserData>,
}

/// Everything the distributed runtime needs to drive one worker.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub bind_addr: String,
    /// Worker processes on this instance.
    pub count: usize,
    pub exename: String,
    pub exeflags: String,
    pub userdata: Option<WorkerUserData>,
}

/// Right-pad `cookie` with spaces to the wire length.
pub fn pad_cookie(cookie: &str) -> ManagerResult<[u8; HDR_COOKIE_LEN]> {
    let bytes = cookie.as_bytes();
    if bytes.len() > HDR_COOKIE_LEN {
        return Err(ManagerError::Handshake(format!(
            "cookie longer than {HDR_COOKIE_LEN} bytes"
        )));
    }
    let mut padded = [b' '; HDR_COOKIE_LEN];
    padded[..bytes.len()].copy_from_slice(bytes);
    Ok(padded)
}

/// Validate the cookie and read the worker's self-description.
///
/// The stream is positioned exactly past the handshake afterwards, so the
/// caller can hand it to the distributed runtime untouched.
pub async fn read_handshake<R>(stream: &mut R, cookie: &str) -> ManagerResult<WorkerHello>
where
    R: AsyncRead + Unpin,
{
    let expected = pad_cookie(cookie)?;
    let mut received = [0u8; HDR_COOKIE_LEN];
    stream.read_exact(&mut received).await?;
    if received != expected {
        return Err(ManagerError::InvalidCookie);
    }

    // One byte at a time keeps the stream unbuffered for the runtime.
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > 64 * 1024 {
            return Err(ManagerError::Handshake(
                "self-description line too long".to_string(),
            ));
        }
    }

    let decoded = BASE64
        .decode(&line)
        .map_err(|e| ManagerError::Handshake(format!("invalid base64: {e}")))?;
    let hello: WorkerHello = serde_json::from_slice(&decoded)
        .map_err(|e| ManagerError::Handshake(format!("invalid self-description: {e}")))?;
    Ok(hello)
}

/// Encode a hello the way workers put it on the wire (used by tests and by
/// worker-side tooling).
pub fn encode_hello(cookie: &str, hello: &WorkerHello) -> ManagerResult<Vec<u8>> {
    let mut wire = pad_cookie(cookie)?.to_vec();
    wire.extend_from_slice(BASE64.encode(serde_json::to_vec(hello)?).as_bytes());
    wire.push(b'\n');
    Ok(wire)
}
