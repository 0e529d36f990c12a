//! Mapping of `ssh` / `rsync` failures onto `TransportError` kinds.

use flowreg_session_core::TransportError;

/// `ssh` exits with 255 when the connection itself failed.
pub const SSH_CONNECTION_FAILURE: i32 = 255;

const HOST_KEY_MARKERS: &[&str] = &[
    "Host key verification failed",
    "REMOTE HOST IDENTIFICATION HAS CHANGED",
    "No ECDSA host key is known",
    "No ED25519 host key is known",
    "No RSA host key is known",
];

const AUTH_MARKERS: &[&str] = &[
    "Permission denied",
    "Too many authentication failures",
    "No more authentication methods",
    "Authentication failed",
];

const UNREACHABLE_MARKERS: &[&str] = &[
    "Could not resolve hostname",
    "Connection refused",
    "Connection timed out",
    "Operation timed out",
    "No route to host",
    "Network is unreachable",
    "Connection closed by",
    "Connection reset by",
];

fn contains_any(text: &str, markers: &[&str]) -> bool {
    let lower = text.to_ascii_lowercase();
    markers
        .iter()
        .any(|m| lower.contains(&m.to_ascii_lowercase()))
}

/// Classify SSH-level failure text, if it names a known cause.
#[must_use]
pub fn classify_ssh_stderr(host: &str, stderr: &str) -> Option<TransportError> {
    let detail = stderr.trim().to_string();
    let host = host.to_string();
    if contains_any(stderr, HOST_KEY_MARKERS) {
        Some(TransportError::HostKeyVerification { host, detail })
    } else if contains_any(stderr, AUTH_MARKERS) {
        Some(TransportError::AuthenticationFailed { host, detail })
    } else if contains_any(stderr, UNREACHABLE_MARKERS) {
        Some(TransportError::HostUnreachable { host, detail })
    } else {
        None
    }
}

/// Classify a failed `ssh <host> <command>` run.
#[must_use]
pub fn classify_ssh_failure(
    host: &str,
    remote_command: &str,
    code: Option<i32>,
    stderr: &str,
) -> TransportError {
    match code {
        Some(SSH_CONNECTION_FAILURE) => {
            classify_ssh_stderr(host, stderr).unwrap_or_else(|| TransportError::HostUnreachable {
                host: host.to_string(),
                detail: stderr.trim().to_string(),
            })
        }
        code => TransportError::RemoteCommand {
            command: remote_command.to_string(),
            code: code.unwrap_or(-1),
            stderr: stderr.trim().to_string(),
        },
    }
}

/// Classify a failed `rsync` run.
///
/// Exit codes follow rsync(1): socket, protocol-stream, signal, partial
/// transfer, and timeout failures mean the transfer was cut short.
#[must_use]
pub fn classify_rsync_failure(host: &str, code: Option<i32>, stderr: &str) -> TransportError {
    if let Some(err) = classify_ssh_stderr(host, stderr) {
        return err;
    }
    let detail = stderr.trim().to_string();
    match code {
        None | Some(10 | 12 | 20 | 23 | 24 | 30 | 35 | 255) => {
            TransportError::TransferInterrupted { detail }
        }
        Some(code) => TransportError::TransferFailed { code, detail },
    }
}
