//! Thin ssh2 wrappers for the device management shell and the spoke VM.
//!
//! Commands are plain shell invocations; the first line of standard output
//! is the datum consumed (tunnel counts, probe verdicts). Calls are
//! synchronous and block the flow, which is intentional: the sequencer's
//! steps are causally ordered.

use std::io::Read;
use std::net::TcpStream;
use std::path::Path;

use anyhow::{Context, Result};
use ssh2::Session;

/// Opens a password-authenticated session to `host:port`.
pub fn connect_password(host: &str, port: u16, username: &str, password: &str) -> Result<Session> {
    let stream = TcpStream::connect((host, port))
        .with_context(|| format!("failed to reach {host}:{port}"))?;
    let mut session = Session::new().context("failed to create SSH session")?;
    session.set_tcp_stream(stream);
    session.handshake().context("SSH handshake failed")?;
    session
        .userauth_password(username, password)
        .with_context(|| format!("SSH password auth failed for {username}@{host}"))?;
    Ok(session)
}

/// Opens a key-authenticated session using a PEM private key file.
pub fn connect_key(host: &str, port: u16, username: &str, key_path: &Path) -> Result<Session> {
    let stream = TcpStream::connect((host, port))
        .with_context(|| format!("failed to reach {host}:{port}"))?;
    let mut session = Session::new().context("failed to create SSH session")?;
    session.set_tcp_stream(stream);
    session.handshake().context("SSH handshake failed")?;
    session
        .userauth_pubkey_file(username, None, key_path, None)
        .with_context(|| format!("SSH key auth failed for {username}@{host} ({key_path:?})"))?;
    Ok(session)
}

/// Runs `command` and returns the first line of its standard output,
/// stripped of the trailing newline.
pub fn first_output_line(session: &Session, command: &str) -> Result<String> {
    let mut channel = session
        .channel_session()
        .context("failed to open SSH channel")?;
    channel
        .exec(command)
        .with_context(|| format!("failed to run {command:?}"))?;
    let mut output = String::new();
    channel
        .read_to_string(&mut output)
        .with_context(|| format!("failed to read output of {command:?}"))?;
    channel.wait_close().ok();
    Ok(output.lines().next().unwrap_or("").trim().to_string())
}
