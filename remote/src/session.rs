use anyhow::{Context, anyhow};
use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::instrument;

use common::integrity::{CommandOutput, CommandRunner};

use crate::known_hosts::{DEFAULT_PORT, HostKey, HostVerifier};
use crate::sftp::SftpFs;

pub const DEFAULT_USER: &str = "root";
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Idle time before the first TCP keepalive is sent
pub const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Private keys tried, in order, when none is given explicitly
pub const DEFAULT_KEYS: [&str; 3] = ["id_ecdsa", "id_ed25519", "id_rsa"];

const CIPHERS: &str =
    "chacha20-poly1305@openssh.com,aes128-gcm@openssh.com,aes128-ctr,aes256-ctr";
const MACS: &str = "hmac-sha2-256";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub user: String,
    pub host: String,
    pub port: u16,
    /// Private key file, the default keys in `~/.ssh` are tried when unset
    pub key: Option<PathBuf>,
}

impl Endpoint {
    pub fn new(host: &str) -> Self {
        Self {
            user: DEFAULT_USER.to_string(),
            host: host.to_string(),
            port: DEFAULT_PORT,
            key: None,
        }
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("no SSH key found in ~/.ssh/ (tried: id_ed25519, id_rsa, id_ecdsa)")]
pub struct NoKeysError;

/// Default keys present in `ssh_dir`
pub fn default_keys(ssh_dir: &Path) -> Vec<PathBuf> {
    DEFAULT_KEYS
        .iter()
        .map(|name| ssh_dir.join(name))
        .filter(|path| path.is_file())
        .collect()
}

pub fn resolve_keys(explicit: Option<&Path>) -> anyhow::Result<Vec<PathBuf>> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(anyhow!("failed to read private key {path:?}: no such file"));
        }
        return Ok(vec![path.to_path_buf()]);
    }
    let home = dirs::home_dir().context("cannot determine home directory")?;
    let keys = default_keys(&home.join(".ssh"));
    if keys.is_empty() {
        return Err(NoKeysError.into());
    }
    Ok(keys)
}

fn transport_kind(error: &ssh2::Error) -> Option<std::io::ErrorKind> {
    match error.code() {
        // LIBSSH2_ERROR_TIMEOUT, LIBSSH2_ERROR_SOCKET_TIMEOUT
        ssh2::ErrorCode::Session(-9 | -30) => Some(std::io::ErrorKind::TimedOut),
        // LIBSSH2_ERROR_SOCKET_SEND, LIBSSH2_ERROR_SOCKET_RECV, LIBSSH2_ERROR_SOCKET_DISCONNECT
        ssh2::ErrorCode::Session(-7 | -43 | -13) => Some(std::io::ErrorKind::ConnectionReset),
        _ => None,
    }
}

fn transport_io_error(error: &ssh2::Error) -> Option<std::io::Error> {
    let kind = transport_kind(error)?;
    let message = match kind {
        std::io::ErrorKind::ConnectionReset => format!("connection reset: {}", error.message()),
        _ => error.message().to_string(),
    };
    Some(std::io::Error::new(kind, message))
}

/// Converts libssh2 errors, turning transport failures into io errors the retry policy recognizes
pub(crate) fn ssh_error(error: ssh2::Error) -> anyhow::Error {
    match transport_io_error(&error) {
        Some(converted) => anyhow::Error::new(converted),
        None => anyhow::Error::new(error),
    }
}

/// Same as [`ssh_error`] for libssh2 failures surfacing through `Read`/`Write` on files and
/// channels, which ssh2 reports with `ErrorKind::Other`
pub(crate) fn io_error(error: std::io::Error) -> std::io::Error {
    let remapped = error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<ssh2::Error>())
        .and_then(transport_io_error);
    remapped.unwrap_or(error)
}

/// SFTP "no such file" or "no such path"
pub(crate) fn is_not_found(error: &ssh2::Error) -> bool {
    matches!(error.code(), ssh2::ErrorCode::SFTP(2 | 10))
}

fn connect_tcp(endpoint: &Endpoint) -> anyhow::Result<TcpStream> {
    let host = endpoint.host.trim_start_matches('[').trim_end_matches(']');
    let addrs: Vec<SocketAddr> = (host, endpoint.port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {}", endpoint.address()))?
        .collect();
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                set_keepalive(&stream)?;
                return Ok(stream);
            }
            Err(error) => {
                tracing::debug!("connecting to {addr} failed: {error}");
                last_error = Some(error);
            }
        }
    }
    match last_error {
        Some(error) => {
            Err(error).with_context(|| format!("failed to connect to {}", endpoint.address()))
        }
        None => Err(anyhow!("{} did not resolve to any address", endpoint.address())),
    }
}

/// A dead peer fails blocking reads and writes once keepalives go unanswered, instead of
/// hanging them forever
fn set_keepalive(stream: &TcpStream) -> anyhow::Result<()> {
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    socket2::SockRef::from(stream)
        .set_tcp_keepalive(&keepalive)
        .context("failed to enable TCP keepalive")
}

const METHOD_PREFERENCES: [(&str, ssh2::MethodType, &str); 4] = [
    ("client cipher", ssh2::MethodType::CryptCs, CIPHERS),
    ("server cipher", ssh2::MethodType::CryptSc, CIPHERS),
    ("client MAC", ssh2::MethodType::MacCs, MACS),
    ("server MAC", ssh2::MethodType::MacSc, MACS),
];

fn prefer_methods(session: &ssh2::Session, preferences: &[(&str, ssh2::MethodType, &str)]) {
    for &(name, method, prefs) in preferences {
        // preferences only, libssh2 builds without these algorithms fall back to their defaults
        if let Err(error) = session.method_pref(method, prefs) {
            tracing::debug!("ignoring {name} preference {prefs:?}: {}", error.message());
        }
    }
}

fn authenticate(session: &ssh2::Session, endpoint: &Endpoint) -> anyhow::Result<()> {
    let keys = resolve_keys(endpoint.key.as_deref())?;
    let mut failures = Vec::new();
    for key in &keys {
        match session.userauth_pubkey_file(&endpoint.user, None, key, None) {
            Ok(()) if session.authenticated() => {
                tracing::debug!("authenticated as {} with {:?}", &endpoint.user, key);
                return Ok(());
            }
            Ok(()) => failures.push(format!("{}: not accepted", key.display())),
            Err(error) => failures.push(format!("{}: {}", key.display(), error.message())),
        }
    }
    Err(anyhow!(
        "authentication failed for {}@{} ({})",
        &endpoint.user,
        &endpoint.host,
        failures.join(", ")
    ))
}

/// Authenticated SSH connection
pub struct Session {
    session: ssh2::Session,
    address: String,
}

impl Session {
    /// Connects, verifies the server's host key against `verifier` and authenticates.
    ///
    /// Nothing is sent to the server after the handshake unless the host key was accepted.
    #[instrument(skip(verifier))]
    pub fn connect(endpoint: &Endpoint, verifier: &HostVerifier) -> anyhow::Result<Self> {
        let stream = connect_tcp(endpoint)?;
        let mut session = ssh2::Session::new().context("failed to create SSH session")?;
        session.set_tcp_stream(stream);
        prefer_methods(&session, &METHOD_PREFERENCES);
        session.set_timeout(CONNECT_TIMEOUT.as_millis() as u32);
        session
            .handshake()
            .map_err(ssh_error)
            .with_context(|| format!("SSH handshake with {} failed", endpoint.address()))?;
        let (key, kind) = session
            .host_key()
            .ok_or_else(|| anyhow!("{} did not present a host key", endpoint.address()))?;
        let host_key = HostKey::from_ssh(key, kind);
        verifier.verify(&endpoint.host, endpoint.port, &host_key)?;
        authenticate(&session, endpoint)?;
        // transfers and md5sum may block for long, dead peers are caught by TCP keepalive
        session.set_timeout(0);
        tracing::info!("connected to {}", endpoint.address());
        Ok(Self {
            session,
            address: endpoint.address(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn sftp(&self) -> anyhow::Result<SftpFs> {
        let sftp = self
            .session
            .sftp()
            .map_err(ssh_error)
            .with_context(|| format!("failed to start SFTP subsystem on {}", &self.address))?;
        Ok(SftpFs::new(sftp))
    }

    /// Runs `command` on the remote host, collecting stdout followed by stderr
    pub fn exec(&self, command: &str) -> anyhow::Result<CommandOutput> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(ssh_error)
            .context("failed to open SSH channel")?;
        channel
            .exec(command)
            .map_err(ssh_error)
            .with_context(|| format!("failed to execute {command:?}"))?;
        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .map_err(io_error)
            .with_context(|| format!("failed reading output of {command:?}"))?;
        let mut errors = String::new();
        channel
            .stderr()
            .read_to_string(&mut errors)
            .map_err(io_error)
            .with_context(|| format!("failed reading error output of {command:?}"))?;
        channel.wait_close().map_err(ssh_error)?;
        let status = channel.exit_status().map_err(ssh_error)?;
        output.push_str(&errors);
        Ok(CommandOutput { status, output })
    }
}

impl CommandRunner for Session {
    fn execute(&self, command: &str) -> anyhow::Result<CommandOutput> {
        self.exec(command)
    }
}
