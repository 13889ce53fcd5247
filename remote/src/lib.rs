//! SSH side of rscp: authenticated sessions, the SFTP file service and trust-on-first-use host
//! key verification.

mod known_hosts;
pub mod session;
pub mod sftp;

pub use known_hosts::{
    DEFAULT_PORT, HostKey, HostKeyError, HostKeyPrompt, HostVerifier, KnownHosts, TerminalPrompt,
    TrustDecision, TrustPolicy, fingerprint, normalize_host,
};
pub use session::{Endpoint, NoKeysError, Session};
pub use sftp::SftpFs;
