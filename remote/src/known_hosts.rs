//! Trust-on-first-use host key verification.
//!
//! Keys live in an OpenSSH style known_hosts file, one `<host> <key-type> <base64-key>` entry per
//! line, only ever appended to. Looking a key up ([`KnownHosts::check`]) is pure; prompting and
//! persisting happen in [`HostVerifier`].

use anyhow::Context;
use base64::prelude::*;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 22;

/// Host name as stored in known_hosts: bare for port 22, `[host]:port` otherwise
pub fn normalize_host(host: &str, port: u16) -> String {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if port == DEFAULT_PORT {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

/// `SHA256:` followed by the base64 encoded SHA-256 digest of the key blob
pub fn fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    format!("SHA256:{}", BASE64_STANDARD.encode(digest.as_slice()))
}

pub(crate) fn key_type_name(kind: ssh2::HostKeyType) -> &'static str {
    match kind {
        ssh2::HostKeyType::Rsa => "ssh-rsa",
        ssh2::HostKeyType::Dss => "ssh-dss",
        ssh2::HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        ssh2::HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        ssh2::HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        ssh2::HostKeyType::Ed25519 => "ssh-ed25519",
        _ => "unknown",
    }
}

/// Public key presented by a server, in SSH wire format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    pub key_type: String,
    pub key: Vec<u8>,
}

impl HostKey {
    pub fn new(key_type: &str, key: &[u8]) -> Self {
        Self {
            key_type: key_type.to_string(),
            key: key.to_vec(),
        }
    }

    pub fn from_ssh(key: &[u8], kind: ssh2::HostKeyType) -> Self {
        Self::new(key_type_name(kind), key)
    }

    pub fn encoded(&self) -> String {
        BASE64_STANDARD.encode(&self.key)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    /// An entry for this host has exactly this key
    Known,
    /// No entry for this host and key type
    Unknown,
    /// The host has an entry with the same key type but different key material
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Decides what `contents` (a known_hosts file) says about `key` for the normalized `host`
pub(crate) fn decide(contents: &str, host: &str, key: &HostKey) -> TrustDecision {
    let encoded = key.encoded();
    let mut expected = None;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(hosts), Some(key_type), Some(material)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if key_type != key.key_type || !hosts.split(',').any(|candidate| candidate == host) {
            continue;
        }
        if material == encoded {
            return TrustDecision::Known;
        }
        if expected.is_none() {
            expected = Some(match BASE64_STANDARD.decode(material) {
                Ok(blob) => fingerprint(&blob),
                Err(_) => format!("<malformed key {material}>"),
            });
        }
    }
    match expected {
        Some(expected_fingerprint) => TrustDecision::Changed {
            expected_fingerprint,
            actual_fingerprint: key.fingerprint(),
        },
        None => TrustDecision::Unknown,
    }
}

#[derive(Debug, Clone)]
pub struct KnownHosts {
    path: PathBuf,
}

impl KnownHosts {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.ssh/known_hosts`
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let home = dirs::home_dir().context("cannot determine home directory")?;
        Ok(home.join(".ssh").join("known_hosts"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn contents(&self) -> anyhow::Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(error) => Err(error).with_context(|| format!("failed reading {:?}", &self.path)),
        }
    }

    pub fn check(&self, host: &str, port: u16, key: &HostKey) -> anyhow::Result<TrustDecision> {
        Ok(decide(&self.contents()?, &normalize_host(host, port), key))
    }

    /// Appends an entry, creating the file (0600) and its directory (0700) when missing
    pub fn add(&self, host: &str, port: u16, key: &HostKey) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(dir)
                .with_context(|| format!("cannot create directory {dir:?}"))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o600)
            .open(&self.path)
            .with_context(|| format!("cannot open {:?} for writing", &self.path))?;
        writeln!(
            file,
            "{} {} {}",
            normalize_host(host, port),
            key.key_type,
            key.encoded()
        )
        .with_context(|| format!("failed writing to {:?}", &self.path))
    }
}

/// Asks whether an unknown host key should be trusted
pub trait HostKeyPrompt: Send + Sync {
    fn confirm(&self, host: &str, key: &HostKey) -> anyhow::Result<bool>;
}

pub(crate) fn is_affirmative(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("yes")
}

/// Interactive confirmation on the terminal, only "yes" is accepted
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl HostKeyPrompt for TerminalPrompt {
    fn confirm(&self, host: &str, key: &HostKey) -> anyhow::Result<bool> {
        {
            let mut stderr = std::io::stderr().lock();
            write!(
                stderr,
                "The authenticity of host '{host}' can't be established.\n\
                {} key fingerprint is {}\n\
                Are you sure you want to continue connecting (yes/no)? ",
                key.key_type,
                key.fingerprint()
            )?;
            stderr.flush()?;
        }
        let mut answer = String::new();
        std::io::stdin()
            .read_line(&mut answer)
            .context("failed reading answer")?;
        Ok(is_affirmative(&answer))
    }
}

/// What to do with a host key that is not in the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum TrustPolicy {
    /// Ask on the terminal
    #[default]
    Prompt,
    /// Trust and record keys of hosts never seen before, refuse changed keys
    AcceptNew,
    /// Only connect to hosts already in the store
    Strict,
}

#[derive(Debug, thiserror::Error)]
pub enum HostKeyError {
    #[error("host key verification rejected by user")]
    Rejected { host: String },
    #[error("host key verification failed for '{host}': {fingerprint} is not a known key")]
    Untrusted { host: String, fingerprint: String },
}

pub struct HostVerifier {
    store: KnownHosts,
    policy: TrustPolicy,
    prompt: Box<dyn HostKeyPrompt>,
}

impl HostVerifier {
    pub fn new(store: KnownHosts, policy: TrustPolicy) -> Self {
        Self::with_prompt(store, policy, Box::new(TerminalPrompt))
    }

    pub fn with_prompt(
        store: KnownHosts,
        policy: TrustPolicy,
        prompt: Box<dyn HostKeyPrompt>,
    ) -> Self {
        Self {
            store,
            policy,
            prompt,
        }
    }

    /// Accepts `key` for `host:port` or fails with [`HostKeyError`].
    ///
    /// A changed key is logged and then handled like an unknown one.
    pub fn verify(&self, host: &str, port: u16, key: &HostKey) -> anyhow::Result<()> {
        let name = normalize_host(host, port);
        let changed = match self.store.check(host, port, key)? {
            TrustDecision::Known => {
                tracing::debug!("host key for {name} found in {:?}", self.store.path());
                return Ok(());
            }
            TrustDecision::Unknown => false,
            TrustDecision::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                tracing::warn!(
                    "host key for {name} differs from the recorded one: expected {expected_fingerprint}, got {actual_fingerprint}"
                );
                true
            }
        };
        let accepted = match self.policy {
            TrustPolicy::Prompt => self.prompt.confirm(&name, key)?,
            TrustPolicy::AcceptNew => !changed,
            TrustPolicy::Strict => false,
        };
        if !accepted {
            return Err(match self.policy {
                TrustPolicy::Prompt => HostKeyError::Rejected { host: name },
                _ => HostKeyError::Untrusted {
                    host: name,
                    fingerprint: key.fingerprint(),
                },
            }
            .into());
        }
        match self.store.add(host, port, key) {
            Ok(()) => eprintln!("Warning: Permanently added '{name}' to known hosts."),
            Err(error) => tracing::warn!("failed to save host key for {name}: {:#}", &error),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn key(material: &[u8]) -> HostKey {
        HostKey::new("ssh-ed25519", material)
    }

    /// Prompt answering with a fixed reply and counting how often it was asked
    struct Scripted {
        answer: &'static str,
        asked: Arc<AtomicUsize>,
    }

    impl HostKeyPrompt for Scripted {
        fn confirm(&self, _host: &str, _key: &HostKey) -> anyhow::Result<bool> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            Ok(is_affirmative(self.answer))
        }
    }

    fn verifier(store: &KnownHosts, answer: &'static str) -> (HostVerifier, Arc<AtomicUsize>) {
        let asked = Arc::new(AtomicUsize::new(0));
        let prompt = Scripted {
            answer,
            asked: asked.clone(),
        };
        (
            HostVerifier::with_prompt(store.clone(), TrustPolicy::Prompt, Box::new(prompt)),
            asked,
        )
    }

    #[test]
    fn host_normalization() {
        assert_eq!(normalize_host("example.com", 22), "example.com");
        assert_eq!(normalize_host("example.com", 2222), "[example.com]:2222");
        assert_eq!(normalize_host("::1", 22), "::1");
        assert_eq!(normalize_host("[::1]", 2222), "[::1]:2222");
    }

    #[test]
    fn fingerprint_format() {
        assert_eq!(
            fingerprint(b""),
            "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[test]
    fn key_type_names() {
        assert_eq!(key_type_name(ssh2::HostKeyType::Ed25519), "ssh-ed25519");
        assert_eq!(key_type_name(ssh2::HostKeyType::Rsa), "ssh-rsa");
        assert_eq!(
            key_type_name(ssh2::HostKeyType::Ecdsa256),
            "ecdsa-sha2-nistp256"
        );
    }

    #[test]
    fn decisions() {
        let ours = key(b"server key");
        let contents = format!(
            "# comment line\n\
            \n\
            other.host ssh-ed25519 {other}\n\
            alias,example.com ssh-ed25519 {ours}\n\
            [example.com]:2222 ssh-rsa {ours}\n",
            other = key(b"another").encoded(),
            ours = ours.encoded(),
        );
        assert_eq!(decide(&contents, "example.com", &ours), TrustDecision::Known);
        assert_eq!(decide(&contents, "alias", &ours), TrustDecision::Known);
        // same material, different key type
        assert_eq!(
            decide(&contents, "[example.com]:2222", &ours),
            TrustDecision::Unknown
        );
        assert_eq!(decide(&contents, "new.host", &ours), TrustDecision::Unknown);
        assert_eq!(
            decide(&contents, "other.host", &ours),
            TrustDecision::Changed {
                expected_fingerprint: fingerprint(b"another"),
                actual_fingerprint: fingerprint(b"server key"),
            }
        );
        assert_eq!(decide("", "example.com", &ours), TrustDecision::Unknown);
    }

    #[test]
    fn affirmative_answers() {
        assert!(is_affirmative("yes\n"));
        assert!(is_affirmative("  YES "));
        assert!(!is_affirmative("y"));
        assert!(!is_affirmative("no"));
        assert!(!is_affirmative(""));
    }

    #[test]
    fn accepted_host_is_not_prompted_again() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let path = tmp_dir.path().join("ssh").join("known_hosts");
        let store = KnownHosts::new(&path);
        let (verifier, asked) = verifier(&store, "yes");
        let server = key(b"server key");
        verifier.verify("example.com", 2222, &server)?;
        assert_eq!(asked.load(Ordering::SeqCst), 1);
        assert_eq!(
            std::fs::read_to_string(&path)?,
            format!("[example.com]:2222 ssh-ed25519 {}\n", server.encoded())
        );
        assert_eq!(
            std::fs::metadata(&path)?.permissions().mode() & 0o777,
            0o600
        );
        assert_eq!(
            std::fs::metadata(path.parent().unwrap())?.permissions().mode() & 0o777,
            0o700
        );
        verifier.verify("example.com", 2222, &server)?;
        assert_eq!(asked.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.check("example.com", 2222, &server)?,
            TrustDecision::Known
        );
        Ok(())
    }

    #[test]
    fn rejected_host_aborts() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let path = tmp_dir.path().join("known_hosts");
        let store = KnownHosts::new(&path);
        let (verifier, asked) = verifier(&store, "no");
        let error = verifier
            .verify("example.com", 22, &key(b"server key"))
            .unwrap_err();
        assert_eq!(asked.load(Ordering::SeqCst), 1);
        assert!(matches!(
            error.downcast_ref::<HostKeyError>(),
            Some(HostKeyError::Rejected { .. })
        ));
        assert_eq!(error.to_string(), "host key verification rejected by user");
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn changed_key_prompts_again() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let store = KnownHosts::new(tmp_dir.path().join("known_hosts"));
        store.add("example.com", 22, &key(b"old key"))?;
        let (verifier, asked) = verifier(&store, "yes");
        verifier.verify("example.com", 22, &key(b"new key"))?;
        assert_eq!(asked.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.check("example.com", 22, &key(b"new key"))?,
            TrustDecision::Known
        );
        Ok(())
    }

    #[test]
    fn non_interactive_policies() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let store = KnownHosts::new(tmp_dir.path().join("known_hosts"));
        let strict = HostVerifier::new(store.clone(), TrustPolicy::Strict);
        let error = strict.verify("example.com", 22, &key(b"k1")).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<HostKeyError>(),
            Some(HostKeyError::Untrusted { .. })
        ));
        let accept_new = HostVerifier::new(store.clone(), TrustPolicy::AcceptNew);
        accept_new.verify("example.com", 22, &key(b"k1"))?;
        strict.verify("example.com", 22, &key(b"k1"))?;
        // a different key for a recorded host is not "new"
        assert!(accept_new.verify("example.com", 22, &key(b"k2")).is_err());
        Ok(())
    }

    #[test]
    fn policy_names() {
        assert_eq!("accept-new".parse::<TrustPolicy>().unwrap(), TrustPolicy::AcceptNew);
        assert_eq!("strict".parse::<TrustPolicy>().unwrap(), TrustPolicy::Strict);
        assert_eq!(TrustPolicy::default().to_string(), "prompt");
        assert!("sometimes".parse::<TrustPolicy>().is_err());
    }
}
