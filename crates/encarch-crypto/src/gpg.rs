//! GnuPG command-line backend
//!
//! Drives the `gpg` binary for both collaborator roles:
//! - key lookup via `--with-colons --list-keys`
//! - binary stream encryption via `--encrypt --recipient <fpr> --output <path>`
//!
//! Keys and trust are managed entirely by the keyring; this module never
//! imports, generates or signs anything.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use tracing::debug;

use crate::error::{CryptoError, CryptoResult};
use crate::fingerprint::matches_suffix;
use crate::{Encryptor, Recipient, RecipientResolver};

/// Settings for the `gpg` backend
#[derive(Debug, Clone)]
pub struct GpgConfig {
    /// Program to invoke (default: `gpg`)
    pub binary: String,
    /// Alternate keyring home, passed as `--homedir`
    pub homedir: Option<PathBuf>,
    /// Encrypt to keys that are not ultimately trusted (`--trust-model always`)
    pub always_trust: bool,
}

impl Default for GpgConfig {
    fn default() -> Self {
        Self {
            binary: "gpg".to_string(),
            homedir: None,
            always_trust: false,
        }
    }
}

/// Encryption and key lookup through the `gpg` executable
#[derive(Debug, Clone, Default)]
pub struct GpgBackend {
    config: GpgConfig,
}

impl GpgBackend {
    pub fn new(config: GpgConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("--batch").arg("--no-tty");
        if let Some(ref home) = self.config.homedir {
            cmd.arg("--homedir").arg(home);
        }
        cmd
    }

    fn spawn_error(&self, source: io::Error) -> CryptoError {
        CryptoError::Spawn {
            binary: self.config.binary.clone(),
            source,
        }
    }

    /// List public keys in keyring order.
    pub fn list_keys(&self) -> CryptoResult<Vec<Recipient>> {
        let output = self
            .command()
            .args(["--with-colons", "--fixed-list-mode", "--list-keys"])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(CryptoError::Gpg {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_colon_listing(&String::from_utf8_lossy(&output.stdout))
    }
}

impl RecipientResolver for GpgBackend {
    fn resolve(&self, suffix: &str) -> CryptoResult<Recipient> {
        let keys = self.list_keys()?;
        debug!(keys = keys.len(), suffix, "searching keyring");
        find_by_suffix(keys, suffix)
    }
}

impl Encryptor for GpgBackend {
    fn encrypt_to_file(
        &self,
        source: &mut dyn Read,
        recipient: &Recipient,
        output: &Path,
    ) -> CryptoResult<()> {
        let mut cmd = self.command();
        cmd.args(["--yes", "--quiet", "--no-armor"]);
        if self.config.always_trust {
            cmd.args(["--trust-model", "always"]);
        }
        cmd.arg("--encrypt")
            .arg("--recipient")
            .arg(&recipient.fingerprint)
            .arg("--output")
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        // Drain stderr on its own thread so a chatty gpg cannot block on a
        // full pipe while we are still feeding stdin.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf);
                buf
            })
        });

        let copied = match child.stdin.take() {
            Some(mut stdin) => io::copy(source, &mut stdin).map(|_| ()),
            None => Ok(()),
        };

        let status = child.wait()?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(CryptoError::Gpg {
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        copied?;
        Ok(())
    }
}

/// Pick the first key whose primary fingerprint ends with `suffix`.
pub fn find_by_suffix(keys: Vec<Recipient>, suffix: &str) -> CryptoResult<Recipient> {
    keys.into_iter()
        .find(|key| matches_suffix(&key.fingerprint, suffix))
        .ok_or_else(|| CryptoError::RecipientNotFound(suffix.to_string()))
}

/// Parse `gpg --with-colons --list-keys` output into primary keys.
///
/// Only the first `fpr` record after each `pub` record is the primary
/// fingerprint; `fpr` records following a `sub` belong to subkeys and are
/// ignored. The first `uid` record supplies the display name.
pub fn parse_colon_listing(listing: &str) -> CryptoResult<Vec<Recipient>> {
    let mut keys = Vec::new();
    let mut current: Option<PartialKey> = None;
    let mut in_subkey = false;

    for line in listing.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first().copied() {
            Some("pub") => {
                if let Some(done) = current.take() {
                    keys.push(done.finish()?);
                }
                current = Some(PartialKey::default());
                in_subkey = false;
            }
            Some("sub") | Some("ssb") => in_subkey = true,
            Some("fpr") if !in_subkey => {
                if let Some(ref mut key) = current {
                    if key.fingerprint.is_none() {
                        let fpr = fields.get(9).copied().unwrap_or_default();
                        if fpr.is_empty() {
                            return Err(CryptoError::Listing(format!(
                                "fpr record without fingerprint: {}",
                                line
                            )));
                        }
                        key.fingerprint = Some(fpr.to_ascii_uppercase());
                    }
                }
            }
            Some("uid") => {
                if let Some(ref mut key) = current {
                    if key.uid.is_none() {
                        let uid = fields.get(9).copied().unwrap_or_default();
                        key.uid = Some(unescape_colon_field(uid));
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(done) = current.take() {
        keys.push(done.finish()?);
    }

    Ok(keys)
}

#[derive(Default)]
struct PartialKey {
    fingerprint: Option<String>,
    uid: Option<String>,
}

impl PartialKey {
    fn finish(self) -> CryptoResult<Recipient> {
        let fingerprint = self
            .fingerprint
            .ok_or_else(|| CryptoError::Listing("pub record without fpr".to_string()))?;
        Ok(Recipient {
            fingerprint,
            uid: self.uid.unwrap_or_default(),
        })
    }
}

/// Decode the `\xNN` escapes gpg uses inside colon-listing fields.
fn unescape_colon_field(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1] == b'x' {
            let hex = std::str::from_utf8(&bytes[i + 2..i + 4]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
