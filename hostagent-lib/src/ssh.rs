//! SSH public key handling and the shell snippets used to set up sshd inside a
//! workload container.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hostagent_common::{AgentError, Result};
use ssh_key::{HashAlg, PublicKey};
use std::collections::BTreeSet;

pub const SSH_DIR: &str = "/root/.ssh";
pub const AUTHORIZED_KEYS: &str = "/root/.ssh/authorized_keys";

/// Installs an OpenSSH server with whichever package manager the image ships.
pub const INSTALL_SCRIPT: &str = r#"set -e
if [ -x /usr/sbin/sshd ]; then exit 0; fi
if command -v apt-get >/dev/null 2>&1; then
  apt-get update -qq
  DEBIAN_FRONTEND=noninteractive apt-get install -y -qq openssh-server
elif command -v apk >/dev/null 2>&1; then
  apk add --no-cache openssh-server
elif command -v dnf >/dev/null 2>&1; then
  dnf install -y openssh-server
elif command -v yum >/dev/null 2>&1; then
  yum install -y openssh-server
else
  echo "no supported package manager found" >&2
  exit 127
fi"#;

pub const CONFIGURE_SCRIPT: &str = r#"set -e
mkdir -p /var/run/sshd
touch /etc/ssh/sshd_config
sed -i -e '/^#\?PermitRootLogin/d' -e '/^#\?PubkeyAuthentication/d' /etc/ssh/sshd_config
printf 'PermitRootLogin prohibit-password\nPubkeyAuthentication yes\n' >> /etc/ssh/sshd_config
ssh-keygen -A"#;

pub const START_SCRIPT: &str = "/usr/sbin/sshd";

/// Starting a container kills any previously exec-spawned daemon.
pub const RESTART_SCRIPT: &str =
    "pkill -x sshd >/dev/null 2>&1 || true; mkdir -p /var/run/sshd; /usr/sbin/sshd";

/// Parse one OpenSSH public key line (`ssh-ed25519 AAAA... comment`).
pub fn parse_public_key(line: &str) -> Result<PublicKey> {
    let line = line.trim();
    if line.is_empty() {
        return Err(AgentError::InvalidSpec("ssh public key is empty".to_string()));
    }
    if line.contains('\n') {
        return Err(AgentError::InvalidSpec(
            "expected a single ssh public key line".to_string(),
        ));
    }
    PublicKey::from_openssh(line)
        .map_err(|e| AgentError::InvalidSpec(format!("unsupported ssh public key: {e}")))
}

/// Canonical `authorized_keys` line for a key, comment preserved.
pub fn canonical_line(key: &PublicKey) -> Result<String> {
    key.to_openssh()
        .map_err(|e| AgentError::Internal(format!("encode ssh key: {e}")))
}

pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Position-independent lookup of `key` among stored lines; keys compare by
/// algorithm and key material only.
pub fn find_key<'a>(stored: &'a BTreeSet<String>, key: &PublicKey) -> Option<&'a String> {
    stored.iter().find(|line| {
        PublicKey::from_openssh(line)
            .map(|existing| existing.key_data() == key.key_data())
            .unwrap_or(false)
    })
}

pub fn authorized_keys_content(keys: &BTreeSet<String>) -> String {
    keys.iter().map(|k| format!("{k}\n")).collect()
}

fn shell(script: impl Into<String>) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.into()]
}

pub fn install_command() -> Vec<String> {
    shell(INSTALL_SCRIPT)
}

pub fn configure_command() -> Vec<String> {
    shell(CONFIGURE_SCRIPT)
}

pub fn start_command() -> Vec<String> {
    shell(START_SCRIPT)
}

pub fn restart_command() -> Vec<String> {
    shell(RESTART_SCRIPT)
}

/// Rewrite `authorized_keys` with exactly `keys`. The content travels base64
/// encoded so no key text is ever interpreted by the shell.
pub fn write_keys_command(keys: &BTreeSet<String>) -> Vec<String> {
    let encoded = STANDARD.encode(authorized_keys_content(keys));
    shell(format!(
        "set -e; umask 077; mkdir -p {SSH_DIR}; chmod 700 {SSH_DIR}; \
         printf '%s' '{encoded}' | base64 -d > {AUTHORIZED_KEYS}.tmp; \
         chmod 600 {AUTHORIZED_KEYS}.tmp; mv {AUTHORIZED_KEYS}.tmp {AUTHORIZED_KEYS}"
    ))
}
