//! Envelope format for the vault ciphertext.
//!
//! The keystream is SHA-256 in counter mode over `key || nonce || counter`,
//! and each envelope carries a 16-byte keyed tag over the nonce and the
//! ciphertext. Opening with the wrong key fails the tag check, so a
//! user/device mismatch yields `None` instead of garbage text.
//!
//! This is obfuscation, not a security boundary: the key is re-derivable from
//! the user id and the device fingerprint, both of which are readable by any
//! code running as the same user.

use base64::Engine as _;

use super::digest::Sha256;

const ENVELOPE_PREFIX: &str = "v1:";
pub(crate) const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 16;
const TAG_DOMAIN: &[u8] = b"uru-vault-tag";

/// Symmetric key derived from user and device inputs. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct VaultKey(pub(crate) [u8; 32]);

impl VaultKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VaultKey(..)")
    }
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn seal(key: &VaultKey, plaintext: &str) -> Result<String, getrandom::Error> {
    let mut nonce = [0_u8; NONCE_LEN];
    getrandom::fill(&mut nonce)?;
    Ok(seal_with_nonce(key, plaintext, &nonce))
}

pub(crate) fn seal_with_nonce(key: &VaultKey, plaintext: &str, nonce: &[u8; NONCE_LEN]) -> String {
    let mut body = plaintext.as_bytes().to_vec();
    apply_keystream(key, nonce, &mut body);
    let tag = compute_tag(key, nonce, &body);

    let mut envelope = Vec::with_capacity(NONCE_LEN + body.len() + TAG_LEN);
    envelope.extend_from_slice(nonce);
    envelope.extend_from_slice(&body);
    envelope.extend_from_slice(&tag);

    format!(
        "{ENVELOPE_PREFIX}{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(envelope)
    )
}

/// Decrypt an envelope produced by [`seal`].
///
/// Returns `None` for unknown formats, truncated input, a tag mismatch (wrong
/// key) and plaintext that is not valid UTF-8.
pub fn open(key: &VaultKey, envelope: &str) -> Option<String> {
    let encoded = envelope.trim().strip_prefix(ENVELOPE_PREFIX)?;
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(encoded)
        .ok()?;
    if raw.len() < NONCE_LEN + TAG_LEN {
        return None;
    }

    let (nonce, rest) = raw.split_at(NONCE_LEN);
    let (body, tag) = rest.split_at(rest.len() - TAG_LEN);
    let nonce: [u8; NONCE_LEN] = nonce.try_into().ok()?;

    if !tags_match(&compute_tag(key, &nonce, body), tag) {
        return None;
    }

    let mut plaintext = body.to_vec();
    apply_keystream(key, &nonce, &mut plaintext);
    String::from_utf8(plaintext).ok()
}

fn apply_keystream(key: &VaultKey, nonce: &[u8; NONCE_LEN], data: &mut [u8]) {
    let keyed = Sha256::new().update(&key.0).update(nonce);
    for (counter, block) in data.chunks_mut(32).enumerate() {
        let pad = keyed
            .clone()
            .update(&(counter as u64).to_be_bytes())
            .finalize();
        for (byte, mask) in block.iter_mut().zip(pad) {
            *byte ^= mask;
        }
    }
}

fn compute_tag(key: &VaultKey, nonce: &[u8; NONCE_LEN], body: &[u8]) -> [u8; TAG_LEN] {
    let digest = Sha256::new()
        .update(TAG_DOMAIN)
        .update(&key.0)
        .update(nonce)
        .update(body)
        .finalize();
    let mut tag = [0_u8; TAG_LEN];
    tag.copy_from_slice(&digest[..TAG_LEN]);
    tag
}

fn tags_match(expected: &[u8], actual: &[u8]) -> bool {
    expected.len() == actual.len()
        && expected
            .iter()
            .zip(actual)
            .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
