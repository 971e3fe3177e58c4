//! AEAD framing of the relay protocol. Every message opens with a random
//! salt of the cipher's salt length; a per-message subkey is derived from the
//! master key and that salt. A TCP session is the salt followed by
//! length-prefixed AEAD chunks; a UDP datagram is the salt followed by one
//! sealed payload.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce as AesNonce};
use anyhow::{anyhow, bail, Result};
use chacha20poly1305::{ChaCha20Poly1305, Nonce as ChaNonce};
use hkdf::Hkdf;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

type HkdfSha1 = Hkdf<Sha1>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherKind {
    Aes256Gcm,
    Chacha20Poly1305,
}

impl CipherKind {
    pub fn from_method(method: &str) -> Option<Self> {
        match method.to_ascii_lowercase().as_str() {
            "" | "aes-256-gcm" => Some(Self::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Some(Self::Chacha20Poly1305),
            _ => None,
        }
    }

    pub fn key_len(&self) -> usize {
        32
    }

    /// Salt length; this is the "IV" every message is prefixed with.
    pub fn salt_len(&self) -> usize {
        32
    }

    pub fn tag_len(&self) -> usize {
        16
    }
}

/// Deterministic EVP-BytesToKey-style expansion of the configured password
/// into the master key.
pub fn evp_bytes_to_key(password: &str, key_len: usize) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let mut out = hasher.finalize().to_vec();
    while out.len() < key_len {
        let mut hasher = Sha1::new();
        hasher.update(&out);
        out.extend_from_slice(&hasher.finalize());
    }
    out.truncate(key_len);
    out
}

/// Derive the per-message subkey from the master key and the message salt.
pub fn hkdf_subkey(master: &[u8], salt: &[u8]) -> [u8; 32] {
    let hk = HkdfSha1::new(Some(salt), master);
    let mut okm = [0u8; 32];
    hk.expand(b"ss-subkey", &mut okm).expect("hkdf expand");
    okm
}

fn nonce_bytes(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    nonce
}

pub fn aead_encrypt(kind: CipherKind, key: &[u8], counter: u64, data: &[u8]) -> Result<Vec<u8>> {
    let nonce = nonce_bytes(counter);
    match kind {
        CipherKind::Aes256Gcm => {
            let aead = Aes256Gcm::new_from_slice(key).map_err(|_| anyhow!("bad aes key"))?;
            aead.encrypt(AesNonce::from_slice(&nonce), Payload { msg: data, aad: &[] })
                .map_err(|_| anyhow!("encrypt"))
        }
        CipherKind::Chacha20Poly1305 => {
            let aead =
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| anyhow!("bad chacha key"))?;
            aead.encrypt(ChaNonce::from_slice(&nonce), Payload { msg: data, aad: &[] })
                .map_err(|_| anyhow!("encrypt"))
        }
    }
}

pub fn aead_decrypt(kind: CipherKind, key: &[u8], counter: u64, data: &[u8]) -> Result<Vec<u8>> {
    let nonce = nonce_bytes(counter);
    match kind {
        CipherKind::Aes256Gcm => {
            let aead = Aes256Gcm::new_from_slice(key).map_err(|_| anyhow!("bad aes key"))?;
            aead.decrypt(AesNonce::from_slice(&nonce), Payload { msg: data, aad: &[] })
                .map_err(|_| anyhow!("decrypt"))
        }
        CipherKind::Chacha20Poly1305 => {
            let aead =
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| anyhow!("bad chacha key"))?;
            aead.decrypt(ChaNonce::from_slice(&nonce), Payload { msg: data, aad: &[] })
                .map_err(|_| anyhow!("decrypt"))
        }
    }
}

/// Read one AEAD chunk of a TCP session: encrypted 2-byte length, then the
/// encrypted payload, each advancing the nonce counter.
pub async fn read_aead_chunk(
    kind: CipherKind,
    key: &[u8],
    counter: &mut u64,
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<Vec<u8>> {
    let tag = kind.tag_len();
    let mut enc_len = vec![0u8; 2 + tag];
    reader.read_exact(&mut enc_len).await?;
    let len_plain = aead_decrypt(kind, key, *counter, &enc_len)?;
    *counter += 1;
    if len_plain.len() != 2 {
        bail!("bad chunk length");
    }
    let payload_len = u16::from_be_bytes([len_plain[0], len_plain[1]]) as usize;
    let mut enc_payload = vec![0u8; payload_len + tag];
    reader.read_exact(&mut enc_payload).await?;
    let payload = aead_decrypt(kind, key, *counter, &enc_payload)?;
    *counter += 1;
    Ok(payload)
}

/// Write one AEAD chunk of a TCP session.
pub async fn write_aead_chunk(
    kind: CipherKind,
    key: &[u8],
    counter: &mut u64,
    writer: &mut (impl AsyncWrite + Unpin),
    data: &[u8],
) -> Result<()> {
    let len_be = (data.len() as u16).to_be_bytes();
    let enc_len = aead_encrypt(kind, key, *counter, &len_be)?;
    *counter += 1;
    let enc_payload = aead_encrypt(kind, key, *counter, data)?;
    *counter += 1;
    writer.write_all(&enc_len).await?;
    writer.write_all(&enc_payload).await?;
    Ok(())
}

pub fn random_salt(kind: CipherKind) -> Vec<u8> {
    let mut salt = vec![0u8; kind.salt_len()];
    rand::thread_rng().fill(&mut salt[..]);
    salt
}

/// Seal one UDP datagram: salt followed by the sealed payload.
pub fn seal_datagram(kind: CipherKind, master: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let salt = random_salt(kind);
    let subkey = hkdf_subkey(master, &salt);
    let sealed = aead_encrypt(kind, &subkey, 0, payload)?;
    let mut packet = salt;
    packet.extend_from_slice(&sealed);
    Ok(packet)
}

/// Open one UDP datagram. Packets shorter than the salt prefix, or that fail
/// authentication, are malformed.
pub fn open_datagram(kind: CipherKind, master: &[u8], packet: &[u8]) -> Result<Vec<u8>> {
    if packet.len() < kind.salt_len() + kind.tag_len() {
        bail!("received packet is abnormally small");
    }
    let (salt, sealed) = packet.split_at(kind.salt_len());
    let subkey = hkdf_subkey(master, salt);
    aead_decrypt(kind, &subkey, 0, sealed)
}

/// Length of a decoy reply, between 4 and 600 bytes.
pub fn decoy_len() -> usize {
    rand::thread_rng().gen_range(4..=600)
}
