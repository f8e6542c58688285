//! Destination address tokens.
//!
//! Clients never see backend addresses. They carry a token, usually an OpenSSL-compatible
//! AES-256-CBC ciphertext (`base64("Salted__" || salt || ciphertext)`, key and IV derived with
//! `EVP_BytesToKey`/MD5 from the operator passphrase), which the gateway turns back into the
//! `host:port` it dials.

use crate::config::TokenSplit;
use crate::error::DecodeError;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use md5::{Digest, Md5};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const SALT_MAGIC: &[u8; 8] = b"Salted__";
const SALT_LEN: usize = 8;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

/// Resolves client tokens into dial targets.
#[derive(Clone)]
pub struct AddressCodec {
    passphrase: String,
    split: Option<TokenSplit>,
}

impl std::fmt::Debug for AddressCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressCodec")
            .field("passphrase", &"<redacted>")
            .field("split", &self.split)
            .finish()
    }
}

impl AddressCodec {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
            split: None,
        }
    }

    pub fn with_split(mut self, split: Option<TokenSplit>) -> Self {
        self.split = split;
        self
    }

    /// Turn a raw query value into the address to dial.
    ///
    /// Plaintext `host:port` is accepted as-is unless `require_encrypted` is set; anything else
    /// must decrypt under the configured passphrase.
    pub fn resolve(&self, token: &str, require_encrypted: bool) -> Result<String, DecodeError> {
        // query decoding turns '+' into ' '
        let normalized = token.replace(' ', "+");
        let mut token = normalized.trim();

        if let Some(split) = &self.split {
            token = split.apply(token)?.trim();
        }

        if token.is_empty() {
            return Err(DecodeError::Empty);
        }

        if !require_encrypted && is_plain_endpoint(token) {
            return validate_endpoint(&sanitize(token));
        }

        let decrypted = self.decrypt(token)?;
        validate_endpoint(&sanitize(&decrypted))
    }

    /// Produce a token that [`AddressCodec::resolve`] accepts for `addr`.
    pub fn encrypt(&self, addr: &str) -> String {
        let salt: [u8; SALT_LEN] = rand::random();
        encrypt_with_salt(&self.passphrase, addr.as_bytes(), &salt)
    }

    /// Decrypt a token without any endpoint validation.
    pub fn decrypt(&self, token: &str) -> Result<String, DecodeError> {
        decrypt_token(&self.passphrase, token)
    }
}

fn encrypt_with_salt(passphrase: &str, plaintext: &[u8], salt: &[u8; SALT_LEN]) -> String {
    let (key, iv) = bytes_to_key(passphrase.as_bytes(), salt);
    let ciphertext =
        Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut raw = Vec::with_capacity(SALT_MAGIC.len() + SALT_LEN + ciphertext.len());
    raw.extend_from_slice(SALT_MAGIC);
    raw.extend_from_slice(salt);
    raw.extend_from_slice(&ciphertext);
    STANDARD.encode(raw)
}

fn decrypt_token(passphrase: &str, token: &str) -> Result<String, DecodeError> {
    let raw = STANDARD
        .decode(token.as_bytes())
        .map_err(|e| DecodeError::undecryptable(format!("base64: {}", e)))?;

    let header_len = SALT_MAGIC.len() + SALT_LEN;
    if raw.len() <= header_len || !raw.starts_with(SALT_MAGIC) {
        return Err(DecodeError::undecryptable("missing salt header"));
    }

    let salt = &raw[SALT_MAGIC.len()..header_len];
    let ciphertext = &raw[header_len..];
    if ciphertext.len() % 16 != 0 {
        return Err(DecodeError::undecryptable("ciphertext is not block aligned"));
    }

    let (key, iv) = bytes_to_key(passphrase.as_bytes(), salt);
    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| DecodeError::undecryptable("bad padding"))?;

    String::from_utf8(plaintext).map_err(|_| DecodeError::undecryptable("plaintext is not UTF-8"))
}

/// OpenSSL `EVP_BytesToKey` with MD5 and a single iteration.
fn bytes_to_key(passphrase: &[u8], salt: &[u8]) -> ([u8; KEY_LEN], [u8; IV_LEN]) {
    let mut material = Vec::with_capacity(KEY_LEN + IV_LEN + 16);
    let mut prev: Vec<u8> = Vec::new();

    while material.len() < KEY_LEN + IV_LEN {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(passphrase);
        hasher.update(salt);
        prev = hasher.finalize().to_vec();
        material.extend_from_slice(&prev);
    }

    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    key.copy_from_slice(&material[..KEY_LEN]);
    iv.copy_from_slice(&material[KEY_LEN..KEY_LEN + IV_LEN]);
    (key, iv)
}

/// Plaintext form: exactly one colon separating host and port.
fn is_plain_endpoint(token: &str) -> bool {
    token.matches(':').count() == 1
}

fn sanitize(value: &str) -> String {
    value.trim().chars().filter(|c| !c.is_control()).collect()
}

/// Accept `host:port` and `[v6]:port` with a numeric port.
fn validate_endpoint(addr: &str) -> Result<String, DecodeError> {
    if addr.is_empty() {
        return Err(DecodeError::Empty);
    }

    let invalid = || DecodeError::InvalidEndpoint(addr.to_string());
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;

    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) || port.parse::<u16>().is_err()
    {
        return Err(invalid());
    }

    let host_ok = if let Some(inner) = host.strip_prefix('[') {
        inner
            .strip_suffix(']')
            .is_some_and(|v6| v6.parse::<std::net::Ipv6Addr>().is_ok())
    } else {
        !host.is_empty() && !host.contains(':') && !host.contains(char::is_whitespace)
    };

    if !host_ok {
        return Err(invalid());
    }

    Ok(addr.to_string())
}
