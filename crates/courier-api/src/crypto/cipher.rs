//! Callback payload encryption.
//!
//! AES-256-CBC with the IV taken from the first 16 bytes of the key, as the
//! platform protocol requires. Plaintext frames are
//! `[u32 BE content length][content][u32 BE content length][random bytes]`,
//! PKCS#7-padded to 32-byte boundaries, and travel as base64.

use aes::Aes256;
use base64::{
    alphabet,
    engine::{general_purpose::STANDARD, DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use courier_core::CoreError;
use rand::Rng;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Platform keys are 43 base64 characters without padding and need not have
/// canonical trailing bits.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const AES_BLOCK: usize = 16;
/// PKCS#7 block used by the platform; pad values range over `1..=32`.
const PAD_BLOCK: usize = 32;
const LEN_PREFIX: usize = 4;

type Result<T> = std::result::Result<T, CoreError>;

/// Encrypts and decrypts callback payloads for one tenant.
#[derive(Clone)]
pub struct PayloadCipher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCipher").finish_non_exhaustive()
    }
}

impl PayloadCipher {
    /// Creates a cipher from the tenant's 43-character encoding key.
    ///
    /// # Errors
    ///
    /// [`CoreError::Configuration`] when the key does not decode to 32 bytes.
    pub fn new(encoding_aes_key: &str) -> Result<Self> {
        let decoded = LENIENT
            .decode(encoding_aes_key.trim())
            .map_err(|e| CoreError::Configuration(format!("encoding_aes_key is not base64: {e}")))?;
        let key: [u8; KEY_LEN] = decoded.try_into().map_err(|bytes: Vec<u8>| {
            CoreError::Configuration(format!("encoding_aes_key decodes to {} bytes, expected {KEY_LEN}", bytes.len()))
        })?;
        Ok(Self { key })
    }

    /// Decrypts a base64 ciphertext and returns the framed content bytes.
    ///
    /// # Errors
    ///
    /// [`CoreError::DecryptionFailed`] for malformed base64, a ciphertext
    /// that is not whole blocks, a pad byte outside `1..=32`, or a length
    /// field that overruns the plaintext.
    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>> {
        let mut buf = LENIENT
            .decode(ciphertext.trim())
            .map_err(|e| CoreError::decryption(format!("invalid base64: {e}")))?;
        if buf.is_empty() || buf.len() % AES_BLOCK != 0 {
            return Err(CoreError::decryption(format!("ciphertext length {} is not a whole number of blocks", buf.len())));
        }

        let plain = Aes256CbcDec::new_from_slices(&self.key, self.iv())
            .map_err(|e| CoreError::decryption(e.to_string()))?
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|e| CoreError::decryption(e.to_string()))?;

        let pad = usize::from(plain.last().copied().unwrap_or(0));
        if !(1..=PAD_BLOCK).contains(&pad) || pad > plain.len() {
            return Err(CoreError::decryption(format!("invalid padding byte {pad}")));
        }
        let frame = &plain[..plain.len() - pad];

        let (prefix, rest) = frame
            .split_first_chunk::<LEN_PREFIX>()
            .ok_or_else(|| CoreError::decryption("frame shorter than length prefix"))?;
        let content_len = usize::try_from(u32::from_be_bytes(*prefix))
            .map_err(|_| CoreError::decryption("content length does not fit"))?;
        if content_len > rest.len() {
            return Err(CoreError::decryption(format!(
                "content length {content_len} exceeds frame of {} bytes",
                rest.len()
            )));
        }
        Ok(rest[..content_len].to_vec())
    }

    /// Decrypts and requires the content to be UTF-8.
    pub fn decrypt_to_string(&self, ciphertext: &str) -> Result<String> {
        String::from_utf8(self.decrypt(ciphertext)?)
            .map_err(|_| CoreError::decryption("content is not valid UTF-8"))
    }

    /// Encrypts `content` with 16 to 32 fresh random trailing bytes.
    pub fn encrypt(&self, content: &[u8]) -> Result<String> {
        let mut rng = rand::rng();
        let mut random = vec![0u8; rng.random_range(16..=32)];
        rng.fill(random.as_mut_slice());
        self.encrypt_with_random(content, &random)
    }

    /// Encrypts `content` with caller-chosen trailing bytes.
    pub fn encrypt_with_random(&self, content: &[u8], random: &[u8]) -> Result<String> {
        let len = u32::try_from(content.len())
            .map_err(|_| CoreError::Internal("content too large to encrypt".into()))?
            .to_be_bytes();

        let mut frame = Vec::with_capacity(content.len() + 2 * LEN_PREFIX + random.len() + PAD_BLOCK);
        frame.extend_from_slice(&len);
        frame.extend_from_slice(content);
        frame.extend_from_slice(&len);
        frame.extend_from_slice(random);
        pkcs7_pad(&mut frame);

        self.seal(frame)
    }

    /// Encrypts block-aligned bytes as-is.
    fn seal(&self, mut plaintext: Vec<u8>) -> Result<String> {
        let len = plaintext.len();
        let sealed = Aes256CbcEnc::new_from_slices(&self.key, self.iv())
            .map_err(|e| CoreError::Internal(e.to_string()))?
            .encrypt_padded_mut::<NoPadding>(&mut plaintext, len)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        Ok(STANDARD.encode(sealed))
    }

    fn iv(&self) -> &[u8] {
        &self.key[..IV_LEN]
    }
}

fn pkcs7_pad(buf: &mut Vec<u8>) {
    let pad = PAD_BLOCK - buf.len() % PAD_BLOCK;
    // pad is in 1..=32, so it fits in a byte
    buf.resize(buf.len() + pad, u8::try_from(pad).unwrap_or(0));
}
