//! Encrypted message bodies for the TO2 tunnel.
//!
//! After key exchange every message travels as an EMB: the simple suites
//! are a COSE Encrypt0 with an AEAD cipher, the composed suites wrap an
//! unauthenticated Encrypt0 in a COSE Mac0 carrying an HMAC over its
//! serialized bytes.

use coset::{
    iana, CoseEncrypt0, CoseEncrypt0Builder, CoseMac0, Header, HeaderBuilder,
    RegisteredLabelWithPrivate, TaggedCborSerializable,
};
use eyre::{bail, ensure, Context, OptionExt};
use openssl::symm::{decrypt, decrypt_aead, encrypt, encrypt_aead, Cipher};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::kdf::derive_key_material;
use super::kex::KeyExchangeResult;
use super::CryptoService;

/// ```cddl
/// CipherSuites /= (
///     AES128GCM:          1,
///     AES256GCM:          3,
///     AES-CCM-64-128-128: 32,
///     AES-CCM-64-128-256: 33,
///     AES128/CTR/HMAC-SHA256: -17760704,
///     AES128/CBC/HMAC-SHA256: -17760703,
///     AES256/CTR/HMAC-SHA384: -17760706,
///     AES256/CBC/HMAC-SHA384: -17760705
/// )
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
#[repr(i64)]
pub enum CipherSuite {
    A128Gcm = 1,
    A256Gcm = 3,
    AesCcm64_128_128 = 32,
    AesCcm64_128_256 = 33,
    Aes128CtrHmacSha256 = -17760704,
    Aes128CbcHmacSha256 = -17760703,
    Aes256CtrHmacSha384 = -17760706,
    Aes256CbcHmacSha384 = -17760705,
}

impl TryFrom<i64> for CipherSuite {
    type Error = eyre::Report;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        let value = match value {
            1 => CipherSuite::A128Gcm,
            3 => CipherSuite::A256Gcm,
            32 => CipherSuite::AesCcm64_128_128,
            33 => CipherSuite::AesCcm64_128_256,
            -17760704 => CipherSuite::Aes128CtrHmacSha256,
            -17760703 => CipherSuite::Aes128CbcHmacSha256,
            -17760706 => CipherSuite::Aes256CtrHmacSha384,
            -17760705 => CipherSuite::Aes256CbcHmacSha384,
            _ => bail!("value out of range: {value}"),
        };

        Ok(value)
    }
}

impl From<CipherSuite> for i64 {
    fn from(value: CipherSuite) -> Self {
        value as i64
    }
}

impl CipherSuite {
    /// Session encryption key size.
    fn sek_len(&self) -> usize {
        match self {
            CipherSuite::A128Gcm
            | CipherSuite::AesCcm64_128_128
            | CipherSuite::Aes128CtrHmacSha256
            | CipherSuite::Aes128CbcHmacSha256 => 16,
            CipherSuite::A256Gcm
            | CipherSuite::AesCcm64_128_256
            | CipherSuite::Aes256CtrHmacSha384
            | CipherSuite::Aes256CbcHmacSha384 => 32,
        }
    }

    /// Session verification key size, zero for the AEAD suites.
    fn svk_len(&self) -> usize {
        match self {
            CipherSuite::Aes128CtrHmacSha256 | CipherSuite::Aes128CbcHmacSha256 => 32,
            CipherSuite::Aes256CtrHmacSha384 | CipherSuite::Aes256CbcHmacSha384 => 64,
            _ => 0,
        }
    }

    /// PRF for the key derivation.
    fn kdf_algorithm(&self) -> aws_lc_rs::hmac::Algorithm {
        match self {
            CipherSuite::Aes256CtrHmacSha384 | CipherSuite::Aes256CbcHmacSha384 => {
                aws_lc_rs::hmac::HMAC_SHA384
            }
            _ => aws_lc_rs::hmac::HMAC_SHA256,
        }
    }

    fn is_ctr(&self) -> bool {
        matches!(
            self,
            CipherSuite::Aes128CtrHmacSha256 | CipherSuite::Aes256CtrHmacSha384
        )
    }

    fn is_composed(&self) -> bool {
        self.svk_len() != 0
    }

    fn iv_len(&self) -> usize {
        match self {
            CipherSuite::A128Gcm | CipherSuite::A256Gcm => 12,
            CipherSuite::AesCcm64_128_128 | CipherSuite::AesCcm64_128_256 => 7,
            _ => 16,
        }
    }

    fn cipher(&self) -> Cipher {
        match self {
            CipherSuite::A128Gcm => Cipher::aes_128_gcm(),
            CipherSuite::A256Gcm => Cipher::aes_256_gcm(),
            CipherSuite::AesCcm64_128_128 => Cipher::aes_128_ccm(),
            CipherSuite::AesCcm64_128_256 => Cipher::aes_256_ccm(),
            CipherSuite::Aes128CtrHmacSha256 => Cipher::aes_128_ctr(),
            CipherSuite::Aes256CtrHmacSha384 => Cipher::aes_256_ctr(),
            CipherSuite::Aes128CbcHmacSha256 => Cipher::aes_128_cbc(),
            CipherSuite::Aes256CbcHmacSha384 => Cipher::aes_256_cbc(),
        }
    }

    fn algorithm_label(&self) -> RegisteredLabelWithPrivate<iana::Algorithm> {
        match self {
            CipherSuite::A128Gcm => RegisteredLabelWithPrivate::Assigned(iana::Algorithm::A128GCM),
            CipherSuite::A256Gcm => RegisteredLabelWithPrivate::Assigned(iana::Algorithm::A256GCM),
            CipherSuite::AesCcm64_128_128 => {
                RegisteredLabelWithPrivate::Assigned(iana::Algorithm::AES_CCM_64_128_128)
            }
            CipherSuite::AesCcm64_128_256 => {
                RegisteredLabelWithPrivate::Assigned(iana::Algorithm::AES_CCM_64_128_256)
            }
            // The CTR and CBC ids have no IANA assignment
            other => RegisteredLabelWithPrivate::PrivateUse(*other as i64),
        }
    }

    fn mac_algorithm(&self) -> eyre::Result<(iana::Algorithm, aws_lc_rs::hmac::Algorithm)> {
        match self {
            CipherSuite::Aes128CtrHmacSha256 | CipherSuite::Aes128CbcHmacSha256 => {
                Ok((iana::Algorithm::HMAC_256_256, aws_lc_rs::hmac::HMAC_SHA256))
            }
            CipherSuite::Aes256CtrHmacSha384 | CipherSuite::Aes256CbcHmacSha384 => {
                Ok((iana::Algorithm::HMAC_384_384, aws_lc_rs::hmac::HMAC_SHA384))
            }
            _ => bail!("AEAD suite has no MAC"),
        }
    }
}

/// Per session tunnel state, derived from the key exchange result.
///
/// Serializable so a session can resume on a different worker. Keys are
/// scrubbed on drop.
#[derive(Debug, Serialize, Deserialize)]
pub struct EncryptionState {
    suite: CipherSuite,
    #[serde(with = "serde_bytes")]
    sek: Vec<u8>,
    #[serde(with = "serde_bytes")]
    svk: Vec<u8>,
    /// First 12 bytes of the CTR IV, fixed for the session.
    #[serde(with = "serde_bytes")]
    iv_seed: Vec<u8>,
    /// CTR block counter, advanced by the blocks of every sent message.
    counter: u32,
}

impl Drop for EncryptionState {
    fn drop(&mut self) {
        self.sek.zeroize();
        self.svk.zeroize();
    }
}

impl EncryptionState {
    pub fn derive(
        suite: CipherSuite,
        keys: &KeyExchangeResult,
        crypto: &CryptoService,
    ) -> eyre::Result<Self> {
        let mut material = vec![0; suite.sek_len() + suite.svk_len()];

        derive_key_material(
            suite.kdf_algorithm(),
            &keys.shared_secret,
            &keys.context_rand,
            &mut material,
        )?;

        let svk = material.split_off(suite.sek_len());

        let iv_seed = if suite.is_ctr() {
            crypto.random_bytes(12)?
        } else {
            Vec::new()
        };

        Ok(Self {
            suite,
            sek: material,
            svk,
            iv_seed,
            counter: 0,
        })
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Encrypts a protocol message body, returning the serialized EMB.
    pub fn encrypt(&mut self, crypto: &CryptoService, plaintext: &[u8]) -> eyre::Result<Vec<u8>> {
        let iv = self.next_iv(crypto)?;

        if self.suite.is_composed() {
            self.encrypt_composed(plaintext, iv)
        } else {
            self.encrypt_simple(plaintext, iv)
        }
    }

    /// Decrypts a serialized EMB back into the protocol message body.
    pub fn decrypt(&self, buf: &[u8]) -> eyre::Result<Vec<u8>> {
        if self.suite.is_composed() {
            self.decrypt_composed(buf)
        } else {
            self.decrypt_simple(buf)
        }
    }

    fn next_iv(&mut self, crypto: &CryptoService) -> eyre::Result<Vec<u8>> {
        if self.suite.is_ctr() {
            let mut iv = self.iv_seed.clone();
            iv.extend_from_slice(&self.counter.to_be_bytes());

            Ok(iv)
        } else {
            crypto.random_bytes(self.suite.iv_len())
        }
    }

    /// The CTR counter advances by the blocks consumed by the message.
    fn advance_counter(&mut self, cipher_len: usize) -> eyre::Result<()> {
        if !self.suite.is_ctr() {
            return Ok(());
        }

        let blocks = u32::try_from(cipher_len.div_ceil(16))?;
        self.counter = self
            .counter
            .checked_add(blocks)
            .ok_or_eyre("CTR counter exhausted")?;

        Ok(())
    }

    fn protected_header(&self) -> Header {
        let mut header = Header::default();
        header.alg = Some(self.suite.algorithm_label());

        header
    }

    fn encrypt_simple(&mut self, plaintext: &[u8], iv: Vec<u8>) -> eyre::Result<Vec<u8>> {
        let protected = self.protected_header();

        let encrypt0 = CoseEncrypt0Builder::new()
            .protected(protected)
            .unprotected(HeaderBuilder::new().iv(iv.clone()).build())
            .try_create_ciphertext(plaintext, &[], |plaintext, aad| {
                let mut tag = [0; 16];
                let mut ciphertext = encrypt_aead(
                    self.suite.cipher(),
                    &self.sek,
                    Some(&iv),
                    aad,
                    plaintext,
                    &mut tag,
                )
                .wrap_err("encryption failed")?;

                ciphertext.extend_from_slice(&tag);

                Ok::<_, eyre::Report>(ciphertext)
            })?
            .build();

        encrypt0
            .to_tagged_vec()
            .map_err(|err| eyre::eyre!("couldn't encode Encrypt0: {err}"))
    }

    fn decrypt_simple(&self, buf: &[u8]) -> eyre::Result<Vec<u8>> {
        let encrypt0 = CoseEncrypt0::from_tagged_slice(buf)
            .map_err(|err| eyre::eyre!("invalid Encrypt0: {err}"))?;

        let iv = &encrypt0.unprotected.iv;
        ensure!(iv.len() == self.suite.iv_len(), "invalid IV size: {}", iv.len());

        encrypt0.decrypt(&[], |ciphertext, aad| {
            let (ciphertext, tag) = ciphertext
                .split_last_chunk::<16>()
                .ok_or_eyre("ciphertext shorter than the tag")?;

            decrypt_aead(self.suite.cipher(), &self.sek, Some(iv), aad, ciphertext, tag)
                .wrap_err("decryption failed")
        })
    }

    fn encrypt_composed(&mut self, plaintext: &[u8], iv: Vec<u8>) -> eyre::Result<Vec<u8>> {
        let ciphertext = encrypt(self.suite.cipher(), &self.sek, Some(&iv), plaintext)
            .wrap_err("encryption failed")?;

        self.advance_counter(ciphertext.len())?;

        let encrypt0 = CoseEncrypt0Builder::new()
            .protected(self.protected_header())
            .unprotected(HeaderBuilder::new().iv(iv).build())
            .ciphertext(ciphertext)
            .build();

        let payload = encrypt0
            .to_tagged_vec()
            .map_err(|err| eyre::eyre!("couldn't encode Encrypt0: {err}"))?;

        let (mac_alg, hmac_alg) = self.suite.mac_algorithm()?;

        let key = aws_lc_rs::hmac::Key::new(hmac_alg, &self.svk);
        let tag = aws_lc_rs::hmac::sign(&key, &payload);

        let mac0 = CoseMac0 {
            protected: coset::ProtectedHeader {
                original_data: None,
                header: HeaderBuilder::new().algorithm(mac_alg).build(),
            },
            unprotected: Header::default(),
            payload: Some(payload),
            tag: tag.as_ref().to_vec(),
        };

        mac0.to_tagged_vec()
            .map_err(|err| eyre::eyre!("couldn't encode Mac0: {err}"))
    }

    fn decrypt_composed(&self, buf: &[u8]) -> eyre::Result<Vec<u8>> {
        let mac0 =
            CoseMac0::from_tagged_slice(buf).map_err(|err| eyre::eyre!("invalid Mac0: {err}"))?;

        let payload = mac0.payload.as_deref().ok_or_eyre("missing Mac0 payload")?;

        let (_, hmac_alg) = self.suite.mac_algorithm()?;
        let key = aws_lc_rs::hmac::Key::new(hmac_alg, &self.svk);
        aws_lc_rs::hmac::verify(&key, payload, &mac0.tag)
            .map_err(|_| eyre::eyre!("message authentication failed"))?;

        let encrypt0 = CoseEncrypt0::from_tagged_slice(payload)
            .map_err(|err| eyre::eyre!("invalid Encrypt0: {err}"))?;

        let iv = &encrypt0.unprotected.iv;
        ensure!(iv.len() == self.suite.iv_len(), "invalid IV size: {}", iv.len());

        let ciphertext = encrypt0
            .ciphertext
            .as_deref()
            .ok_or_eyre("missing ciphertext")?;

        decrypt(self.suite.cipher(), &self.sek, Some(iv), ciphertext).wrap_err("decryption failed")
    }
}
