//! Cryptographic primitives used by the TO1 and TO2 exchanges.
//!
//! Digests, HMACs and COSE signatures are backed by aws-lc-rs. The key
//! exchange and the encrypted tunnel need primitives aws-lc-rs doesn't
//! expose (serializable ECDH keys, modular exponentiation, RSA-OAEP,
//! AES-CTR/CBC) and use openssl instead.

use aws_lc_rs::rand::{SecureRandom, SystemRandom};
use aws_lc_rs::{digest, hmac, signature};
use coset::iana::EnumI64;
use coset::{CoseSign1, CoseSign1Builder, HeaderBuilder, Label, SignatureContext};
use eyre::{bail, ensure, OptionExt};
use serde_bytes::ByteArray;
use tracing::instrument;

use crate::protocol::v101::hash_hmac::{HMac, Hash, Hashtype};
use crate::protocol::v101::sign_info::{DeviceSgType, SigInfo};
use crate::protocol::v101::x509::{spki_key_bits, CoseX509};
use crate::protocol::v101::{Guid, Nonce};

use self::epid::EpidVerifier;
use self::on_die::OnDieVerifier;

pub mod cipher;
pub(crate) mod kdf;
pub mod kex;

pub mod epid;
pub mod on_die;

/// Stateless service wrapping the primitives the protocol needs.
///
/// Cheap to clone, one per server.
#[derive(Debug, Clone, Default)]
pub struct CryptoService {
    rng: SystemRandom,
    epid: Option<EpidVerifier>,
    on_die: Option<OnDieVerifier>,
}

impl CryptoService {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
            epid: None,
            on_die: None,
        }
    }

    /// Enables verification of Intel® EPID attestations through the
    /// online verification service.
    pub fn with_epid(mut self, epid: EpidVerifier) -> Self {
        self.epid = Some(epid);

        self
    }

    pub fn epid(&self) -> Option<&EpidVerifier> {
        self.epid.as_ref()
    }

    /// Enables verification of Intel® OnDie ECDSA attestations.
    pub fn with_on_die(mut self, on_die: OnDieVerifier) -> Self {
        self.on_die = Some(on_die);

        self
    }

    pub fn on_die(&self) -> Option<&OnDieVerifier> {
        self.on_die.as_ref()
    }

    pub fn random_bytes(&self, len: usize) -> eyre::Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.rng
            .fill(&mut buf)
            .map_err(|_| eyre::eyre!("rng failure"))?;

        Ok(buf)
    }

    pub fn random_nonce(&self) -> eyre::Result<Nonce> {
        let mut buf = [0; 16];
        self.rng
            .fill(&mut buf)
            .map_err(|_| eyre::eyre!("rng failure"))?;

        Ok(ByteArray::new(buf))
    }

    pub fn random_guid(&self) -> eyre::Result<Guid> {
        let mut buf = [0; 16];
        self.rng
            .fill(&mut buf)
            .map_err(|_| eyre::eyre!("rng failure"))?;

        Ok(Guid::new(buf))
    }

    pub fn hash(&self, hashtype: Hashtype, data: &[u8]) -> eyre::Result<Hash<'static>> {
        let alg = match hashtype {
            Hashtype::Sha256 => &digest::SHA256,
            Hashtype::Sha384 => &digest::SHA384,
            Hashtype::HmacSha256 | Hashtype::HmacSha384 => {
                bail!("hmac type passed to hash")
            }
        };

        let value = digest::digest(alg, data);

        Ok(Hash::new(hashtype, value.as_ref().to_vec()))
    }

    pub fn hash_verify(&self, expected: &Hash<'_>, data: &[u8]) -> eyre::Result<()> {
        let computed = self.hash(expected.hashtype, data)?;

        ensure!(
            computed.hash == expected.hash,
            "{:?} hash mismatch",
            expected.hashtype
        );

        Ok(())
    }

    pub fn hmac(&self, hashtype: Hashtype, secret: &[u8], data: &[u8]) -> eyre::Result<HMac<'static>> {
        let key = hmac::Key::new(hmac_algorithm(hashtype)?, secret);

        let tag = hmac::sign(&key, data);

        Ok(HMac::new(hashtype, tag.as_ref().to_vec()))
    }

    pub fn hmac_verify(&self, expected: &HMac<'_>, secret: &[u8], data: &[u8]) -> eyre::Result<()> {
        let key = hmac::Key::new(hmac_algorithm(expected.hashtype)?, secret);

        hmac::verify(&key, data, &expected.hash)
            .map_err(|_| eyre::eyre!("{:?} verification failed", expected.hashtype))
    }

    /// Signs a COSE Sign1 over the payload with the given unprotected
    /// header values.
    pub fn cose_sign1(
        &self,
        signer: &SigningKey,
        payload: Vec<u8>,
        unprotected: Vec<(Label, ciborium::Value)>,
    ) -> eyre::Result<CoseSign1> {
        let protected = HeaderBuilder::new().algorithm(signer.algorithm()).build();

        let mut unprotected_hdr = HeaderBuilder::new();
        for (label, value) in unprotected {
            match label {
                Label::Int(label) => {
                    unprotected_hdr = unprotected_hdr.value(label, value);
                }
                Label::Text(label) => {
                    unprotected_hdr = unprotected_hdr.text_value(label, value);
                }
            }
        }

        let sign = CoseSign1Builder::new()
            .protected(protected)
            .unprotected(unprotected_hdr.build())
            .payload(payload)
            .try_create_signature(&[], |data| signer.sign(&self.rng, data))?
            .build();

        Ok(sign)
    }

    /// Verifies a COSE Sign1 against a SubjectPublicKeyInfo.
    ///
    /// The verification algorithm is taken from the protected header.
    #[instrument(skip_all)]
    pub fn verify_sign1(&self, sign: &CoseSign1, spki: &[u8]) -> eyre::Result<()> {
        let alg = sign
            .protected
            .header
            .alg
            .as_ref()
            .ok_or_eyre("missing signature algorithm")?;

        let coset::RegisteredLabelWithPrivate::Assigned(alg) = alg else {
            bail!("unsupported signature algorithm: {alg:?}");
        };

        let verify_alg: &dyn signature::VerificationAlgorithm = match alg {
            coset::iana::Algorithm::ES256 => &signature::ECDSA_P256_SHA256_FIXED,
            coset::iana::Algorithm::ES384 => &signature::ECDSA_P384_SHA384_FIXED,
            coset::iana::Algorithm::RS256 => &signature::RSA_PKCS1_2048_8192_SHA256,
            coset::iana::Algorithm::RS384 => &signature::RSA_PKCS1_2048_8192_SHA384,
            other => bail!("unsupported signature algorithm: {}", other.to_i64()),
        };

        let key_bits = spki_key_bits(spki)?;
        let key = signature::UnparsedPublicKey::new(verify_alg, &key_bits);

        let tbs = coset::sig_structure_data(
            SignatureContext::CoseSign1,
            sign.protected.clone(),
            None,
            &[],
            sign.payload.as_deref().unwrap_or(&[]),
        );

        key.verify(&tbs, &sign.signature)
            .map_err(|_| eyre::eyre!("signature verification failed"))
    }

    /// Verifies a device attestation token, dispatching on the signature
    /// scheme the device announced in its eASigInfo.
    ///
    /// Intel® EPID tokens go through the online verification service,
    /// Intel® OnDie tokens through the offline verifier, validating the
    /// certificate chain when the caller has one. Everything else is
    /// checked against the device certificate key.
    pub async fn verify_device_sign1(
        &self,
        sign: &CoseSign1,
        sig_info: &SigInfo<'_>,
        device_key: Option<&[u8]>,
        cert_chain: Option<&CoseX509<'_>>,
    ) -> eyre::Result<()> {
        if sig_info.sg_type.is_epid() {
            let epid = self
                .epid
                .as_ref()
                .ok_or_eyre("no EPID verification service configured")?;

            return epid.verify(sign, sig_info).await;
        }

        match sig_info.sg_type {
            DeviceSgType::StSecP256R1
            | DeviceSgType::StSecP384R1
            | DeviceSgType::StRsa2048
            | DeviceSgType::StRsa3072 => {
                let spki = device_key.ok_or_eyre("missing device certificate key")?;

                self.verify_sign1(sign, spki)
            }
            DeviceSgType::StOnDie => {
                let on_die = self
                    .on_die
                    .as_ref()
                    .ok_or_eyre("no OnDie verification service configured")?;

                let tbs = coset::sig_structure_data(
                    SignatureContext::CoseSign1,
                    sign.protected.clone(),
                    None,
                    &[],
                    sign.payload.as_deref().unwrap_or(&[]),
                );

                match cert_chain {
                    Some(chain) => on_die.verify_with_chain(chain, &tbs, &sign.signature),
                    None => {
                        let spki = device_key.ok_or_eyre("missing device certificate key")?;

                        on_die.verify_with_key(spki, &tbs, &sign.signature)
                    }
                }
            }
            DeviceSgType::StEpid10 | DeviceSgType::StEpid11 => {
                unreachable!("handled above")
            }
        }
    }
}

fn hmac_algorithm(hashtype: Hashtype) -> eyre::Result<hmac::Algorithm> {
    let alg = match hashtype {
        Hashtype::HmacSha256 => hmac::HMAC_SHA256,
        Hashtype::HmacSha384 => hmac::HMAC_SHA384,
        Hashtype::Sha256 | Hashtype::Sha384 => bail!("hash type passed to hmac"),
    };

    Ok(alg)
}

/// A server signing key, loaded from PKCS#8.
pub enum SigningKey {
    EcP256(signature::EcdsaKeyPair),
    EcP384(signature::EcdsaKeyPair),
    Rsa2048(signature::RsaKeyPair),
    Rsa3072(signature::RsaKeyPair),
}

impl SigningKey {
    pub fn from_pkcs8(sg_type: DeviceSgType, pkcs8: &[u8]) -> eyre::Result<Self> {
        let key = match sg_type {
            DeviceSgType::StSecP256R1 => SigningKey::EcP256(
                signature::EcdsaKeyPair::from_pkcs8(
                    &signature::ECDSA_P256_SHA256_FIXED_SIGNING,
                    pkcs8,
                )
                .map_err(|err| eyre::eyre!("invalid P-256 key: {err}"))?,
            ),
            DeviceSgType::StSecP384R1 => SigningKey::EcP384(
                signature::EcdsaKeyPair::from_pkcs8(
                    &signature::ECDSA_P384_SHA384_FIXED_SIGNING,
                    pkcs8,
                )
                .map_err(|err| eyre::eyre!("invalid P-384 key: {err}"))?,
            ),
            DeviceSgType::StRsa2048 => SigningKey::Rsa2048(
                signature::RsaKeyPair::from_pkcs8(pkcs8)
                    .map_err(|err| eyre::eyre!("invalid RSA key: {err}"))?,
            ),
            DeviceSgType::StRsa3072 => SigningKey::Rsa3072(
                signature::RsaKeyPair::from_pkcs8(pkcs8)
                    .map_err(|err| eyre::eyre!("invalid RSA key: {err}"))?,
            ),
            DeviceSgType::StEpid10 | DeviceSgType::StEpid11 | DeviceSgType::StOnDie => {
                bail!("attestation-only sgType has no loadable signing key")
            }
        };

        Ok(key)
    }

    pub fn algorithm(&self) -> coset::iana::Algorithm {
        match self {
            SigningKey::EcP256(_) => coset::iana::Algorithm::ES256,
            SigningKey::EcP384(_) => coset::iana::Algorithm::ES384,
            SigningKey::Rsa2048(_) => coset::iana::Algorithm::RS256,
            SigningKey::Rsa3072(_) => coset::iana::Algorithm::RS384,
        }
    }

    fn sign(&self, rng: &SystemRandom, data: &[u8]) -> eyre::Result<Vec<u8>> {
        match self {
            SigningKey::EcP256(pair) | SigningKey::EcP384(pair) => {
                let sig = pair
                    .sign(rng, data)
                    .map_err(|_| eyre::eyre!("signing failed"))?;

                Ok(sig.as_ref().to_vec())
            }
            SigningKey::Rsa2048(pair) | SigningKey::Rsa3072(pair) => {
                let padding = match self {
                    SigningKey::Rsa2048(_) => &signature::RSA_PKCS1_SHA256,
                    _ => &signature::RSA_PKCS1_SHA384,
                };

                let mut sig = vec![0; pair.public_modulus_len()];
                pair.sign(padding, rng, data, &mut sig)
                    .map_err(|_| eyre::eyre!("signing failed"))?;

                Ok(sig)
            }
        }
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SigningKey::EcP256(_) => "EcP256",
            SigningKey::EcP384(_) => "EcP384",
            SigningKey::Rsa2048(_) => "Rsa2048",
            SigningKey::Rsa3072(_) => "Rsa3072",
        };

        f.debug_tuple(name).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p256_signer() -> (SigningKey, Vec<u8>) {
        let key = rcgen::KeyPair::generate().unwrap();

        let signer =
            SigningKey::from_pkcs8(DeviceSgType::StSecP256R1, &key.serialize_der()).unwrap();

        (signer, key.public_key_der())
    }

    #[test]
    fn epid_verification_is_opt_in() {
        let service = CryptoService::new();
        assert!(service.epid().is_none());

        let base = url::Url::parse("https://verify.epid.example").unwrap();
        let service = service.with_epid(EpidVerifier::new(base));
        assert!(service.epid().is_some());
    }

    #[test]
    fn random_values_do_not_repeat() {
        let service = CryptoService::new();

        assert_ne!(
            service.random_nonce().unwrap(),
            service.random_nonce().unwrap()
        );
        assert_ne!(
            service.random_guid().unwrap(),
            service.random_guid().unwrap()
        );
    }

    #[test]
    fn hash_verify_rejects_tamper() {
        let service = CryptoService::new();

        let hash = service.hash(Hashtype::Sha384, b"payload").unwrap();

        service.hash_verify(&hash, b"payload").unwrap();
        assert!(service.hash_verify(&hash, b"payloae").is_err());
    }

    #[test]
    fn hmac_round_trip() {
        let service = CryptoService::new();

        let tag = service
            .hmac(Hashtype::HmacSha256, b"secret", b"header")
            .unwrap();

        service.hmac_verify(&tag, b"secret", b"header").unwrap();
        assert!(service.hmac_verify(&tag, b"other", b"header").is_err());
    }

    #[test]
    fn cose_sign1_verifies_with_spki() {
        let service = CryptoService::new();
        let (signer, spki) = p256_signer();

        let sign = service
            .cose_sign1(&signer, b"payload".to_vec(), Vec::new())
            .unwrap();

        service.verify_sign1(&sign, &spki).unwrap();
    }

    #[test]
    fn cose_sign1_rejects_wrong_key() {
        let service = CryptoService::new();
        let (signer, _) = p256_signer();
        let (_, other_spki) = p256_signer();

        let sign = service
            .cose_sign1(&signer, b"payload".to_vec(), Vec::new())
            .unwrap();

        assert!(service.verify_sign1(&sign, &other_spki).is_err());
    }

    #[test]
    fn rsa_cose_sign1_round_trip_and_tamper() {
        let service = CryptoService::new();

        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        let pkey = openssl::pkey::PKey::from_rsa(rsa).unwrap();

        let signer = SigningKey::from_pkcs8(
            DeviceSgType::StRsa2048,
            &pkey.private_key_to_pkcs8().unwrap(),
        )
        .unwrap();
        let spki = pkey.public_key_to_der().unwrap();

        let mut sign = service
            .cose_sign1(&signer, b"payload".to_vec(), Vec::new())
            .unwrap();

        service.verify_sign1(&sign, &spki).unwrap();

        sign.payload = Some(b"qayload".to_vec());
        assert!(service.verify_sign1(&sign, &spki).is_err());
    }

    #[tokio::test]
    async fn on_die_attestation_dispatches_through_the_verifier() {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).unwrap();
        let pair = signature::EcdsaKeyPair::from_pkcs8(
            &signature::ECDSA_P384_SHA384_FIXED_SIGNING,
            &key.serialize_der(),
        )
        .unwrap();

        let rng = SystemRandom::new();
        let sign = CoseSign1Builder::new()
            .payload(b"attested payload".to_vec())
            .try_create_signature(&[], |data| -> eyre::Result<Vec<u8>> {
                let mut signed = vec![3; 36];
                signed.extend_from_slice(data);

                let sig = pair
                    .sign(&rng, &signed)
                    .map_err(|_| eyre::eyre!("signing failed"))?;

                let mut out = vec![3; 36];
                out.extend_from_slice(sig.as_ref());

                Ok(out)
            })
            .unwrap()
            .build();

        let sig_info = SigInfo::empty(DeviceSgType::try_from(32).unwrap());
        let spki = key.public_key_der();

        let bare = CryptoService::new();
        assert!(bare
            .verify_device_sign1(&sign, &sig_info, Some(&spki), None)
            .await
            .is_err());

        let service = CryptoService::new().with_on_die(OnDieVerifier::new(Vec::new()));
        service
            .verify_device_sign1(&sign, &sig_info, Some(&spki), None)
            .await
            .unwrap();

        let mut tampered = sign.clone();
        tampered.payload = Some(b"attested qayload".to_vec());
        assert!(service
            .verify_device_sign1(&tampered, &sig_info, Some(&spki), None)
            .await
            .is_err());
    }

    #[test]
    fn cose_sign1_rejects_tampered_payload() {
        let service = CryptoService::new();
        let (signer, spki) = p256_signer();

        let mut sign = service
            .cose_sign1(&signer, b"payload".to_vec(), Vec::new())
            .unwrap();
        sign.payload = Some(b"tampered".to_vec());

        assert!(service.verify_sign1(&sign, &spki).is_err());
    }
}
