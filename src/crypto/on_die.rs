//! Intel® OnDie ECDSA attestation verification.
//!
//! OnDie devices sign with a P-384 key fused into the silicon. The
//! signature is not a plain COSE signature: an opaque task-info block is
//! signed together with the payload and travels in front of the
//! fixed-width r and s values. The device certificate chain anchors at an
//! Intel root, and revocations are checked offline against CRLs cached
//! ahead of time.

use std::collections::HashMap;

use aws_lc_rs::signature;
use eyre::{bail, ensure, OptionExt};
use x509_parser::prelude::*;

use crate::protocol::v101::x509::{spki_key_bits, CoseX509};

/// Opaque device task context prepended to the signed data.
const TASK_INFO_LEN: usize = 36;
/// P-384 field width, one each for r and s.
const COMPONENT_LEN: usize = 48;

const SIGNATURE_LEN: usize = TASK_INFO_LEN + 2 * COMPONENT_LEN;

/// Verifier for the silicon-fused attestation scheme.
///
/// Holds the trusted root certificates and the CRL cache. Verification is
/// fully offline, the CRLs named by the chain's distribution points must
/// be loaded before the first device shows up.
#[derive(Debug, Clone, Default)]
pub struct OnDieVerifier {
    roots: Vec<Vec<u8>>,
    crls: HashMap<String, Vec<u8>>,
    check_revocations: bool,
}

impl OnDieVerifier {
    /// Creates a verifier trusting the given DER root certificates, with
    /// revocation checking enabled.
    pub fn new(roots: Vec<Vec<u8>>) -> Self {
        Self {
            roots,
            crls: HashMap::new(),
            check_revocations: true,
        }
    }

    /// Caches the DER CRL published at `url`.
    pub fn with_crl(mut self, url: impl Into<String>, der: Vec<u8>) -> Self {
        self.crls.insert(url.into(), der);

        self
    }

    /// Toggles revocation checking, for deployments without access to a
    /// CRL mirror.
    pub fn check_revocations(mut self, enabled: bool) -> Self {
        self.check_revocations = enabled;

        self
    }

    /// Verifies a signature against the device certificate chain.
    ///
    /// The chain must anchor at one of the trusted roots and no
    /// certificate in it may be revoked.
    pub fn verify_with_chain(
        &self,
        chain: &CoseX509<'_>,
        data: &[u8],
        signature: &[u8],
    ) -> eyre::Result<()> {
        let certs = chain.certs();
        let root = certs.last().ok_or_eyre("empty certificate chain")?;

        ensure!(
            self.roots.iter().any(|anchor| anchor == root.der()),
            "certificate chain does not anchor at a trusted root"
        );

        if self.check_revocations {
            for cert in certs {
                self.check_revoked(cert.der())?;
            }
        }

        self.verify_with_key(chain.cert_key(), data, signature)
    }

    /// Verifies a signature against a bare SubjectPublicKeyInfo, without
    /// path validation.
    pub fn verify_with_key(
        &self,
        spki: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> eyre::Result<()> {
        ensure!(
            signature.len() == SIGNATURE_LEN,
            "invalid signature size: {}",
            signature.len()
        );

        let (task_info, sig) = signature.split_at(TASK_INFO_LEN);

        // The device signs task-info and payload as one message
        let mut signed = Vec::with_capacity(TASK_INFO_LEN + data.len());
        signed.extend_from_slice(task_info);
        signed.extend_from_slice(data);

        let key_bits = spki_key_bits(spki)?;
        let key =
            signature::UnparsedPublicKey::new(&signature::ECDSA_P384_SHA384_FIXED, &key_bits);

        key.verify(&signed, sig)
            .map_err(|_| eyre::eyre!("signature verification failed"))
    }

    /// Checks one certificate against the CRLs its distribution points
    /// name. A missing CRL fails closed.
    fn check_revoked(&self, der: &[u8]) -> eyre::Result<()> {
        let (_, cert) = parse_x509_certificate(der)?;

        for ext in cert.extensions() {
            let ParsedExtension::CRLDistributionPoints(points) = ext.parsed_extension() else {
                continue;
            };

            for point in &points.points {
                let Some(DistributionPointName::FullName(names)) = &point.distribution_point
                else {
                    continue;
                };

                for name in names {
                    let GeneralName::URI(url) = name else {
                        continue;
                    };

                    let crl = self
                        .crls
                        .get(*url)
                        .ok_or_else(|| eyre::eyre!("no cached CRL for {url}"))?;

                    let (_, crl) = parse_x509_crl(crl)?;

                    if crl
                        .iter_revoked_certificates()
                        .any(|revoked| revoked.raw_serial() == cert.raw_serial())
                    {
                        bail!("certificate {} is revoked", cert.subject());
                    }
                }
            }
        }

        Ok(())
    }
}
