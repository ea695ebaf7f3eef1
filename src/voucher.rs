//! Ownership Voucher chain of custody.
//!
//! A voucher starts at the manufacturer with only a header and the device
//! HMAC. Each transfer of ownership appends an entry signed by the current
//! owner that names the next owner's public key, so the device can walk the
//! chain from the manufacturer key it trusts down to the owner it is talking
//! to in TO2.
//!
//! The header HMAC itself is only checkable by the device, which holds the
//! secret. [`verify`] validates everything the server side can: the device
//! certificate chain and the signature and hash links of every entry.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use eyre::{Context, OptionExt};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509StoreContext, X509 as OsslX509};
use tracing::debug;
use x509_parser::der_parser::oid;

use crate::crypto::{CryptoService, SigningKey};
use crate::error::ProtocolError;
use crate::protocol::v101::hash_hmac::Hashtype;
use crate::protocol::v101::public_key::PublicKey;
use crate::protocol::v101::x509::CoseX509;

pub use crate::protocol::v101::ownership_voucher::{
    OvEntry, OvEntryPayload, OvHeader, OwnershipVoucher,
};

const PEM_HEADER: &str = "-----BEGIN OWNERSHIP VOUCHER-----";
const PEM_FOOTER: &str = "-----END OWNERSHIP VOUCHER-----";

fn invalid(msg: String) -> eyre::Report {
    ProtocolError::InvalidVoucher(msg).into()
}

/// The owner the chain currently ends at.
///
/// The manufacturer key from the header when no entry has been appended
/// yet, the key named by the last entry otherwise.
pub fn last_owner(voucher: &OwnershipVoucher<'_>) -> eyre::Result<PublicKey<'static>> {
    match voucher.ov_entry_array.last() {
        Some(entry) => Ok(entry.payload()?.ove_pub_key),
        None => Ok(voucher.header().ov_pub_key.clone().into_owned()),
    }
}

/// Digest used for the entry hashes, matching the strength of the device
/// HMAC.
fn entry_hashtype(voucher: &OwnershipVoucher<'_>) -> eyre::Result<Hashtype> {
    let hashtype = voucher.ov_header_hmac.hashtype;

    if !hashtype.is_hmac() {
        return Err(invalid(format!("header HMAC has hash type {hashtype:?}")));
    }

    Ok(hashtype.compatible_hash())
}

/// `OVHeader ‖ OVHeaderHMac`, the previous-entry hash input of the first
/// entry. The header bytes are the exact wire encoding, without the bstr
/// wrapping.
fn header_seed(voucher: &OwnershipVoucher<'_>) -> eyre::Result<Vec<u8>> {
    let mut buf = voucher.ov_header_tag.bytes().to_vec();
    ciborium::into_writer(&voucher.ov_header_hmac, &mut buf)?;

    Ok(buf)
}

fn prev_entry_input(voucher: &OwnershipVoucher<'_>) -> eyre::Result<Vec<u8>> {
    match voucher.ov_entry_array.last() {
        Some(entry) => entry.to_bytes(),
        None => header_seed(voucher),
    }
}

/// Appends an entry transferring the voucher to `next_owner`.
///
/// `owner_key` must be the private key of the chain's current last owner,
/// or the extended voucher won't verify.
pub fn extend<'a>(
    crypto: &CryptoService,
    mut voucher: OwnershipVoucher<'a>,
    owner_key: &SigningKey,
    next_owner: &PublicKey<'_>,
) -> eyre::Result<OwnershipVoucher<'a>> {
    let hashtype = entry_hashtype(&voucher)?;

    let prev = crypto.hash(hashtype, &prev_entry_input(&voucher)?)?;
    let hdr_info = crypto.hash(hashtype, &voucher.header().header_info())?;

    let payload = OvEntryPayload {
        ove_hash_prev_entry: prev,
        ove_hash_hdr_info: hdr_info,
        ove_extra: None,
        ove_pub_key: next_owner.clone().into_owned(),
    };

    let mut buf = Vec::new();
    ciborium::into_writer(&payload, &mut buf)?;

    let sign = crypto
        .cose_sign1(owner_key, buf, Vec::new())
        .wrap_err("couldn't sign voucher entry")?;

    voucher.ov_entry_array.push(OvEntry::new(sign));

    Ok(voucher)
}

/// Validates the whole chain of custody.
///
/// Checks the device certificate chain against the hash in the header and
/// walks every entry: the signature must verify under the previous owner's
/// key and the previous-entry and header-info hashes must match the
/// recomputed values. Any mismatch is fatal.
pub fn verify(crypto: &CryptoService, voucher: &OwnershipVoucher<'_>) -> eyre::Result<()> {
    let header = voucher.header();

    if voucher.ov_prot_ver != header.ovh_prot_ver {
        return Err(invalid(format!(
            "protocol version mismatch: voucher {} header {}",
            voucher.ov_prot_ver, header.ovh_prot_ver
        )));
    }

    if let Some(chain) = &voucher.ov_dev_cert_chain {
        if let Some(expected) = &header.ov_dev_cert_chain_hash {
            let mut der = Vec::new();
            for cert in chain.certs() {
                der.extend_from_slice(cert.der());
            }

            crypto
                .hash_verify(expected, &der)
                .map_err(|err| invalid(format!("device certificate chain hash: {err}")))?;
        }

        validate_device_chain(chain)?;
    }

    let hdr_info = header.header_info();

    let mut signer = header.ov_pub_key.clone().into_owned();
    let mut prev_input = header_seed(voucher)?;

    for (index, entry) in voucher.ov_entry_array.iter().enumerate() {
        let payload = entry
            .payload()
            .map_err(|err| invalid(format!("entry {index}: {err}")))?;

        let spki = signer
            .spki()
            .map_err(|err| invalid(format!("entry {index} signer key: {err}")))?;

        crypto
            .verify_sign1(&entry.entry, spki)
            .map_err(|err| invalid(format!("entry {index} signature: {err}")))?;

        crypto
            .hash_verify(&payload.ove_hash_prev_entry, &prev_input)
            .map_err(|err| invalid(format!("entry {index} previous-entry hash: {err}")))?;

        crypto
            .hash_verify(&payload.ove_hash_hdr_info, &hdr_info)
            .map_err(|err| invalid(format!("entry {index} header-info hash: {err}")))?;

        prev_input = entry.to_bytes()?;
        signer = payload.ove_pub_key;
    }

    debug!(
        guid = %header.ov_guid,
        entries = voucher.ov_entry_array.len(),
        "ownership voucher verified"
    );

    Ok(())
}

/// Validates the device certificate chain.
///
/// The leaf must hold an EC key on P-256 or P-384 with the
/// digitalSignature key usage. Path validation runs with the chain's own
/// certificates as trust anchors and without revocation checking.
pub fn validate_device_chain(chain: &CoseX509<'_>) -> eyre::Result<()> {
    let certs = chain.certs();
    let leaf_der = chain.leaf().der();

    let (_, leaf) = x509_parser::parse_x509_certificate(leaf_der)
        .map_err(|err| invalid(format!("device certificate: {err}")))?;

    let alg = &leaf.subject_pki.algorithm;
    if alg.algorithm != oid!(1.2.840 .10045 .2 .1) {
        return Err(invalid(format!(
            "device certificate key is not EC: {}",
            alg.algorithm
        )));
    }

    let curve = alg
        .parameters
        .as_ref()
        .and_then(|params| params.as_oid().ok())
        .ok_or_else(|| invalid("device certificate key has no named curve".into()))?;

    if curve != oid!(1.2.840 .10045 .3 .1 .7) && curve != oid!(1.3.132 .0 .34) {
        return Err(invalid(format!("unsupported device key curve: {curve}")));
    }

    let key_usage = leaf
        .key_usage()
        .map_err(|err| invalid(format!("device certificate key usage: {err}")))?
        .ok_or_else(|| invalid("device certificate has no key usage extension".into()))?;

    if !key_usage.value.digital_signature() {
        return Err(invalid(
            "device certificate not valid for digital signature".into(),
        ));
    }

    // The chain is self-anchored, there is no external root to validate
    // against at this point in the device's life.
    let mut builder = X509StoreBuilder::new()?;
    for cert in certs {
        builder.add_cert(OsslX509::from_der(cert.der())?)?;
    }
    let store = builder.build();

    let leaf = OsslX509::from_der(leaf_der)?;
    let untrusted = Stack::new()?;

    let mut context = X509StoreContext::new()?;
    let (ok, error) = context.init(&store, &leaf, &untrusted, |ctx| {
        let ok = ctx.verify_cert()?;

        Ok((ok, ctx.error()))
    })?;

    if !ok {
        return Err(invalid(format!(
            "device certificate chain rejected: {}",
            error.error_string()
        )));
    }

    Ok(())
}

/// Encodes a voucher in its PEM text form.
pub fn to_pem(voucher: &OwnershipVoucher<'_>) -> eyre::Result<String> {
    let encoded = BASE64.encode(voucher.to_bytes()?);

    let mut pem = String::with_capacity(encoded.len() + 80);
    pem.push_str(PEM_HEADER);
    pem.push('\n');
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
        pem.push('\n');
    }
    pem.push_str(PEM_FOOTER);
    pem.push('\n');

    Ok(pem)
}

/// Decodes a voucher from its PEM text form, ignoring surrounding text.
pub fn from_pem(pem: &str) -> eyre::Result<OwnershipVoucher<'static>> {
    let start = pem
        .find(PEM_HEADER)
        .ok_or_eyre("missing ownership voucher PEM header")?;
    let rest = &pem[start + PEM_HEADER.len()..];

    let end = rest
        .find(PEM_FOOTER)
        .ok_or_eyre("missing ownership voucher PEM footer")?;

    let body: String = rest[..end].chars().filter(|c| !c.is_whitespace()).collect();

    let bytes = BASE64
        .decode(body)
        .wrap_err("invalid ownership voucher base64")?;

    OwnershipVoucher::from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair, KeyUsagePurpose};

    use crate::protocol::v101::public_key::PkType;
    use crate::protocol::v101::randezvous_info::{
        RVVariable, RendezvousDirective, RendezvousInfo, RendezvousInstr,
    };
    use crate::protocol::v101::sign_info::DeviceSgType;
    use crate::protocol::v101::x509::X509;
    use crate::protocol::v101::{Guid, PROTOCOL_VERSION};
    use crate::protocol::{CborBstr, OneOrMore};

    use super::*;

    fn p256_owner() -> (SigningKey, PublicKey<'static>) {
        let key = KeyPair::generate().unwrap();

        let signer =
            SigningKey::from_pkcs8(DeviceSgType::StSecP256R1, &key.serialize_der()).unwrap();

        (signer, PublicKey::x509(PkType::Secp256R1, key.public_key_der()))
    }

    fn rv_info() -> RendezvousInfo {
        let value = CborBstr::new(ciborium::Value::Text("owner.example".into())).unwrap();

        let instr = RendezvousInstr {
            rv_variable: RVVariable::RVDns,
            rv_value: value,
        };

        RendezvousInfo::new(vec![RendezvousDirective::new(vec![instr]).unwrap()]).unwrap()
    }

    fn fresh_voucher(
        crypto: &CryptoService,
        manufacturer: &PublicKey<'static>,
        dev_cert_chain: Option<CoseX509<'static>>,
    ) -> OwnershipVoucher<'static> {
        let chain_hash = dev_cert_chain.as_ref().map(|chain| {
            let mut der = Vec::new();
            for cert in chain.certs() {
                der.extend_from_slice(cert.der());
            }

            crypto.hash(Hashtype::Sha256, &der).unwrap()
        });

        let header = OvHeader {
            ovh_prot_ver: PROTOCOL_VERSION,
            ov_guid: Guid::new([7; 16]),
            ov_rv_info: rv_info(),
            ov_device_info: "test-device".into(),
            ov_pub_key: manufacturer.clone(),
            ov_dev_cert_chain_hash: chain_hash,
        };

        let header_tag = CborBstr::new(header).unwrap();
        let hmac = crypto
            .hmac(Hashtype::HmacSha256, b"device-secret", header_tag.bytes())
            .unwrap();

        OwnershipVoucher {
            ov_prot_ver: PROTOCOL_VERSION,
            ov_header_tag: header_tag,
            ov_header_hmac: hmac,
            ov_dev_cert_chain: dev_cert_chain,
            ov_entry_array: Vec::new(),
        }
    }

    fn device_chain() -> CoseX509<'static> {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        // rcgen 0.13 skips the whole extensions block unless a SAN (or other
        // trigger) is present, silently dropping the key usages set below.
        let mut leaf_params = CertificateParams::new(vec!["device.test".to_string()]).unwrap();
        leaf_params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

        CoseX509::Certs(
            OneOrMore::new(vec![
                X509::from_der(leaf.der().to_vec()).unwrap(),
                X509::from_der(ca.der().to_vec()).unwrap(),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn last_owner_follows_extensions() {
        let crypto = CryptoService::new();
        let (mfg_signer, mfg_key) = p256_owner();
        let (_, owner_key) = p256_owner();

        let voucher = fresh_voucher(&crypto, &mfg_key, None);
        assert_eq!(last_owner(&voucher).unwrap(), mfg_key);

        let voucher = extend(&crypto, voucher, &mfg_signer, &owner_key).unwrap();
        assert_eq!(last_owner(&voucher).unwrap(), owner_key);
    }

    #[test]
    fn extended_voucher_verifies() {
        let crypto = CryptoService::new();
        let (mfg_signer, mfg_key) = p256_owner();
        let (owner_signer, owner_key) = p256_owner();
        let (_, next_key) = p256_owner();

        let voucher = fresh_voucher(&crypto, &mfg_key, None);
        let voucher = extend(&crypto, voucher, &mfg_signer, &owner_key).unwrap();
        let voucher = extend(&crypto, voucher, &owner_signer, &next_key).unwrap();

        verify(&crypto, &voucher).unwrap();
    }

    #[test]
    fn voucher_survives_reserialization() {
        let crypto = CryptoService::new();
        let (mfg_signer, mfg_key) = p256_owner();
        let (_, owner_key) = p256_owner();

        let voucher = fresh_voucher(&crypto, &mfg_key, None);
        let voucher = extend(&crypto, voucher, &mfg_signer, &owner_key).unwrap();

        let decoded = OwnershipVoucher::from_bytes(&voucher.to_bytes().unwrap()).unwrap();

        verify(&crypto, &decoded).unwrap();
    }

    #[test]
    fn entry_signed_by_wrong_key_rejected() {
        let crypto = CryptoService::new();
        let (_, mfg_key) = p256_owner();
        let (other_signer, _) = p256_owner();
        let (_, owner_key) = p256_owner();

        let voucher = fresh_voucher(&crypto, &mfg_key, None);
        let voucher = extend(&crypto, voucher, &other_signer, &owner_key).unwrap();

        let err = verify(&crypto, &voucher).unwrap_err();
        assert!(err.to_string().contains("signature"));
    }

    #[test]
    fn tampered_signature_rejected() {
        let crypto = CryptoService::new();
        let (mfg_signer, mfg_key) = p256_owner();
        let (_, owner_key) = p256_owner();

        let voucher = fresh_voucher(&crypto, &mfg_key, None);
        let mut voucher = extend(&crypto, voucher, &mfg_signer, &owner_key).unwrap();

        voucher.ov_entry_array[0].entry.signature[0] ^= 1;

        assert!(verify(&crypto, &voucher).is_err());
    }

    #[test]
    fn tampered_previous_entry_hash_rejected() {
        let crypto = CryptoService::new();
        let (mfg_signer, mfg_key) = p256_owner();
        let (_, owner_key) = p256_owner();

        let voucher = fresh_voucher(&crypto, &mfg_key, None);
        let mut voucher = extend(&crypto, voucher, &mfg_signer, &owner_key).unwrap();

        // Re-sign a payload carrying a corrupted hash with the legitimate
        // key, so only the hash check can catch it.
        let mut payload = voucher.ov_entry_array[0].payload().unwrap();
        let mut hash = payload.ove_hash_prev_entry.hash.to_vec();
        hash[0] ^= 1;
        payload.ove_hash_prev_entry = crate::protocol::v101::hash_hmac::Hash::new(
            payload.ove_hash_prev_entry.hashtype,
            hash,
        );

        let mut buf = Vec::new();
        ciborium::into_writer(&payload, &mut buf).unwrap();
        voucher.ov_entry_array[0] =
            OvEntry::new(crypto.cose_sign1(&mfg_signer, buf, Vec::new()).unwrap());

        let err = verify(&crypto, &voucher).unwrap_err();
        assert!(err.to_string().contains("previous-entry hash"));
    }

    #[test]
    fn tampered_header_info_hash_rejected() {
        let crypto = CryptoService::new();
        let (mfg_signer, mfg_key) = p256_owner();
        let (_, owner_key) = p256_owner();

        let voucher = fresh_voucher(&crypto, &mfg_key, None);
        let mut voucher = extend(&crypto, voucher, &mfg_signer, &owner_key).unwrap();

        let mut payload = voucher.ov_entry_array[0].payload().unwrap();
        let mut hash = payload.ove_hash_hdr_info.hash.to_vec();
        hash[0] ^= 1;
        payload.ove_hash_hdr_info =
            crate::protocol::v101::hash_hmac::Hash::new(payload.ove_hash_hdr_info.hashtype, hash);

        let mut buf = Vec::new();
        ciborium::into_writer(&payload, &mut buf).unwrap();
        voucher.ov_entry_array[0] =
            OvEntry::new(crypto.cose_sign1(&mfg_signer, buf, Vec::new()).unwrap());

        let err = verify(&crypto, &voucher).unwrap_err();
        assert!(err.to_string().contains("header-info hash"));
    }

    #[test]
    fn device_chain_validates() {
        let crypto = CryptoService::new();
        let (mfg_signer, mfg_key) = p256_owner();
        let (_, owner_key) = p256_owner();

        let voucher = fresh_voucher(&crypto, &mfg_key, Some(device_chain()));
        let voucher = extend(&crypto, voucher, &mfg_signer, &owner_key).unwrap();

        verify(&crypto, &voucher).unwrap();
    }

    #[test]
    fn device_chain_hash_mismatch_rejected() {
        let crypto = CryptoService::new();
        let (_, mfg_key) = p256_owner();

        let mut voucher = fresh_voucher(&crypto, &mfg_key, Some(device_chain()));

        // Swap in a different chain without refreshing the header hash.
        voucher.ov_dev_cert_chain = Some(device_chain());

        let err = verify(&crypto, &voucher).unwrap_err();
        assert!(err.to_string().contains("certificate chain hash"));
    }

    #[test]
    fn leaf_without_digital_signature_rejected() {
        let key = KeyPair::generate().unwrap();
        // rcgen 0.13 skips the whole extensions block unless a SAN (or other
        // trigger) is present, silently dropping the key usages set below.
        let mut params = CertificateParams::new(vec!["device.test".to_string()]).unwrap();
        params.key_usages = vec![KeyUsagePurpose::KeyEncipherment];
        let cert = params.self_signed(&key).unwrap();

        let chain = CoseX509::One(X509::from_der(cert.der().to_vec()).unwrap());

        let err = validate_device_chain(&chain).unwrap_err();
        assert!(err.to_string().contains("digital signature"));
    }

    #[test]
    fn pem_round_trip() {
        let crypto = CryptoService::new();
        let (mfg_signer, mfg_key) = p256_owner();
        let (_, owner_key) = p256_owner();

        let voucher = fresh_voucher(&crypto, &mfg_key, None);
        let voucher = extend(&crypto, voucher, &mfg_signer, &owner_key).unwrap();

        let pem = to_pem(&voucher).unwrap();
        assert!(pem.starts_with(PEM_HEADER));
        assert!(pem.lines().all(|line| line.len() <= 64));

        let decoded = from_pem(&pem).unwrap();
        assert_eq!(decoded, voucher);

        assert!(from_pem("not a voucher").is_err());
    }
}
