//! TO2, the ownership transfer exchange.
//!
//! The owner onboarding service proves it holds the voucher chain, the
//! device proves possession of its attestation key, and both sides run a
//! key exchange that seals the rest of the session. Inside the tunnel the
//! service info loop provisions the device, and the device either keeps
//! or replaces its credentials.
//!
//! ```text
//! Device                          Owner
//!   | -- HelloDevice (60) ----------> |
//!   | <- ProveOVHdr (61) ------------ |
//!   | -- GetOVNextEntry (62) -------> |  repeated
//!   | <- OVNextEntry (63) ----------- |
//!   | -- ProveDevice (64) ----------> |
//!   | <- SetupDevice (65) ----------- |  encrypted from here on
//!   | -- DeviceServiceInfoReady (66)> |
//!   | <- OwnerServiceInfoReady (67) - |
//!   | -- DeviceServiceInfo (68) ----> |  repeated
//!   | <- OwnerServiceInfo (69) ------ |
//!   | -- Done (70) -----------------> |
//!   | <- Done2 (71) ----------------- |
//! ```

use std::borrow::Cow;

use coset::iana::{EnumI64, HeaderParameter};
use coset::Label;
use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::cipher::{CipherSuite, EncryptionState};
use crate::crypto::kex::{KexSuiteName, KeyExchange};
use crate::crypto::CryptoService;
use crate::error::ProtocolError;
use crate::protocol::v101::eat_signature::{unprotected_value, EatClaims, EUPH_NONCE};
use crate::protocol::v101::hash_hmac::HMac;
use crate::protocol::v101::key_exchange::XBKeyExchange;
use crate::protocol::v101::ownership_voucher::OvHeader;
use crate::protocol::v101::public_key::PublicKey;
use crate::protocol::v101::randezvous_info::RendezvousInfo;
use crate::protocol::v101::sign_info::{EBSigInfo, SigInfo};
use crate::protocol::v101::to2::{
    DeviceServiceInfo, DeviceServiceInfoReady, Done, Done2, GetOvNextEntry, HelloDevice,
    OvNextEntry, OwnerServiceInfo, OwnerServiceInfoReady, ProveDevice, ProveOvHdr, PvOvHdrPayload,
    SetupDevice, SetupDevicePayload,
};
use crate::protocol::v101::{Guid, NonceTo2ProveDv, NonceTo2ProveOv, NonceTo2SetupDv};
use crate::protocol::CborBstr;
use crate::storage::{KeyResolver, ReplacementSupplier, ServiceInfoModule, VoucherStore};
use crate::voucher;

/// Default service info MTU when a side does not announce one.
const DEFAULT_SERVICE_INFO_MTU: u16 = 1300;

/// Server side of the TO2 exchange.
#[derive(Debug)]
pub struct To2Exchange<V, K, P, M> {
    crypto: CryptoService,
    vouchers: V,
    keys: K,
    replacements: P,
    modules: M,
    max_owner_message_size: u16,
    max_device_service_info_sz: u16,
}

/// Position in the exchange, gating which messages are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum To2State {
    /// Serving voucher entries, waiting for the device attestation.
    Entries,
    /// Attestation done, waiting for DeviceServiceInfoReady.
    ServiceInfoReady,
    /// Service info loop, until Done.
    ServiceInfo,
}

/// Credentials picked for the device at attestation time.
///
/// Held in the session so Done settles against exactly what SetupDevice
/// promised, even if the supplier would answer differently by then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ReplacementPlan {
    guid: Guid,
    rendezvous_info: RendezvousInfo,
    owner_key: PublicKey<'static>,
    changed: bool,
}

/// State carried between TO2 messages.
#[derive(Debug, Serialize, Deserialize)]
pub struct To2Session {
    pub(crate) state: To2State,
    pub(crate) guid: Guid,
    pub(crate) nonce_to2_prove_ov: NonceTo2ProveOv,
    pub(crate) nonce_to2_prove_dv: NonceTo2ProveDv,
    pub(crate) nonce_to2_setup_dv: Option<NonceTo2SetupDv>,
    pub(crate) sig_info: SigInfo<'static>,
    pub(crate) kex: Option<KeyExchange>,
    pub(crate) cipher_suite: CipherSuite,
    pub(crate) encryption: Option<EncryptionState>,
    pub(crate) num_entries: u8,
    pub(crate) plan: Option<ReplacementPlan>,
    pub(crate) replacement_hmac: Option<HMac<'static>>,
    pub(crate) device_service_info_mtu: u16,
}

fn out_of_sequence(msg: &str) -> eyre::Report {
    ProtocolError::InvalidMessage(format!("{msg} out of sequence")).into()
}

impl<V, K, P, M> To2Exchange<V, K, P, M>
where
    V: VoucherStore,
    K: KeyResolver,
    P: ReplacementSupplier,
    M: ServiceInfoModule,
{
    pub fn new(crypto: CryptoService, vouchers: V, keys: K, replacements: P, modules: M) -> Self {
        Self {
            crypto,
            vouchers,
            keys,
            replacements,
            modules,
            max_owner_message_size: u16::MAX,
            max_device_service_info_sz: DEFAULT_SERVICE_INFO_MTU,
        }
    }

    /// TO2.HelloDevice: opens a session and answers with the signed
    /// voucher header.
    ///
    /// `raw` is the message body exactly as received, hashed into the
    /// response so the device can detect tampering with its hello.
    pub async fn hello_device(
        &self,
        raw: &[u8],
        hello: &HelloDevice<'_>,
    ) -> eyre::Result<(To2Session, ProveOvHdr)> {
        let voucher = self
            .vouchers
            .query(hello.guid)
            .await
            .wrap_err("querying voucher")?
            .ok_or_else(|| {
                ProtocolError::NotFound(format!("no voucher stored for {}", hello.guid))
            })?;

        voucher::verify(&self.crypto, &voucher)?;

        let owner = voucher::last_owner(&voucher)?;

        let signing_key = self
            .keys
            .signing_key(&owner)
            .await
            .wrap_err("resolving owner key")?
            .ok_or_else(|| {
                ProtocolError::Internal("no signing key for the voucher owner".to_string())
            })?;

        let kex_suite = KexSuiteName::parse(&hello.kex_suite_name)
            .map_err(|err| ProtocolError::UnsupportedAlgorithm(err.to_string()))?;
        let cipher_suite = CipherSuite::try_from(hello.cipher_suite_name)
            .map_err(|err| ProtocolError::UnsupportedAlgorithm(err.to_string()))?;

        let (kex, x_a_key_exchange) = KeyExchange::owner_begin(kex_suite, &self.crypto)?;

        let sig_info = &hello.ea_sign_info.0;

        let eb_sign_info = if sig_info.sg_type.is_epid() {
            let epid = self.crypto.epid().ok_or_else(|| {
                ProtocolError::UnsupportedAlgorithm(
                    "no EPID verification service configured".to_string(),
                )
            })?;

            epid.sig_info_material(sig_info)
                .await
                .wrap_err("fetching EPID signature material")?
        } else {
            SigInfo::empty(sig_info.sg_type)
        };

        let nonce_to2_prove_dv = self.crypto.random_nonce()?;

        let hashtype = voucher.ov_header_hmac.hashtype.compatible_hash();
        let hello_device_hash = self.crypto.hash(hashtype, raw)?;

        let num_entries = u8::try_from(voucher.ov_entry_array.len())
            .map_err(|_| ProtocolError::InvalidVoucher("too many voucher entries".to_string()))?;

        let payload = PvOvHdrPayload {
            ov_header: voucher.ov_header_tag.clone(),
            num_ov_entries: num_entries,
            hmac: voucher.ov_header_hmac.clone(),
            nonce_to2_prove_ov: hello.nonce,
            eb_sign_info: EBSigInfo(eb_sign_info),
            x_a_key_exchange,
            hello_device_hash,
            max_owner_message_size: self.max_owner_message_size,
        };

        let mut buf = Vec::new();
        ciborium::into_writer(&payload, &mut buf)?;

        let unprotected = vec![
            (
                Label::Int(HeaderParameter::CuphNonce.to_i64()),
                ciborium::Value::Bytes(nonce_to2_prove_dv.as_slice().to_vec()),
            ),
            (
                Label::Int(HeaderParameter::CuphOwnerPubKey.to_i64()),
                ciborium::Value::serialized(&owner)?,
            ),
        ];

        let sign = self.crypto.cose_sign1(&signing_key, buf, unprotected)?;

        let session = To2Session {
            state: To2State::Entries,
            guid: hello.guid,
            nonce_to2_prove_ov: hello.nonce,
            nonce_to2_prove_dv,
            nonce_to2_setup_dv: None,
            sig_info: sig_info.clone().into_owned(),
            kex: Some(kex),
            cipher_suite,
            encryption: None,
            num_entries,
            plan: None,
            replacement_hmac: None,
            device_service_info_mtu: DEFAULT_SERVICE_INFO_MTU,
        };

        debug!(guid = %hello.guid, suite = kex_suite.as_str(), "TO2 session opened");

        Ok((session, ProveOvHdr { sign }))
    }

    /// TO2.GetOVNextEntry: serves one voucher entry, verbatim.
    pub async fn get_ov_next_entry(
        &self,
        session: &To2Session,
        req: &GetOvNextEntry,
    ) -> eyre::Result<OvNextEntry> {
        if session.state != To2State::Entries {
            return Err(out_of_sequence("GetOVNextEntry"));
        }

        if req.ov_entry_num >= session.num_entries {
            return Err(ProtocolError::InvalidMessage(format!(
                "entry {} out of range, voucher has {}",
                req.ov_entry_num, session.num_entries
            ))
            .into());
        }

        let voucher = self
            .vouchers
            .query(session.guid)
            .await
            .wrap_err("querying voucher")?
            .ok_or_else(|| {
                ProtocolError::NotFound(format!("no voucher stored for {}", session.guid))
            })?;

        let ov_entry = voucher
            .ov_entry_array
            .get(usize::from(req.ov_entry_num))
            .ok_or_else(|| {
                ProtocolError::InvalidVoucher("voucher shrank during the session".to_string())
            })?
            .clone();

        Ok(OvNextEntry {
            ov_entry_num: req.ov_entry_num,
            ov_entry,
        })
    }

    /// TO2.ProveDevice: verifies the device attestation, finishes the key
    /// exchange and answers with the signed replacement credentials.
    pub async fn prove_device(
        &self,
        session: &mut To2Session,
        prove: &ProveDevice,
    ) -> eyre::Result<SetupDevice> {
        if session.state != To2State::Entries {
            return Err(out_of_sequence("ProveDevice"));
        }

        let claims = EatClaims::from_token(&prove.sign)
            .map_err(|err| ProtocolError::MessageBody(format!("invalid EAT: {err}")))?;

        if claims.nonce != session.nonce_to2_prove_dv {
            return Err(ProtocolError::InvalidMessage("nonce mismatch".to_string()).into());
        }

        if claims.guid != session.guid {
            return Err(ProtocolError::InvalidGuid(format!(
                "attestation for {} in a session for {}",
                claims.guid, session.guid
            ))
            .into());
        }

        let voucher = self
            .vouchers
            .query(session.guid)
            .await
            .wrap_err("querying voucher")?
            .ok_or_else(|| {
                ProtocolError::NotFound(format!("no voucher stored for {}", session.guid))
            })?;

        let cert_chain = voucher.ov_dev_cert_chain.as_ref();
        let device_key = cert_chain.map(|chain| chain.cert_key());

        self.crypto
            .verify_device_sign1(&prove.sign, &session.sig_info, device_key, cert_chain)
            .await
            .map_err(|err| {
                ProtocolError::InvalidMessage(format!("attestation verification failed: {err}"))
            })?;

        let nonce_to2_setup_dv: NonceTo2SetupDv = unprotected_value(&prove.sign, EUPH_NONCE)
            .ok_or_else(|| ProtocolError::MessageBody("missing EUPHNonce".to_string()))?
            .deserialized()
            .map_err(|err| ProtocolError::MessageBody(format!("invalid EUPHNonce: {err}")))?;

        let fdo = claims
            .fdo
            .ok_or_else(|| ProtocolError::MessageBody("missing EAT-FDO claim".to_string()))?;
        let (x_b_key_exchange,): (XBKeyExchange<'static>,) = fdo
            .deserialized()
            .map_err(|err| ProtocolError::MessageBody(format!("invalid xBKeyExchange: {err}")))?;

        let owner = voucher::last_owner(&voucher)?;

        let decryption_key = self
            .keys
            .decryption_key(&owner)
            .await
            .wrap_err("resolving owner decryption key")?;

        let kex = session
            .kex
            .take()
            .ok_or_else(|| ProtocolError::Internal("key exchange already consumed".to_string()))?;

        let shared = kex.owner_finish(&x_b_key_exchange, decryption_key.as_ref())?;

        session.encryption = Some(EncryptionState::derive(
            session.cipher_suite,
            &shared,
            &self.crypto,
        )?);

        let plan = self.replacement_plan(&voucher, &owner).await?;

        let setup_key = self
            .keys
            .signing_key(&plan.owner_key)
            .await
            .wrap_err("resolving replacement owner key")?
            .ok_or_else(|| {
                ProtocolError::Internal("no signing key for the replacement owner".to_string())
            })?;

        let payload = SetupDevicePayload {
            rendezvous_info: plan.rendezvous_info.clone(),
            guid: plan.guid,
            nonce_to2_setup_dv,
            owner_2_key: plan.owner_key.clone(),
        };

        let mut buf = Vec::new();
        ciborium::into_writer(&payload, &mut buf)?;

        let sign = self.crypto.cose_sign1(&setup_key, buf, Vec::new())?;

        session.nonce_to2_setup_dv = Some(nonce_to2_setup_dv);
        session.plan = Some(plan);
        session.state = To2State::ServiceInfoReady;

        debug!(guid = %session.guid, "device proved, tunnel established");

        Ok(SetupDevice { sign })
    }

    async fn replacement_plan(
        &self,
        voucher: &crate::voucher::OwnershipVoucher<'static>,
        owner: &PublicKey<'static>,
    ) -> eyre::Result<ReplacementPlan> {
        let header = voucher.header();

        let guid = self
            .replacements
            .guid(header.ov_guid)
            .await
            .wrap_err("picking replacement guid")?;
        let rendezvous_info = self
            .replacements
            .rendezvous_info(guid.unwrap_or(header.ov_guid))
            .await
            .wrap_err("picking replacement rendezvous info")?;
        let owner_key = self
            .replacements
            .owner_key(owner)
            .await
            .wrap_err("picking replacement owner key")?;

        let changed = guid.is_some_and(|guid| guid != header.ov_guid)
            || rendezvous_info
                .as_ref()
                .is_some_and(|info| *info != header.ov_rv_info)
            || owner_key.as_ref().is_some_and(|key| key != owner);

        Ok(ReplacementPlan {
            guid: guid.unwrap_or(header.ov_guid),
            rendezvous_info: rendezvous_info.unwrap_or_else(|| header.ov_rv_info.clone()),
            owner_key: owner_key.unwrap_or_else(|| owner.clone()),
            changed,
        })
    }

    /// TO2.DeviceServiceInfoReady: records the replacement HMAC, if any,
    /// and settles the service info MTUs.
    pub async fn device_service_info_ready(
        &self,
        session: &mut To2Session,
        msg: &DeviceServiceInfoReady<'_>,
    ) -> eyre::Result<OwnerServiceInfoReady> {
        if session.state != To2State::ServiceInfoReady {
            return Err(out_of_sequence("DeviceServiceInfoReady"));
        }

        if let Some(hmac) = &msg.replacement_hmac {
            if hmac.hashtype.is_hash() {
                return Err(ProtocolError::MessageBody(format!(
                    "replacement HMAC with hash type {:?}",
                    hmac.hashtype
                ))
                .into());
            }

            session.replacement_hmac = Some(hmac.clone().into_owned());
        }

        session.device_service_info_mtu = msg
            .max_owner_service_info_sz
            .unwrap_or(DEFAULT_SERVICE_INFO_MTU);
        session.state = To2State::ServiceInfo;

        Ok(OwnerServiceInfoReady {
            max_device_service_info_sz: Some(self.max_device_service_info_sz),
        })
    }

    /// TO2.DeviceServiceInfo: forwards device pairs to the modules and
    /// answers with the next owner batch.
    ///
    /// While the device announces more to come the owner only
    /// acknowledges; its own batches start once the device is drained.
    pub async fn device_service_info(
        &self,
        session: &mut To2Session,
        msg: &DeviceServiceInfo<'_>,
    ) -> eyre::Result<OwnerServiceInfo<'static>> {
        if session.state != To2State::ServiceInfo {
            return Err(out_of_sequence("DeviceServiceInfo"));
        }

        for kv in &msg.service_info {
            self.modules
                .device_service_info(session.guid, &kv.service_info_key, kv.service_info_val.value())
                .await
                .wrap_err("handling device service info")?;
        }

        if msg.is_more_service_info {
            return Ok(OwnerServiceInfo {
                is_more_service_info: false,
                is_done: false,
                service_info: Vec::new(),
            });
        }

        let batch = self
            .modules
            .owner_service_info(session.guid, session.device_service_info_mtu)
            .await
            .wrap_err("producing owner service info")?;

        Ok(OwnerServiceInfo {
            is_more_service_info: batch.is_more,
            is_done: batch.is_done,
            service_info: batch.service_info,
        })
    }

    /// TO2.Done: settles the credentials and closes the exchange.
    ///
    /// The device either proved it kept its credentials, in which case
    /// nothing may have changed, or sent the HMAC of the replacement
    /// header and the stored voucher is superseded.
    pub async fn done(&self, session: &mut To2Session, msg: &Done) -> eyre::Result<Done2> {
        if session.state != To2State::ServiceInfo {
            return Err(out_of_sequence("Done"));
        }

        if msg.nonce_to2_prove_dv != session.nonce_to2_prove_dv {
            return Err(ProtocolError::InvalidMessage("nonce mismatch".to_string()).into());
        }

        let nonce_to2_setup_dv = session
            .nonce_to2_setup_dv
            .ok_or_else(|| ProtocolError::Internal("setup nonce not recorded".to_string()))?;
        let plan = session
            .plan
            .as_ref()
            .ok_or_else(|| ProtocolError::Internal("replacement plan not recorded".to_string()))?;

        let voucher = self
            .vouchers
            .query(session.guid)
            .await
            .wrap_err("querying voucher")?
            .ok_or_else(|| {
                ProtocolError::NotFound(format!("no voucher stored for {}", session.guid))
            })?;

        match &session.replacement_hmac {
            Some(hmac) if plan.changed || *hmac != voucher.ov_header_hmac => {
                let header = voucher.header();

                let replacement = OvHeader {
                    ovh_prot_ver: header.ovh_prot_ver,
                    ov_guid: plan.guid,
                    ov_rv_info: plan.rendezvous_info.clone(),
                    ov_device_info: Cow::Owned(header.ov_device_info.to_string()),
                    ov_pub_key: plan.owner_key.clone(),
                    ov_dev_cert_chain_hash: header
                        .ov_dev_cert_chain_hash
                        .clone()
                        .map(|hash| hash.into_owned()),
                };

                let replaced = crate::voucher::OwnershipVoucher {
                    ov_prot_ver: voucher.ov_prot_ver,
                    ov_header_tag: CborBstr::new(replacement)?,
                    ov_header_hmac: hmac.clone(),
                    ov_dev_cert_chain: voucher.ov_dev_cert_chain.clone(),
                    ov_entry_array: Vec::new(),
                };

                self.vouchers
                    .replace(session.guid, &replaced)
                    .await
                    .wrap_err("storing replacement voucher")?;

                debug!(old = %session.guid, new = %plan.guid, "voucher replaced");
            }
            Some(_) => {
                // HMAC unchanged over unchanged credentials: reuse.
                debug!(guid = %session.guid, "credentials reused");
            }
            None if plan.changed => {
                return Err(ProtocolError::CredReuse(
                    "credentials were replaced but the device sent no HMAC".to_string(),
                )
                .into());
            }
            None => {
                debug!(guid = %session.guid, "credentials reused");
            }
        }

        Ok(Done2 { nonce_to2_setup_dv })
    }
}

#[cfg(test)]
mod tests {
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair, KeyUsagePurpose};

    use crate::crypto::SigningKey;
    use crate::error::innermost_protocol_error;
    use crate::protocol::v101::eat_signature::{EAT_FDO, EAT_NONCE, EAT_UEID};
    use crate::protocol::v101::hash_hmac::Hashtype;
    use crate::protocol::v101::ownership_voucher::OwnershipVoucher;
    use crate::protocol::v101::public_key::PkType;
    use crate::protocol::v101::randezvous_info::{
        RVVariable, RendezvousDirective, RendezvousInstr,
    };
    use crate::protocol::v101::sign_info::{DeviceSgType, EASigInfo};
    use crate::protocol::v101::x509::{CoseX509, X509};
    use crate::protocol::v101::{Message, Nonce, PROTOCOL_VERSION};
    use crate::protocol::OneOrMore;
    use crate::storage::memory::{
        FixedReplacements, MemoryKeys, MemoryServiceInfo, MemoryVouchers,
    };
    use crate::storage::OwnerServiceInfoBatch;

    use super::*;

    fn p256_owner() -> (PublicKey<'static>, Vec<u8>) {
        let key = KeyPair::generate().unwrap();

        (
            PublicKey::x509(PkType::Secp256R1, key.public_key_der()),
            key.serialize_der(),
        )
    }

    fn rv_info() -> RendezvousInfo {
        let value = CborBstr::new(ciborium::Value::Text("owner.example".into())).unwrap();

        let instr = RendezvousInstr {
            rv_variable: RVVariable::RVDns,
            rv_value: value,
        };

        RendezvousInfo::new(vec![RendezvousDirective::new(vec![instr]).unwrap()]).unwrap()
    }

    fn device_chain() -> (CoseX509<'static>, SigningKey) {
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

        let chain = CoseX509::Certs(
            OneOrMore::new(vec![
                X509::from_der(leaf.der().to_vec()).unwrap(),
                X509::from_der(ca.der().to_vec()).unwrap(),
            ])
            .unwrap(),
        );

        let signer =
            SigningKey::from_pkcs8(DeviceSgType::StSecP256R1, &leaf_key.serialize_der()).unwrap();

        (chain, signer)
    }

    fn fresh_voucher(
        crypto: &CryptoService,
        owner: &PublicKey<'static>,
        chain: CoseX509<'static>,
    ) -> OwnershipVoucher<'static> {
        let mut der = Vec::new();
        for cert in chain.certs() {
            der.extend_from_slice(cert.der());
        }
        let chain_hash = crypto.hash(Hashtype::Sha256, &der).unwrap();

        let header = OvHeader {
            ovh_prot_ver: PROTOCOL_VERSION,
            ov_guid: Guid::new([7; 16]),
            ov_rv_info: rv_info(),
            ov_device_info: "test-device".into(),
            ov_pub_key: owner.clone(),
            ov_dev_cert_chain_hash: Some(chain_hash),
        };

        let header_tag = CborBstr::new(header).unwrap();
        let hmac = crypto
            .hmac(Hashtype::HmacSha256, b"device-secret", header_tag.bytes())
            .unwrap();

        OwnershipVoucher {
            ov_prot_ver: PROTOCOL_VERSION,
            ov_header_tag: header_tag,
            ov_header_hmac: hmac,
            ov_dev_cert_chain: Some(chain),
            ov_entry_array: Vec::new(),
        }
    }

    type TestExchange =
        To2Exchange<MemoryVouchers, MemoryKeys, FixedReplacements, MemoryServiceInfo>;

    fn setup(replacements: FixedReplacements) -> (TestExchange, Guid, SigningKey) {
        let crypto = CryptoService::new();
        let (owner, owner_pkcs8) = p256_owner();
        let (chain, device_signer) = device_chain();

        let voucher = fresh_voucher(&crypto, &owner, chain);
        let guid = voucher.header().ov_guid;

        let vouchers = MemoryVouchers::new();
        vouchers.insert(voucher);

        let keys = MemoryKeys::new();
        keys.add_signing_key(owner, DeviceSgType::StSecP256R1, owner_pkcs8);

        let exchange = To2Exchange::new(
            crypto,
            vouchers,
            keys,
            replacements,
            MemoryServiceInfo::new(),
        );

        (exchange, guid, device_signer)
    }

    fn hello_message(guid: Guid) -> HelloDevice<'static> {
        HelloDevice {
            max_device_message_size: u16::MAX,
            guid,
            nonce: Nonce::new([1; 16]),
            kex_suite_name: KexSuiteName::Ecdh256.as_str().into(),
            cipher_suite_name: CipherSuite::A128Gcm.into(),
            ea_sign_info: EASigInfo(SigInfo::empty(DeviceSgType::StSecP256R1)),
        }
    }

    fn device_eat(
        crypto: &CryptoService,
        signer: &SigningKey,
        nonce: Nonce,
        guid: Guid,
        xb: &XBKeyExchange<'_>,
        euph: Nonce,
    ) -> ProveDevice {
        let payload = ciborium::Value::Map(vec![
            (
                EAT_NONCE.into(),
                ciborium::Value::Bytes(nonce.as_slice().to_vec()),
            ),
            (
                EAT_UEID.into(),
                ciborium::Value::Bytes(guid.as_ueid().to_vec()),
            ),
            (
                EAT_FDO.into(),
                ciborium::Value::Array(vec![ciborium::Value::Bytes(xb.as_ref().to_vec())]),
            ),
        ]);

        let mut buf = Vec::new();
        ciborium::into_writer(&payload, &mut buf).unwrap();

        let unprotected = vec![(
            Label::Int(EUPH_NONCE),
            ciborium::Value::Bytes(euph.as_slice().to_vec()),
        )];

        ProveDevice {
            sign: crypto.cose_sign1(signer, buf, unprotected).unwrap(),
        }
    }

    /// Runs hello and the device attestation, returning the session and
    /// the device half of the tunnel.
    async fn establish_tunnel(
        exchange: &TestExchange,
        guid: Guid,
        device_signer: &SigningKey,
    ) -> (To2Session, EncryptionState, SetupDevice) {
        let hello = hello_message(guid);
        let raw = hello.encode().unwrap();

        let (mut session, prove_hdr) = exchange.hello_device(&raw, &hello).await.unwrap();

        let payload = prove_hdr.payload().unwrap();
        let header = prove_hdr.header().unwrap();

        let (xb, device_shared) = KeyExchange::device_respond(
            KexSuiteName::Ecdh256,
            &exchange.crypto,
            &payload.x_a_key_exchange,
            None,
        )
        .unwrap();

        let euph = Nonce::new([8; 16]);
        let prove = device_eat(
            &exchange.crypto,
            device_signer,
            header.cuph_nonce,
            guid,
            &xb,
            euph,
        );

        let setup = exchange.prove_device(&mut session, &prove).await.unwrap();

        let device_tunnel =
            EncryptionState::derive(CipherSuite::A128Gcm, &device_shared, &exchange.crypto)
                .unwrap();

        (session, device_tunnel, setup)
    }

    #[tokio::test]
    async fn hello_answers_with_signed_header() {
        let (exchange, guid, _) = setup(FixedReplacements::default());

        let hello = hello_message(guid);
        let raw = hello.encode().unwrap();

        let (session, prove_hdr) = exchange.hello_device(&raw, &hello).await.unwrap();

        let owner = {
            let voucher = exchange.vouchers.query(guid).await.unwrap().unwrap();
            voucher.header().ov_pub_key.clone().into_owned()
        };
        exchange
            .crypto
            .verify_sign1(&prove_hdr.sign, owner.spki().unwrap())
            .unwrap();

        let payload = prove_hdr.payload().unwrap();
        assert_eq!(payload.num_ov_entries, 0);
        assert_eq!(payload.nonce_to2_prove_ov, hello.nonce);
        exchange
            .crypto
            .hash_verify(&payload.hello_device_hash, &raw)
            .unwrap();

        let header = prove_hdr.header().unwrap();
        assert_eq!(header.cuph_nonce, session.nonce_to2_prove_dv);
        assert_eq!(header.cuph_owner_pubkey, owner);
    }

    #[tokio::test]
    async fn hello_for_unknown_guid_not_found() {
        let (exchange, _, _) = setup(FixedReplacements::default());

        let hello = hello_message(Guid::new([9; 16]));
        let raw = hello.encode().unwrap();

        let report = exchange.hello_device(&raw, &hello).await.unwrap_err();
        assert_eq!(innermost_protocol_error(&report).unwrap().code(), 6);
    }

    #[tokio::test]
    async fn unknown_kex_suite_rejected() {
        let (exchange, guid, _) = setup(FixedReplacements::default());

        let mut hello = hello_message(guid);
        hello.kex_suite_name = "ECDH521".into();
        let raw = hello.encode().unwrap();

        let report = exchange.hello_device(&raw, &hello).await.unwrap_err();
        assert_eq!(innermost_protocol_error(&report).unwrap().code(), 500);
    }

    #[tokio::test]
    async fn entry_out_of_range_rejected() {
        let (exchange, guid, _) = setup(FixedReplacements::default());

        let hello = hello_message(guid);
        let raw = hello.encode().unwrap();
        let (session, _) = exchange.hello_device(&raw, &hello).await.unwrap();

        let report = exchange
            .get_ov_next_entry(&session, &GetOvNextEntry { ov_entry_num: 0 })
            .await
            .unwrap_err();
        assert_eq!(innermost_protocol_error(&report).unwrap().code(), 101);
    }

    #[tokio::test]
    async fn extended_voucher_entries_served() {
        let crypto = CryptoService::new();
        let (manufacturer, manufacturer_pkcs8) = p256_owner();
        let (owner2, owner2_pkcs8) = p256_owner();
        let (chain, _) = device_chain();

        let voucher = fresh_voucher(&crypto, &manufacturer, chain);
        let guid = voucher.header().ov_guid;

        let manufacturer_signer =
            SigningKey::from_pkcs8(DeviceSgType::StSecP256R1, &manufacturer_pkcs8).unwrap();
        let voucher = voucher::extend(&crypto, voucher, &manufacturer_signer, &owner2).unwrap();

        let vouchers = MemoryVouchers::new();
        vouchers.insert(voucher.clone());

        let keys = MemoryKeys::new();
        keys.add_signing_key(owner2, DeviceSgType::StSecP256R1, owner2_pkcs8);

        let exchange = To2Exchange::new(
            crypto,
            vouchers,
            keys,
            FixedReplacements::default(),
            MemoryServiceInfo::new(),
        );

        let hello = hello_message(guid);
        let raw = hello.encode().unwrap();
        let (session, prove_hdr) = exchange.hello_device(&raw, &hello).await.unwrap();
        assert_eq!(prove_hdr.payload().unwrap().num_ov_entries, 1);

        let entry = exchange
            .get_ov_next_entry(&session, &GetOvNextEntry { ov_entry_num: 0 })
            .await
            .unwrap();
        assert_eq!(entry.ov_entry_num, 0);
        assert_eq!(entry.ov_entry, voucher.ov_entry_array[0]);
    }

    #[tokio::test]
    async fn full_exchange_with_credential_reuse() {
        let (exchange, guid, device_signer) = setup(FixedReplacements::default());

        let (mut session, device_tunnel, setup_msg) =
            establish_tunnel(&exchange, guid, &device_signer).await;

        let payload = setup_msg.payload().unwrap();
        assert_eq!(payload.guid, guid);
        assert_eq!(payload.nonce_to2_setup_dv, Nonce::new([8; 16]));

        // Both halves derived the same tunnel keys.
        let sealed = session
            .encryption
            .as_mut()
            .unwrap()
            .encrypt(&exchange.crypto, b"ping")
            .unwrap();
        assert_eq!(device_tunnel.decrypt(&sealed).unwrap(), b"ping");

        let ready = exchange
            .device_service_info_ready(
                &mut session,
                &DeviceServiceInfoReady {
                    replacement_hmac: None,
                    max_owner_service_info_sz: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(ready.max_device_service_info_sz, Some(1300));

        exchange.modules.queue(OwnerServiceInfoBatch {
            service_info: vec![crate::protocol::v101::service_info::ServiceInfoKv::new(
                "fdo.download:name",
                ciborium::Value::Text("config".into()),
            )
            .unwrap()],
            is_more: false,
            is_done: true,
        });

        let device_info = DeviceServiceInfo {
            is_more_service_info: false,
            service_info: vec![crate::protocol::v101::service_info::ServiceInfoKv::new(
                "devmod:os",
                ciborium::Value::Text("linux".into()),
            )
            .unwrap()],
        };

        let reply = exchange
            .device_service_info(&mut session, &device_info)
            .await
            .unwrap();
        assert!(reply.is_done);
        assert_eq!(reply.service_info.len(), 1);
        assert_eq!(exchange.modules.received()[0].0, "devmod:os");

        let nonce_to2_prove_dv = session.nonce_to2_prove_dv;
        let done2 = exchange
            .done(&mut session, &Done { nonce_to2_prove_dv })
            .await
            .unwrap();
        assert_eq!(done2.nonce_to2_setup_dv, Nonce::new([8; 16]));

        // Reuse leaves the stored voucher untouched.
        let stored = exchange.vouchers.query(guid).await.unwrap().unwrap();
        assert!(stored.ov_entry_array.is_empty());
        assert_eq!(stored.header().ov_guid, guid);
    }

    #[tokio::test]
    async fn replacement_supersedes_the_voucher() {
        let new_guid = Guid::new([42; 16]);
        let (exchange, guid, device_signer) = setup(FixedReplacements {
            guid: Some(new_guid),
            ..Default::default()
        });

        let (mut session, _, setup_msg) = establish_tunnel(&exchange, guid, &device_signer).await;
        assert_eq!(setup_msg.payload().unwrap().guid, new_guid);

        let replacement_hmac = exchange
            .crypto
            .hmac(Hashtype::HmacSha256, b"device-secret", b"replacement header")
            .unwrap();

        exchange
            .device_service_info_ready(
                &mut session,
                &DeviceServiceInfoReady {
                    replacement_hmac: Some(replacement_hmac.clone()),
                    max_owner_service_info_sz: None,
                },
            )
            .await
            .unwrap();

        let nonce_to2_prove_dv = session.nonce_to2_prove_dv;
        exchange
            .done(&mut session, &Done { nonce_to2_prove_dv })
            .await
            .unwrap();

        assert!(exchange.vouchers.query(guid).await.unwrap().is_none());

        let replaced = exchange.vouchers.query(new_guid).await.unwrap().unwrap();
        assert_eq!(replaced.header().ov_guid, new_guid);
        assert_eq!(replaced.ov_header_hmac, replacement_hmac);
        assert!(replaced.ov_entry_array.is_empty());
    }

    #[tokio::test]
    async fn replacement_without_hmac_rejected() {
        let (exchange, guid, device_signer) = setup(FixedReplacements {
            guid: Some(Guid::new([42; 16])),
            ..Default::default()
        });

        let (mut session, _, _) = establish_tunnel(&exchange, guid, &device_signer).await;

        exchange
            .device_service_info_ready(
                &mut session,
                &DeviceServiceInfoReady {
                    replacement_hmac: None,
                    max_owner_service_info_sz: None,
                },
            )
            .await
            .unwrap();

        let nonce_to2_prove_dv = session.nonce_to2_prove_dv;
        let report = exchange
            .done(&mut session, &Done { nonce_to2_prove_dv })
            .await
            .unwrap_err();
        assert_eq!(innermost_protocol_error(&report).unwrap().code(), 102);
    }

    #[tokio::test]
    async fn done_nonce_mismatch_rejected() {
        let (exchange, guid, device_signer) = setup(FixedReplacements::default());

        let (mut session, _, _) = establish_tunnel(&exchange, guid, &device_signer).await;

        exchange
            .device_service_info_ready(
                &mut session,
                &DeviceServiceInfoReady {
                    replacement_hmac: None,
                    max_owner_service_info_sz: None,
                },
            )
            .await
            .unwrap();

        let mut nonce = session.nonce_to2_prove_dv.into_array();
        nonce[0] ^= 1;

        let report = exchange
            .done(
                &mut session,
                &Done {
                    nonce_to2_prove_dv: Nonce::new(nonce),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(innermost_protocol_error(&report).unwrap().code(), 101);
    }

    #[tokio::test]
    async fn prove_device_with_wrong_nonce_rejected() {
        let (exchange, guid, device_signer) = setup(FixedReplacements::default());

        let hello = hello_message(guid);
        let raw = hello.encode().unwrap();
        let (mut session, prove_hdr) = exchange.hello_device(&raw, &hello).await.unwrap();

        let (xb, _) = KeyExchange::device_respond(
            KexSuiteName::Ecdh256,
            &exchange.crypto,
            &prove_hdr.payload().unwrap().x_a_key_exchange,
            None,
        )
        .unwrap();

        let mut nonce = prove_hdr.header().unwrap().cuph_nonce.into_array();
        nonce[0] ^= 1;

        let prove = device_eat(
            &exchange.crypto,
            &device_signer,
            Nonce::new(nonce),
            guid,
            &xb,
            Nonce::new([8; 16]),
        );

        let report = exchange.prove_device(&mut session, &prove).await.unwrap_err();
        assert_eq!(innermost_protocol_error(&report).unwrap().code(), 101);
    }

    #[tokio::test]
    async fn service_info_before_attestation_rejected() {
        let (exchange, guid, _) = setup(FixedReplacements::default());

        let hello = hello_message(guid);
        let raw = hello.encode().unwrap();
        let (mut session, _) = exchange.hello_device(&raw, &hello).await.unwrap();

        let report = exchange
            .device_service_info_ready(
                &mut session,
                &DeviceServiceInfoReady {
                    replacement_hmac: None,
                    max_owner_service_info_sz: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(innermost_protocol_error(&report).unwrap().code(), 101);
    }
}
