//! TO1, the rendezvous exchange.
//!
//! A booting device proves possession of its GUID to the rendezvous
//! service and receives the to1d blob the owner registered in TO0,
//! telling it where to run TO2.
//!
//! ```text
//! Device                     Rendezvous
//!   | -- HelloRV (30) ---------> |
//!   | <- HelloRVAck (31) ------- |
//!   | -- ProveToRV (32) -------> |
//!   | <- RVRedirect (33) ------- |
//! ```

use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::CryptoService;
use crate::error::ProtocolError;
use crate::protocol::v101::eat_signature::EatClaims;
use crate::protocol::v101::sign_info::{EBSigInfo, SigInfo};
use crate::protocol::v101::to1::{HelloRv, HelloRvAck, ProveToRv, RvRedirect};
use crate::protocol::v101::{Guid, NonceTo1Proof};
use crate::storage::To1RedirectStore;

/// Server side of the TO1 exchange.
#[derive(Debug)]
pub struct To1Exchange<R> {
    crypto: CryptoService,
    redirects: R,
}

/// State carried between HelloRV and ProveToRV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct To1Session {
    pub(crate) guid: Guid,
    pub(crate) nonce: NonceTo1Proof,
    pub(crate) sig_info: SigInfo<'static>,
}

impl<R> To1Exchange<R>
where
    R: To1RedirectStore,
{
    pub fn new(crypto: CryptoService, redirects: R) -> Self {
        Self { crypto, redirects }
    }

    /// TO1.HelloRV: opens a session for a device with a registered
    /// redirect.
    ///
    /// Devices no owner has registered are turned away before any nonce
    /// is minted, so the rendezvous service cannot be used to probe
    /// which GUIDs exist beyond this yes/no answer.
    pub async fn hello(
        &self,
        hello: &HelloRv<'_>,
    ) -> eyre::Result<(To1Session, HelloRvAck<'static>)> {
        let registered = self
            .redirects
            .redirect(hello.guid)
            .await
            .wrap_err("querying redirect")?
            .is_some();

        if !registered {
            return Err(ProtocolError::NotFound(format!(
                "no redirect registered for {}",
                hello.guid
            ))
            .into());
        }

        let sig_info = &hello.e_a_sig_info.0;

        let e_b_sig_info = if sig_info.sg_type.is_epid() {
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

        let nonce = self.crypto.random_nonce()?;

        let session = To1Session {
            guid: hello.guid,
            nonce,
            sig_info: sig_info.clone().into_owned(),
        };

        debug!(guid = %hello.guid, "TO1 session opened");

        let ack = HelloRvAck {
            nonce_to1_proof: nonce,
            e_b_sig_info: EBSigInfo(e_b_sig_info),
        };

        Ok((session, ack))
    }

    /// TO1.ProveToRV: verifies the device attestation and releases the
    /// to1d blob.
    ///
    /// The nonce and GUID claims must match the session byte for byte.
    pub async fn prove(
        &self,
        session: &To1Session,
        prove: &ProveToRv,
    ) -> eyre::Result<RvRedirect> {
        let claims = EatClaims::from_token(&prove.ea_token)
            .map_err(|err| ProtocolError::MessageBody(format!("invalid EAT: {err}")))?;

        if claims.nonce != session.nonce {
            return Err(ProtocolError::InvalidMessage("nonce mismatch".to_string()).into());
        }

        if claims.guid != session.guid {
            return Err(ProtocolError::InvalidGuid(format!(
                "attestation for {} in a session for {}",
                claims.guid, session.guid
            ))
            .into());
        }

        let device_key = self
            .redirects
            .device_key(session.guid)
            .await
            .wrap_err("querying device key")?;

        self.crypto
            .verify_device_sign1(&prove.ea_token, &session.sig_info, device_key.as_deref(), None)
            .await
            .map_err(|err| {
                ProtocolError::InvalidMessage(format!("attestation verification failed: {err}"))
            })?;

        let redirect = self
            .redirects
            .redirect(session.guid)
            .await
            .wrap_err("querying redirect")?
            .ok_or_else(|| {
                ProtocolError::NotFound(format!("no redirect registered for {}", session.guid))
            })?;

        debug!(guid = %session.guid, "device proved, releasing to1d");

        Ok(redirect)
    }
}

#[cfg(test)]
mod tests {
    use rcgen::KeyPair;

    use crate::crypto::SigningKey;
    use crate::error::innermost_protocol_error;
    use crate::protocol::v101::eat_signature::{EAT_NONCE, EAT_UEID};
    use crate::protocol::v101::hash_hmac::Hashtype;
    use crate::protocol::v101::rv_to2_addr::RvTo2AddrEntry;
    use crate::protocol::v101::sign_info::{DeviceSgType, EASigInfo};
    use crate::protocol::v101::to1::To1dBlob;
    use crate::protocol::v101::{Nonce, TransportProtocol};
    use crate::storage::memory::MemoryRedirects;

    use super::*;

    fn device_keys() -> (SigningKey, Vec<u8>) {
        let key = KeyPair::generate().unwrap();

        let signer =
            SigningKey::from_pkcs8(DeviceSgType::StSecP256R1, &key.serialize_der()).unwrap();

        (signer, key.public_key_der())
    }

    fn redirect(crypto: &CryptoService) -> RvRedirect {
        let owner_key = KeyPair::generate().unwrap();
        let owner =
            SigningKey::from_pkcs8(DeviceSgType::StSecP256R1, &owner_key.serialize_der()).unwrap();

        let blob = To1dBlob {
            to1d_rv: vec![RvTo2AddrEntry {
                rv_ip: None,
                rv_dns: Some("owner.example".into()),
                rv_port: 8042,
                rv_protocol: TransportProtocol::ProtHttp,
            }],
            to1d_to0d_hash: crypto.hash(Hashtype::Sha256, b"to0d").unwrap(),
        };

        let mut payload = Vec::new();
        ciborium::into_writer(&blob, &mut payload).unwrap();

        RvRedirect {
            to1d: crypto.cose_sign1(&owner, payload, Vec::new()).unwrap(),
        }
    }

    fn eat_token(
        crypto: &CryptoService,
        signer: &SigningKey,
        nonce: Nonce,
        guid: Guid,
    ) -> ProveToRv {
        let payload = ciborium::Value::Map(vec![
            (
                EAT_NONCE.into(),
                ciborium::Value::Bytes(nonce.as_slice().to_vec()),
            ),
            (
                EAT_UEID.into(),
                ciborium::Value::Bytes(guid.as_ueid().to_vec()),
            ),
        ]);

        let mut buf = Vec::new();
        ciborium::into_writer(&payload, &mut buf).unwrap();

        ProveToRv {
            ea_token: crypto.cose_sign1(signer, buf, Vec::new()).unwrap(),
        }
    }

    fn exchange_with_device() -> (To1Exchange<MemoryRedirects>, SigningKey, Guid) {
        let crypto = CryptoService::new();
        let guid = Guid::new([4; 16]);

        let (signer, spki) = device_keys();

        let redirects = MemoryRedirects::new();
        redirects.register(guid, redirect(&crypto), Some(spki));

        (To1Exchange::new(crypto, redirects), signer, guid)
    }

    #[tokio::test]
    async fn full_exchange_releases_to1d() {
        let (exchange, signer, guid) = exchange_with_device();

        let hello = HelloRv {
            guid,
            e_a_sig_info: EASigInfo(SigInfo::empty(DeviceSgType::StSecP256R1)),
        };

        let (session, ack) = exchange.hello(&hello).await.unwrap();
        assert_eq!(ack.nonce_to1_proof, session.nonce);
        assert_eq!(ack.e_b_sig_info.0.sg_type, DeviceSgType::StSecP256R1);

        let prove = eat_token(&exchange.crypto, &signer, session.nonce, guid);

        let redirect = exchange.prove(&session, &prove).await.unwrap();
        let blob = redirect.to1d_blob().unwrap();
        assert_eq!(blob.to1d_rv[0].rv_port, 8042);
    }

    #[tokio::test]
    async fn unknown_guid_is_not_found() {
        let (exchange, _, _) = exchange_with_device();

        let hello = HelloRv {
            guid: Guid::new([9; 16]),
            e_a_sig_info: EASigInfo(SigInfo::empty(DeviceSgType::StSecP256R1)),
        };

        let report = exchange.hello(&hello).await.unwrap_err();
        let err = innermost_protocol_error(&report).unwrap();
        assert_eq!(err.code(), 6);
    }

    #[tokio::test]
    async fn nonce_off_by_one_byte_rejected() {
        let (exchange, signer, guid) = exchange_with_device();

        let hello = HelloRv {
            guid,
            e_a_sig_info: EASigInfo(SigInfo::empty(DeviceSgType::StSecP256R1)),
        };
        let (session, _) = exchange.hello(&hello).await.unwrap();

        let mut nonce = session.nonce.into_array();
        nonce[0] ^= 1;

        let prove = eat_token(&exchange.crypto, &signer, Nonce::new(nonce), guid);

        let report = exchange.prove(&session, &prove).await.unwrap_err();
        let err = innermost_protocol_error(&report).unwrap();
        assert_eq!(err.code(), 101);
    }

    #[tokio::test]
    async fn guid_mismatch_rejected() {
        let (exchange, signer, guid) = exchange_with_device();

        let hello = HelloRv {
            guid,
            e_a_sig_info: EASigInfo(SigInfo::empty(DeviceSgType::StSecP256R1)),
        };
        let (session, _) = exchange.hello(&hello).await.unwrap();

        let mut bytes = [4; 16];
        bytes[0] ^= 1;

        let prove = eat_token(&exchange.crypto, &signer, session.nonce, Guid::new(bytes));

        let report = exchange.prove(&session, &prove).await.unwrap_err();
        let err = innermost_protocol_error(&report).unwrap();
        assert_eq!(err.code(), 5);
    }

    #[tokio::test]
    async fn wrong_device_key_rejected() {
        let (exchange, _, guid) = exchange_with_device();
        let (other_signer, _) = device_keys();

        let hello = HelloRv {
            guid,
            e_a_sig_info: EASigInfo(SigInfo::empty(DeviceSgType::StSecP256R1)),
        };
        let (session, _) = exchange.hello(&hello).await.unwrap();

        let prove = eat_token(&exchange.crypto, &other_signer, session.nonce, guid);

        let report = exchange.prove(&session, &prove).await.unwrap_err();
        let err = innermost_protocol_error(&report).unwrap();
        assert_eq!(err.code(), 101);
    }
}
