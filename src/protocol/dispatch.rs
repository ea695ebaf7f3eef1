//! Message dispatch for the onboarding server.
//!
//! The runner owns the session store and the lifecycle hooks, routes each
//! raw message to its exchange handler, and turns every failure into the
//! wire ERROR message. Transport details stay outside: the caller hands in
//! the message type, the body and the session token, however they arrived.

use eyre::WrapErr;
use tracing::{debug, warn};

use crate::crypto::CryptoService;
use crate::error::{innermost_protocol_error, ProtocolError};
use crate::protocol::v101::error::ErrorMessage;
use crate::protocol::v101::to1::{HelloRv, HelloRvAck, ProveToRv, RvRedirect};
use crate::protocol::v101::to2::{
    DeviceServiceInfo, DeviceServiceInfoReady, Done, Done2, GetOvNextEntry, HelloDevice,
    OvNextEntry, OwnerServiceInfo, OwnerServiceInfoReady, ProveDevice, ProveOvHdr, SetupDevice,
};
use crate::protocol::v101::{Message, Msgtype};
use crate::storage::{
    KeyResolver, ReplacementSupplier, ServiceInfoModule, SessionLifecycle, SessionStore,
    To1RedirectStore, VoucherStore,
};

use super::to1::{To1Exchange, To1Session};
use super::to2::{To2Exchange, To2Session};

/// One inbound message, as the transport received it.
#[derive(Debug, Clone, Copy)]
pub struct DispatchRequest<'a> {
    pub msg_type: Msgtype,
    pub body: &'a [u8],
    /// Session token echoed by the device, absent on initial messages.
    pub token: Option<&'a str>,
}

/// The reply to send back, with the token the device must echo.
#[derive(Debug)]
pub struct DispatchResult {
    pub msg_type: Msgtype,
    pub body: Vec<u8>,
    pub token: String,
}

/// Session state for either exchange, stored as one opaque blob.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
enum Session {
    To1(To1Session),
    To2(To2Session),
}

fn encode_session(session: &Session) -> eyre::Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(session, &mut buf).wrap_err("encoding session")?;

    Ok(buf)
}

fn decode_body<T: Message>(body: &[u8]) -> eyre::Result<T> {
    T::decode(body).map_err(|err| {
        ProtocolError::MessageBody(format!("invalid message {}: {err}", T::MSG_TYPE)).into()
    })
}

/// Routes protocol messages to the TO1 and TO2 exchanges.
#[derive(Debug)]
pub struct DispatchRunner<S, L, R, V, K, P, M> {
    crypto: CryptoService,
    sessions: S,
    lifecycle: L,
    to1: To1Exchange<R>,
    to2: To2Exchange<V, K, P, M>,
}

impl<S, L, R, V, K, P, M> DispatchRunner<S, L, R, V, K, P, M>
where
    S: SessionStore,
    L: SessionLifecycle,
    R: To1RedirectStore,
    V: VoucherStore,
    K: KeyResolver,
    P: ReplacementSupplier,
    M: ServiceInfoModule,
{
    pub fn new(
        crypto: CryptoService,
        sessions: S,
        lifecycle: L,
        to1: To1Exchange<R>,
        to2: To2Exchange<V, K, P, M>,
    ) -> Self {
        Self {
            crypto,
            sessions,
            lifecycle,
            to1,
            to2,
        }
    }

    /// Handles one message, never failing outward: every error becomes
    /// the wire ERROR message and closes the session.
    pub async fn handle(&self, req: DispatchRequest<'_>) -> DispatchResult {
        debug!(msg_type = req.msg_type, "dispatching");

        match self.try_handle(&req).await {
            Ok(result) => result,
            Err(report) => self.error_result(&req, report).await,
        }
    }

    async fn try_handle(&self, req: &DispatchRequest<'_>) -> eyre::Result<DispatchResult> {
        match req.msg_type {
            HelloRv::MSG_TYPE | HelloDevice::MSG_TYPE => self.handle_initial(req).await,
            _ => self.handle_continue(req).await,
        }
    }

    async fn handle_initial(&self, req: &DispatchRequest<'_>) -> eyre::Result<DispatchResult> {
        let token = self.mint_token()?;

        self.lifecycle
            .starting(&token)
            .await
            .wrap_err("starting hook")?;

        let (session, msg_type, body) = match req.msg_type {
            HelloRv::MSG_TYPE => {
                let hello: HelloRv<'_> = decode_body(req.body)?;
                let (session, ack) = self.to1.hello(&hello).await?;

                (Session::To1(session), HelloRvAck::MSG_TYPE, ack.encode()?)
            }
            HelloDevice::MSG_TYPE => {
                let hello: HelloDevice<'_> = decode_body(req.body)?;
                let (session, hdr) = self.to2.hello_device(req.body, &hello).await?;

                (Session::To2(session), ProveOvHdr::MSG_TYPE, hdr.encode()?)
            }
            other => eyre::bail!("message {other} routed as initial"),
        };

        self.sessions
            .save(&token, &encode_session(&session)?)
            .await
            .wrap_err("saving session")?;
        self.lifecycle
            .started(&token)
            .await
            .wrap_err("started hook")?;

        Ok(DispatchResult {
            msg_type,
            body,
            token,
        })
    }

    async fn handle_continue(&self, req: &DispatchRequest<'_>) -> eyre::Result<DispatchResult> {
        let token = req.token.filter(|token| !token.is_empty()).ok_or_else(|| {
            ProtocolError::InvalidMessage(format!("message {} without a session", req.msg_type))
        })?;

        let blob = self
            .sessions
            .get(token)
            .await
            .wrap_err("loading session")?
            .ok_or_else(|| ProtocolError::InvalidToken("unknown session token".to_string()))?;

        let mut session: Session = ciborium::from_reader(blob.as_slice())
            .map_err(|err| ProtocolError::InvalidToken(format!("undecodable session: {err}")))?;

        self.lifecycle
            .continuing(token)
            .await
            .wrap_err("continuing hook")?;

        let (msg_type, body, terminal) = match (&mut session, req.msg_type) {
            (Session::To1(to1), ProveToRv::MSG_TYPE) => {
                let prove: ProveToRv = decode_body(req.body)?;
                let redirect = self.to1.prove(to1, &prove).await?;

                (RvRedirect::MSG_TYPE, redirect.encode()?, true)
            }
            (Session::To2(to2), GetOvNextEntry::MSG_TYPE) => {
                let req_entry: GetOvNextEntry = decode_body(req.body)?;
                let entry = self.to2.get_ov_next_entry(to2, &req_entry).await?;

                (OvNextEntry::MSG_TYPE, entry.encode()?, false)
            }
            (Session::To2(to2), ProveDevice::MSG_TYPE) => {
                let prove: ProveDevice = decode_body(req.body)?;
                let setup = self.to2.prove_device(to2, &prove).await?;
                let sealed = self.seal(to2, setup.encode()?)?;

                (SetupDevice::MSG_TYPE, sealed, false)
            }
            (Session::To2(to2), DeviceServiceInfoReady::MSG_TYPE) => {
                let plain = self.open(to2, req.body)?;
                let ready: DeviceServiceInfoReady<'_> = decode_body(&plain)?;
                let reply = self.to2.device_service_info_ready(to2, &ready).await?;
                let sealed = self.seal(to2, reply.encode()?)?;

                (OwnerServiceInfoReady::MSG_TYPE, sealed, false)
            }
            (Session::To2(to2), DeviceServiceInfo::MSG_TYPE) => {
                let plain = self.open(to2, req.body)?;
                let info: DeviceServiceInfo<'_> = decode_body(&plain)?;
                let reply = self.to2.device_service_info(to2, &info).await?;
                let sealed = self.seal(to2, reply.encode()?)?;

                (OwnerServiceInfo::MSG_TYPE, sealed, false)
            }
            (Session::To2(to2), Done::MSG_TYPE) => {
                let plain = self.open(to2, req.body)?;
                let done: Done = decode_body(&plain)?;
                let done2 = self.to2.done(to2, &done).await?;
                let sealed = self.seal(to2, done2.encode()?)?;

                (Done2::MSG_TYPE, sealed, true)
            }
            _ => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "message {} out of sequence",
                    req.msg_type
                ))
                .into());
            }
        };

        if terminal {
            self.sessions
                .expire(token)
                .await
                .wrap_err("expiring session")?;
            self.lifecycle
                .completed(token)
                .await
                .wrap_err("completed hook")?;
        } else {
            self.sessions
                .save(token, &encode_session(&session)?)
                .await
                .wrap_err("saving session")?;
            self.lifecycle
                .continued(token)
                .await
                .wrap_err("continued hook")?;
        }

        Ok(DispatchResult {
            msg_type,
            body,
            token: token.to_string(),
        })
    }

    /// Encrypts an outbound body once the tunnel is up.
    fn seal(&self, session: &mut To2Session, plain: Vec<u8>) -> eyre::Result<Vec<u8>> {
        let encryption = session.encryption.as_mut().ok_or_else(|| {
            ProtocolError::Internal("encrypting before the tunnel is established".to_string())
        })?;

        encryption.encrypt(&self.crypto, &plain)
    }

    /// Decrypts an inbound body once the tunnel is up.
    fn open(&self, session: &To2Session, body: &[u8]) -> eyre::Result<Vec<u8>> {
        let encryption = session.encryption.as_ref().ok_or_else(|| {
            ProtocolError::InvalidMessage("encrypted message before the tunnel".to_string())
        })?;

        encryption
            .decrypt(body)
            .map_err(|err| ProtocolError::MessageBody(format!("undecryptable body: {err}")).into())
    }

    fn mint_token(&self) -> eyre::Result<String> {
        let bytes = self.crypto.random_bytes(16)?;

        Ok(crate::protocol::Hex::new(&bytes).to_string())
    }

    async fn error_result(
        &self,
        req: &DispatchRequest<'_>,
        report: eyre::Report,
    ) -> DispatchResult {
        warn!(msg_type = req.msg_type, error = %report, "exchange failed");

        let token = req.token.unwrap_or_default();

        if !token.is_empty() {
            if let Err(error) = self.lifecycle.failed(token).await {
                warn!(%error, "failed hook errored");
            }
            if let Err(error) = self.sessions.expire(token).await {
                warn!(%error, "expiring failed session errored");
            }
        }

        // Untyped failures stay opaque on the wire, the detail goes to the
        // log only.
        let typed = innermost_protocol_error(&report);
        let code = typed.map_or(500, ProtocolError::code);
        let error_str = typed.map_or_else(
            || "Unspecified error occurred.".to_string(),
            ToString::to_string,
        );
        let prev_msg_id = u8::try_from(req.msg_type).unwrap_or(0);

        let message = ErrorMessage::new(code, prev_msg_id, error_str, None);
        let body = message.encode().unwrap_or_default();

        DispatchResult {
            msg_type: ErrorMessage::MSG_TYPE,
            body,
            token: token.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair, KeyUsagePurpose};

    use crate::crypto::cipher::{CipherSuite, EncryptionState};
    use crate::crypto::kex::{KexSuiteName, KeyExchange};
    use crate::crypto::SigningKey;
    use crate::protocol::v101::eat_signature::{EAT_FDO, EAT_NONCE, EAT_UEID, EUPH_NONCE};
    use crate::protocol::v101::hash_hmac::Hashtype;
    use crate::protocol::v101::key_exchange::XBKeyExchange;
    use crate::protocol::v101::ownership_voucher::{OvHeader, OwnershipVoucher};
    use crate::protocol::v101::public_key::{PkType, PublicKey};
    use crate::protocol::v101::randezvous_info::{
        RVVariable, RendezvousDirective, RendezvousInfo, RendezvousInstr,
    };
    use crate::protocol::v101::rv_to2_addr::RvTo2AddrEntry;
    use crate::protocol::v101::sign_info::{DeviceSgType, EASigInfo, SigInfo};
    use crate::protocol::v101::to1::To1dBlob;
    use crate::protocol::v101::x509::{CoseX509, X509};
    use crate::protocol::v101::{Guid, Nonce, TransportProtocol, PROTOCOL_VERSION};
    use crate::protocol::{CborBstr, OneOrMore};
    use crate::storage::memory::{
        FixedReplacements, MemoryKeys, MemoryRedirects, MemoryServiceInfo, MemorySessions,
        MemoryVouchers, RecordingLifecycle,
    };

    use super::*;

    type Runner = DispatchRunner<
        MemorySessions,
        RecordingLifecycle,
        MemoryRedirects,
        MemoryVouchers,
        MemoryKeys,
        FixedReplacements,
        MemoryServiceInfo,
    >;

    fn rv_info() -> RendezvousInfo {
        let value = CborBstr::new(ciborium::Value::Text("owner.example".into())).unwrap();

        let instr = RendezvousInstr {
            rv_variable: RVVariable::RVDns,
            rv_value: value,
        };

        RendezvousInfo::new(vec![RendezvousDirective::new(vec![instr]).unwrap()]).unwrap()
    }

    fn device_chain() -> (CoseX509<'static>, SigningKey, Vec<u8>) {
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

        (chain, signer, leaf_key.public_key_der())
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

    fn runner() -> (Runner, CryptoService, Guid, SigningKey) {
        let crypto = CryptoService::new();

        let owner_pair = KeyPair::generate().unwrap();
        let owner = PublicKey::x509(PkType::Secp256R1, owner_pair.public_key_der());

        let (chain, device_signer, device_spki) = device_chain();
        let voucher = fresh_voucher(&crypto, &owner, chain);
        let guid = voucher.header().ov_guid;

        let vouchers = MemoryVouchers::new();
        vouchers.insert(voucher);

        let keys = MemoryKeys::new();
        keys.add_signing_key(
            owner.clone(),
            DeviceSgType::StSecP256R1,
            owner_pair.serialize_der(),
        );

        let redirects = MemoryRedirects::new();
        let to1d_payload = {
            let blob = To1dBlob {
                to1d_rv: vec![RvTo2AddrEntry {
                    rv_ip: None,
                    rv_dns: Some("owner.example".into()),
                    rv_port: 8042,
                    rv_protocol: TransportProtocol::ProtHttp,
                }],
                to1d_to0d_hash: crypto.hash(Hashtype::Sha256, b"to0d").unwrap(),
            };

            let mut buf = Vec::new();
            ciborium::into_writer(&blob, &mut buf).unwrap();
            buf
        };
        let owner_signer =
            SigningKey::from_pkcs8(DeviceSgType::StSecP256R1, &owner_pair.serialize_der()).unwrap();
        redirects.register(
            guid,
            RvRedirect {
                to1d: crypto
                    .cose_sign1(&owner_signer, to1d_payload, Vec::new())
                    .unwrap(),
            },
            Some(device_spki),
        );

        let to1 = To1Exchange::new(crypto.clone(), redirects);
        let to2 = To2Exchange::new(
            crypto.clone(),
            vouchers,
            keys,
            FixedReplacements::default(),
            MemoryServiceInfo::new(),
        );

        let runner = DispatchRunner::new(
            crypto.clone(),
            MemorySessions::new(),
            RecordingLifecycle::new(),
            to1,
            to2,
        );

        (runner, crypto, guid, device_signer)
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
            coset::Label::Int(EUPH_NONCE),
            ciborium::Value::Bytes(euph.as_slice().to_vec()),
        )];

        ProveDevice {
            sign: crypto.cose_sign1(signer, buf, unprotected).unwrap(),
        }
    }

    fn decoded_error(result: &DispatchResult) -> ErrorMessage<'static> {
        assert_eq!(result.msg_type, ErrorMessage::MSG_TYPE);

        ErrorMessage::decode(&result.body).unwrap()
    }

    #[tokio::test]
    async fn attestation_before_hello_rejected() {
        let (runner, _, _, _) = runner();

        let result = runner
            .handle(DispatchRequest {
                msg_type: ProveDevice::MSG_TYPE,
                body: &[],
                token: None,
            })
            .await;

        let error = decoded_error(&result);
        assert_eq!(error.e_m_error_code, 101);
        assert_eq!(error.e_m_prev_msg_id, 64);
        assert!(runner.lifecycle.events().is_empty());
    }

    #[tokio::test]
    async fn unknown_token_rejected() {
        let (runner, _, _, _) = runner();

        let result = runner
            .handle(DispatchRequest {
                msg_type: GetOvNextEntry::MSG_TYPE,
                body: &[],
                token: Some("deadbeef"),
            })
            .await;

        assert_eq!(decoded_error(&result).e_m_error_code, 1);
    }

    #[tokio::test]
    async fn to1_exchange_through_dispatch() {
        let (runner, crypto, guid, device_signer) = runner();

        let hello = HelloRv {
            guid,
            e_a_sig_info: EASigInfo(SigInfo::empty(DeviceSgType::StSecP256R1)),
        };

        let result = runner
            .handle(DispatchRequest {
                msg_type: HelloRv::MSG_TYPE,
                body: &hello.encode().unwrap(),
                token: None,
            })
            .await;
        assert_eq!(result.msg_type, HelloRvAck::MSG_TYPE);

        let ack = HelloRvAck::decode(&result.body).unwrap();

        let payload = ciborium::Value::Map(vec![
            (
                EAT_NONCE.into(),
                ciborium::Value::Bytes(ack.nonce_to1_proof.as_slice().to_vec()),
            ),
            (
                EAT_UEID.into(),
                ciborium::Value::Bytes(guid.as_ueid().to_vec()),
            ),
        ]);
        let mut buf = Vec::new();
        ciborium::into_writer(&payload, &mut buf).unwrap();
        let prove = ProveToRv {
            ea_token: crypto.cose_sign1(&device_signer, buf, Vec::new()).unwrap(),
        };

        let result = runner
            .handle(DispatchRequest {
                msg_type: ProveToRv::MSG_TYPE,
                body: &prove.encode().unwrap(),
                token: Some(&result.token),
            })
            .await;
        assert_eq!(result.msg_type, RvRedirect::MSG_TYPE);

        let redirect = RvRedirect::decode(&result.body).unwrap();
        assert_eq!(redirect.to1d_blob().unwrap().to1d_rv[0].rv_port, 8042);

        let hooks: Vec<_> = runner
            .lifecycle
            .events()
            .into_iter()
            .map(|(hook, _)| hook)
            .collect();
        assert_eq!(
            hooks,
            ["starting", "started", "continuing", "completed"]
        );
    }

    #[tokio::test]
    async fn to2_exchange_through_dispatch() {
        let (runner, crypto, guid, device_signer) = runner();

        let hello = HelloDevice {
            max_device_message_size: u16::MAX,
            guid,
            nonce: Nonce::new([1; 16]),
            kex_suite_name: KexSuiteName::Ecdh256.as_str().into(),
            cipher_suite_name: CipherSuite::A128Gcm.into(),
            ea_sign_info: EASigInfo(SigInfo::empty(DeviceSgType::StSecP256R1)),
        };

        let result = runner
            .handle(DispatchRequest {
                msg_type: HelloDevice::MSG_TYPE,
                body: &hello.encode().unwrap(),
                token: None,
            })
            .await;
        assert_eq!(result.msg_type, ProveOvHdr::MSG_TYPE);
        let token = result.token.clone();

        let hdr = ProveOvHdr::decode(&result.body).unwrap();
        let payload = hdr.payload().unwrap();
        let cuph_nonce = hdr.header().unwrap().cuph_nonce;

        let (xb, shared) = KeyExchange::device_respond(
            KexSuiteName::Ecdh256,
            &crypto,
            &payload.x_a_key_exchange,
            None,
        )
        .unwrap();
        let mut tunnel = EncryptionState::derive(CipherSuite::A128Gcm, &shared, &crypto).unwrap();

        let euph = Nonce::new([8; 16]);
        let prove = device_eat(&crypto, &device_signer, cuph_nonce, guid, &xb, euph);

        let result = runner
            .handle(DispatchRequest {
                msg_type: ProveDevice::MSG_TYPE,
                body: &prove.encode().unwrap(),
                token: Some(&token),
            })
            .await;
        assert_eq!(result.msg_type, SetupDevice::MSG_TYPE);

        let setup = SetupDevice::decode(&tunnel.decrypt(&result.body).unwrap()).unwrap();
        assert_eq!(setup.payload().unwrap().guid, guid);

        let ready = DeviceServiceInfoReady {
            replacement_hmac: None,
            max_owner_service_info_sz: None,
        };
        let sealed = tunnel.encrypt(&crypto, &ready.encode().unwrap()).unwrap();

        let result = runner
            .handle(DispatchRequest {
                msg_type: DeviceServiceInfoReady::MSG_TYPE,
                body: &sealed,
                token: Some(&token),
            })
            .await;
        assert_eq!(result.msg_type, OwnerServiceInfoReady::MSG_TYPE);
        OwnerServiceInfoReady::decode(&tunnel.decrypt(&result.body).unwrap()).unwrap();

        let info = DeviceServiceInfo {
            is_more_service_info: false,
            service_info: Vec::new(),
        };
        let sealed = tunnel.encrypt(&crypto, &info.encode().unwrap()).unwrap();

        let result = runner
            .handle(DispatchRequest {
                msg_type: DeviceServiceInfo::MSG_TYPE,
                body: &sealed,
                token: Some(&token),
            })
            .await;
        assert_eq!(result.msg_type, OwnerServiceInfo::MSG_TYPE);
        let reply =
            OwnerServiceInfo::decode(&tunnel.decrypt(&result.body).unwrap()).unwrap();
        assert!(reply.is_done);

        let done = Done {
            nonce_to2_prove_dv: cuph_nonce,
        };
        let sealed = tunnel.encrypt(&crypto, &done.encode().unwrap()).unwrap();

        let result = runner
            .handle(DispatchRequest {
                msg_type: Done::MSG_TYPE,
                body: &sealed,
                token: Some(&token),
            })
            .await;
        assert_eq!(result.msg_type, Done2::MSG_TYPE);

        let done2 = Done2::decode(&tunnel.decrypt(&result.body).unwrap()).unwrap();
        assert_eq!(done2.nonce_to2_setup_dv, euph);

        let hooks: Vec<_> = runner
            .lifecycle
            .events()
            .into_iter()
            .map(|(hook, _)| hook)
            .collect();
        assert_eq!(hooks.first().unwrap(), "starting");
        assert_eq!(hooks.last().unwrap(), "completed");

        // The session is gone after Done2.
        let result = runner
            .handle(DispatchRequest {
                msg_type: GetOvNextEntry::MSG_TYPE,
                body: &[],
                token: Some(&token),
            })
            .await;
        assert_eq!(decoded_error(&result).e_m_error_code, 1);
    }

    #[tokio::test]
    async fn failure_expires_the_session() {
        let (runner, _, guid, _) = runner();

        let hello = HelloDevice {
            max_device_message_size: u16::MAX,
            guid,
            nonce: Nonce::new([1; 16]),
            kex_suite_name: KexSuiteName::Ecdh256.as_str().into(),
            cipher_suite_name: CipherSuite::A128Gcm.into(),
            ea_sign_info: EASigInfo(SigInfo::empty(DeviceSgType::StSecP256R1)),
        };

        let result = runner
            .handle(DispatchRequest {
                msg_type: HelloDevice::MSG_TYPE,
                body: &hello.encode().unwrap(),
                token: None,
            })
            .await;
        let token = result.token.clone();

        let result = runner
            .handle(DispatchRequest {
                msg_type: ProveDevice::MSG_TYPE,
                body: b"not cbor",
                token: Some(&token),
            })
            .await;
        assert_eq!(decoded_error(&result).e_m_error_code, 100);

        let failed = runner
            .lifecycle
            .events()
            .iter()
            .any(|(hook, _)| hook == "failed");
        assert!(failed);

        let result = runner
            .handle(DispatchRequest {
                msg_type: GetOvNextEntry::MSG_TYPE,
                body: &GetOvNextEntry { ov_entry_num: 0 }.encode().unwrap(),
                token: Some(&token),
            })
            .await;
        assert_eq!(decoded_error(&result).e_m_error_code, 1);
    }
}
