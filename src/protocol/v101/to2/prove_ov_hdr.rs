use coset::iana::{EnumI64, HeaderParameter};
use coset::{CoseSign1, Label, TaggedCborSerializable};
use eyre::{ensure, Context, OptionExt};
use serde::{Deserialize, Serialize};

use crate::protocol::v101::hash_hmac::{HMac, Hash};
use crate::protocol::v101::key_exchange::XAKeyExchange;
use crate::protocol::v101::ownership_voucher::OvHeader;
use crate::protocol::v101::public_key::PublicKey;
use crate::protocol::v101::sign_info::EBSigInfo;
use crate::protocol::v101::{Message, Msgtype, NonceTo2ProveDv, NonceTo2ProveOv};
use crate::protocol::CborBstr;

/// ```cddl
/// TO2.ProveOVHdr = CoseSignature
/// ```
#[derive(Debug)]
pub struct ProveOvHdr {
    pub sign: CoseSign1,
}

impl ProveOvHdr {
    pub fn payload(&self) -> eyre::Result<PvOvHdrPayload<'static>> {
        let payload = self
            .sign
            .payload
            .as_deref()
            .ok_or_eyre("missing cose payload")?;

        ciborium::from_reader(payload).wrap_err("couldn't decode prove owner header payload")
    }

    pub fn header(&self) -> eyre::Result<PvOvHdrUnprotected<'static>> {
        let pubkey_param = Label::Int(HeaderParameter::CuphOwnerPubKey.to_i64());

        let payload = self
            .sign
            .unprotected
            .rest
            .iter()
            .find_map(|(label, value)| (*label == pubkey_param).then_some(value))
            .ok_or_eyre("missing owner public key")?;

        let pubkey = payload
            .deserialized()
            .wrap_err("couldn't decode header owner public key")?;

        let nonce_param = Label::Int(HeaderParameter::CuphNonce.to_i64());

        let payload = self
            .sign
            .unprotected
            .rest
            .iter()
            .find_map(|(label, value)| (*label == nonce_param).then_some(value))
            .ok_or_eyre("missing header nonce")?;

        let nonce = payload
            .deserialized()
            .wrap_err("couldn't decode header nonce")?;

        Ok(PvOvHdrUnprotected {
            cuph_nonce: nonce,
            cuph_owner_pubkey: pubkey,
        })
    }
}

impl Message for ProveOvHdr {
    const MSG_TYPE: Msgtype = 61;

    fn decode(buf: &[u8]) -> eyre::Result<Self> {
        let sign = CoseSign1::from_tagged_slice(buf)?;

        ensure!(sign.payload.is_some(), "missing payload");

        Ok(Self { sign })
    }

    fn encode(&self) -> eyre::Result<Vec<u8>> {
        let buf = self.sign.clone().to_tagged_vec()?;

        Ok(buf)
    }
}

/// ```cddl
/// TO2ProveOVHdrPayload = [
///     bstr .cbor OVHeader,     ;; Ownership Voucher header
///     NumOVEntries, ;; number of ownership voucher entries
///     HMac,         ;; Ownership Voucher "hmac" of hdr
///     NonceTO2ProveOV, ;; nonce from TO2.HelloDevice
///     eBSigInfo,    ;; Device attestation signature info
///     xAKeyExchange,;; Key exchange first step
///     helloDeviceHash: Hash, ;; hash of HelloDevice message
///     maxOwnerMessageSize
/// ]
/// NumOVEntries = uint8
/// $COSEPayloads /= (
///     TO2ProveOVHdrPayload
/// )
/// maxOwnerMessageSize = uint16
/// ```
#[derive(Debug)]
pub struct PvOvHdrPayload<'a> {
    pub ov_header: CborBstr<OvHeader<'a>>,
    pub num_ov_entries: u8,
    pub hmac: HMac<'a>,
    pub nonce_to2_prove_ov: NonceTo2ProveOv,
    pub eb_sign_info: EBSigInfo<'a>,
    pub x_a_key_exchange: XAKeyExchange<'a>,
    pub hello_device_hash: Hash<'a>,
    pub max_owner_message_size: u16,
}

impl Serialize for PvOvHdrPayload<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let Self {
            ov_header,
            num_ov_entries,
            hmac,
            nonce_to2_prove_ov,
            eb_sign_info,
            x_a_key_exchange,
            hello_device_hash,
            max_owner_message_size,
        } = self;

        (
            ov_header,
            num_ov_entries,
            hmac,
            nonce_to2_prove_ov,
            eb_sign_info,
            x_a_key_exchange,
            hello_device_hash,
            max_owner_message_size,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PvOvHdrPayload<'_> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (
            ov_header,
            num_ov_entries,
            hmac,
            nonce_to2_prove_ov,
            eb_sign_info,
            x_a_key_exchange,
            hello_device_hash,
            max_owner_message_size,
        ) = Deserialize::deserialize(deserializer)?;

        Ok(Self {
            ov_header,
            num_ov_entries,
            hmac,
            nonce_to2_prove_ov,
            eb_sign_info,
            x_a_key_exchange,
            hello_device_hash,
            max_owner_message_size,
        })
    }
}

/// ```cddl
/// TO2ProveOVHdrUnprotectedHeaders = (
///     CUPHNonce:       NonceTO2ProveDv, ;; nonce is used below in TO2.ProveDevice and TO2.Done
///     CUPHOwnerPubKey: PublicKey ;; Owner key, as convenience to Device
/// )
/// $$COSEUnprotectedHeaders /= (
///     TO2ProveOVHdrUnprotectedHeaders
/// )
/// ```
pub struct PvOvHdrUnprotected<'a> {
    pub cuph_nonce: NonceTo2ProveDv,
    pub cuph_owner_pubkey: PublicKey<'a>,
}
