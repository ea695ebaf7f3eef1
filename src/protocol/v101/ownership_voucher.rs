use std::borrow::Cow;

use coset::{AsCborValue, CoseSign1};
use eyre::{Context, OptionExt};
use serde::{Deserialize, Serialize};

use crate::protocol::CborBstr;

use super::hash_hmac::{HMac, Hash};
use super::public_key::PublicKey;
use super::randezvous_info::RendezvousInfo;
use super::x509::CoseX509;
use super::{Guid, Protver};

/// Ownership Voucher top level structure
///
/// ```cddl
/// OwnershipVoucher = [
///     OVProtVer:      protver,           ;; protocol version
///     OVHeaderTag:    bstr .cbor OVHeader,
///     OVHeaderHMac:   HMac,              ;; hmac[DCHmacSecret, OVHeader]
///     OVDevCertChain: OVDevCertChainOrNull,
///     OVEntryArray:   OVEntries
/// ]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct OwnershipVoucher<'a> {
    pub ov_prot_ver: Protver,
    pub ov_header_tag: CborBstr<OvHeader<'a>>,
    pub ov_header_hmac: HMac<'a>,
    /// CBOR null for devices without a certificate root (e.g. Intel® EPID).
    pub ov_dev_cert_chain: Option<CoseX509<'a>>,
    pub ov_entry_array: Vec<OvEntry>,
}

impl OwnershipVoucher<'_> {
    pub fn header(&self) -> &OvHeader<'_> {
        self.ov_header_tag.value()
    }

    pub fn from_bytes(buf: &[u8]) -> eyre::Result<OwnershipVoucher<'static>> {
        ciborium::from_reader(buf).wrap_err("couldn't decode ownership voucher")
    }

    pub fn to_bytes(&self) -> eyre::Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;

        Ok(buf)
    }
}

impl Serialize for OwnershipVoucher<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let Self {
            ov_prot_ver,
            ov_header_tag,
            ov_header_hmac,
            ov_dev_cert_chain,
            ov_entry_array,
        } = self;

        (
            ov_prot_ver,
            ov_header_tag,
            ov_header_hmac,
            ov_dev_cert_chain,
            ov_entry_array,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OwnershipVoucher<'_> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (ov_prot_ver, ov_header_tag, ov_header_hmac, ov_dev_cert_chain, ov_entry_array) =
            Deserialize::deserialize(deserializer)?;

        Ok(Self {
            ov_prot_ver,
            ov_header_tag,
            ov_header_hmac,
            ov_dev_cert_chain,
            ov_entry_array,
        })
    }
}

/// ```cddl
/// ;; Ownership Voucher header, also used in TO1 protocol
/// OVHeader = [
///     OVHProtVer:        protver,        ;; protocol version
///     OVGuid:            Guid,           ;; guid
///     OVRVInfo:          RendezvousInfo, ;; rendezvous instructions
///     OVDeviceInfo:      tstr,           ;; DeviceInfo
///     OVPubKey:          PublicKey,      ;; mfg public key
///     OVDevCertChainHash:OVDevCertChainHashOrNull
/// ]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct OvHeader<'a> {
    pub ovh_prot_ver: Protver,
    pub ov_guid: Guid,
    pub ov_rv_info: RendezvousInfo,
    pub ov_device_info: Cow<'a, str>,
    pub ov_pub_key: PublicKey<'a>,
    /// CBOR null for Intel® EPID device keys.
    pub ov_dev_cert_chain_hash: Option<Hash<'a>>,
}

impl OvHeader<'_> {
    /// `OVGuid ‖ OVDeviceInfo`, the input of the header-info hash carried by
    /// every voucher entry.
    pub fn header_info(&self) -> Vec<u8> {
        let mut info = Vec::with_capacity(16 + self.ov_device_info.len());
        info.extend_from_slice(self.ov_guid.as_slice());
        info.extend_from_slice(self.ov_device_info.as_bytes());

        info
    }
}

impl Serialize for OvHeader<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let Self {
            ovh_prot_ver,
            ov_guid,
            ov_rv_info,
            ov_device_info,
            ov_pub_key,
            ov_dev_cert_chain_hash,
        } = self;

        (
            ovh_prot_ver,
            ov_guid,
            ov_rv_info,
            ov_device_info,
            ov_pub_key,
            ov_dev_cert_chain_hash,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OvHeader<'_> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (ovh_prot_ver, ov_guid, ov_rv_info, ov_device_info, ov_pub_key, ov_dev_cert_chain_hash) =
            Deserialize::deserialize(deserializer)?;

        Ok(Self {
            ovh_prot_ver,
            ov_guid,
            ov_rv_info,
            ov_device_info,
            ov_pub_key,
            ov_dev_cert_chain_hash,
        })
    }
}

/// A chain-of-custody entry: a COSE Sign1 produced by the previous owner
/// over an [`OvEntryPayload`].
///
/// Entries travel untagged inside the voucher array and the
/// TO2.OVNextEntry message.
#[derive(Debug, Clone, PartialEq)]
pub struct OvEntry {
    pub entry: CoseSign1,
}

impl OvEntry {
    pub fn new(entry: CoseSign1) -> Self {
        Self { entry }
    }

    pub fn payload(&self) -> eyre::Result<OvEntryPayload<'static>> {
        let payload = self
            .entry
            .payload
            .as_deref()
            .ok_or_eyre("missing entry payload")?;

        ciborium::from_reader(payload).wrap_err("couldn't decode entry payload")
    }

    /// The serialized form, the input of the next entry's previous-entry
    /// hash.
    pub fn to_bytes(&self) -> eyre::Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;

        Ok(buf)
    }
}

impl Serialize for OvEntry {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.entry
            .clone()
            .to_cbor_value()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OvEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = ciborium::Value::deserialize(deserializer)?;

        let entry = CoseSign1::from_cbor_value(value).map_err(serde::de::Error::custom)?;

        Ok(Self { entry })
    }
}

/// ```cddl
/// OVEntryPayload = [
///     OVEHashPrevEntry: Hash,
///     OVEHashHdrInfo:   Hash,  ;; hash[GUID||DeviceInfo] in header
///     OVEExtra:         null / bstr .cbor OVEExtraInfo
///     OVEPubKey:        PublicKey
/// ]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct OvEntryPayload<'a> {
    pub ove_hash_prev_entry: Hash<'a>,
    pub ove_hash_hdr_info: Hash<'a>,
    pub ove_extra: Option<CborBstr<ciborium::Value>>,
    pub ove_pub_key: PublicKey<'a>,
}

impl Serialize for OvEntryPayload<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let Self {
            ove_hash_prev_entry,
            ove_hash_hdr_info,
            ove_extra,
            ove_pub_key,
        } = self;

        (
            ove_hash_prev_entry,
            ove_hash_hdr_info,
            ove_extra,
            ove_pub_key,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OvEntryPayload<'_> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (ove_hash_prev_entry, ove_hash_hdr_info, ove_extra, ove_pub_key) =
            Deserialize::deserialize(deserializer)?;

        Ok(Self {
            ove_hash_prev_entry,
            ove_hash_hdr_info,
            ove_extra,
            ove_pub_key,
        })
    }
}
