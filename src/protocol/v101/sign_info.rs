use std::borrow::Cow;

use eyre::bail;
use serde::{Deserialize, Serialize};
use serde_bytes::Bytes;

/// ```cddl
/// SigInfo = [
///     sgType: DeviceSgType,
///     Info: bstr
/// ]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SigInfo<'a> {
    pub sg_type: DeviceSgType,
    pub info: Cow<'a, Bytes>,
}

impl<'a> SigInfo<'a> {
    pub fn new(sg_type: DeviceSgType, info: Vec<u8>) -> Self {
        SigInfo {
            sg_type,
            info: Cow::Owned(serde_bytes::ByteBuf::from(info)),
        }
    }

    pub fn empty(sg_type: DeviceSgType) -> Self {
        Self::new(sg_type, Vec::new())
    }

    pub fn into_owned(self) -> SigInfo<'static> {
        SigInfo {
            sg_type: self.sg_type,
            info: Cow::Owned(self.info.into_owned()),
        }
    }
}

impl Serialize for SigInfo<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let Self { sg_type, info } = self;

        (sg_type, info).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SigInfo<'_> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (sg_type, info) = Deserialize::deserialize(deserializer)?;

        Ok(Self { sg_type, info })
    }
}

/// ```cddl
/// eASigInfo = SigInfo  ;; from Device to Rendezvous/Owner
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EASigInfo<'a>(pub SigInfo<'a>);

/// ```cddl
/// eBSigInfo = SigInfo  ;; from Owner/Rendezvous to Device
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EBSigInfo<'a>(pub SigInfo<'a>);

/// DeviceSgType //= (
///     StSECP256R1: ES256,  ;; ECDSA secp256r1 = NIST-P-256 = prime256v1
///     StSECP384R1: ES384,  ;; ECDSA secp384r1 = NIST-P-384
///     StRSA2048:   RS256,  ;; RSA 2048 bit
///     StRSA3072:   RS384,  ;; RSA 3072 bit
///     StEPID10:    90,     ;; Intel® EPID 1.0 signature
///     StEPID11:    91,     ;; Intel® EPID 1.1 signature
///     StONDIE:     32      ;; Intel® OnDie ECDSA P-384 signature
/// )
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
#[repr(i64)]
pub enum DeviceSgType {
    /// ECDSA secp256r1 = NIST-P-256 = prime256v1
    StSecP256R1 = coset::iana::Algorithm::ES256 as i64,
    /// ECDSA secp384r1 = NIST-P-384
    StSecP384R1 = coset::iana::Algorithm::ES384 as i64,
    /// RSA 2048 bit
    StRsa2048 = coset::iana::Algorithm::RS256 as i64,
    /// RSA 3072 bit
    StRsa3072 = coset::iana::Algorithm::RS384 as i64,
    /// Intel® EPID 1.0 signature
    StEpid10 = 90,
    /// Intel® EPID 1.1 signature
    StEpid11 = 91,
    /// Intel® OnDie ECDSA P-384 signature
    StOnDie = 32,
}

impl DeviceSgType {
    /// True for the legacy group-signature schemes that need the online
    /// verification service.
    pub fn is_epid(&self) -> bool {
        matches!(self, DeviceSgType::StEpid10 | DeviceSgType::StEpid11)
    }

    /// True for the silicon-fused attestation scheme with the task-info
    /// signature framing.
    pub fn is_on_die(&self) -> bool {
        matches!(self, DeviceSgType::StOnDie)
    }
}

impl TryFrom<i64> for DeviceSgType {
    type Error = eyre::Report;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        let value = match value {
            -7 => DeviceSgType::StSecP256R1,
            -35 => DeviceSgType::StSecP384R1,
            -257 => DeviceSgType::StRsa2048,
            -258 => DeviceSgType::StRsa3072,
            90 => DeviceSgType::StEpid10,
            91 => DeviceSgType::StEpid11,
            32 => DeviceSgType::StOnDie,
            _ => bail!("value out of range: {value}"),
        };

        Ok(value)
    }
}

impl From<DeviceSgType> for i64 {
    fn from(value: DeviceSgType) -> Self {
        value as i64
    }
}
