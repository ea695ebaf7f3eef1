use coset::{CoseSign1, TaggedCborSerializable};
use eyre::{ensure, OptionExt};
use serde::{Deserialize, Serialize};

use crate::protocol::v101::hash_hmac::Hash;
use crate::protocol::v101::rv_to2_addr::RvTo2Addr;
use crate::protocol::v101::{Message, Msgtype};

/// The to1d blob, signed with the owner key registered for the device.
///
/// ```cddl
/// RVRedirect = to1d
/// to1d = CoseSignature
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RvRedirect {
    pub to1d: CoseSign1,
}

impl RvRedirect {
    pub fn to1d_blob(&self) -> eyre::Result<To1dBlob<'_>> {
        let payload = self.to1d.payload.as_ref().ok_or_eyre("payload missing")?;

        let blob = ciborium::from_reader(payload.as_slice())?;

        Ok(blob)
    }
}

impl Message for RvRedirect {
    const MSG_TYPE: Msgtype = 33;

    fn decode(buf: &[u8]) -> eyre::Result<Self> {
        let to1d = CoseSign1::from_tagged_slice(buf)?;

        ensure!(to1d.payload.is_some(), "to1d payload missing");

        Ok(Self { to1d })
    }

    fn encode(&self) -> eyre::Result<Vec<u8>> {
        let buf = self.to1d.clone().to_tagged_vec()?;

        Ok(buf)
    }
}

/// ```cddl
/// to1dBlobPayload = [
///     to1dRV:       RVTO2Addr,  ;; choices to access TO2 protocol
///     to1dTo0dHash: Hash        ;; Hash of to0d from TO0.OwnerSign
/// ]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct To1dBlob<'a> {
    pub to1d_rv: RvTo2Addr<'a>,
    pub to1d_to0d_hash: Hash<'a>,
}

impl Serialize for To1dBlob<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let Self {
            to1d_rv,
            to1d_to0d_hash,
        } = self;

        (to1d_rv, to1d_to0d_hash).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for To1dBlob<'_> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (to1d_rv, to1d_to0d_hash) = Deserialize::deserialize(deserializer)?;

        Ok(Self {
            to1d_rv,
            to1d_to0d_hash,
        })
    }
}
