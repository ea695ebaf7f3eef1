use serde::{Deserialize, Serialize};

use crate::protocol::v101::sign_info::EBSigInfo;
use crate::protocol::v101::{Message, Msgtype, NonceTo1Proof};

/// ```cddl
/// HelloRVAck = [
///     NonceTO1Proof,
///     eBSigInfo  ;; signature capability response
/// ]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct HelloRvAck<'a> {
    pub nonce_to1_proof: NonceTo1Proof,
    pub e_b_sig_info: EBSigInfo<'a>,
}

impl Serialize for HelloRvAck<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let Self {
            nonce_to1_proof,
            e_b_sig_info,
        } = self;

        (nonce_to1_proof, e_b_sig_info).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HelloRvAck<'_> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (nonce_to1_proof, e_b_sig_info) = Deserialize::deserialize(deserializer)?;

        Ok(Self {
            nonce_to1_proof,
            e_b_sig_info,
        })
    }
}

impl Message for HelloRvAck<'_> {
    const MSG_TYPE: Msgtype = 31;

    fn decode(buf: &[u8]) -> eyre::Result<Self> {
        let this = ciborium::from_reader(buf)?;

        Ok(this)
    }

    fn encode(&self) -> eyre::Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;

        Ok(buf)
    }
}
