use coset::{CoseSign1, TaggedCborSerializable};

use crate::protocol::v101::eat_signature::EaToken;
use crate::protocol::v101::{ClientMessage, Message, Msgtype};

use super::rv_redirect::RvRedirect;

/// An EAT token signed with the device key, proving possession of the
/// guid sent in HelloRV.
///
/// ```cddl
/// ProveToRV = EAToken
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ProveToRv {
    pub ea_token: EaToken,
}

impl Message for ProveToRv {
    const MSG_TYPE: Msgtype = 32;

    fn decode(buf: &[u8]) -> eyre::Result<Self> {
        let ea_token = CoseSign1::from_tagged_slice(buf)?;

        Ok(Self { ea_token })
    }

    fn encode(&self) -> eyre::Result<Vec<u8>> {
        // coset requires allocations
        let buf = self.ea_token.clone().to_tagged_vec()?;

        Ok(buf)
    }
}

impl ClientMessage for ProveToRv {
    type Response<'a> = RvRedirect;
}
