use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::{Message, Msgtype};

/// ERROR message, closing the session.
///
/// ```cddl
/// ErrorMessage = [
///     EMErrorCode: uint16,
///     EMPrevMsgID: uint8,
///     EMErrorStr:  tstr,
///     EMErrorTs:   timestamp,
///     EMErrorCID:  correlationId
/// ]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage<'a> {
    pub e_m_error_code: u16,
    /// Message ID (type) of the previous message
    pub e_m_prev_msg_id: u8,
    pub e_m_error_str: Cow<'a, str>,
    /// UTC timestamp, seconds since epoch (0 when the clock is unavailable)
    pub e_m_error_ts: u64,
    /// Unique id associated with this request
    pub e_m_error_c_i_d: Option<u64>,
}

impl<'a> ErrorMessage<'a> {
    pub fn new(
        code: u16,
        prev_msg_id: u8,
        error_str: impl Into<Cow<'a, str>>,
        correlation_id: Option<u64>,
    ) -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);

        Self {
            e_m_error_code: code,
            e_m_prev_msg_id: prev_msg_id,
            e_m_error_str: error_str.into(),
            e_m_error_ts: ts,
            e_m_error_c_i_d: correlation_id,
        }
    }
}

impl Serialize for ErrorMessage<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let Self {
            e_m_error_code,
            e_m_prev_msg_id,
            e_m_error_str,
            e_m_error_ts,
            e_m_error_c_i_d,
        } = self;

        (
            e_m_error_code,
            e_m_prev_msg_id,
            e_m_error_str,
            e_m_error_ts,
            e_m_error_c_i_d,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ErrorMessage<'_> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (e_m_error_code, e_m_prev_msg_id, e_m_error_str, e_m_error_ts, e_m_error_c_i_d) =
            Deserialize::deserialize(deserializer)?;

        Ok(Self {
            e_m_error_code,
            e_m_prev_msg_id,
            e_m_error_str,
            e_m_error_ts,
            e_m_error_c_i_d,
        })
    }
}

impl Message for ErrorMessage<'_> {
    const MSG_TYPE: Msgtype = 255;

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
