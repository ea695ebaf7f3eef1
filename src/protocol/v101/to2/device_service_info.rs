use eyre::Context;
use serde::{Deserialize, Serialize};

use crate::protocol::v101::service_info::ServiceInfo;
use crate::protocol::v101::{ClientMessage, Message, Msgtype};

use super::owner_service_info::OwnerServiceInfo;

/// ```cddl
/// TO2.DeviceServiceInfo = [
///     IsMoreServiceInfo,   ;; more ServiceInfo to come
///     ServiceInfo          ;; service info entries
/// ]
/// IsMoreServiceInfo = bool
/// ```
#[derive(Debug)]
pub struct DeviceServiceInfo<'a> {
    pub is_more_service_info: bool,
    pub service_info: ServiceInfo<'a>,
}

impl Serialize for DeviceServiceInfo<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let Self {
            is_more_service_info,
            service_info,
        } = self;

        (is_more_service_info, service_info).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DeviceServiceInfo<'_> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (is_more_service_info, service_info) = Deserialize::deserialize(deserializer)?;

        Ok(Self {
            is_more_service_info,
            service_info,
        })
    }
}

impl Message for DeviceServiceInfo<'_> {
    const MSG_TYPE: Msgtype = 68;

    fn decode(buf: &[u8]) -> eyre::Result<Self> {
        ciborium::from_reader(buf).wrap_err("couldn't decode TO2.DeviceServiceInfo")
    }

    fn encode(&self) -> eyre::Result<Vec<u8>> {
        let mut buf = Vec::new();

        ciborium::into_writer(self, &mut buf)?;

        Ok(buf)
    }
}

impl ClientMessage for DeviceServiceInfo<'_> {
    type Response<'a> = OwnerServiceInfo<'a>;
}
