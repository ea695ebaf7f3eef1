use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::protocol::CborBstr;

pub type ServiceInfo<'a> = Vec<ServiceInfoKv<'a>>;

/// ```cddl
/// ServiceInfoKeyVal = [
///     ServiceInfoKey: tstr,
///     ServiceInfoVal: bstr .cbor any
/// ]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfoKv<'a> {
    pub service_info_key: Cow<'a, str>,
    pub service_info_val: CborBstr<ciborium::Value>,
}

impl<'a> ServiceInfoKv<'a> {
    pub fn new(key: impl Into<Cow<'a, str>>, value: ciborium::Value) -> eyre::Result<Self> {
        Ok(Self {
            service_info_key: key.into(),
            service_info_val: CborBstr::new(value)?,
        })
    }
}

impl Serialize for ServiceInfoKv<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let Self {
            service_info_key,
            service_info_val,
        } = self;

        (service_info_key, service_info_val).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ServiceInfoKv<'_> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (service_info_key, service_info_val) = Deserialize::deserialize(deserializer)?;

        Ok(Self {
            service_info_key,
            service_info_val,
        })
    }
}
