use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Deref;

/// Radio address representing all devices on the local network at once
pub const BROADCAST_ADDRESS: u8 = 0;

/// Radio address reserved for the gateway itself
pub const GATEWAY_ADDRESS: u8 = 1;

/// Default topic prefix used by the device-twin service
pub const DEFAULT_DEVICE_PREFIX: &str = "$aws/things";

/// Cloud twin identifier derived from a radio network address.
///
/// Address 0 (broadcast) maps to the wildcard identity `l000`; every other
/// address maps one-to-one onto `l001`..`l255`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct TwinId(String);

impl TwinId {
    pub fn from_address(address: u8) -> Self {
        Self(format!("l{address:03}"))
    }
}

impl Deref for TwinId {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for TwinId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<TwinId> for String {
    fn from(value: TwinId) -> Self {
        value.0
    }
}

/// Association between a radio network address and a cloud twin identifier.
///
/// Built once at startup and immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub radio_address: u8,
    pub twin_id: TwinId,
    prefix: String,
}

impl DeviceIdentity {
    pub fn new(radio_address: u8, prefix: impl Into<String>) -> Self {
        Self {
            radio_address,
            twin_id: TwinId::from_address(radio_address),
            prefix: prefix.into(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.radio_address == BROADCAST_ADDRESS
    }

    /// Topic for outbound reported-state updates
    pub fn update_topic(&self) -> String {
        format!("{}/{}/shadow/update", self.prefix, self.twin_id)
    }

    /// Topic carrying accepted desired-state notifications from the cloud
    pub fn accepted_topic(&self) -> String {
        format!("{}/{}/shadow/update/accepted", self.prefix, self.twin_id)
    }
}
