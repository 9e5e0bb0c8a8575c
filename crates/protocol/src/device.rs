//! Device identity types: addresses, families, check codes and capabilities.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Network address of a printer, used as the unique session key.
///
/// Addresses are trimmed and lower-cased on construction so that
/// `"Printer.local"` and `"printer.local "` name the same device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Parses and normalizes an address.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(ProtocolError::InvalidAddress(raw.to_string()));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    /// Returns the normalized address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceAddress> for String {
    fn from(addr: DeviceAddress) -> Self {
        addr.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Supported printer families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Current-generation firmware with the HTTP API; needs a check code.
    New,
    /// Older firmware speaking the line-based TCP protocol.
    Legacy,
}

impl DeviceType {
    /// Whether connecting to this family requires a check code.
    pub fn requires_check_code(self) -> bool {
        matches!(self, DeviceType::New)
    }

    /// Lower-case name as used in configuration and events.
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::New => "new",
            DeviceType::Legacy => "legacy",
        }
    }
}

impl FromStr for DeviceType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(DeviceType::New),
            "legacy" => Ok(DeviceType::Legacy),
            _ => Err(ProtocolError::UnknownDeviceType(s.to_string())),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential printed on the device and required by some families.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CheckCode(String);

impl CheckCode {
    /// Wraps a check code, rejecting empty or whitespace-bearing values.
    pub fn new(code: impl Into<String>) -> Result<Self, ProtocolError> {
        let code = code.into();
        if code.is_empty() || code.chars().any(char::is_whitespace) {
            return Err(ProtocolError::MalformedCheckCode);
        }
        Ok(Self(code))
    }

    /// Exposes the raw code for the transport.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CheckCode {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CheckCode> for String {
    fn from(code: CheckCode) -> Self {
        code.0
    }
}

impl fmt::Debug for CheckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CheckCode(****)")
    }
}

/// A feature flag reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Built-in camera stream, served through the camera proxy port.
    Camera,
    /// Chamber LED control.
    LedControl,
    /// Internal/external filtration control.
    Filtration,
    /// Multi-material station.
    MaterialStation,
    /// Uploading and starting local job files.
    JobUpload,
}

/// Set of capabilities discovered from a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    /// Creates an empty capability set.
    pub fn none() -> Self {
        Self::default()
    }

    /// Returns true if the capability is present.
    pub fn has(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    /// Adds a capability.
    pub fn insert(&mut self, capability: Capability) {
        self.0.insert(capability);
    }

    /// Returns true if no capability is present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over capabilities in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A printer that answered a discovery scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Address the device answered from.
    pub address: DeviceAddress,
    /// Family inferred from the discovery reply.
    pub device_type: DeviceType,
    /// Advertised printer name, if any.
    pub name: Option<String>,
    /// Advertised serial number, if any.
    pub serial: Option<String>,
}
