//! Identity types for instrument sessions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Address part of a session identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceAddress {
    /// Serial number or transport address reported by the device
    Resolved(String),
    /// Placeholder used until the device reports its address
    Unresolved(Uuid),
}

impl DeviceAddress {
    /// Whether the address came from the device itself.
    pub fn is_resolved(&self) -> bool {
        matches!(self, DeviceAddress::Resolved(_))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAddress::Resolved(address) => write!(f, "{address}"),
            DeviceAddress::Unresolved(id) => write!(f, "~{id}"),
        }
    }
}

/// Stable key for one logical hardware session.
///
/// Rendered as `<instrument>:<address>`; an unresolved address renders as
/// `~<uuid>`. The instrument part never contains `:`, the address may
/// (VISA resource strings do).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionIdentity {
    instrument: String,
    address: DeviceAddress,
}

impl SessionIdentity {
    /// Build an identity from an instrument type and an optional address.
    ///
    /// A missing or blank address yields an unresolved identity.
    pub fn new(instrument: impl Into<String>, address: Option<&str>) -> Result<Self> {
        match address.map(str::trim).filter(|a| !a.is_empty()) {
            Some(address) => Self::resolved(instrument, address),
            None => Self::unresolved(instrument),
        }
    }

    /// Build an identity with a device-reported address.
    pub fn resolved(instrument: impl Into<String>, address: impl Into<String>) -> Result<Self> {
        let instrument = validate_instrument(instrument.into())?;
        let address = address.into().trim().to_string();
        if address.is_empty() {
            return Err(Error::InvalidIdentity(format!(
                "{instrument}: address cannot be empty"
            )));
        }
        if address.starts_with('~') {
            return Err(Error::InvalidIdentity(format!(
                "{instrument}: address '{address}' uses the reserved '~' prefix"
            )));
        }
        Ok(Self {
            instrument,
            address: DeviceAddress::Resolved(address),
        })
    }

    /// Build an identity whose address is not known yet.
    pub fn unresolved(instrument: impl Into<String>) -> Result<Self> {
        let instrument = validate_instrument(instrument.into())?;
        Ok(Self {
            instrument,
            address: DeviceAddress::Unresolved(Uuid::new_v4()),
        })
    }

    /// Instrument type part.
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Address part.
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Whether both identities name the same instrument type (case-insensitive).
    pub fn same_instrument(&self, other: &SessionIdentity) -> bool {
        self.instrument.eq_ignore_ascii_case(&other.instrument)
    }
}

fn validate_instrument(instrument: String) -> Result<String> {
    let instrument = instrument.trim().to_string();
    if instrument.is_empty() {
        return Err(Error::InvalidIdentity(
            "instrument type cannot be empty".to_string(),
        ));
    }
    if instrument.contains(':') {
        return Err(Error::InvalidIdentity(format!(
            "instrument type '{instrument}' cannot contain ':'"
        )));
    }
    Ok(instrument)
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.instrument, self.address)
    }
}

impl FromStr for SessionIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (instrument, address) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| Error::InvalidIdentity(format!("'{s}' is missing ':'")))?;

        match address.strip_prefix('~') {
            Some(id) => {
                let id = Uuid::parse_str(id)
                    .map_err(|e| Error::InvalidIdentity(format!("'{s}': {e}")))?;
                Ok(Self {
                    instrument: validate_instrument(instrument.to_string())?,
                    address: DeviceAddress::Unresolved(id),
                })
            }
            None => Self::resolved(instrument, address),
        }
    }
}

impl TryFrom<String> for SessionIdentity {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SessionIdentity> for String {
    fn from(identity: SessionIdentity) -> Self {
        identity.to_string()
    }
}

/// Identifier of one construction of a session.
///
/// Each `construction started` event mints a new instance; reports addressed
/// to an older instance are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(Uuid);

impl InstanceId {
    /// Create a new random instance ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for InstanceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Marks the registry instance (process + runtime) that owns a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerMarker {
    /// OS process id of the owner, 0 when unknown
    pub process_id: u32,
    /// Random id minted when the owning registry was created
    pub runtime_id: Uuid,
}

impl OwnerMarker {
    /// Create a marker from explicit parts.
    pub fn new(process_id: u32, runtime_id: Uuid) -> Self {
        Self {
            process_id,
            runtime_id,
        }
    }

    /// Mint a marker for a new registry in the current process.
    pub fn for_current_process() -> Self {
        Self::new(std::process::id(), Uuid::new_v4())
    }

    /// Whether the owner's process id is known.
    pub fn has_process(&self) -> bool {
        self.process_id > 0
    }
}

impl fmt::Display for OwnerMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let runtime = self.runtime_id.simple().to_string();
        write!(f, "{}-{}", self.process_id, &runtime[..10])
    }
}

/// Descriptive fields shown next to a session's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Device model string
    pub model: String,
    /// Human-readable device family
    pub device_type: String,
}

impl SessionDescriptor {
    /// Create a descriptor; blank fields fall back to `Unknown`.
    pub fn new(model: impl Into<String>, device_type: impl Into<String>) -> Self {
        let or_unknown = |s: String| {
            if s.trim().is_empty() {
                "Unknown".to_string()
            } else {
                s
            }
        };
        Self {
            model: or_unknown(model.into()),
            device_type: or_unknown(device_type.into()),
        }
    }
}

impl Default for SessionDescriptor {
    fn default() -> Self {
        Self::new("", "")
    }
}
