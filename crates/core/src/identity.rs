//! Caller identity types.
//!
//! Authentication happens outside the core; it hands over a trusted `(caller id, role)` pair
//! which the core uses for authorization decisions and attribution. Origin metadata (address,
//! user agent) travels alongside for the audit trail only.

use crate::validation::validate_actor_id;
use crate::{RecordError, RecordResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque identifier of a user (clinician, patient, administrator, responder).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl AsRef<str>) -> RecordResult<Self> {
        let id = id.as_ref().trim();
        validate_actor_id(id)?;
        Ok(Self(id.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ActorId {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for ActorId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ActorId::new(&s).map_err(serde::de::Error::custom)
    }
}

/// Role attached to an authenticated caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Doctor,
    Nurse,
    Patient,
    EmergencyResponder,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Doctor => "doctor",
            Self::Nurse => "nurse",
            Self::Patient => "patient",
            Self::EmergencyResponder => "emergency_responder",
        }
    }

    /// Roles that may author clinical content.
    pub const fn is_clinician(self) -> bool {
        matches!(self, Self::Doctor | Self::Nurse)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "admin" => Ok(Self::Admin),
            "doctor" => Ok(Self::Doctor),
            "nurse" => Ok(Self::Nurse),
            "patient" => Ok(Self::Patient),
            "emergency_responder" => Ok(Self::EmergencyResponder),
            other => Err(RecordError::InvalidInput(format!("unknown role '{other}'"))),
        }
    }
}

/// A trusted, already-authenticated caller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Caller {
    pub id: ActorId,
    pub role: Role,
}

impl Caller {
    pub fn new(id: ActorId, role: Role) -> Self {
        Self { id, role }
    }
}

/// Where a request came from. Recorded on audit entries, never used for decisions.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Origin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl Origin {
    pub fn new(address: Option<String>, agent: Option<String>) -> Self {
        // Strip control characters so an origin value cannot break the line-oriented audit file.
        let clean = |v: String| -> Option<String> {
            let v: String = v.chars().filter(|c| !c.is_control()).collect();
            let v = v.trim().to_string();
            (!v.is_empty()).then_some(v)
        };
        Self {
            address: address.and_then(clean),
            agent: agent.and_then(clean),
        }
    }
}
