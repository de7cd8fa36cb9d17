//! Broker identity strings for this process
//!
//! The broker knows a client by an auth id of the form
//! `mq:{remote|hosted}:{team}:{instance}`. Hosted instances running in HA mode
//! append a short `:{ha_id}` suffix to their client id so replicas do not
//! evict each other.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// What kind of platform member this process runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    /// A remote device
    Device,
    /// A hosted instance
    Instance,
}

impl InstanceKind {
    fn auth_segment(&self) -> &'static str {
        match self {
            InstanceKind::Device => "remote",
            InstanceKind::Instance => "hosted",
        }
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKind::Device => f.write_str("device"),
            InstanceKind::Instance => f.write_str("instance"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub team_id: String,
    pub kind: InstanceKind,
    pub instance_id: String,
    pub ha_id: Option<String>,
}

impl ClientIdentity {
    pub fn new(team_id: impl Into<String>, kind: InstanceKind, instance_id: impl Into<String>) -> Self {
        Self {
            team_id: team_id.into(),
            kind,
            instance_id: instance_id.into(),
            ha_id: None,
        }
    }

    pub fn with_ha_id(mut self, ha_id: Option<String>) -> Self {
        self.ha_id = ha_id.filter(|id| !id.is_empty());
        self
    }

    /// Username presented to the broker, e.g. `mq:hosted:team:instance`
    pub fn auth_id(&self) -> String {
        format!(
            "mq:{}:{}:{}",
            self.kind.auth_segment(),
            self.team_id,
            self.instance_id
        )
    }

    /// MQTT client id; only hosted instances carry the HA suffix
    pub fn client_id(&self) -> String {
        match (&self.ha_id, self.kind) {
            (Some(ha_id), InstanceKind::Instance) => format!("{}:{ha_id}", self.auth_id()),
            _ => self.auth_id(),
        }
    }

    /// Key the link API uses for this client, e.g. `device:abc`
    pub fn owner_key(&self) -> String {
        format!("{}:{}", self.kind, self.instance_id)
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("Invalid broker id format: {0}")]
pub struct IdentityError(pub String);

/// Parse an auth id (`username = true`) or client id back into an identity
pub fn parse_client_id(id: &str, username: bool) -> Result<ClientIdentity, IdentityError> {
    let parts: Vec<&str> = id.split(':').collect();
    let length_ok = if username {
        parts.len() == 4
    } else {
        parts.len() == 4 || parts.len() == 5
    };
    if !length_ok || parts[0] != "mq" {
        return Err(IdentityError(id.to_string()));
    }

    let kind = match parts[1] {
        "hosted" => InstanceKind::Instance,
        "remote" => InstanceKind::Device,
        _ => return Err(IdentityError(id.to_string())),
    };
    let ha_id = match (kind, parts.get(4)) {
        (InstanceKind::Instance, Some(ha)) => Some(ha.to_string()),
        _ => None,
    };

    Ok(ClientIdentity::new(parts[2], kind, parts[3]).with_ha_id(ha_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_identity() {
        let id = ClientIdentity::new("team1", InstanceKind::Device, "dev42")
            .with_ha_id(Some("ab12".into()));
        assert_eq!(id.auth_id(), "mq:remote:team1:dev42");
        assert_eq!(id.client_id(), "mq:remote:team1:dev42");
        assert_eq!(id.owner_key(), "device:dev42");
    }

    #[test]
    fn test_hosted_ha_identity() {
        let id = ClientIdentity::new("team1", InstanceKind::Instance, "proj9")
            .with_ha_id(Some("ab12".into()));
        assert_eq!(id.auth_id(), "mq:hosted:team1:proj9");
        assert_eq!(id.client_id(), "mq:hosted:team1:proj9:ab12");
        assert_eq!(id.owner_key(), "instance:proj9");
    }

    #[test]
    fn test_parse_round_trip() {
        let parsed = parse_client_id("mq:hosted:team1:proj9:ab12", false).unwrap();
        assert_eq!(parsed.kind, InstanceKind::Instance);
        assert_eq!(parsed.ha_id.as_deref(), Some("ab12"));
        assert_eq!(parsed.client_id(), "mq:hosted:team1:proj9:ab12");

        assert!(parse_client_id("mq:hosted:team1:proj9:ab12", true).is_err());
        assert!(parse_client_id("xx:remote:team1:dev", true).is_err());
        assert!(parse_client_id("mq:other:team1:dev", true).is_err());
    }
}
