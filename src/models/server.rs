use crate::error::{MonitorError, Result};
use crate::models::metrics::ServerState;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

pub const DEFAULT_USERNAME: &str = "root";
pub const DEFAULT_SSH_PORT: u16 = 22;

lazy_static! {
    static ref HOSTNAME_RE: Regex =
        Regex::new(r"^[A-Za-z0-9_]([A-Za-z0-9_\-\.]*[A-Za-z0-9_])?$").unwrap();
}

/// The single secret used to authenticate against a host.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "secret", rename_all = "snake_case")]
pub enum Credential {
    PrivateKey(String),
    Password(String),
}

impl Credential {
    /// Picks the credential from optional request fields, ignoring blanks.
    /// A private key wins when both are supplied.
    pub fn from_parts(private_key: Option<&str>, password: Option<&str>) -> Option<Self> {
        let private_key = private_key.filter(|k| !k.trim().is_empty());
        let password = password.filter(|p| !p.is_empty());
        match (private_key, password) {
            (Some(key), _) => Some(Credential::PrivateKey(key.to_string())),
            (None, Some(pw)) => Some(Credential::Password(pw.to_string())),
            (None, None) => None,
        }
    }

    pub fn auth_type(&self) -> AuthType {
        match self {
            Credential::PrivateKey(_) => AuthType::PrivateKey,
            Credential::Password(_) => AuthType::Password,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::PrivateKey(_) => write!(f, "PrivateKey(<redacted>)"),
            Credential::Password(_) => write!(f, "Password(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    PrivateKey,
    Password,
}

/// Everything the executor needs to open a session against one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
}

impl ConnectionTarget {
    /// Builds a target from loose descriptor fields, failing fast when the
    /// hostname or both credentials are missing.
    pub fn from_descriptor(
        hostname: Option<&str>,
        port: Option<u16>,
        username: Option<&str>,
        private_key: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self> {
        let hostname = hostname
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(MonitorError::MissingConnectionDetails)?;
        let credential = Credential::from_parts(private_key, password)
            .ok_or(MonitorError::MissingConnectionDetails)?;

        Ok(Self {
            hostname: hostname.to_string(),
            port: port.filter(|p| *p != 0).unwrap_or(DEFAULT_SSH_PORT),
            username: username
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .unwrap_or(DEFAULT_USERNAME)
                .to_string(),
            credential,
        })
    }
}

/// Persisted connection record. Never serialized toward the display layer;
/// see [`ServerSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerRecord {
    pub fn create(req: NewServer) -> Result<Self> {
        let name = req.name.as_deref().map(str::trim).unwrap_or_default();
        if name.is_empty() {
            return Err(MonitorError::validation(
                "Missing required fields (Name, Host, and Key/Password)",
            ));
        }
        let target = ConnectionTarget::from_descriptor(
            req.hostname.as_deref(),
            req.port,
            req.username.as_deref(),
            req.private_key.as_deref(),
            req.password.as_deref(),
        )
        .map_err(|_| {
            MonitorError::validation("Missing required fields (Name, Host, and Key/Password)")
        })?;
        validate_hostname(&target.hostname)?;

        let now = Utc::now();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            hostname: target.hostname,
            port: target.port,
            username: target.username,
            credential: target.credential,
            description: normalize_description(req.description),
            tags: req.tags.map(TagsInput::into_set).unwrap_or_default(),
            ip_address: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Applies a partial update. A new credential of one kind replaces the
    /// other kind; blank credential fields leave the stored one untouched.
    pub fn apply(&mut self, patch: ServerPatch) -> Result<()> {
        if let Some(name) = patch.name.as_deref().map(str::trim) {
            if name.is_empty() {
                return Err(MonitorError::validation("Name cannot be empty"));
            }
            self.name = name.to_string();
        }
        if let Some(hostname) = patch.hostname.as_deref().map(str::trim) {
            validate_hostname(hostname)?;
            self.hostname = hostname.to_string();
        }
        if let Some(port) = patch.port {
            if port == 0 {
                return Err(MonitorError::validation("Port must be between 1 and 65535"));
            }
            self.port = port;
        }
        if let Some(username) = patch.username.as_deref().map(str::trim) {
            if !username.is_empty() {
                self.username = username.to_string();
            }
        }
        if let Some(credential) =
            Credential::from_parts(patch.private_key.as_deref(), patch.password.as_deref())
        {
            self.credential = credential;
        }
        if patch.description.is_some() {
            self.description = normalize_description(patch.description);
        }
        if let Some(tags) = patch.tags {
            self.tags = tags.into_set();
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn target(&self) -> ConnectionTarget {
        ConnectionTarget {
            hostname: self.hostname.clone(),
            port: self.port,
            username: self.username.clone(),
            credential: self.credential.clone(),
        }
    }

    pub fn summary(&self) -> ServerSummary {
        ServerSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            hostname: self.hostname.clone(),
            ip_address: self.ip_address.clone(),
            port: self.port,
            username: self.username.clone(),
            auth_type: self.credential.auth_type(),
            description: self.description.clone(),
            tags: self.tags.iter().cloned().collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Accepts IP literals (v4 or bare v6) and DNS or hosts-file names.
fn validate_hostname(hostname: &str) -> Result<()> {
    if hostname.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if hostname.len() > 253 || !HOSTNAME_RE.is_match(hostname) {
        return Err(MonitorError::validation(format!("Invalid hostname: {}", hostname)));
    }
    Ok(())
}

fn normalize_description(description: Option<String>) -> Option<String> {
    description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
}

/// Tags arrive either as `"web, prod"` or as `["web", "prod"]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TagsInput {
    Csv(String),
    List(Vec<String>),
}

impl TagsInput {
    pub fn into_set(self) -> BTreeSet<String> {
        let raw: Vec<String> = match self {
            TagsInput::Csv(s) => s.split(',').map(str::to_string).collect(),
            TagsInput::List(v) => v,
        };
        raw.into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewServer {
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub port: Option<u16>,
    pub private_key: Option<String>,
    pub password: Option<String>,
    pub description: Option<String>,
    pub tags: Option<TagsInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPatch {
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub port: Option<u16>,
    pub private_key: Option<String>,
    pub password: Option<String>,
    pub description: Option<String>,
    pub tags: Option<TagsInput>,
}

/// A record as the display layer sees it: no credential material.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub port: u16,
    pub username: String,
    pub auth_type: AuthType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Summary merged with the live poll state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerView {
    #[serde(flatten)]
    pub server: ServerSummary,
    #[serde(flatten)]
    pub state: ServerState,
}
