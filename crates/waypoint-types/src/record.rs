//! Service record and its key/wire encodings

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RecordError, RecordResult};
use crate::ids::LeaseId;

/// Separator between key segments.
pub const KEY_SEPARATOR: char = '/';

/// Longest lease a record may ask for, matching etcd's lease TTL cap.
pub const MAX_TTL: Duration = Duration::from_secs(9_000_000_000);

/// A single advertised instance of a named service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Logical service identity.
    pub name: String,

    /// Host the instance listens on.
    #[serde(rename = "addr")]
    pub address: String,

    /// Port the instance listens on.
    pub port: u16,

    /// Lease lifetime requested at registration.
    #[serde(skip)]
    pub ttl: Duration,

    /// Lease handle, present only while registered.
    #[serde(skip)]
    pub lease_id: Option<LeaseId>,

    /// Last successful renewal observed by the owning process.
    #[serde(skip)]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl ServiceRecord {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        ttl: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            ttl,
            lease_id: None,
            last_heartbeat: None,
        }
    }

    /// Check the preconditions for registration.
    pub fn validate(&self) -> RecordResult<()> {
        Self::validate_name(&self.name)?;
        if self.address.is_empty() {
            return Err(RecordError::EmptyAddress);
        }
        if self.port == 0 {
            return Err(RecordError::ZeroPort);
        }
        if self.ttl.is_zero() {
            return Err(RecordError::ZeroTtl);
        }
        if self.ttl > MAX_TTL {
            return Err(RecordError::TtlTooLarge(self.ttl));
        }
        Ok(())
    }

    /// Validate a bare service name, as used for subscriptions.
    pub fn validate_name(name: &str) -> RecordResult<()> {
        if name.is_empty() {
            return Err(RecordError::EmptyName);
        }
        if name.contains(KEY_SEPARATOR) {
            return Err(RecordError::InvalidName(name.to_string()));
        }
        Ok(())
    }

    /// `<address>:<port>`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Store key for this record under `prefix`.
    pub fn key(&self, prefix: &str) -> String {
        format!("{}{}", service_prefix(prefix, &self.name), self.endpoint())
    }

    pub fn is_registered(&self) -> bool {
        self.lease_id.is_some()
    }

    /// Local liveness estimate: a heartbeat was seen less than `ttl` ago.
    ///
    /// The store's lease expiry is authoritative; this is only for
    /// introspection inside the owning process.
    pub fn is_healthy(&self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_heartbeat else {
            return false;
        };
        match (now - last).to_std() {
            Ok(elapsed) => elapsed < self.ttl,
            // Heartbeat stamped in the future relative to `now`.
            Err(_) => true,
        }
    }

    /// Encode the wire form: `{"name":..,"addr":..,"port":..}`.
    pub fn encode(&self) -> RecordResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode the wire form. Local-only fields come back empty.
    pub fn decode(bytes: &[u8]) -> RecordResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Prefix covering every instance of `name`: `<prefix>/<name>/`.
///
/// The trailing separator keeps `orders` from matching `orders-v2`.
pub fn service_prefix(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches(KEY_SEPARATOR);
    format!("{prefix}{KEY_SEPARATOR}{name}{KEY_SEPARATOR}")
}
