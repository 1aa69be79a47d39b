//! Common types used throughout rdmsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Suffix the frontend appends to the identifier of a dataset that has not
/// been created at the destination yet.
pub const NEW_DATASET_SUFFIX: &str = "New Dataset";

/// Persistent identifier of a dataset at the destination (e.g. `doi:10.5072/FK2/ABC`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(String);

impl DatasetId {
    /// Create a new DatasetId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "dataset id cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Placeholder ids refer to datasets that do not exist at the destination yet.
    pub fn is_placeholder(&self) -> bool {
        self.0.ends_with(NEW_DATASET_SUFFIX)
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Credentials of the acting user at the destination.
///
/// The token is wiped from memory when the value is dropped.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    /// Destination user name.
    pub user: String,
    /// API token for the destination.
    pub token: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            token: token.into(),
        }
    }

    /// True if an API token was supplied.
    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_id() {
        let id = DatasetId::new("doi:10.5072/FK2/ABC").unwrap();
        assert_eq!(id.as_str(), "doi:10.5072/FK2/ABC");
        assert!(!id.is_placeholder());
        assert!(DatasetId::new("").is_err());
        assert!(DatasetId::new("   ").is_err());
    }

    #[test]
    fn test_placeholder() {
        let id = DatasetId::new("root:New Dataset").unwrap();
        assert!(id.is_placeholder());
    }

    #[test]
    fn test_credentials_debug_hides_token() {
        let creds = Credentials::new("alice", "s3cr3t");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("s3cr3t"));
    }
}
