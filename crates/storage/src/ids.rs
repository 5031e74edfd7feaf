use std::fmt;
use std::str::FromStr;

use snafu::ensure;

use super::error::{InvalidUserIdSnafu, StorageError, StorageResult};

const MAX_USER_ID_LEN: usize = 256;

/// Identity key that namespaces every persisted conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(String);

impl UserId {
    pub fn parse(raw: &str) -> StorageResult<Self> {
        let trimmed = raw.trim();
        ensure!(
            !trimmed.is_empty(),
            InvalidUserIdSnafu {
                stage: "parse-user-id",
                raw: raw.to_string(),
                reason: "empty",
            }
        );
        ensure!(
            trimmed.len() <= MAX_USER_ID_LEN,
            InvalidUserIdSnafu {
                stage: "parse-user-id",
                raw: raw.to_string(),
                reason: "too long",
            }
        );
        ensure!(
            !trimmed.chars().any(char::is_control),
            InvalidUserIdSnafu {
                stage: "parse-user-id",
                raw: raw.to_string(),
                reason: "contains control characters",
            }
        );

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl FromStr for UserId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
