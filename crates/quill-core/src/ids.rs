//! Prefixed, time-ordered identifiers.
//!
//! Fresh ids are `<prefix>_<uuid v7>`, so byte order follows creation
//! order. Ids read back from storage go through `from_raw` untouched; ids
//! typed by a user go through `FromStr`, which checks the shape.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::CoreError;

fn check_shape(raw: &str, prefix: &str) -> Result<(), CoreError> {
    let body = raw
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .ok_or_else(|| CoreError::InvalidInput(format!("expected a {prefix}_ id, got {raw:?}")))?;
    let well_formed = !body.is_empty()
        && body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !well_formed {
        return Err(CoreError::InvalidInput(format!("malformed {prefix} id {raw:?}")));
    }
    Ok(())
}

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident => $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new() -> Self {
                Self(format!("{}_{}", Self::PREFIX, Uuid::now_v7().simple()))
            }

            /// Wrap a stored value without checking it.
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(raw: &str) -> Result<Self, CoreError> {
                let raw = raw.trim();
                check_shape(raw, Self::PREFIX)?;
                Ok(Self(raw.to_owned()))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

prefixed_id!(
    /// One content-generation job.
    SessionId => "sess"
);
prefixed_id!(
    /// One row of a session's action log.
    ActionId => "act"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_carry_their_prefix() {
        assert!(SessionId::new().as_str().starts_with("sess_"));
        assert!(ActionId::new().as_str().starts_with("act_"));
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn parse_accepts_fresh_and_hand_written_ids() {
        let id = SessionId::new();
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
        assert_eq!(" sess_resumed-42 ".parse::<SessionId>().unwrap().as_str(), "sess_resumed-42");
    }

    #[test]
    fn parse_rejects_foreign_or_malformed_ids() {
        for raw in ["act_123", "sess_", "sess", "session_1", "sess_a b", ""] {
            assert!(
                matches!(raw.parse::<SessionId>(), Err(CoreError::InvalidInput(_))),
                "accepted {raw:?}"
            );
        }
    }

    #[test]
    fn from_raw_skips_validation() {
        assert_eq!(SessionId::from_raw("legacy").as_str(), "legacy");
    }

    #[test]
    fn creation_order_is_sort_order() {
        let ids: Vec<ActionId> = (0..50).map(|_| ActionId::new()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
