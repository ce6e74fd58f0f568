//! Typed ID wrappers for engine-generated identifiers.
//!
//! Job records are keyed by [`crate::JobKey`] (caller-supplied), so the only
//! UUID-backed ids are the ones the engine mints itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Generate a newtype ID wrapper over `Uuid`.
///
/// Each generated type gets `new()`, `Display`/`FromStr` through the inner
/// UUID, and `From` conversions in both directions.
macro_rules! typed_id {
    ($($(#[doc = $doc:expr])* $name:ident),+ $(,)?) => {
        $(
            $(#[doc = $doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(Uuid);

            impl $name {
                /// Create a new random ID.
                #[must_use]
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = uuid::Error;

                fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                    Uuid::parse_str(s).map(Self)
                }
            }

            impl From<Uuid> for $name {
                fn from(uuid: Uuid) -> Self {
                    Self(uuid)
                }
            }

            impl From<$name> for Uuid {
                fn from(id: $name) -> Self {
                    id.0
                }
            }
        )+
    };
}

typed_id! {
    /// Identifier of one tracked unit of background execution.
    WorkItemId,
    /// Identifier of one distributed fan-out group (one job instance).
    FanOutGroupId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique() {
        let ids: HashSet<FanOutGroupId> = (0..100).map(|_| FanOutGroupId::new()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn display_and_parse() {
        let id = WorkItemId::new();
        let parsed: WorkItemId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_is_transparent() {
        let id = FanOutGroupId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("not-a-uuid".parse::<FanOutGroupId>().is_err());
    }
}
