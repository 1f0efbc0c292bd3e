//! Strongly typed ids. All ids are UUID v7 so they sort by creation time.

use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        #[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
        #[cfg_attr(feature = "sqlx", sqlx(transparent))]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn to_uuid(&self) -> Uuid {
                self.0
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

        impl AsRef<Uuid> for $name {
            fn as_ref(&self) -> &Uuid {
                &self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

define_id!(
    /// Identifies one repository (a managed media root on disk).
    RepositoryId
);

define_id!(
    /// Identifies a committed, deduplicated asset.
    AssetId
);

define_id!(
    /// Identifies a durable background job. Also surfaced to upload callers
    /// as the task id.
    JobId
);

define_id!(
    /// Identifies a staged upload awaiting processing. Reflected in the
    /// staging file name so paths are self-describing.
    StagingId
);

define_id!(
    /// Identifies one synchronization run audit row.
    SyncOpId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_time_ordered_across_milliseconds() {
        let a = AssetId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = AssetId::new();
        assert!(a < b);
    }

    #[test]
    fn id_display_roundtrips_through_uuid() {
        let id = RepositoryId::new();
        let parsed: Uuid = id.to_string().parse().unwrap();
        assert_eq!(parsed, id.to_uuid());
    }
}
