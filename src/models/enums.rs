use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(EntityType {
    Problem => "problem",
    Medication => "medication",
    Imaging => "imaging",
    Lab => "lab",
});

str_enum!(EntityStatus {
    Active => "active",
    Resolved => "resolved",
    Discontinued => "discontinued",
    Superseded => "superseded",
    PendingReview => "pending_review",
});

str_enum!(SourceType {
    Encounter => "encounter",
    Attachment => "attachment",
    Manual => "manual",
});

impl EntityType {
    pub fn all() -> &'static [EntityType] {
        &[Self::Problem, Self::Medication, Self::Imaging, Self::Lab]
    }

    /// Imaging studies and lab results are tied to the day they were performed,
    /// so structural matching also compares their effective dates.
    pub fn is_date_bearing(&self) -> bool {
        matches!(self, Self::Imaging | Self::Lab)
    }

    /// Terminal status a RESOLVE action moves this type into.
    pub fn resolved_status(&self) -> EntityStatus {
        match self {
            Self::Medication => EntityStatus::Discontinued,
            _ => EntityStatus::Resolved,
        }
    }
}

impl EntityStatus {
    /// Active and pending-review entities accept new visits and transitions.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::PendingReview)
    }

    /// Closed but reopenable through an explicit reactivation.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Resolved | Self::Discontinued)
    }

    /// Whether the state machine permits moving from `self` to `to`.
    ///
    /// Superseded is terminal. Closed entities only move back to active.
    pub fn can_transition_to(&self, to: EntityStatus) -> bool {
        match (self, to) {
            (Self::Superseded, _) => false,
            (from, to) if *from == to => true,
            (Self::Active | Self::PendingReview, _) => true,
            (Self::Resolved | Self::Discontinued, Self::Active) => true,
            _ => false,
        }
    }
}
