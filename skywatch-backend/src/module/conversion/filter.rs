use serde::{Deserialize, Serialize};
use skywatch_common::OrbitalElementRecord;
use std::sync::Arc;

/// Predicate handed to a conversion run
pub type RecordPredicate = Arc<dyn Fn(&OrbitalElementRecord) -> bool + Send + Sync>;

/// Predicate accepting every record
pub fn match_all() -> RecordPredicate {
    Arc::new(|_| true)
}

/// The user-facing filter: optional name prefix plus a favourites toggle.
/// Both conditions must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteFilter {
    #[serde(default)]
    pub name_prefix: Option<String>,
    #[serde(default)]
    pub favorites_only: bool,
}

impl SatelliteFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn name_prefix(prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: Some(prefix.into()),
            favorites_only: false,
        }
    }

    pub fn favorites() -> Self {
        Self {
            name_prefix: None,
            favorites_only: true,
        }
    }

    pub fn with_favorites_only(mut self, favorites_only: bool) -> Self {
        self.favorites_only = favorites_only;
        self
    }

    pub fn matches(&self, record: &OrbitalElementRecord) -> bool {
        if self.favorites_only && !record.is_favorite {
            return false;
        }
        match &self.name_prefix {
            Some(prefix) => record.name_starts_with(prefix),
            None => true,
        }
    }

    pub fn into_predicate(self) -> RecordPredicate {
        Arc::new(move |record| self.matches(record))
    }
}

impl std::fmt::Display for SatelliteFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.name_prefix, self.favorites_only) {
            (Some(prefix), true) => write!(f, "favourites starting with '{}'", prefix),
            (Some(prefix), false) => write!(f, "names starting with '{}'", prefix),
            (None, true) => write!(f, "favourites"),
            (None, false) => write!(f, "all"),
        }
    }
}
