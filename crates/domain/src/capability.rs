//! Cross-cutting state an aggregate can embed by value.
//!
//! Capabilities are plain structs updated from the aggregate's own `apply`,
//! so replay keeps them deterministic. An aggregate exposes them through the
//! matching trait to get the shared accessors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Creation and last-modification times, taken from applied events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Timestamps {
    /// Records a change at `at`. The first change also sets `created_at`.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if self.created_at.is_none() {
            self.created_at = Some(at);
        }
        self.updated_at = Some(at);
    }
}

/// Rule violations of the archival capability.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArchivalError {
    #[error("already archived at {archived_at}")]
    AlreadyArchived { archived_at: DateTime<Utc> },

    #[error("archived entities cannot be modified")]
    Archived,
}

/// Soft-archival marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archival {
    pub archived_at: Option<DateTime<Utc>>,
    pub archived_by: Option<String>,
}

impl Archival {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// Checks that archiving is allowed. Archiving twice is a rule violation.
    pub fn can_archive(&self) -> Result<(), ArchivalError> {
        match self.archived_at {
            Some(archived_at) => Err(ArchivalError::AlreadyArchived { archived_at }),
            None => Ok(()),
        }
    }

    /// Checks that a modifying operation is allowed.
    pub fn ensure_active(&self) -> Result<(), ArchivalError> {
        if self.is_archived() {
            return Err(ArchivalError::Archived);
        }
        Ok(())
    }

    /// Marks the entity archived.
    pub fn archive(&mut self, at: DateTime<Utc>, by: Option<String>) -> Result<(), ArchivalError> {
        self.can_archive()?;
        self.archived_at = Some(at);
        self.archived_by = by;
        Ok(())
    }
}

/// Aggregates that embed [`Timestamps`].
pub trait HasTimestamps {
    fn timestamps(&self) -> &Timestamps;

    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.timestamps().created_at
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.timestamps().updated_at
    }
}

/// Aggregates that embed [`Archival`].
pub trait Archivable {
    fn archival(&self) -> &Archival;

    fn is_archived(&self) -> bool {
        self.archival().is_archived()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn touch_keeps_first_creation_time() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(5);
        let mut ts = Timestamps::default();

        ts.touch(t0);
        ts.touch(t1);
        assert_eq!(ts.created_at, Some(t0));
        assert_eq!(ts.updated_at, Some(t1));
    }

    #[test]
    fn archiving_twice_fails() {
        let at = Utc::now();
        let mut archival = Archival::default();
        assert!(archival.ensure_active().is_ok());

        archival.archive(at, Some("ops".into())).unwrap();
        assert!(archival.is_archived());
        assert_eq!(archival.ensure_active(), Err(ArchivalError::Archived));
        assert_eq!(
            archival.archive(Utc::now(), None),
            Err(ArchivalError::AlreadyArchived { archived_at: at })
        );
        assert_eq!(archival.archived_by.as_deref(), Some("ops"));
    }
}
