//! Room catalog seam.
//!
//! The catalog lists and creates rooms ("groups"). The session layer only
//! consumes a `RoomId` from it and trusts its capacity gate; these types exist
//! so the presentation layer can talk to any catalog backend.

use async_trait::async_trait;
use common::types::RoomId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest allowed room capacity.
pub const MIN_MEMBERS: u32 = 2;

/// Largest allowed room capacity.
pub const MAX_MEMBERS: u32 = 50;

/// Capacity used when the creator does not pick one.
pub const DEFAULT_MAX_MEMBERS: u32 = 20;

/// A room as listed by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: RoomId,
    pub name: String,
    pub description: String,
    pub member_count: u32,
    pub max_members: u32,
}

impl Group {
    /// Whether the room is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.member_count >= self.max_members
    }

    /// Case-insensitive match on name or description.
    #[must_use]
    pub fn matches_search(&self, term: &str) -> bool {
        let term = term.to_lowercase();
        self.name.to_lowercase().contains(&term) || self.description.to_lowercase().contains(&term)
    }
}

/// Request to create a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroup {
    pub name: String,
    pub description: String,
    pub max_members: u32,
}

impl Default for CreateGroup {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            max_members: DEFAULT_MAX_MEMBERS,
        }
    }
}

impl CreateGroup {
    /// Check the request before sending it to the catalog.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.name.trim().is_empty() {
            return Err(CatalogError::InvalidName);
        }
        if !(MIN_MEMBERS..=MAX_MEMBERS).contains(&self.max_members) {
            return Err(CatalogError::InvalidCapacity(self.max_members));
        }
        Ok(())
    }
}

/// Catalog errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    /// Group name was empty or whitespace.
    #[error("Group name is required")]
    InvalidName,

    /// Capacity outside the allowed range.
    #[error("Maximum members must be between {MIN_MEMBERS} and {MAX_MEMBERS}, got {0}")]
    InvalidCapacity(u32),

    /// The catalog backend failed.
    #[error("Catalog unavailable: {0}")]
    Unavailable(String),
}

/// Room catalog backend.
#[async_trait]
pub trait RoomCatalog: Send + Sync {
    async fn list_groups(&self) -> Result<Vec<Group>, CatalogError>;

    async fn create_group(&self, request: CreateGroup) -> Result<Group, CatalogError>;
}
