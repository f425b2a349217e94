use serde::{Deserialize, Serialize};

use crate::model::{Id, Timestamp};

/// A named deployment target within a game.
///
/// Holds only the ids of the deploys it points at; deploys are looked up
/// through the store when needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: Id,
    pub org_id: Id,
    pub game_id: Id,
    pub slug: String,
    /// Sealed access password, never the plaintext
    #[serde(skip_serializing)]
    pub password_seal: Option<String>,
    pub pinned: bool,
    pub active_deploy_id: Option<Id>,
    pub latest_deploy_id: Option<Id>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Branch {
    pub fn is_password_protected(&self) -> bool {
        self.password_seal.is_some()
    }

    /// Whether either pointer references `deploy_id`
    pub fn references(&self, deploy_id: Id) -> bool {
        self.active_deploy_id == Some(deploy_id) || self.latest_deploy_id == Some(deploy_id)
    }

    pub fn has_pointers(&self) -> bool {
        self.active_deploy_id.is_some() || self.latest_deploy_id.is_some()
    }
}

/// Address of a branch as supplied by the organization/game collaborators
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchAddress {
    pub org_id: Id,
    pub game_id: Id,
    pub slug: String,
}

impl BranchAddress {
    pub fn new(org_id: Id, game_id: Id, slug: impl Into<String>) -> Self {
        Self {
            org_id,
            game_id,
            slug: slug.into(),
        }
    }
}

impl std::fmt::Display for BranchAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.org_id, self.game_id, self.slug)
    }
}

/// Slugs are lowercase ascii alphanumerics and dashes, 1..=64 chars,
/// not starting or ending with a dash.
pub fn validate_slug(slug: &str) -> Result<(), String> {
    if slug.is_empty() || slug.len() > 64 {
        return Err(format!("branch slug '{}' must be 1-64 characters", slug));
    }
    if slug.starts_with('-') || slug.ends_with('-') {
        return Err(format!("branch slug '{}' cannot start or end with '-'", slug));
    }
    if !slug
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(format!(
            "branch slug '{}' may only contain a-z, 0-9 and '-'",
            slug
        ));
    }
    Ok(())
}
