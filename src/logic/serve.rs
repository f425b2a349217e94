use chrono::SubsecRound;
use log::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::logic::archive::guess_content_type;
use crate::logic::deploy_ops::DeployPipeline;
use crate::logic::password::{cookie_name, find_cookie};
use crate::model::{Branch, BranchAddress, Id, Timestamp};
use crate::storage::paths::{join_key, normalize_relative_path};
use crate::store::traits::Store;

pub const INDEX_FILE: &str = "index.html";
pub const CACHE_CONTROL: &str = "public, max-age=0, must-revalidate";
pub const PASSWORD_PATH: &str = "_password";

/// A file of the active deploy, ready to send
#[derive(Debug, Clone)]
pub struct ServedAsset {
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// Activation time, truncated to whole seconds
    pub last_modified: Timestamp,
    pub cache_control: &'static str,
}

#[derive(Debug, Clone)]
pub enum ServeOutcome {
    Asset(ServedAsset),
    NotModified { last_modified: Timestamp },
    /// The branch has a password and the request carries no valid session
    PasswordRequired { branch_id: Id, asset_path: String },
}

/// What the caller knows about the request
#[derive(Debug, Clone, Default)]
pub struct ServeRequest<'a> {
    pub if_modified_since: Option<Timestamp>,
    pub cookie_header: Option<&'a str>,
}

/// Empty paths and directories resolve to their `index.html`
pub fn resolve_asset_path(raw: &str) -> String {
    if raw.is_empty() || raw.ends_with('/') {
        format!("{}{}", raw, INDEX_FILE)
    } else {
        raw.to_string()
    }
}

fn whole_seconds(ts: Timestamp) -> Timestamp {
    ts.trunc_subsecs(0)
}

impl<S: Store> DeployPipeline<S> {
    async fn find_served_branch(&self, address: &BranchAddress) -> PipelineResult<Branch> {
        self.store()
            .find_branch(address)
            .await?
            .ok_or_else(|| PipelineError::branch_not_found(address))
    }

    fn has_valid_session(&self, branch: &Branch, cookie_header: Option<&str>) -> bool {
        let Some(seal) = &branch.password_seal else {
            return true;
        };
        cookie_header
            .and_then(|header| find_cookie(header, &cookie_name(branch.id)))
            .map_or(false, |token| {
                self.sealer().verify_session_token(branch.id, seal, token)
            })
    }

    /// Resolve `asset_path` against the branch's active deploy.
    pub async fn serve_asset(
        &self,
        address: &BranchAddress,
        asset_path: &str,
        request: ServeRequest<'_>,
    ) -> PipelineResult<ServeOutcome> {
        let branch = self.find_served_branch(address).await?;
        let asset_path = resolve_asset_path(asset_path);

        if !self.has_valid_session(&branch, request.cookie_header) {
            return Ok(ServeOutcome::PasswordRequired {
                branch_id: branch.id,
                asset_path,
            });
        }

        let not_found = || PipelineError::NotFound {
            kind: "asset",
            key: format!("{}/{}", address, asset_path),
        };

        let deploy_id = branch.active_deploy_id.ok_or_else(not_found)?;
        let deploy = self.get_deploy(deploy_id).await?;
        let last_modified = whole_seconds(deploy.deployed_on.ok_or_else(not_found)?);

        let relative = normalize_relative_path(&asset_path).map_err(|_| not_found())?;
        let key = join_key(&deploy.path, &relative);
        if self.files().stat(&key).await?.is_none() {
            return Err(not_found());
        }

        if let Some(since) = request.if_modified_since {
            if since >= last_modified {
                return Ok(ServeOutcome::NotModified { last_modified });
            }
        }

        let bytes = self.files().load(&key).await?.ok_or_else(not_found)?;
        debug!("Serving {} ({} bytes) from deploy {}", key, bytes.len(), deploy.id);

        Ok(ServeOutcome::Asset(ServedAsset {
            content_type: guess_content_type(&relative),
            bytes,
            last_modified,
            cache_control: CACHE_CONTROL,
        }))
    }

    /// Check a submitted branch password; returns the cookie name and token
    /// to remember the verification for the session.
    pub async fn verify_branch_password(
        &self,
        address: &BranchAddress,
        password: &str,
    ) -> PipelineResult<(String, String)> {
        let branch = self.find_served_branch(address).await?;
        let Some(seal) = &branch.password_seal else {
            return Err(PipelineError::validation(format!(
                "branch {} has no password",
                address
            )));
        };

        if !self.sealer().verify(password, seal) {
            return Err(PipelineError::Authorization(format!(
                "wrong password for branch {}",
                address
            )));
        }
        Ok((
            cookie_name(branch.id),
            self.sealer().session_token(branch.id, seal)?,
        ))
    }
}
