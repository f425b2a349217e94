//! Storage key layout.
//!
//! Content blobs live under `content/` (see [`ContentObject::path_for`]) and
//! deploy trees under `deploys/`. The reclaimer's safety check is calibrated
//! against [`DEPLOY_PATH_SEGMENTS`]; changing the layout means bumping
//! [`DEPLOY_LAYOUT_VERSION`] and both constants together.
//!
//! [`ContentObject::path_for`]: crate::model::ContentObject::path_for

use crate::model::Id;

pub const DEPLOY_ROOT: &str = "deploys";

/// v1: `deploys/<orgId>/<gameId>/<branchId>/<dir>`
pub const DEPLOY_LAYOUT_VERSION: u32 = 1;
pub const DEPLOY_PATH_SEGMENTS: usize = 5;
pub const DEPLOY_DIR_NAME_LEN: usize = 32;

const MAX_RELATIVE_PATH_LEN: usize = 1024;

pub fn deploy_path(org_id: Id, game_id: Id, branch_id: Id, dir_name: &str) -> String {
    format!("{}/{}/{}/{}/{}", DEPLOY_ROOT, org_id, game_id, branch_id, dir_name)
}

/// Leaf names are what [`generate_dir_name`] produces: 32 lowercase hex digits.
///
/// [`generate_dir_name`]: crate::model::generate_dir_name
fn is_deploy_dir_name(leaf: &str) -> bool {
    leaf.len() == DEPLOY_DIR_NAME_LEN
        && leaf.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Structural check run before any directory removal.
pub fn is_safe_deploy_path(path: &str) -> bool {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() != DEPLOY_PATH_SEGMENTS || segments[0] != DEPLOY_ROOT {
        return false;
    }

    let ids_numeric = segments[1..4]
        .iter()
        .all(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()));

    ids_numeric && is_deploy_dir_name(segments[4])
}

/// Normalize a client-supplied relative path into a storage key fragment.
///
/// Rejects absolute paths, backslashes, NULs, `.`/`..` segments and empty
/// segments; a single leading `./` is tolerated because archive tools emit it.
pub fn normalize_relative_path(raw: &str) -> Result<String, String> {
    let trimmed = raw.strip_prefix("./").unwrap_or(raw);

    if trimmed.is_empty() {
        return Err("path is empty".to_string());
    }
    if trimmed.len() > MAX_RELATIVE_PATH_LEN {
        return Err(format!("path exceeds {} bytes", MAX_RELATIVE_PATH_LEN));
    }
    if trimmed.starts_with('/') {
        return Err(format!("path '{}' must be relative", raw));
    }
    if trimmed.contains('\\') || trimmed.contains('\0') {
        return Err(format!("path '{}' contains an illegal character", raw));
    }

    for segment in trimmed.split('/') {
        match segment {
            "" => return Err(format!("path '{}' has an empty segment", raw)),
            "." | ".." => return Err(format!("path '{}' escapes its root", raw)),
            _ => {}
        }
    }

    Ok(trimmed.to_string())
}

/// Join a directory key and a relative key
pub fn join_key(dir: &str, relative: &str) -> String {
    if dir.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_path_matches_its_own_check() {
        let path = deploy_path(1, 22, 333, "0123456789abcdef0123456789abcdef");
        assert_eq!(path, "deploys/1/22/333/0123456789abcdef0123456789abcdef");
        assert!(is_safe_deploy_path(&path));

        let generated = deploy_path(1, 22, 333, &crate::model::generate_dir_name());
        assert!(is_safe_deploy_path(&generated));
    }

    #[test]
    fn test_unsafe_shapes_are_rejected() {
        for path in [
            "",
            "/",
            "deploys",
            "deploys/1/2/3",
            "deploys/1/2/3/abc/extra",
            "content/1/2/3/abc",
            "deploys/x/2/3/abc",
            "deploys/1/2/3/..",
            "deploys/1/2//abc",
            "/deploys/1/2/3/abc",
            "deploys/1/2/3/a b",
            "deploys/1/2/3/abc",
            "deploys/1/2/3/0123456789ABCDEF0123456789ABCDEF",
            "deploys/1/2/3/0123456789abcdef0123456789abcdeg",
            "deploys/1/2/3/0123456789abcdef0123456789abcdef0",
        ] {
            assert!(!is_safe_deploy_path(path), "{} should be unsafe", path);
        }
    }

    #[test]
    fn test_normalize_relative_path() {
        assert_eq!(normalize_relative_path("index.html").unwrap(), "index.html");
        assert_eq!(
            normalize_relative_path("./assets/app.js").unwrap(),
            "assets/app.js"
        );
        assert!(normalize_relative_path("").is_err());
        assert!(normalize_relative_path("/etc/passwd").is_err());
        assert!(normalize_relative_path("a/../../b").is_err());
        assert!(normalize_relative_path("a//b").is_err());
        assert!(normalize_relative_path("a\\b").is_err());
        assert!(normalize_relative_path(&"a".repeat(2000)).is_err());
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("deploys/1/2/3/x", "a/b.js"), "deploys/1/2/3/x/a/b.js");
        assert_eq!(join_key("dir/", "f"), "dir/f");
        assert_eq!(join_key("", "f"), "f");
    }
}
