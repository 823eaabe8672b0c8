//! Canonical cache-key builders. Every KV key the service writes is minted
//! here so owner scoping and pattern invalidation stay consistent; nothing
//! else in the tree formats a `cloud:` key by hand.

use crate::context::OwnerId;

fn path_or_root(path: &str) -> &str {
    if path.is_empty() {
        "root"
    } else {
        path
    }
}

fn flag(b: bool) -> &'static str {
    if b {
        "1"
    } else {
        "0"
    }
}

pub fn listing_full(
    owner: &OwnerId,
    path: &str,
    delimited: bool,
    with_metadata: bool,
    has_folder_auth: bool,
    has_hidden_auth: bool,
) -> String {
    format!(
        "cloud:list:{owner}:{}:full:{}:{}:{}:{}",
        path_or_root(path),
        flag(delimited),
        flag(with_metadata),
        flag(has_folder_auth),
        flag(has_hidden_auth),
    )
}

#[allow(clippy::too_many_arguments)]
pub fn listing_objects(
    owner: &OwnerId,
    path: &str,
    delimited: bool,
    with_metadata: bool,
    skip: usize,
    take: usize,
    search: Option<&str>,
) -> String {
    let mut key = format!(
        "cloud:list:{owner}:{}:objects:{}:{}:{}:{}",
        path_or_root(path),
        flag(delimited),
        flag(with_metadata),
        skip,
        take,
    );
    if let Some(search) = search {
        key.push(':');
        key.push_str(search);
    }
    key
}

pub fn listing_directories(
    owner: &OwnerId,
    path: &str,
    skip: usize,
    take: usize,
    has_folder_auth: bool,
    has_hidden_auth: bool,
    search: Option<&str>,
) -> String {
    let mut key = format!(
        "cloud:list:{owner}:{}:dirs:{}:{}:{}:{}",
        path_or_root(path),
        skip,
        take,
        flag(has_folder_auth),
        flag(has_hidden_auth),
    );
    if let Some(search) = search {
        key.push(':');
        key.push_str(search);
    }
    key
}

/// Pattern matching every listing cache entry of an owner.
pub fn listing_pattern(owner: &OwnerId) -> String {
    format!("cloud:list:{owner}:*")
}

pub fn directory_thumbnails(owner: &OwnerId, prefix: &str, signed: bool) -> String {
    format!(
        "cloud:dir-thumbnails:{}:{owner}:{}",
        if signed { "signed" } else { "public" },
        path_or_root(prefix),
    )
}

pub fn directory_thumbnails_pattern(owner: &OwnerId, prefix: &str) -> String {
    format!("cloud:dir-thumbnails:*:{owner}:{}", path_or_root(prefix))
}

pub fn usage(owner: &OwnerId) -> String {
    format!("cloud:usage:{owner}")
}

pub fn encrypted_manifest(owner: &OwnerId) -> String {
    format!("cloud:encrypted-manifest:{owner}")
}

pub fn hidden_manifest(owner: &OwnerId) -> String {
    format!("cloud:hidden-manifest:{owner}")
}

pub fn encrypted_session(owner: &OwnerId, path: &str) -> String {
    format!("cloud:encrypted-folder:session:{owner}:{path}")
}

/// Pattern matching every descendant session of a folder (not the folder's
/// own session: a `{path}*` glob would also catch `{path}x` siblings, so
/// callers delete the exact key separately).
pub fn encrypted_session_descendants_pattern(owner: &OwnerId, path: &str) -> String {
    format!("cloud:encrypted-folder:session:{owner}:{path}/*")
}

pub fn hidden_session(owner: &OwnerId, path: &str) -> String {
    format!("cloud:hidden-folder:session:{owner}:{path}")
}

pub fn hidden_session_descendants_pattern(owner: &OwnerId, path: &str) -> String {
    format!("cloud:hidden-folder:session:{owner}:{path}/*")
}

pub fn extract_cancel(job_id: &str) -> String {
    format!("cloud:archive-extract:cancel:{job_id}")
}

pub fn create_cancel(job_id: &str) -> String {
    format!("cloud:archive-create:cancel:{job_id}")
}

pub fn create_result(job_id: &str) -> String {
    format!("cloud:archive-create:result:{job_id}")
}

pub fn scan_status(owner: &OwnerId, key: &str) -> String {
    format!("cloud:scan:{owner}:{}", urlencoding::encode(key))
}

pub fn idempotency(owner: &OwnerId, action: &str, key: &str) -> String {
    format!("cloud:idempotency:{owner}:{action}:{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use utils::glob::glob_match;

    #[test]
    fn owner_patterns_do_not_cross_owners() {
        let u1 = OwnerId::user("u1");
        let u2 = OwnerId::user("u2");
        let key = listing_full(&u2, "docs", true, false, false, false);
        assert!(!glob_match(&listing_pattern(&u1), &key));
        assert!(glob_match(&listing_pattern(&u2), &key));
    }

    #[test]
    fn root_path_is_spelled_out() {
        let owner = OwnerId::user("u1");
        assert_eq!(
            listing_full(&owner, "", true, true, false, false),
            "cloud:list:u1:root:full:1:1:0:0"
        );
    }

    #[test]
    fn session_descendants_pattern_spares_siblings() {
        let owner = OwnerId::user("u1");
        let pattern = encrypted_session_descendants_pattern(&owner, "secret");
        assert!(glob_match(&pattern, &encrypted_session(&owner, "secret/sub")));
        assert!(!glob_match(&pattern, &encrypted_session(&owner, "secret")));
        assert!(!glob_match(&pattern, &encrypted_session(&owner, "secretx")));
    }

    #[test]
    fn scan_key_is_url_encoded() {
        let owner = OwnerId::user("u1");
        assert_eq!(
            scan_status(&owner, "docs/a b.txt"),
            "cloud:scan:u1:docs%2Fa%20b.txt"
        );
    }
}
