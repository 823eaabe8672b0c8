//! Search scanner: case-insensitive substring match over file and directory
//! names, by walking the owner's keys page by page.
//!
//! There is deliberately no index. The scan is bounded by a global cap and
//! matches are windowed with skip/take; directory-name matches are collected
//! independently of file matches and a directory is reported once no matter
//! how many of its children hit the query.

use std::collections::HashMap;

use object_gateway::ListRequest;
use serde::{Deserialize, Serialize};

use crate::context::RequestContext;
use crate::directory::{FolderManifest, SessionKind};
use crate::error::ApiError;
use crate::listing::ListingService;
use crate::model::{DirectoryRecord, ObjectRecord};
use crate::EMPTY_FOLDER_PLACEHOLDER;

const MIN_QUERY_LEN: usize = 2;

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub path: Option<String>,
    pub extension: Option<String>,
    pub skip: usize,
    pub take: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResults {
    pub objects: Vec<ObjectRecord>,
    pub directories: Vec<DirectoryRecord>,
    pub total_count: usize,
    pub total_directory_count: usize,
    /// True when the scan cap cut the walk short.
    pub truncated: bool,
}

/// Per-request memo of "may the caller see content under this protected
/// folder", so one folder is session-checked once, not per key.
struct AccessMemo {
    folders: HashMap<String, bool>,
}

impl AccessMemo {
    fn new() -> Self {
        Self {
            folders: HashMap::new(),
        }
    }

    async fn allowed(
        &mut self,
        listing: &ListingService,
        ctx: &RequestContext,
        manifest: &FolderManifest,
        kind: SessionKind,
        token: Option<&str>,
        path: &str,
    ) -> Result<bool, ApiError> {
        let Some(folder) = manifest.covering_folder(path) else {
            return Ok(true);
        };
        let folder = folder.to_string();
        if let Some(known) = self.folders.get(&folder) {
            return Ok(*known);
        }
        let allowed = match token {
            Some(token) => listing
                .directories()
                .sessions()
                .validate(&ctx.owner, kind, &folder, token)
                .await?
                .is_some(),
            None => false,
        };
        self.folders.insert(folder, allowed);
        Ok(allowed)
    }
}

pub async fn search(
    listing: &ListingService,
    ctx: &RequestContext,
    request: &SearchRequest,
) -> Result<SearchResults, ApiError> {
    let query = request.query.trim().to_lowercase();
    if query.len() < MIN_QUERY_LEN {
        return Err(ApiError::BadRequest(
            "search query must be at least 2 characters".into(),
        ));
    }
    let extension = request
        .extension
        .as_deref()
        .map(|e| e.trim_start_matches('.').to_lowercase());
    let take = request.take.max(1);

    let base = utils::path::normalize_dir(request.path.as_deref().unwrap_or(""));
    let prefix = if base.is_empty() {
        ctx.owner.key_prefix()
    } else {
        format!("{}{}/", ctx.owner.key_prefix(), base)
    };

    let encrypted = listing
        .directories()
        .encrypted_manifest(&ctx.owner, &ctx.cancel)
        .await?;
    let hidden = listing
        .directories()
        .hidden_manifest(&ctx.owner, &ctx.cancel)
        .await?;
    let mut encrypted_memo = AccessMemo::new();
    let mut hidden_memo = AccessMemo::new();

    // Insertion-ordered map of matched directories (relative path -> name).
    let mut matched_dirs: Vec<String> = Vec::new();
    let mut window = Vec::new();
    let mut total_count = 0usize;
    let mut scanned = 0usize;
    let mut truncated = false;

    let scan_cap = listing.listing_config().search_scan_max;
    let mut continuation_token = None;
    'scan: loop {
        let page = listing
            .store()
            .list_page(
                &ListRequest {
                    prefix: prefix.clone(),
                    continuation_token,
                    ..Default::default()
                },
                &ctx.cancel,
            )
            .await?;
        for object in page.objects {
            if scanned >= scan_cap {
                truncated = true;
                break 'scan;
            }
            scanned += 1;

            let relative = object
                .key
                .strip_prefix(&ctx.owner.key_prefix())
                .unwrap_or(&object.key)
                .to_string();
            if relative == ".secure" || relative.starts_with(".secure/") {
                continue;
            }

            let visible = encrypted_memo
                .allowed(
                    listing,
                    ctx,
                    &encrypted,
                    SessionKind::Encrypted,
                    ctx.folder_session.as_deref(),
                    &relative,
                )
                .await?
                && hidden_memo
                    .allowed(
                        listing,
                        ctx,
                        &hidden,
                        SessionKind::Hidden,
                        ctx.hidden_session.as_deref(),
                        &relative,
                    )
                    .await?;
            if !visible {
                continue;
            }

            // Directory-name matches: every enclosing directory of the key,
            // relative to the search base, tested once.
            for ancestor in utils::path::ancestors(&relative) {
                if base.is_empty() || ancestor.len() > base.len() {
                    let name = utils::path::file_name(ancestor);
                    if name.to_lowercase().contains(&query)
                        && !matched_dirs.iter().any(|d| d == ancestor)
                    {
                        matched_dirs.push(ancestor.to_string());
                    }
                }
            }

            let name = utils::path::file_name(&relative);
            if name == EMPTY_FOLDER_PLACEHOLDER {
                continue;
            }
            if !name.to_lowercase().contains(&query) {
                continue;
            }
            if let Some(wanted_ext) = &extension {
                match utils::path::extension(&relative) {
                    Some(ext) if &ext == wanted_ext => {}
                    _ => continue,
                }
            }

            if total_count >= request.skip && total_count < request.skip + take {
                window.push(object);
            }
            total_count += 1;
        }
        match page.next_continuation_token {
            Some(token) => continuation_token = Some(token),
            None => break,
        }
    }
    if truncated {
        tracing::debug!(
            "search for {} hit the scan cap at {scanned} keys",
            ctx.owner
        );
    }

    let mut objects = Vec::with_capacity(window.len());
    for object in &window {
        objects.push(listing.build_object_record(ctx, object, false).await?);
    }

    let total_directory_count = matched_dirs.len();
    let mut directories = Vec::with_capacity(matched_dirs.len());
    for dir_path in &matched_dirs {
        let flags = listing
            .directories()
            .classify(ctx, dir_path, &encrypted, &hidden)
            .await?;
        directories.push(DirectoryRecord {
            name: utils::path::file_name(dir_path).to_string(),
            prefix: dir_path.clone(),
            is_encrypted: flags.is_encrypted,
            is_locked: flags.is_locked,
            is_hidden: flags.is_hidden,
            is_concealed: flags.is_concealed,
            thumbnails: Vec::new(),
        });
    }

    Ok(SearchResults {
        objects,
        directories,
        total_count,
        total_directory_count,
        truncated,
    })
}
