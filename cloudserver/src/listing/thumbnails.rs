//! Directory thumbnail aggregation.
//!
//! A directory's thumbnails are up to four image objects sampled across its
//! immediate sub-folders: images are bucketed by their first path segment
//! under the directory (at most four buckets, four images each), then the
//! final four are drawn round-robin across the buckets so one giant
//! sub-folder cannot monopolize the preview.

use object_gateway::{ListRequest, ListedObject};

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::listing::ListingService;
use crate::model::ObjectRecord;
use crate::{cache_keys, is_internal_key, metadata};

const MAX_THUMBNAILS: usize = 4;
const MAX_GROUPS: usize = 4;
const MAX_PER_GROUP: usize = 4;

/// Bucket images by first path segment and sample round-robin.
/// Input order is preserved within each bucket.
fn sample_round_robin(images: &[(String, ListedObject)]) -> Vec<ListedObject> {
    let mut groups: Vec<(String, Vec<ListedObject>)> = Vec::new();
    for (group_name, object) in images {
        match groups.iter_mut().find(|(name, _)| name == group_name) {
            Some((_, bucket)) => {
                if bucket.len() < MAX_PER_GROUP {
                    bucket.push(object.clone());
                }
            }
            None => {
                if groups.len() < MAX_GROUPS {
                    groups.push((group_name.clone(), vec![object.clone()]));
                }
            }
        }
    }

    let mut sampled = Vec::new();
    let mut round = 0;
    while sampled.len() < MAX_THUMBNAILS {
        let mut picked_any = false;
        for (_, bucket) in &groups {
            if let Some(object) = bucket.get(round) {
                sampled.push(object.clone());
                picked_any = true;
                if sampled.len() == MAX_THUMBNAILS {
                    break;
                }
            }
        }
        if !picked_any {
            break;
        }
        round += 1;
    }
    sampled
}

fn is_full(groups: &[(String, usize)]) -> bool {
    groups.len() >= MAX_GROUPS && groups.iter().all(|(_, n)| *n >= MAX_PER_GROUP)
}

/// Up to four thumbnail records for a directory, cached per owner/prefix and
/// URL flavor. The cache TTL is bounded by the presign expiry so cached
/// signed URLs never outlive their signature.
pub async fn directory_thumbnails(
    listing: &ListingService,
    ctx: &RequestContext,
    dir_path: &str,
) -> Result<Vec<ObjectRecord>, ApiError> {
    let dir_path = utils::path::normalize_dir(dir_path);
    let signed = listing.presign_config().enabled;
    let cache_key = cache_keys::directory_thumbnails(&ctx.owner, &dir_path, signed);
    if let Some(cached) = listing
        .kv()
        .get_json::<Vec<ObjectRecord>>(&cache_key)
        .await?
    {
        return Ok(cached);
    }

    let prefix = if dir_path.is_empty() {
        ctx.owner.key_prefix()
    } else {
        format!("{}{}/", ctx.owner.key_prefix(), dir_path)
    };

    let mut images: Vec<(String, ListedObject)> = Vec::new();
    let mut group_fill: Vec<(String, usize)> = Vec::new();
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
            let relative = object
                .key
                .strip_prefix(&ctx.owner.key_prefix())
                .unwrap_or(&object.key)
                .to_string();
            if is_internal_key(&relative) {
                continue;
            }
            let Some(ext) = utils::path::extension(&relative) else {
                continue;
            };
            if !metadata::is_image_extension(&ext) {
                continue;
            }

            let under = &object.key[prefix.len()..];
            let group = match under.find('/') {
                Some(idx) => under[..idx].to_string(),
                None => String::new(),
            };
            match group_fill.iter_mut().find(|(name, _)| *name == group) {
                Some((_, count)) => {
                    if *count >= MAX_PER_GROUP {
                        continue;
                    }
                    *count += 1;
                }
                None => {
                    if group_fill.len() >= MAX_GROUPS {
                        continue;
                    }
                    group_fill.push((group.clone(), 1));
                }
            }
            images.push((group, object));
            if is_full(&group_fill) {
                break 'scan;
            }
        }
        match page.next_continuation_token {
            Some(token) => continuation_token = Some(token),
            None => break,
        }
    }

    let sampled = sample_round_robin(&images);
    let mut records = Vec::with_capacity(sampled.len());
    for object in &sampled {
        records.push(listing.build_object_record(ctx, object, false).await?);
    }

    listing
        .kv()
        .set_json(&cache_key, &records, Some(listing.thumbnail_cache_ttl()))
        .await?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn obj(key: &str) -> ListedObject {
        ListedObject {
            key: key.to_string(),
            size: 1,
            etag: "\"e\"".to_string(),
            last_modified: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn round_robin_spreads_across_groups() {
        let images = vec![
            ("a".to_string(), obj("a/1.png")),
            ("a".to_string(), obj("a/2.png")),
            ("a".to_string(), obj("a/3.png")),
            ("b".to_string(), obj("b/1.png")),
            ("c".to_string(), obj("c/1.png")),
        ];
        let sampled = sample_round_robin(&images);
        let keys: Vec<_> = sampled.iter().map(|o| o.key.as_str()).collect();
        // one from each group first, then a second pass over `a`
        assert_eq!(keys, vec!["a/1.png", "b/1.png", "c/1.png", "a/2.png"]);
    }

    #[test]
    fn single_group_yields_up_to_four() {
        let images: Vec<_> = (1..=6)
            .map(|i| ("a".to_string(), obj(&format!("a/{i}.png"))))
            .collect();
        let sampled = sample_round_robin(&images);
        assert_eq!(sampled.len(), 4);
    }

    #[test]
    fn empty_input_is_empty() {
        assert!(sample_round_robin(&[]).is_empty());
    }
}
