//! User-metadata codec and image dimension extraction.
//!
//! S3-compatible providers restrict user metadata to ASCII header values and
//! lowercase keys; anything outside that gets mangled or rejected outright.
//! The codec therefore stores non-ASCII values base64-encoded behind a `b64:`
//! prefix and restores them (plus PascalCase keys) on the way out.

use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;

use anyhow::Context as _;
use futures::TryStreamExt;
use object_gateway::{
    CopyOptions, GenericObjectStore, MetadataDirective, PutOptions, StorageMetadata,
};
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;

const B64_PREFIX: &str = "b64:";

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

pub fn is_image_extension(ext: &str) -> bool {
    IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
}

/// Mime type for a key: stored content type first, extension lookup second,
/// octet-stream last.
pub fn mime_type_for(key: &str, stored: Option<&str>) -> String {
    if let Some(stored) = stored {
        if !stored.is_empty() {
            return stored.to_string();
        }
    }
    utils::path::extension(key)
        .and_then(|ext| mime_guess::from_ext(&ext).first_raw())
        .unwrap_or("application/octet-stream")
        .to_string()
}

fn sanitize_key(key: &str) -> String {
    key.to_ascii_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '-' => c,
            _ => '-',
        })
        .collect()
}

fn sanitize_value(value: &str) -> String {
    let flattened = value
        .replace(['\r', '\n'], " ")
        .trim()
        .to_string();
    if flattened.is_ascii() {
        flattened
    } else {
        format!("{B64_PREFIX}{}", base64::encode(flattened.as_bytes()))
    }
}

/// `content-kind` -> `ContentKind`; underscores count as word breaks too.
fn pascalize(key: &str) -> String {
    key.split(['-', '_'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Prepare caller-supplied metadata for storage.
pub fn sanitize_for_store(metadata: &BTreeMap<String, String>) -> HashMap<String, String> {
    metadata
        .iter()
        .map(|(k, v)| (sanitize_key(k), sanitize_value(v)))
        .collect()
}

fn decode_value(value: &str) -> String {
    match value.strip_prefix(B64_PREFIX) {
        Some(encoded) => match base64::decode(encoded) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => value.to_string(),
        },
        None => value.to_string(),
    }
}

/// Reverse of [`sanitize_for_store`] for records returned to callers.
pub fn decode_from_store(metadata: &StorageMetadata) -> BTreeMap<String, String> {
    metadata
        .0
        .iter()
        .map(|(k, v)| (pascalize(k), decode_value(v)))
        .collect()
}

/// Probe an uploaded image for its dimensions and merge `width`/`height`
/// into the stored metadata.
///
/// The write-back happens twice: a full `put` with the body, then a `copy`
/// with REPLACE. Some providers drop user metadata during an in-place copy
/// and others during a body rewrite, so both paths are exercised.
pub async fn process_image(
    store: &GenericObjectStore,
    key: &str,
    cancel: &CancellationToken,
) -> Result<(), ApiError> {
    let body = store.get(key, None, cancel).await?;
    let content_type = body.content_type.clone();
    let mut metadata = body.metadata.0.clone();

    let buf: Vec<u8> = body
        .stream
        .try_fold(Vec::with_capacity(body.size as usize), |mut acc, chunk| {
            acc.extend_from_slice(&chunk);
            async move { Ok(acc) }
        })
        .await
        .context("read image body")
        .map_err(ApiError::Internal)?;

    let (width, height) = match image::ImageReader::new(Cursor::new(&buf))
        .with_guessed_format()
        .ok()
        .and_then(|reader| reader.into_dimensions().ok())
    {
        Some(dims) => dims,
        None => {
            tracing::debug!("could not decode dimensions for {key}, skipping");
            return Ok(());
        }
    };

    metadata.insert("width".to_string(), width.to_string());
    metadata.insert("height".to_string(), height.to_string());
    let metadata = StorageMetadata(metadata);

    let size = buf.len() as u64;
    let body_stream = futures::stream::once({
        let data = bytes::Bytes::from(buf);
        async move { Ok(data) }
    });
    store
        .put(
            key,
            body_stream,
            size,
            &PutOptions {
                content_type: content_type.clone(),
                metadata: Some(metadata.clone()),
            },
            cancel,
        )
        .await?;
    store
        .copy(
            key,
            key,
            &CopyOptions {
                directive: MetadataDirective::Replace,
                content_type,
                metadata: Some(metadata),
            },
            cancel,
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_lowercased_and_cleaned() {
        let mut input = BTreeMap::new();
        input.insert("Content Kind".to_string(), "photo".to_string());
        input.insert("Née.Name".to_string(), "x".to_string());
        let out = sanitize_for_store(&input);
        assert_eq!(out.get("content-kind").map(String::as_str), Some("photo"));
        // non-ascii key bytes are replaced, one dash per character
        assert!(out.keys().all(|k| k.chars().all(|c| matches!(
            c,
            'a'..='z' | '0'..='9' | '_' | '-'
        ))));
    }

    #[test]
    fn non_ascii_values_roundtrip_via_b64() {
        let mut input = BTreeMap::new();
        input.insert("title".to_string(), "schöne Grüße".to_string());
        let stored = sanitize_for_store(&input);
        let raw = stored.get("title").unwrap();
        assert!(raw.starts_with(B64_PREFIX));

        let decoded = decode_from_store(&StorageMetadata(stored));
        assert_eq!(
            decoded.get("Title").map(String::as_str),
            Some("schöne Grüße")
        );
    }

    #[test]
    fn values_are_flattened_and_trimmed() {
        let mut input = BTreeMap::new();
        input.insert("note".to_string(), "  line1\r\nline2  ".to_string());
        let stored = sanitize_for_store(&input);
        assert_eq!(stored.get("note").map(String::as_str), Some("line1 line2"));
    }

    #[test]
    fn pascalize_key_shapes() {
        assert_eq!(pascalize("content-kind"), "ContentKind");
        assert_eq!(pascalize("width"), "Width");
        assert_eq!(pascalize("a_b-c"), "ABC");
    }

    #[test]
    fn mime_fallback_chain() {
        assert_eq!(mime_type_for("a/b.png", None), "image/png");
        assert_eq!(mime_type_for("a/b.png", Some("image/webp")), "image/webp");
        assert_eq!(mime_type_for("a/noext", None), "application/octet-stream");
    }

    #[test]
    fn image_extension_set() {
        assert!(is_image_extension("JPG"));
        assert!(!is_image_extension("zip"));
    }
}
