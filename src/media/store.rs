//! Media document resolution
//!
//! The document store itself is external; [`MediaStore`] is the seam the
//! dispatcher resolves media names through. [`MemoryMediaStore`] backs the
//! test suite and single-process deployments.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::name::MediaName;
use crate::error::{Error, Result};

/// A media document: whether it may stream, and its attachments in
/// declaration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDoc {
    pub streamable: bool,
    pub attachments: Vec<String>,
}

/// A fully resolved media reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedia {
    pub db: String,
    pub doc: String,
    pub attachment: String,
}

/// External document store seam
#[async_trait]
pub trait MediaStore: Send + Sync + 'static {
    /// Fetch the document `doc` from database `db`
    async fn lookup(&self, db: &str, doc: &str) -> Result<Option<MediaDoc>>;
}

/// In-memory document store
#[derive(Default)]
pub struct MemoryMediaStore {
    docs: RwLock<HashMap<(String, String), MediaDoc>>,
}

impl MemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document
    pub fn insert(&self, db: impl Into<String>, doc: impl Into<String>, media: MediaDoc) {
        self.docs
            .write()
            .expect("media store lock poisoned")
            .insert((db.into(), doc.into()), media);
    }
}

#[async_trait]
impl MediaStore for MemoryMediaStore {
    async fn lookup(&self, db: &str, doc: &str) -> Result<Option<MediaDoc>> {
        Ok(self
            .docs
            .read()
            .expect("media store lock poisoned")
            .get(&(db.to_string(), doc.to_string()))
            .cloned())
    }
}

/// Resolve a raw media name to `(db, doc, attachment)`
///
/// A missing or unparsable name and a missing document resolve to
/// [`Error::NotFound`]; a document that is not streamable or has no
/// attachments resolves to [`Error::NoData`]. An explicit attachment must
/// exist on the document; otherwise the first declared attachment wins.
pub async fn resolve(store: &dyn MediaStore, default_db: &str, raw: &str) -> Result<ResolvedMedia> {
    let name = MediaName::parse(raw).ok_or(Error::NotFound)?;
    let db = name.db.unwrap_or_else(|| default_db.to_string());
    let doc = store.lookup(&db, &name.doc).await?.ok_or(Error::NotFound)?;
    if !doc.streamable || doc.attachments.is_empty() {
        return Err(Error::NoData);
    }
    let attachment = match name.attachment {
        Some(explicit) => {
            if !doc.attachments.contains(&explicit) {
                return Err(Error::NotFound);
            }
            explicit
        }
        None => doc.attachments[0].clone(),
    };
    Ok(ResolvedMedia {
        db,
        doc: name.doc,
        attachment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_doc(streamable: bool, attachments: &[&str]) -> MemoryMediaStore {
        let store = MemoryMediaStore::new();
        store.insert(
            "media",
            "greeting.wav",
            MediaDoc {
                streamable,
                attachments: attachments.iter().map(|a| a.to_string()).collect(),
            },
        );
        store
    }

    #[tokio::test]
    async fn test_resolve_first_attachment() {
        let store = store_with_doc(true, &["a.wav", "b.wav"]);
        let media = resolve(&store, "media", "greeting.wav").await.unwrap();

        assert_eq!(media.db, "media");
        assert_eq!(media.doc, "greeting.wav");
        assert_eq!(media.attachment, "a.wav");
    }

    #[tokio::test]
    async fn test_resolve_explicit_attachment() {
        let store = store_with_doc(true, &["a.wav", "b.wav"]);
        let media = resolve(&store, "media", "media/greeting.wav/b.wav")
            .await
            .unwrap();
        assert_eq!(media.attachment, "b.wav");

        let missing = resolve(&store, "media", "media/greeting.wav/c.wav").await;
        assert!(matches!(missing, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn test_resolve_missing_doc() {
        let store = MemoryMediaStore::new();
        assert!(matches!(
            resolve(&store, "media", "nothing.wav").await,
            Err(Error::NotFound)
        ));
        assert!(matches!(
            resolve(&store, "media", "").await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_resolve_no_data() {
        let unstreamable = store_with_doc(false, &["a.wav"]);
        assert!(matches!(
            resolve(&unstreamable, "media", "greeting.wav").await,
            Err(Error::NoData)
        ));

        let empty = store_with_doc(true, &[]);
        assert!(matches!(
            resolve(&empty, "media", "greeting.wav").await,
            Err(Error::NoData)
        ));
    }
}
