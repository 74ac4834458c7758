//! Content-addressable storage for product metadata documents.

use std::collections::HashMap;
use std::sync::RwLock;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use provenance_core::Metadata;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContentStoreError {
    #[error("content store unavailable: {0}")]
    Unavailable(String),

    #[error("content serialization failed: {0}")]
    Serialization(String),
}

/// Opaque content store. `put` returns a reference that `get` resolves.
pub trait ContentStore: Send + Sync {
    fn put(&self, document: &Metadata) -> Result<String, ContentStoreError>;

    fn get(&self, reference: &str) -> Result<Option<Metadata>, ContentStoreError>;
}

impl<C> ContentStore for std::sync::Arc<C>
where
    C: ContentStore + ?Sized,
{
    fn put(&self, document: &Metadata) -> Result<String, ContentStoreError> {
        (**self).put(document)
    }

    fn get(&self, reference: &str) -> Result<Option<Metadata>, ContentStoreError> {
        (**self).get(reference)
    }
}

/// In-process store addressing documents by the SHA-256 of their canonical JSON.
///
/// `Metadata` is key-ordered, so equal documents always hash to the same reference.
#[derive(Debug, Default)]
pub struct InMemoryContentStore {
    documents: RwLock<HashMap<String, Metadata>>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn address_of(document: &Metadata) -> Result<String, ContentStoreError> {
        let canonical =
            serde_json::to_vec(document).map_err(|e| ContentStoreError::Serialization(e.to_string()))?;
        Ok(format!("sha256:{}", hex::encode(Sha256::digest(&canonical))))
    }
}

impl ContentStore for InMemoryContentStore {
    fn put(&self, document: &Metadata) -> Result<String, ContentStoreError> {
        let reference = Self::address_of(document)?;
        let mut documents = self
            .documents
            .write()
            .map_err(|_| ContentStoreError::Unavailable("lock poisoned".to_string()))?;
        documents.entry(reference.clone()).or_insert_with(|| document.clone());
        debug!(reference = %reference, "content stored");
        Ok(reference)
    }

    fn get(&self, reference: &str) -> Result<Option<Metadata>, ContentStoreError> {
        let documents = self
            .documents
            .read()
            .map_err(|_| ContentStoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(documents.get(reference).cloned())
    }
}
