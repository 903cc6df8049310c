//! Registry-backed identity matcher.
//!
//! Holds an in-memory copy of the enrolled gallery and compares every
//! query against it. The copy is refreshed from the registry on an
//! interval so enrollments made through the CLI show up without a restart.

use async_trait::async_trait;
use noel_core::{best_match, Embedding, Identity, IdentityMatcher, MatchError, MatchResult};
use noel_store::{IdentityRegistry, StorageError};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct GalleryMatcher {
    registry: Arc<dyn IdentityRegistry>,
    gallery: RwLock<Option<Arc<Vec<Identity>>>>,
    threshold: f32,
}

impl GalleryMatcher {
    pub fn new(registry: Arc<dyn IdentityRegistry>, threshold: f32) -> Self {
        Self {
            registry,
            gallery: RwLock::new(None),
            threshold,
        }
    }

    /// Reload the gallery from the registry. On failure the previous
    /// gallery (if any) stays in place.
    pub async fn refresh(&self) -> Result<usize, StorageError> {
        let identities = self.registry.list_identities().await?;
        let count = identities.len();
        *self.gallery.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(identities));
        tracing::debug!(identities = count, "gallery refreshed");
        Ok(count)
    }

    pub fn spawn_refresh(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // First tick completes immediately; the initial load is done by the caller.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh().await {
                    tracing::warn!(error = %e, "gallery refresh failed; keeping previous gallery");
                }
            }
        })
    }

    fn current(&self) -> Option<Arc<Vec<Identity>>> {
        self.gallery
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl IdentityMatcher for GalleryMatcher {
    async fn find_match(&self, embedding: &Embedding) -> Result<Option<MatchResult>, MatchError> {
        let gallery = self
            .current()
            .ok_or_else(|| MatchError::Unavailable("gallery not loaded".into()))?;
        best_match(embedding, &gallery, self.threshold)
    }
}
