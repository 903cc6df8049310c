//! Identity matching contract.
//!
//! The pipeline only sees [`IdentityMatcher`]: hand it an embedding, get
//! back the best enrolled identity or nothing. [`best_match`] is the
//! cosine gallery comparison concrete matchers build on.

use crate::types::{Embedding, Identity, MatchResult};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("matcher unavailable: {0}")]
    Unavailable(String),
    #[error("malformed embedding: {0}")]
    MalformedEmbedding(String),
}

/// Resolves a face embedding to an enrolled identity.
#[async_trait]
pub trait IdentityMatcher: Send + Sync {
    /// `Ok(None)` when no identity clears the matcher's threshold.
    async fn find_match(&self, embedding: &Embedding) -> Result<Option<MatchResult>, MatchError>;
}

/// Compare a query against every gallery entry and return the best one
/// if its cosine similarity reaches `threshold`.
///
/// Every entry is visited; there is no early exit on a good score.
/// Entries whose dimension differs from the query are skipped with a
/// warning, and a query matching no entry's dimension is rejected.
pub fn best_match(
    query: &Embedding,
    gallery: &[Identity],
    threshold: f32,
) -> Result<Option<MatchResult>, MatchError> {
    if !query.is_well_formed() {
        return Err(MatchError::MalformedEmbedding(format!(
            "{}-dim vector is empty or has non-finite components",
            query.dim()
        )));
    }

    let mut best_sim = f32::NEG_INFINITY;
    let mut best_idx: Option<usize> = None;
    let mut comparable = 0usize;

    for (i, identity) in gallery.iter().enumerate() {
        if identity.embedding.dim() != query.dim() {
            tracing::warn!(
                identity = %identity.id,
                expected = query.dim(),
                actual = identity.embedding.dim(),
                "gallery entry has mismatched embedding dimension"
            );
            continue;
        }
        comparable += 1;
        let sim = query.similarity(&identity.embedding);
        if sim > best_sim {
            best_sim = sim;
            best_idx = Some(i);
        }
    }

    if !gallery.is_empty() && comparable == 0 {
        return Err(MatchError::MalformedEmbedding(format!(
            "{}-dim query does not match any enrolled embedding",
            query.dim()
        )));
    }

    Ok(match best_idx {
        Some(idx) if best_sim >= threshold => {
            let identity = &gallery[idx];
            Some(MatchResult {
                identity_id: identity.id.clone(),
                display_name: identity.display_name.clone(),
                avatar_ref: identity.avatar_ref.clone(),
                similarity: best_sim.clamp(0.0, 1.0),
            })
        }
        _ => None,
    })
}
