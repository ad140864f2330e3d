//! Short-lived memoization of authorization decisions.
//!
//! A [`DecisionSignature`] hashes everything a decision depends on, including the configuration
//! [`VersionVector`]. Changing any configuration record the decision read produces a different
//! signature, so stale entries are never served; they simply age out.

use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::{Decision, DecisionCacheTtlMs, MeteringError, RequestContext, Scope, Usage};

/// Operation a cached decision was produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Evaluate only.
    Authorize,
    /// Evaluate, then record usage when authorized.
    Authrep,
}

impl OperationKind {
    /// Name folded into signatures.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Authorize => "authorize",
            OperationKind::Authrep => "authrep",
        }
    }
}

/// Versions of the configuration records a decision was computed from.
///
/// The service version also covers the service's usage limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VersionVector {
    /// Service version.
    pub service: u64,
    /// Application version, for application-scope calls.
    pub application: Option<u64>,
    /// User version, for user-scope calls.
    pub user: Option<u64>,
}

/// SHA-256 hex digest identifying one cacheable request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecisionSignature(String);

impl DecisionSignature {
    /// Signature over the operation, the normalized request and the configuration versions.
    ///
    /// Usage entries are hashed in request order.
    pub fn new(
        kind: OperationKind,
        scope: &Scope,
        usage: &Usage,
        context: &RequestContext,
        versions: &VersionVector,
    ) -> Self {
        let mut hasher = Sha256::new();

        field(&mut hasher, kind.as_str().as_bytes());
        field(&mut hasher, scope.kind().as_str().as_bytes());
        field(&mut hasher, scope.service_id().as_bytes());
        optional(&mut hasher, scope.instance_id().map(str::as_bytes));
        optional(&mut hasher, context.credential.as_deref().map(str::as_bytes));
        optional(&mut hasher, context.referrer.as_deref().map(str::as_bytes));

        hasher.update([
            u8::from(context.extensions.flat_usage),
            u8::from(context.extensions.no_body),
        ]);

        hasher.update((usage.len() as u64).to_le_bytes());
        for (metric, value) in usage.iter() {
            field(&mut hasher, metric.as_bytes());
            field(&mut hasher, value.to_string().as_bytes());
        }

        hasher.update(versions.service.to_le_bytes());
        for version in [versions.application, versions.user] {
            match version {
                Some(version) => {
                    hasher.update([1]);
                    hasher.update(version.to_le_bytes());
                }
                None => hasher.update([0]),
            }
        }

        Self(hex::encode(hasher.finalize()))
    }

    /// Hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn optional(hasher: &mut Sha256, bytes: Option<&[u8]>) {
    match bytes {
        Some(bytes) => {
            hasher.update([1]);
            field(hasher, bytes);
        }
        None => hasher.update([0]),
    }
}

#[derive(Debug, Clone)]
struct CachedDecision {
    decision: Decision,
    expires_at: Instant,
}

/// TTL cache of decisions keyed by [`DecisionSignature`].
///
/// Concurrent misses on the same signature may each compute the decision; the last insert wins.
#[derive(Debug)]
pub struct DecisionCache {
    entries: DashMap<DecisionSignature, CachedDecision>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for DecisionCache {
    fn default() -> Self {
        Self::new(DecisionCacheTtlMs::default())
    }
}

impl DecisionCache {
    /// Empty cache whose entries live for `ttl`.
    pub fn new(ttl: DecisionCacheTtlMs) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_millis(*ttl),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached decision for `signature`, if present and fresh.
    pub fn get(&self, signature: &DecisionSignature) -> Option<Decision> {
        let now = Instant::now();

        if let Some(entry) = self.entries.get(signature)
            && entry.expires_at > now
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.decision.clone());
        }

        self.entries
            .remove_if(signature, |_, entry| entry.expires_at <= now);
        self.misses.fetch_add(1, Ordering::Relaxed);

        None
    }

    /// Store `decision` under `signature`, replacing any previous entry.
    pub fn insert(&self, signature: DecisionSignature, decision: Decision) {
        self.entries.insert(
            signature,
            CachedDecision {
                decision,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Serve `signature` from the cache or compute and store it.
    ///
    /// Errors are returned as is and never cached.
    pub async fn get_or_compute<F, Fut>(
        &self,
        signature: DecisionSignature,
        compute: F,
    ) -> Result<Decision, MeteringError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Decision, MeteringError>>,
    {
        if let Some(decision) = self.get(&signature) {
            return Ok(decision);
        }

        let decision = compute().await?;
        self.insert(signature, decision.clone());

        Ok(decision)
    }

    /// Evict expired entries, returning how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();

        self.entries.retain(|_, entry| entry.expires_at > now);

        before.saturating_sub(self.entries.len())
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Entries currently held, fresh or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookups served from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that missed.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
