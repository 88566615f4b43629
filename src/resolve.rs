//! URL-driven rotation: resolve a page by URL, then select for rotator pages.
//!
//! [`RotationService`] is the request path without HTTP: validate, look the URL up
//! through a [`ResolutionCache`] (falling back to the [`PageDirectory`]), and run the
//! engine when the page is a rotator. The cache only ever affects latency: a cache error
//! is logged and treated as a miss.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::{ContentKey, Engine, EngineError, PageDirectory, Selection, Store, StoreError};

/// Default lifetime of a cached URL resolution.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
/// Default maximum number of cached URL resolutions.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// What a URL resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResolvedPage {
    pub page_id: String,
    pub is_rotator: bool,
}

/// URL → page lookup.
pub trait PageResolver: Send + Sync {
    fn resolve_url(&self, url: &str) -> Result<Option<ResolvedPage>, StoreError>;
}

impl<T: PageDirectory + ?Sized> PageResolver for T {
    fn resolve_url(&self, url: &str) -> Result<Option<ResolvedPage>, StoreError> {
        Ok(self
            .page_by_url_key(&ContentKey::of(url))?
            .map(|p| ResolvedPage {
                page_id: p.page_id,
                is_rotator: p.is_rotator,
            }))
    }
}

/// Short-lived mapping from a URL key to its resolution.
///
/// Implementations may drop entries at any time.
pub trait ResolutionCache: Send + Sync {
    fn get(&self, url_key: &ContentKey) -> Result<Option<ResolvedPage>, StoreError>;
    fn put(&self, url_key: ContentKey, page: ResolvedPage) -> Result<(), StoreError>;
    /// Drop every entry.
    fn flush(&self) -> Result<(), StoreError>;
}

/// Cache that never holds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl ResolutionCache for NoCache {
    fn get(&self, _url_key: &ContentKey) -> Result<Option<ResolvedPage>, StoreError> {
        Ok(None)
    }

    fn put(&self, _url_key: ContentKey, _page: ResolvedPage) -> Result<(), StoreError> {
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

type Entries = HashMap<ContentKey, (Instant, ResolvedPage)>;

/// In-process cache with a fixed time-to-live per entry and a bounded size.
///
/// A `put` into a full cache first sweeps expired entries, then evicts the oldest
/// remaining one if the cache is still full.
#[derive(Debug)]
pub struct TtlCache {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<Entries>,
}

impl TtlCache {
    /// Cache holding at most [`DEFAULT_CACHE_CAPACITY`] entries.
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_CACHE_CAPACITY)
    }

    /// Cache holding at most `capacity` entries (minimum 1).
    pub fn with_capacity(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("resolution cache mutex poisoned".to_string()))
    }
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl ResolutionCache for TtlCache {
    fn get(&self, url_key: &ContentKey) -> Result<Option<ResolvedPage>, StoreError> {
        let mut entries = self.lock()?;
        let hit = entries
            .get(url_key)
            .map(|(at, page)| (at.elapsed() < self.ttl, page.clone()));
        match hit {
            Some((true, page)) => Ok(Some(page)),
            Some((false, _)) => {
                entries.remove(url_key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn put(&self, url_key: ContentKey, page: ResolvedPage) -> Result<(), StoreError> {
        let mut entries = self.lock()?;
        if entries.len() >= self.capacity && !entries.contains_key(&url_key) {
            entries.retain(|_, (at, _)| at.elapsed() < self.ttl);
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, (at, _))| *at)
                    .map(|(k, _)| k.clone());
                if let Some(k) = oldest {
                    entries.remove(&k);
                }
            }
        }
        entries.insert(url_key, (Instant::now(), page));
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.lock()?.clear();
        Ok(())
    }
}

/// Outcome of [`RotationService::rotate`].
#[derive(Debug, Clone)]
pub enum Rotation {
    /// The URL is a rotator; a variant was selected.
    Variant {
        rotator_id: String,
        selection: Selection,
    },
    /// The URL is a plain page, served as-is.
    Static { page_id: String },
}

impl Rotation {
    /// The page to render: the chosen variant's id, or the static page's id.
    pub fn served_id(&self) -> &str {
        match self {
            Rotation::Variant { selection, .. } => selection.variant().as_str(),
            Rotation::Static { page_id } => page_id,
        }
    }
}

/// Engine plus URL resolution.
#[derive(Debug)]
pub struct RotationService<S: ?Sized, C = TtlCache> {
    engine: Engine<S>,
    cache: C,
}

impl<S> RotationService<S, TtlCache>
where
    S: Store + PageDirectory + ?Sized,
{
    /// Service with a [`TtlCache`] of [`DEFAULT_CACHE_TTL`].
    pub fn new(engine: Engine<S>) -> Self {
        Self::with_cache(engine, TtlCache::default())
    }
}

impl<S, C> RotationService<S, C>
where
    S: Store + PageDirectory + ?Sized,
    C: ResolutionCache,
{
    pub fn with_cache(engine: Engine<S>, cache: C) -> Self {
        Self { engine, cache }
    }

    pub fn engine(&self) -> &Engine<S> {
        &self.engine
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Resolve `url` and, for a rotator, select a variant for `campaign`.
    pub fn rotate(&self, url: &str, campaign: &str) -> Result<Rotation, EngineError> {
        self.rotate_with(&mut rand::rng(), url, campaign)
    }

    /// [`rotate`](Self::rotate) with an explicit RNG.
    pub fn rotate_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        url: &str,
        campaign: &str,
    ) -> Result<Rotation, EngineError> {
        let url = url.trim();
        let campaign = campaign.trim();
        if url.is_empty() {
            return Err(EngineError::invalid("url", "empty"));
        }
        if campaign.is_empty() {
            return Err(EngineError::invalid("campaign", "empty"));
        }

        let page = self.resolve(url)?;
        if !page.is_rotator {
            return Ok(Rotation::Static {
                page_id: page.page_id,
            });
        }
        let selection = self.engine.select_variant_with(rng, &page.page_id, campaign)?;
        Ok(Rotation::Variant {
            rotator_id: page.page_id,
            selection,
        })
    }

    /// Drop every cached resolution.
    pub fn flush_cache(&self) -> Result<(), StoreError> {
        self.cache.flush()
    }

    fn resolve(&self, url: &str) -> Result<ResolvedPage, EngineError> {
        let url_key = ContentKey::of(url);
        match self.cache.get(&url_key) {
            Ok(Some(page)) => {
                debug!(url, page = %page.page_id, "resolution cache hit");
                return Ok(page);
            }
            Ok(None) => {}
            Err(e) => warn!(url, error = %e, "resolution cache read failed"),
        }

        let page = self
            .engine
            .store()
            .resolve_url(url)?
            .ok_or_else(|| EngineError::NotFound {
                entity: "page",
                key: url.to_string(),
            })?;
        if let Err(e) = self.cache.put(url_key, page.clone()) {
            warn!(url, error = %e, "resolution cache write failed");
        }
        Ok(page)
    }
}
