use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use section_settings_core::{SectionId, SectionNode, SettingsError};

/// Per-section read cache with a fixed time-to-live.
///
/// Entries are refreshed lazily on the first read after they expire. Writes
/// through the facade never touch the cache, so a cached reader may see a
/// value up to `ttl` old. A zero `ttl` disables caching.
#[derive(Debug)]
pub struct ReadCache {
    ttl: Duration,
    entries: Mutex<HashMap<SectionId, (Arc<SectionNode>, Instant)>>,
}

impl ReadCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    /// Return the cached node for `id` or load it with `fetch`.
    ///
    /// # Errors
    /// Returns whatever `fetch` returns; failed loads are not cached.
    pub fn get_or_fetch<F>(
        &self,
        id: SectionId,
        skip_cache: bool,
        fetch: F,
    ) -> Result<Option<Arc<SectionNode>>, SettingsError>
    where
        F: FnOnce() -> Result<Option<SectionNode>, SettingsError>,
    {
        self.get_or_fetch_at(id, skip_cache, Instant::now(), fetch)
    }

    /// [`Self::get_or_fetch`] evaluated at an explicit point in time.
    ///
    /// # Errors
    /// Returns whatever `fetch` returns.
    pub fn get_or_fetch_at<F>(
        &self,
        id: SectionId,
        skip_cache: bool,
        now: Instant,
        fetch: F,
    ) -> Result<Option<Arc<SectionNode>>, SettingsError>
    where
        F: FnOnce() -> Result<Option<SectionNode>, SettingsError>,
    {
        if !skip_cache && !self.ttl.is_zero() {
            if let Some((node, fetched_at)) = self.entries.lock().get(&id) {
                if now.saturating_duration_since(*fetched_at) < self.ttl {
                    return Ok(Some(Arc::clone(node)));
                }
            }
        }

        // The lock is not held across the fetch; two readers racing on an
        // expired entry both load and the later one wins.
        let Some(node) = fetch()? else {
            self.entries.lock().remove(&id);
            return Ok(None);
        };
        let node = Arc::new(node);
        if !self.ttl.is_zero() {
            self.entries.lock().insert(id, (Arc::clone(&node), now));
        }
        Ok(Some(node))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
