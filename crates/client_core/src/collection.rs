use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Empty,
    CacheLoaded,
    NetworkSynced,
}

/// Where a live update lands when its key is not already in the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivePlacement {
    /// Moved to index 0 even when already present (most recently touched).
    Front,
    /// Kept in the collection's sort order.
    Sorted,
}

pub trait SyncEntity: Clone + Send + Sync + 'static {
    type Key: Clone + PartialEq + Debug + Send + Sync;

    fn key(&self) -> Self::Key;

    fn live_placement() -> LivePlacement;

    /// Restores the view's ordering after a merge. Server page order is kept
    /// by default.
    fn normalize(_items: &mut Vec<Self>) {}

    /// Entries that exist only on this device and survive a full refresh.
    fn is_local_only(&self) -> bool {
        false
    }
}

#[async_trait]
pub trait PageSource<T>: Send + Sync {
    async fn fetch_page(&self, offset: u32, limit: u32) -> ClientResult<Vec<T>>;
}

#[async_trait]
pub trait CacheTier<T>: Send + Sync {
    async fn load(&self) -> Result<Vec<T>>;
    async fn replace(&self, items: &[T]) -> Result<()>;
    async fn upsert(&self, item: &T) -> Result<()>;
}

pub struct MissingCache;

#[async_trait]
impl<T: Send + Sync + 'static> CacheTier<T> for MissingCache {
    async fn load(&self) -> Result<Vec<T>> {
        Ok(Vec::new())
    }

    async fn replace(&self, _items: &[T]) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, _item: &T) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSnapshot<T> {
    pub items: Vec<T>,
    pub phase: SyncPhase,
    pub has_more: bool,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl<T> CollectionSnapshot<T> {
    fn empty() -> Self {
        Self {
            items: Vec::new(),
            phase: SyncPhase::Empty,
            has_more: true,
            is_loading: false,
            error: None,
        }
    }
}

struct CollectionState<T> {
    items: Vec<T>,
    phase: SyncPhase,
    has_more: bool,
    next_offset: u32,
    refreshing: bool,
    paging: bool,
    error: Option<String>,
    closed: bool,
    // Bumped by `reset`; fetches started before it are discarded.
    generation: u64,
}

impl<T: Clone> CollectionState<T> {
    fn snapshot(&self) -> CollectionSnapshot<T> {
        CollectionSnapshot {
            items: self.items.clone(),
            phase: self.phase,
            has_more: self.has_more,
            is_loading: self.refreshing || self.paging,
            error: self.error.clone(),
        }
    }
}

/// One scope's ordered view, merged from the local cache, paged network
/// fetches and live events. Every mutation happens under `state` and is
/// published to subscribers before the lock is released.
pub struct SyncedCollection<T: SyncEntity> {
    scope: String,
    page_size: u32,
    source: Arc<dyn PageSource<T>>,
    cache: Arc<dyn CacheTier<T>>,
    state: Mutex<CollectionState<T>>,
    snapshot_tx: watch::Sender<CollectionSnapshot<T>>,
    started: AtomicBool,
}

impl<T: SyncEntity> SyncedCollection<T> {
    pub fn new(
        scope: impl Into<String>,
        page_size: u32,
        source: Arc<dyn PageSource<T>>,
        cache: Arc<dyn CacheTier<T>>,
    ) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(CollectionSnapshot::empty());
        Arc::new(Self {
            scope: scope.into(),
            page_size: page_size.max(1),
            source,
            cache,
            state: Mutex::new(CollectionState {
                items: Vec::new(),
                phase: SyncPhase::Empty,
                has_more: true,
                next_offset: 0,
                refreshing: false,
                paging: false,
                error: None,
                closed: false,
                generation: 0,
            }),
            snapshot_tx,
            started: AtomicBool::new(false),
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Continuous view updates. The first subscription primes the view from
    /// the cache and launches the initial network fetch in the background.
    pub fn subscribe(self: &Arc<Self>) -> WatchStream<CollectionSnapshot<T>> {
        let rx = self.snapshot_tx.subscribe();
        self.ensure_started();
        WatchStream::new(rx)
    }

    pub fn watch(self: &Arc<Self>) -> watch::Receiver<CollectionSnapshot<T>> {
        let rx = self.snapshot_tx.subscribe();
        self.ensure_started();
        rx
    }

    fn ensure_started(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let collection = Arc::clone(self);
        tokio::spawn(async move {
            collection.start().await;
        });
    }

    /// Cache priming followed by the first network fetch.
    pub async fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
        self.prime_from_cache().await;
        if let Err(err) = self.refresh().await {
            warn!(scope = %self.scope, "sync: initial fetch failed: {err}");
        }
    }

    pub fn snapshot(&self) -> CollectionSnapshot<T> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn items(&self) -> Vec<T> {
        self.snapshot_tx.borrow().items.clone()
    }

    pub async fn find(&self, key: &T::Key) -> Option<T> {
        let state = self.state.lock().await;
        state.items.iter().find(|item| &item.key() == key).cloned()
    }

    pub async fn prime_from_cache(&self) {
        let cached = match self.cache.load().await {
            Ok(cached) => cached,
            Err(err) => {
                warn!(scope = %self.scope, "sync: cache read failed, skipping priming: {err:#}");
                return;
            }
        };
        let mut state = self.state.lock().await;
        if state.closed || state.phase != SyncPhase::Empty {
            return;
        }
        // Entries that arrived before the cache read (live pushes, local
        // sends) win over their cached copies.
        let count = cached.len();
        for item in cached {
            let key = item.key();
            if !state.items.iter().any(|existing| existing.key() == key) {
                state.items.push(item);
            }
        }
        T::normalize(&mut state.items);
        debug!(scope = %self.scope, count, "sync: primed from cache");
        state.phase = SyncPhase::CacheLoaded;
        self.publish(&state);
    }

    /// Fetches the first page and makes it the authoritative view.
    pub async fn refresh(&self) -> ClientResult<()> {
        let generation = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(self.closed_error());
            }
            state.refreshing = true;
            self.publish(&state);
            state.generation
        };
        let fetched = self.source.fetch_page(0, self.page_size).await;
        self.finish_fetch(0, generation, fetched).await
    }

    /// Appends the next page. No-op while another page load is running or
    /// once the end has been reached.
    pub async fn load_next_page(&self) -> ClientResult<()> {
        let (offset, generation) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(self.closed_error());
            }
            if !state.has_more || state.paging {
                return Ok(());
            }
            state.paging = true;
            self.publish(&state);
            (state.next_offset, state.generation)
        };
        let fetched = self.source.fetch_page(offset, self.page_size).await;
        self.finish_fetch(offset, generation, fetched).await
    }

    async fn finish_fetch(
        &self,
        offset: u32,
        generation: u64,
        fetched: ClientResult<Vec<T>>,
    ) -> ClientResult<()> {
        match fetched {
            Ok(page) => self.merge_page(offset, page, Some(generation)).await,
            Err(err) => {
                let mut state = self.state.lock().await;
                clear_loading(&mut state, offset);
                if state.closed {
                    return Ok(());
                }
                if state.generation != generation {
                    self.publish(&state);
                    return Ok(());
                }
                state.error = Some(err.to_string());
                self.publish(&state);
                Err(err)
            }
        }
    }

    /// Merges a network page. Offset 0 replaces the view, keeping local-only
    /// entries; later offsets append. Applying the same page twice leaves the
    /// view unchanged.
    pub async fn apply_page(&self, offset: u32, page: Vec<T>) -> ClientResult<()> {
        self.merge_page(offset, page, None).await
    }

    async fn merge_page(
        &self,
        offset: u32,
        page: Vec<T>,
        generation: Option<u64>,
    ) -> ClientResult<()> {
        let received = page.len();
        let to_cache = {
            let mut state = self.state.lock().await;
            clear_loading(&mut state, offset);
            if state.closed {
                debug!(scope = %self.scope, "sync: discarding page for closed scope");
                return Ok(());
            }
            if generation.is_some_and(|generation| generation != state.generation) {
                debug!(scope = %self.scope, "sync: discarding page fetched before reset");
                self.publish(&state);
                return Ok(());
            }

            if offset == 0 {
                let mut items: Vec<T> = Vec::with_capacity(page.len());
                for item in page {
                    upsert_in_place(&mut items, item);
                }
                let local: Vec<T> = state
                    .items
                    .iter()
                    .filter(|item| item.is_local_only())
                    .cloned()
                    .collect();
                for item in local {
                    upsert_in_place(&mut items, item);
                }
                T::normalize(&mut items);
                state.items = items;
                state.next_offset = received as u32;
                state.phase = SyncPhase::NetworkSynced;
            } else {
                for item in page {
                    upsert_in_place(&mut state.items, item);
                }
                T::normalize(&mut state.items);
                state.next_offset = offset.saturating_add(received as u32);
                if state.phase == SyncPhase::Empty {
                    state.phase = SyncPhase::CacheLoaded;
                }
            }
            state.has_more = received as u32 >= self.page_size;
            state.error = None;
            self.publish(&state);

            (offset == 0).then(|| {
                state
                    .items
                    .iter()
                    .filter(|item| !item.is_local_only())
                    .cloned()
                    .collect::<Vec<T>>()
            })
        };

        if let Some(items) = to_cache {
            if let Err(err) = self.cache.replace(&items).await {
                warn!(scope = %self.scope, "sync: cache write failed: {err:#}");
            }
        }
        debug!(scope = %self.scope, offset, received, "sync: applied page");
        Ok(())
    }

    /// Merges a pushed entity without ever duplicating its key.
    pub async fn apply_live(&self, item: T) {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            match T::live_placement() {
                LivePlacement::Front => {
                    let key = item.key();
                    state.items.retain(|existing| existing.key() != key);
                    state.items.insert(0, item.clone());
                }
                LivePlacement::Sorted => {
                    upsert_in_place(&mut state.items, item.clone());
                    T::normalize(&mut state.items);
                }
            }
            self.publish(&state);
        }
        self.write_through(&item).await;
    }

    /// Applies `update` to the entry with `key`; returns the updated entry.
    pub async fn update_entry<F>(&self, key: &T::Key, update: F) -> Option<T>
    where
        F: FnOnce(&mut T),
    {
        let mut state = self.state.lock().await;
        if state.closed {
            return None;
        }
        let entry = state.items.iter_mut().find(|item| &item.key() == key)?;
        update(entry);
        let updated = entry.clone();
        self.publish(&state);
        Some(updated)
    }

    /// Appends a local entity to the tail of the view.
    pub async fn push_local(&self, item: T) -> ClientResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(self.closed_error());
        }
        upsert_in_place(&mut state.items, item);
        self.publish(&state);
        Ok(())
    }

    /// Swaps the entry under `old_key` for `replacement`, merging with an entry
    /// already holding the replacement's key.
    pub async fn replace_entry(&self, old_key: &T::Key, replacement: T) {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.items.retain(|item| &item.key() != old_key);
            upsert_in_place(&mut state.items, replacement.clone());
            T::normalize(&mut state.items);
            self.publish(&state);
        }
        self.write_through(&replacement).await;
    }

    async fn write_through(&self, item: &T) {
        if item.is_local_only() {
            return;
        }
        if let Err(err) = self.cache.upsert(item).await {
            warn!(scope = %self.scope, "sync: cache write failed: {err:#}");
        }
    }

    /// Forgets everything the view holds, e.g. when the session that owned it
    /// ends. The next subscription primes and fetches again.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.items.clear();
        state.phase = SyncPhase::Empty;
        state.has_more = true;
        state.next_offset = 0;
        state.error = None;
        state.generation = state.generation.wrapping_add(1);
        self.started.store(false, Ordering::SeqCst);
        self.publish(&state);
        debug!(scope = %self.scope, "sync: view reset");
    }

    /// Detaches the scope; late results are dropped.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    fn publish(&self, state: &CollectionState<T>) {
        self.snapshot_tx.send_replace(state.snapshot());
    }

    fn closed_error(&self) -> ClientError {
        ClientError::ScopeClosed(self.scope.clone())
    }
}

fn clear_loading<T>(state: &mut CollectionState<T>, offset: u32) {
    if offset == 0 {
        state.refreshing = false;
    } else {
        state.paging = false;
    }
}

fn upsert_in_place<T: SyncEntity>(items: &mut Vec<T>, item: T) {
    let key = item.key();
    match items.iter_mut().find(|existing| existing.key() == key) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

#[cfg(test)]
#[path = "tests/collection_tests.rs"]
mod tests;
