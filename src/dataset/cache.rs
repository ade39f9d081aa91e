//! Dataset cache with single-flight fill
//!
//! Each source key owns one `OnceCell`. Concurrent callers for an uncached
//! key all wait on the same fill, so the source is read and parsed once.
//! Failed fills are shared by the callers that waited on them and then
//! dropped, so a later call reads the source again.

use crate::dataset::source::{AutoParser, FileSource, TableParser, TabularSource};
use crate::dataset::Dataset;
use crate::error::LoadError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

type Slot = Arc<OnceCell<Result<Dataset, LoadError>>>;

pub struct DatasetCache {
    source: Arc<dyn TabularSource>,
    parser: Arc<dyn TableParser>,
    required_columns: Vec<String>,
    revalidate: bool,
    entries: DashMap<String, Slot>,
    fills: AtomicUsize,
}

impl DatasetCache {
    pub fn new(source: Arc<dyn TabularSource>, parser: Arc<dyn TableParser>) -> Self {
        Self {
            source,
            parser,
            required_columns: Vec::new(),
            revalidate: false,
            entries: DashMap::new(),
            fills: AtomicUsize::new(0),
        }
    }

    /// Files on disk, parser chosen by extension.
    pub fn for_files() -> Self {
        Self::new(Arc::new(FileSource), Arc::new(AutoParser::default()))
    }

    /// Columns every loaded table must contain.
    pub fn with_required_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Reload a key when the source reports a different modification stamp.
    pub fn with_revalidation(mut self, revalidate: bool) -> Self {
        self.revalidate = revalidate;
        self
    }

    /// Return the table for `key`, reading and parsing it on first use.
    pub async fn load(&self, key: &str) -> Result<Dataset, LoadError> {
        if self.revalidate {
            self.drop_if_stale(key);
        }

        let slot: Slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        if let Some(result) = slot.get() {
            debug!("Dataset cache hit for {}", key);
            return result.clone();
        }

        let result = slot.get_or_init(|| self.fill(key)).await.clone();

        if let Err(ref e) = result {
            warn!("Loading {} failed: {}", key, e);
            self.entries.remove_if(key, |_, current| Arc::ptr_eq(current, &slot));
        }
        result
    }

    /// Already-loaded table for `key`, without touching the source.
    pub fn cached(&self, key: &str) -> Option<Dataset> {
        self.entries
            .get(key)
            .and_then(|slot| slot.get().and_then(|r| r.as_ref().ok().cloned()))
    }

    /// Forget `key`; the next `load` reads the source again.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            info!("Invalidated cached dataset {}", key);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of fills (source read + parse) performed so far.
    pub fn fill_count(&self) -> usize {
        self.fills.load(Ordering::SeqCst)
    }

    fn drop_if_stale(&self, key: &str) {
        if let Some(cached) = self.cached(key) {
            let current = self.source.version(key);
            if current.is_some() && current != cached.version() {
                info!("Source {} changed since it was loaded; reloading", key);
                self.entries.remove(key);
            }
        }
    }

    async fn fill(&self, key: &str) -> Result<Dataset, LoadError> {
        self.fills.fetch_add(1, Ordering::SeqCst);
        let started = std::time::Instant::now();

        let source = Arc::clone(&self.source);
        let parser = Arc::clone(&self.parser);
        let owned_key = key.to_string();

        let (frame, version) = tokio::task::spawn_blocking(move || {
            let version = source.version(&owned_key);
            let bytes = source
                .read(&owned_key)
                .map_err(|e| LoadError::unreadable(owned_key.as_str(), e.to_string()))?;
            let frame = parser.parse(&owned_key, bytes)?;
            Ok::<_, LoadError>((frame, version))
        })
        .await
        .map_err(|e| LoadError::malformed(key, format!("Loader task failed: {}", e)))??;

        let names: Vec<&str> = frame.get_column_names();
        let missing: Vec<&str> = self
            .required_columns
            .iter()
            .map(String::as_str)
            .filter(|required| !names.contains(required))
            .collect();
        if !missing.is_empty() {
            return Err(LoadError::schema_mismatch(
                key,
                format!("Missing required columns: {}", missing.join(", ")),
            ));
        }

        info!(
            "Loaded {} ({} rows x {} columns) in {} ms",
            key,
            frame.height(),
            frame.width(),
            started.elapsed().as_millis()
        );
        Ok(Dataset::new(key, frame, version))
    }
}
