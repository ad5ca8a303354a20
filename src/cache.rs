//! Process-wide cache of catalog snapshots keyed by database URL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::catalog::{Catalog, SchemaError, SchemaLoader};

struct CachedCatalog {
    catalog: Arc<Catalog>,
    created_at: Instant,
}

type Cell = Arc<RwLock<Option<CachedCatalog>>>;

/// TTL'd catalog cache with an independent reader/writer lock per URL,
/// so one database's slow refresh never blocks another's lookups.
///
/// The read-to-write handoff is not atomic: two connections hitting an
/// expired entry may both load, and the later store wins. Catalog loads
/// are idempotent, so the duplicate work is the whole cost.
pub struct SchemaCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Cell>>,
}

impl SchemaCache {
    /// A `ttl` of zero means entries never expire.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached catalog for `url`, loading it through `loader`
    /// on a miss or after expiry.
    pub async fn get_or_load(
        &self,
        url: &str,
        loader: &dyn SchemaLoader,
    ) -> Result<Arc<Catalog>, SchemaError> {
        let cell = {
            let mut entries = self.entries.lock().await;
            entries.entry(url.to_string()).or_default().clone()
        };

        {
            let cached = cell.read().await;
            if let Some(entry) = cached.as_ref() {
                if self.ttl.is_zero() || entry.created_at.elapsed() < self.ttl {
                    return Ok(entry.catalog.clone());
                }
            }
        }

        let mut slot = cell.write().await;
        debug!(%url, "loading schema");
        let catalog = Arc::new(loader.load_schema(url).await?);
        *slot = Some(CachedCatalog {
            catalog: catalog.clone(),
            created_at: Instant::now(),
        });
        Ok(catalog)
    }
}
