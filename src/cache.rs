//! In-memory working sets of whole tables

use serde::de::DeserializeOwned;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::postgrest::{Gateway, SortOrder, TableQuery};
use crate::realtime::{ChangeFeed, Delivery};

/// A row with a numeric primary key
pub trait Record: Clone + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> i64;
}

/// A row that takes part in free-text search
pub trait Searchable {
    /// Field values matched by [`TableCache::search`]
    fn search_fields(&self) -> Vec<String>;

    /// Case-insensitive substring match over the search fields; empty matches all
    fn matches_search(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }
        self.search_fields()
            .iter()
            .any(|field| field.to_lowercase().contains(&query))
    }
}

/// Cached copy of one table, rebuilt wholesale on reload
pub struct TableCache<T> {
    source: TableQuery,
    table: String,
    rows: RwLock<Vec<T>>,
    // reloads run one at a time so an older snapshot never replaces a newer one
    reloading: Mutex<()>,
}

impl<T: Record> TableCache<T> {
    /// Create an empty cache for `table`, loaded in descending `order_by` order
    pub fn new(gateway: Arc<dyn Gateway>, table: &str, order_by: &str) -> Self {
        Self {
            source: TableQuery::new(gateway, table).order(order_by, SortOrder::Descending),
            table: table.to_string(),
            rows: RwLock::new(Vec::new()),
            reloading: Mutex::new(()),
        }
    }

    /// The cached table's name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Replace the cached rows with a fresh copy of the table
    pub async fn reload(&self) -> Result<usize, Error> {
        let _reloading = self.reloading.lock().await;
        let rows: Vec<T> = self.source.execute().await?;
        let count = rows.len();
        let mut guard = self
            .rows
            .write()
            .map_err(|_| Error::general(format!("{} cache lock poisoned", self.table)))?;
        *guard = rows;
        log::debug!("reloaded {} ({} rows)", self.table, count);
        Ok(count)
    }

    fn read<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        match self.rows.read() {
            Ok(rows) => f(&rows),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    /// Every cached row
    pub fn all(&self) -> Vec<T> {
        self.read(|rows| rows.to_vec())
    }

    pub fn by_id(&self, id: i64) -> Option<T> {
        self.find(|row| row.id() == id)
    }

    /// First row satisfying the predicate
    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        self.read(|rows| rows.iter().find(|row| predicate(row)).cloned())
    }

    /// Every row satisfying the predicate, in cache order
    pub fn filter(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        self.read(|rows| rows.iter().filter(|row| predicate(row)).cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.read(|rows| rows.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reload whenever the feed reports a change to this table
    pub fn watch(self: &Arc<Self>, feed: &ChangeFeed) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let mut subscription = feed.subscribe(&self.table);

        tokio::spawn(async move {
            while let Some(delivery) = subscription.recv().await {
                if let Delivery::Missed(count) = delivery {
                    log::warn!("{} cache missed {} change events", cache.table, count);
                }
                if let Err(e) = cache.reload().await {
                    log::error!("Error reloading {}: {}", cache.table, e);
                }
            }
            log::debug!("change feed closed, {} cache stops watching", cache.table);
        })
    }
}

impl<T: Record + Searchable> TableCache<T> {
    /// Case-insensitive substring search; an empty query returns every row
    pub fn search(&self, query: &str) -> Vec<T> {
        self.filter(|row| row.matches_search(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgrest::{Filter, MemoryGateway, Query};
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    #[derive(Debug, Clone, Deserialize)]
    struct Row {
        id: i64,
        name: String,
    }

    impl Record for Row {
        fn id(&self) -> i64 {
            self.id
        }
    }

    impl Searchable for Row {
        fn search_fields(&self) -> Vec<String> {
            vec![self.name.clone()]
        }
    }

    #[tokio::test]
    async fn test_reload_orders_newest_first() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway
            .insert("leads", vec![json!({ "name": "Alpha" }), json!({ "name": "Beta" })])
            .await
            .unwrap();

        let cache: TableCache<Row> = TableCache::new(gateway, "leads", "created_at");
        assert_eq!(cache.reload().await.unwrap(), 2);
        assert_eq!(cache.all()[0].name, "Beta");
        assert_eq!(cache.by_id(1).unwrap().name, "Alpha");
        assert_eq!(cache.search("ALP").len(), 1);
        assert_eq!(cache.search("  ").len(), 2);
    }

    #[tokio::test]
    async fn test_watch_reloads_on_change() {
        let feed = ChangeFeed::new(16);
        let gateway = Arc::new(MemoryGateway::with_feed(feed.clone()));
        let cache: Arc<TableCache<Row>> =
            Arc::new(TableCache::new(gateway.clone(), "leads", "created_at"));
        let handle = cache.watch(&feed);

        gateway
            .insert("leads", vec![json!({ "name": "Gamma" })])
            .await
            .unwrap();

        for _ in 0..50 {
            if cache.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.len(), 1);
        handle.abort();
    }

    /// Serves a stale snapshot slowly on the first select, then the fresh one
    struct SlowFirstSelect {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Gateway for SlowFirstSelect {
        async fn select(&self, _table: &str, _query: &Query) -> Result<Vec<Value>, Error> {
            if self.calls.fetch_add(1, AtomicOrdering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
                return Ok(vec![json!({ "id": 1, "name": "stale" })]);
            }
            Ok(vec![json!({ "id": 1, "name": "fresh" })])
        }

        async fn insert(&self, _table: &str, rows: Vec<Value>) -> Result<Vec<Value>, Error> {
            Ok(rows)
        }

        async fn update(
            &self,
            _table: &str,
            _filters: &[Filter],
            _values: Value,
        ) -> Result<Vec<Value>, Error> {
            Ok(Vec::new())
        }

        async fn delete(&self, _table: &str, _filters: &[Filter]) -> Result<Vec<Value>, Error> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_overlapping_reloads_keep_the_latest_snapshot() {
        let gateway = Arc::new(SlowFirstSelect {
            calls: AtomicUsize::new(0),
        });
        let cache: TableCache<Row> = TableCache::new(gateway, "leads", "created_at");

        let (first, second) = tokio::join!(cache.reload(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cache.reload().await
        });
        first.unwrap();
        second.unwrap();

        assert_eq!(cache.by_id(1).unwrap().name, "fresh");
    }
}
