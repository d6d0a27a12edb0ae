//! Shared connection context and the idempotent collection cache.
//!
//! [`DbContext`] replaces the module-global client/db/collection singletons
//! of older revisions with an explicit object owned by the application's
//! startup sequence and handed to every consumer.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::try_join_all;
use mongodb::bson::Document;
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::{debug, info};

use crate::config::DbConfig;
use crate::connect::{negotiate, ConnectionHandle};
use crate::error::{is_already_exists, Error, Result};
use crate::url::{build_url, sanitized_url};

/// One index to create: an ordered field-to-direction mapping plus options.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    /// Target collection
    pub collection: String,
    /// Field names with direction (`1` ascending, `-1` descending), in order
    pub fields: Vec<(String, i32)>,
    /// Index options
    pub options: IndexSpecOptions,
}

/// Options recognized on an [`IndexSpec`]
#[derive(Debug, Clone, Default)]
pub struct IndexSpecOptions {
    pub unique: bool,
    pub background: bool,
    pub name: Option<String>,
}

/// Process-wide database context: the working connection plus the cache of
/// opened collections.
///
/// The connection is written once at construction and read-only thereafter.
/// The cache's sole mutation point is the batch merge at the end of
/// [`DbContext::open_collections`].
pub struct DbContext {
    handle: ConnectionHandle,
    /// Credential-stripped URL, attached to wrapped errors
    url: String,
    collections: RwLock<HashMap<String, Collection<Document>>>,
}

impl DbContext {
    /// Negotiate a working connection for `config` and wrap it in an empty
    /// context.
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        config.validate()?;
        let url = sanitized_url(&build_url(config)?);
        let handle = negotiate(config).await?;
        Ok(Self::new(handle, url))
    }

    pub(crate) fn new(handle: ConnectionHandle, url: String) -> Self {
        Self {
            handle,
            url,
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// The client owning the transport pool.
    pub fn client(&self) -> &Client {
        &self.handle.client
    }

    /// The logical database handle.
    pub fn database(&self) -> &Database {
        &self.handle.db
    }

    /// Ensure every named collection exists, is open, and is present in the
    /// cache. Idempotent and safe to call repeatedly with overlapping name
    /// sets, including concurrently.
    ///
    /// Names already cached are skipped without touching the store. The
    /// pending remainder is created with unbounded fan-out; an
    /// already-exists response counts as success, since another process may
    /// have won the creation race. The cache merge happens only after the
    /// whole batch has succeeded, so callers never observe a partially
    /// initialized entry and may retry on failure.
    pub async fn open_collections(&self, names: &[&str]) -> Result<()> {
        let pending = self.pending_names(names);
        if pending.is_empty() {
            return Ok(());
        }

        debug!(count = pending.len(), "ensuring collections exist");
        try_join_all(pending.iter().map(|name| self.ensure_collection(name))).await?;

        let opened: Vec<(String, Collection<Document>)> = pending
            .into_iter()
            .map(|name| {
                let collection = self.handle.db.collection::<Document>(&name);
                (name, collection)
            })
            .collect();

        let mut cache = self.cache_write();
        for (name, collection) in opened {
            cache.entry(name).or_insert(collection);
        }
        Ok(())
    }

    /// A cached collection handle, if `open_collections` has resolved it.
    pub fn collection(&self, name: &str) -> Option<Collection<Document>> {
        self.cache_read().get(name).cloned()
    }

    /// Names currently present in the cache, sorted.
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cache_read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Create the given indexes. An index that already exists is not an
    /// error.
    pub async fn create_indexes(&self, specs: &[IndexSpec]) -> Result<()> {
        for spec in specs {
            let mut keys = Document::new();
            for (field, direction) in &spec.fields {
                keys.insert(field.clone(), *direction);
            }
            let mut options = IndexOptions::builder()
                .unique(spec.options.unique)
                .background(spec.options.background)
                .build();
            options.name = spec.options.name.clone();
            let model = IndexModel::builder().keys(keys).options(options).build();

            let collection = self.handle.db.collection::<Document>(&spec.collection);
            match collection.create_index(model).await {
                Ok(created) => {
                    debug!(
                        collection = %spec.collection,
                        index = %created.index_name,
                        "index ready"
                    );
                }
                Err(e) if is_already_exists(&e) => {}
                Err(e) => {
                    return Err(Error::operation(
                        format!("failed to create index on '{}'", spec.collection),
                        &self.url,
                        e,
                    ))
                }
            }
        }
        Ok(())
    }

    /// Drop the named collections and evict them from the cache. Destructive;
    /// reserved for test-mode bootstrap.
    pub async fn drop_collections(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.handle
                .db
                .collection::<Document>(name)
                .drop()
                .await
                .map_err(|e| {
                    Error::operation(format!("failed to drop collection '{name}'"), &self.url, e)
                })?;
            info!(collection = %name, "dropped collection");
        }
        let mut cache = self.cache_write();
        for name in names {
            cache.remove(name);
        }
        Ok(())
    }

    /// Requested names not yet cached, deduplicated, in request order.
    fn pending_names(&self, names: &[&str]) -> Vec<String> {
        let cache = self.cache_read();
        let mut seen = HashSet::new();
        names
            .iter()
            .filter(|name| !cache.contains_key(**name) && seen.insert(**name))
            .map(|name| name.to_string())
            .collect()
    }

    async fn ensure_collection(&self, name: &str) -> Result<()> {
        match self.handle.db.create_collection(name).await {
            Ok(()) => {
                info!(collection = %name, "created collection");
                Ok(())
            }
            Err(e) if is_already_exists(&e) => {
                debug!(collection = %name, "collection already exists");
                Ok(())
            }
            Err(e) => Err(Error::operation(
                format!("failed to create collection '{name}'"),
                &self.url,
                e,
            )),
        }
    }

    // Lock poisoning cannot carry useful recovery information here; the
    // guarded value is a plain map, so the poisoned guard is taken as-is.
    fn cache_read(&self) -> RwLockReadGuard<'_, HashMap<String, Collection<Document>>> {
        self.collections.read().unwrap_or_else(|e| e.into_inner())
    }

    fn cache_write(&self) -> RwLockWriteGuard<'_, HashMap<String, Collection<Document>>> {
        self.collections.write().unwrap_or_else(|e| e.into_inner())
    }
}
