use crate::error::CatalogueError;
use crate::reader::TocCatalogueReader;
use crate::toc::TOC_FILE_NAME;
use crate::version::SerialisationVersion;
use crate::visit::{
    self, ListElement, ListVisitor, PurgeReport, PurgeVisitor, StatsReport, StatsVisitor,
    StatusReport, StatusVisitor, Visitor, WipePlan, WipeVisitor,
};
use crate::writer::TocCatalogueWriter;
use crate::{Catalogue, CatalogueWriter};
use bytes::Bytes;
use sfdb_common::{
    config::RootConfig, Config, ControlAction, ControlIdentifier, FdbError, Key, Request, Schema,
};
use sfdb_store::{DataHandle, FileStore, PendingArchive, Store, StoreError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

type FdbResult<T> = Result<T, FdbError>;

/// Builds the bulk-bytes store for a database directory.
pub type StoreBuilder =
    Arc<dyn Fn(&Path) -> Result<Arc<dyn Store>, StoreError> + Send + Sync>;

struct PendingField {
    index_key: Key,
    datum_key: Key,
    pending: PendingArchive,
}

struct WriterSlot {
    catalogue: TocCatalogueWriter,
    store: Arc<dyn Store>,
    pending: Vec<PendingField>,
}

/// Process-level entry point for local databases.
///
/// Owns the configuration, the schema, and an explicit registry of store
/// builders; plugins register themselves on the value instead of through
/// static initialisers. One writer (catalogue + store + unflushed archive
/// queue) is kept per database touched by this engine.
pub struct Engine {
    config: Config,
    schema: Arc<Schema>,
    root: PathBuf,
    version: SerialisationVersion,
    store_builders: HashMap<String, StoreBuilder>,
    stores: HashMap<String, Arc<dyn Store>>,
    writers: HashMap<String, WriterSlot>,
}

impl Engine {
    pub fn new(config: Config) -> FdbResult<Self> {
        let schema = config.load_schema()?;
        Self::with_schema(config, schema)
    }

    /// Engine with an already-loaded schema, bypassing schema-file lookup.
    pub fn with_schema(config: Config, schema: Schema) -> FdbResult<Self> {
        let root = config.writable_root()?;
        let version = SerialisationVersion::from_env().map_err(FdbError::from)?;
        let mut engine = Self {
            config,
            schema: Arc::new(schema),
            root,
            version,
            store_builders: HashMap::new(),
            stores: HashMap::new(),
            writers: HashMap::new(),
        };
        engine.register_store_builder("file", |directory: &Path| {
            Ok(Arc::new(FileStore::new(directory)?) as Arc<dyn Store>)
        });
        Ok(engine)
    }

    /// Registers a bulk-store back-end under a scheme name.
    pub fn register_store_builder<F>(&mut self, scheme: &str, builder: F)
    where
        F: Fn(&Path) -> Result<Arc<dyn Store>, StoreError> + Send + Sync + 'static,
    {
        self.store_builders
            .insert(scheme.to_string(), Arc::new(builder));
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store_for(&mut self, db_key: &Key) -> FdbResult<Arc<dyn Store>> {
        let fp = db_key.values_to_string();
        if let Some(store) = self.stores.get(&fp) {
            return Ok(store.clone());
        }
        let builder = self
            .store_builders
            .get("file")
            .ok_or_else(|| FdbError::usage("no store back-end registered for scheme 'file'"))?
            .clone();
        let store = builder(&self.root.join(&fp)).map_err(FdbError::from)?;
        self.stores.insert(fp, store.clone());
        Ok(store)
    }

    fn writer_slot(&mut self, db_key: &Key) -> FdbResult<&mut WriterSlot> {
        let fp = db_key.values_to_string();
        if !self.writers.contains_key(&fp) {
            let catalogue = TocCatalogueWriter::create(
                &self.root,
                db_key.clone(),
                &self.schema,
                self.version,
                self.config.use_sub_toc,
            )
            .map_err(FdbError::from)?;
            let store = self.store_for(db_key)?;
            info!(db = %db_key, "opened database for writing");
            self.writers.insert(
                fp.clone(),
                WriterSlot {
                    catalogue,
                    store,
                    pending: Vec::new(),
                },
            );
        }
        self.writers
            .get_mut(&fp)
            .ok_or_else(|| FdbError::consistency("writer slot vanished"))
    }

    /// Archives one field. The bytes are enqueued on the store; the index
    /// entry is recorded at the next `flush`, once the location is durable.
    pub async fn archive(&mut self, key: &Key, data: Bytes) -> FdbResult<()> {
        let triple = self.schema.partition(key).map_err(|e| FdbError::usage(e.to_string()))?;
        let slot = self.writer_slot(&triple.db)?;
        if !slot.catalogue.enabled(ControlIdentifier::Archive) {
            return Err(FdbError::not_found(format!(
                "database {} (archiving disabled)",
                triple.db
            )));
        }
        let pending = slot
            .store
            .archive(&triple.index, data)
            .await
            .map_err(FdbError::from)?;
        slot.pending.push(PendingField {
            index_key: triple.index,
            datum_key: triple.datum,
            pending,
        });
        Ok(())
    }

    /// Flush barrier: makes every archived field durable, records it in its
    /// catalogue, and publishes the index epochs in the TOC.
    pub async fn flush(&mut self) -> FdbResult<()> {
        for slot in self.writers.values_mut() {
            if slot.pending.is_empty() {
                slot.catalogue.flush(0).await.map_err(FdbError::from)?;
                continue;
            }
            slot.store.flush().await.map_err(FdbError::from)?;
            let fields = std::mem::take(&mut slot.pending);
            let count = fields.len();
            for field in fields {
                let location = field.pending.wait().await.map_err(FdbError::from)?;
                slot.catalogue
                    .select_index(&field.index_key)
                    .map_err(FdbError::from)?;
                slot.catalogue
                    .archive(&field.datum_key, location)
                    .await
                    .map_err(FdbError::from)?;
            }
            slot.catalogue.flush(count).await.map_err(FdbError::from)?;
            debug!(count, "flushed archive epoch");
        }
        Ok(())
    }

    /// Retrieves the field stored under a fully specified key. A missing
    /// datum yields an empty handle; a missing database is an error.
    pub async fn retrieve(&mut self, key: &Key) -> FdbResult<DataHandle> {
        use crate::CatalogueReader as _;

        let triple = self.schema.partition(key).map_err(|e| FdbError::usage(e.to_string()))?;
        if !TocCatalogueReader::exists(&self.root, &triple.db) {
            return Err(FdbError::not_found(format!("database {}", triple.db)));
        }
        let mut reader =
            TocCatalogueReader::open(&self.root, &triple.db).map_err(FdbError::from)?;
        if !reader.enabled(ControlIdentifier::Retrieve) {
            return Err(FdbError::not_found(format!("database {}", triple.db)));
        }
        reader.select_index(&triple.index);
        let location = reader
            .retrieve(&triple.datum)
            .await
            .map_err(FdbError::from)?;
        match location {
            Some(location) => {
                let store = self.store_for(&triple.db)?;
                store.retrieve(&location).await.map_err(FdbError::from)
            }
            None => Ok(DataHandle::empty()),
        }
    }

    /// Opens every existing database the request selects and the operation
    /// is enabled for. Damaged databases are skipped with a warning.
    fn discover(
        &self,
        request: &Request,
        op: ControlIdentifier,
    ) -> FdbResult<Vec<TocCatalogueReader>> {
        let mut readers = Vec::new();
        let dir = match std::fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(readers),
            Err(e) => return Err(e.into()),
        };
        for entry in dir {
            let path = entry?.path();
            if !path.join(TOC_FILE_NAME).is_file() {
                continue;
            }
            let reader = match TocCatalogueReader::open_directory(&path) {
                Ok(reader) => reader,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable database");
                    continue;
                }
            };
            if !reader.db_key().conforms_to(request) {
                continue;
            }
            if !reader.enabled(op) {
                debug!(db = %reader.db_key(), op = %op, "database disabled for operation");
                continue;
            }
            readers.push(reader);
        }
        readers.sort_by_key(|r| r.db_key().values_to_string());
        Ok(readers)
    }

    /// Drives a visitor over every matching database.
    pub async fn visit(
        &self,
        request: &Request,
        op: ControlIdentifier,
        visitor: &mut dyn Visitor,
    ) -> FdbResult<()> {
        for reader in self.discover(request, op)? {
            visit::traverse(&reader, request, visitor)
                .await
                .map_err(FdbError::from)?;
        }
        Ok(())
    }

    pub async fn list(&self, request: &Request, dedup: bool) -> FdbResult<Vec<ListElement>> {
        let mut visitor = ListVisitor::new(dedup);
        self.visit(request, ControlIdentifier::List, &mut visitor)
            .await?;
        Ok(visitor.into_elements())
    }

    pub async fn dump(&self, request: &Request) -> FdbResult<String> {
        let mut visitor = crate::visit::DumpVisitor::new();
        self.visit(request, ControlIdentifier::List, &mut visitor)
            .await?;
        Ok(visitor.into_text())
    }

    pub async fn stats(&self, request: &Request) -> FdbResult<StatsReport> {
        let mut visitor = StatsVisitor::new();
        self.visit(request, ControlIdentifier::List, &mut visitor)
            .await?;
        Ok(visitor.into_report())
    }

    pub async fn status(&self, request: &Request) -> FdbResult<StatusReport> {
        let mut visitor = StatusVisitor::new();
        self.visit(request, ControlIdentifier::List, &mut visitor)
            .await?;
        Ok(visitor.into_report())
    }

    /// Identifies (and with `doit` removes) fields masked by later
    /// identical keys.
    pub async fn purge(&mut self, request: &Request, doit: bool) -> FdbResult<PurgeReport> {
        let mut merged = PurgeReport::default();
        for reader in self.discover(request, ControlIdentifier::Wipe)? {
            let mut visitor = PurgeVisitor::new();
            visit::traverse(&reader, request, &mut visitor)
                .await
                .map_err(FdbError::from)?;
            let report = visitor.into_report();

            if doit && !report.maskable.is_empty() {
                let db_key = reader.db_key().clone();
                let slot = self.writer_slot(&db_key)?;
                slot.catalogue
                    .mask_entries(&report.maskable)
                    .map_err(FdbError::from)?;
                let store = slot.store.clone();
                for unit in &report.removable_units {
                    store.remove(unit, true).await.map_err(FdbError::from)?;
                }
            }

            merged.duplicate_fields += report.duplicate_fields;
            merged.maskable.extend(report.maskable);
            merged.removable_units.extend(report.removable_units);
        }
        Ok(merged)
    }

    /// Computes, and with `doit` executes, the wipe plan for every database
    /// the request selects. Execution order makes an interrupted wipe
    /// completable by running the same wipe again: masks first, then store
    /// units, then index files, then the container.
    pub async fn wipe(
        &mut self,
        request: &Request,
        doit: bool,
        unsafe_wipe_all: bool,
    ) -> FdbResult<Vec<(Key, WipePlan)>> {
        let mut results = Vec::new();
        let match_all = Request::new(request.verb());
        for reader in self.discover(request, ControlIdentifier::Wipe)? {
            let db_key = reader.db_key().clone();
            let store = self.store_for(&db_key)?;
            let mut visitor = WipeVisitor::new(request.clone());
            visit::traverse(&reader, &match_all, &mut visitor)
                .await
                .map_err(FdbError::from)?;
            let store_units = store.store_unit_uris().await.map_err(FdbError::from)?;
            let plan = visitor
                .into_plan(&reader, &store_units)
                .map_err(FdbError::from)?;

            if doit {
                self.execute_wipe(&reader, request, &plan, unsafe_wipe_all, store.clone())
                    .await?;
            }
            results.push((db_key, plan));
        }
        Ok(results)
    }

    async fn execute_wipe(
        &mut self,
        reader: &TocCatalogueReader,
        request: &Request,
        plan: &WipePlan,
        unsafe_wipe_all: bool,
        store: Arc<dyn Store>,
    ) -> FdbResult<()> {
        use crate::index::Index;
        use crate::reader::LoadedIndex;
        use crate::toc::TocPayload;
        use crate::visit::wipe::entry_matches;

        let db_key = reader.db_key().clone();
        if plan.full && !plan.residuals.is_empty() && !unsafe_wipe_all {
            return Err(FdbError::from(CatalogueError::WipeResidual(format!(
                "{} unaccounted objects in {}",
                plan.residuals.len(),
                reader.directory().display()
            ))));
        }

        // 1. Masks and rewrites, so a crash between steps leaves the
        //    matched entries invisible and the wipe re-runnable. Rewritten
        //    epochs and the masks of the epochs they replace land in one
        //    block append.
        if !plan.full && (!plan.mask_entries.is_empty() || !plan.rewrite_epochs.is_empty()) {
            let mut payloads = Vec::new();
            {
                let slot = self.writer_slot(&db_key)?;
                for toc_ref in &plan.rewrite_epochs {
                    let loaded = LoadedIndex {
                        index: Index::load(&toc_ref.path, toc_ref.offset)
                            .map_err(FdbError::from)?,
                        toc_ref: toc_ref.clone(),
                    };
                    let mut fresh = Index::new_writer(
                        loaded.index.key().clone(),
                        slot.catalogue.new_index_path(loaded.index.key()),
                    );
                    for entry in loaded.index.entries() {
                        if !entry_matches(request, &db_key, &loaded, entry) {
                            fresh.put(&entry.datum_key, entry.location.clone());
                        }
                    }
                    let timestamp = fresh.timestamp();
                    if let Some((offset, axes)) = fresh.flush().map_err(FdbError::from)? {
                        payloads.push(TocPayload::Index {
                            index_key: fresh.key().clone(),
                            path: fresh
                                .path()
                                .file_name()
                                .map(|n| n.to_string_lossy().into_owned())
                                .unwrap_or_default(),
                            offset,
                            axes,
                            timestamp,
                        });
                    }
                    payloads.push(toc_ref.clear_payload());
                }
                for toc_ref in &plan.mask_entries {
                    payloads.push(toc_ref.clear_payload());
                }
                slot.catalogue
                    .append_records(&payloads)
                    .map_err(FdbError::from)?;
            }
        }

        // 2. Store units.
        for unit in &plan.delete_units {
            store.remove(unit, true).await.map_err(FdbError::from)?;
        }

        // 3. Index files.
        for path in &plan.delete_index_files {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        // 4. The container itself.
        if plan.full {
            // Drop any open writer first so the TOC lock is released.
            let fp = db_key.values_to_string();
            if let Some(mut slot) = self.writers.remove(&fp) {
                slot.catalogue.close().await.map_err(FdbError::from)?;
            }
            self.stores.remove(&fp);
            std::fs::remove_dir_all(reader.directory())?;
            info!(db = %db_key, "database wiped");
        }
        Ok(())
    }

    /// Flips control bits on every database the request selects.
    pub async fn control(
        &mut self,
        request: &Request,
        action: ControlAction,
        identifiers: &[ControlIdentifier],
    ) -> FdbResult<()> {
        let keys: Vec<Key> = self
            .discover(request, ControlIdentifier::List)?
            .into_iter()
            .map(|r| r.db_key().clone())
            .collect();
        for db_key in keys {
            let slot = self.writer_slot(&db_key)?;
            slot.catalogue
                .control(action, identifiers)
                .await
                .map_err(FdbError::from)?;
        }
        Ok(())
    }

    /// Re-archives everything the request selects into another root.
    pub async fn move_db(&mut self, request: &Request, dest_root: &Path) -> FdbResult<()> {
        let elements = self.list(request, true).await?;
        if elements.is_empty() {
            return Err(FdbError::not_found(format!("nothing matches {request}")));
        }

        let mut dest_config = self.config.clone();
        dest_config.roots = vec![RootConfig {
            path: dest_root.to_path_buf(),
            endpoint: None,
            bucket: None,
        }];
        let mut dest = Engine {
            config: dest_config,
            schema: self.schema.clone(),
            root: dest_root.to_path_buf(),
            version: self.version,
            store_builders: self.store_builders.clone(),
            stores: HashMap::new(),
            writers: HashMap::new(),
        };

        for element in elements {
            let triple = self
                .schema
                .partition(&element.key)
                .map_err(|e| FdbError::usage(e.to_string()))?;
            let store = self.store_for(&triple.db)?;
            let data = store
                .retrieve(&element.location)
                .await
                .map_err(FdbError::from)?
                .read_all()
                .await
                .map_err(FdbError::from)?;
            dest.archive(&element.key, data).await?;
        }
        dest.flush().await?;
        dest.close().await
    }

    /// Flushes and closes every open writer and store.
    pub async fn close(&mut self) -> FdbResult<()> {
        self.flush().await?;
        for (_, mut slot) in self.writers.drain() {
            slot.catalogue.close().await.map_err(FdbError::from)?;
            slot.store.close().await.map_err(FdbError::from)?;
        }
        self.stores.clear();
        Ok(())
    }
}
