use super::{full_key, Visitor};
use crate::error::CatalogueError;
use crate::index::{Index, IndexEntry};
use crate::reader::{LoadedIndex, TocCatalogueReader};
use crate::toc::{TocIndexRef, SCHEMA_FILE_NAME, TOC_FILE_NAME};
use async_trait::async_trait;
use sfdb_common::{Key, Request, SfdbUri};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Default, Clone, Copy)]
struct UnitStat {
    matched: usize,
    unmatched: usize,
}

struct EpochStat {
    toc_ref: TocIndexRef,
    total: usize,
    matched: usize,
}

/// What a wipe will touch, split into the partitions the safety rules are
/// stated over.
#[derive(Debug, Default)]
pub struct WipePlan {
    /// Store units every referencing entry of which is matched.
    pub delete_units: Vec<SfdbUri>,
    /// Store units with mixed contents; never deleted.
    pub safe_units: Vec<SfdbUri>,
    /// Fully matched index epochs, masked via TOC CLEAR records.
    pub mask_entries: Vec<TocIndexRef>,
    /// Partially matched epochs: survivors are rewritten into a fresh
    /// epoch, then the old one is cleared.
    pub rewrite_epochs: Vec<TocIndexRef>,
    /// Index files whose every live epoch is matched somewhere.
    pub delete_index_files: Vec<PathBuf>,
    /// True when nothing in the DB survives: the container itself goes.
    pub full: bool,
    /// Files physically present but accounted to nothing.
    pub residuals: Vec<PathBuf>,
}

impl WipePlan {
    pub fn is_empty(&self) -> bool {
        self.delete_units.is_empty()
            && self.mask_entries.is_empty()
            && self.rewrite_epochs.is_empty()
            && !self.full
    }
}

/// True iff one index entry is selected by the wipe request.
pub fn entry_matches(
    request: &Request,
    db_key: &Key,
    loaded: &LoadedIndex,
    entry: &IndexEntry,
) -> bool {
    full_key(db_key, loaded, entry).conforms_to(request)
}

/// Computes the wipe partitions for one database.
///
/// The visitor must be driven with an unconstrained request so it sees
/// every entry; the wipe request itself is matched here, entry by entry,
/// because safety depends on the entries that do NOT match. Epochs mounted
/// from other databases are skipped: a wipe never reaches through an
/// overlay, and their presence rules out a full wipe.
pub struct WipeVisitor {
    request: Request,
    units: BTreeMap<SfdbUri, UnitStat>,
    epochs: Vec<EpochStat>,
    has_foreign_mounts: bool,
}

impl WipeVisitor {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            units: BTreeMap::new(),
            epochs: Vec::new(),
            has_foreign_mounts: false,
        }
    }

    /// Builds the plan. `store_units` is the store's physical enumeration,
    /// used for the residual check.
    pub fn into_plan(
        self,
        reader: &TocCatalogueReader,
        store_units: &[SfdbUri],
    ) -> Result<WipePlan, CatalogueError> {
        let mut plan = WipePlan::default();

        let mut referenced: BTreeSet<SfdbUri> = self.units.keys().cloned().collect();
        // Units referenced only by masked epochs hold logically deleted
        // bytes: accounted for, and removable once the DB goes.
        let mut masked_only_units: BTreeSet<SfdbUri> = BTreeSet::new();
        let mut index_files_masked: BTreeSet<PathBuf> = BTreeSet::new();
        for masked_ref in &reader.snapshot().masked {
            index_files_masked.insert(masked_ref.path.clone());
            match Index::load(&masked_ref.path, masked_ref.offset) {
                Ok(index) => {
                    for entry in index.entries() {
                        if let Some(uri) = entry.location.uri() {
                            if !referenced.contains(uri) {
                                masked_only_units.insert(uri.clone());
                            }
                            referenced.insert(uri.clone());
                        }
                    }
                }
                Err(e) => {
                    warn!(path = %masked_ref.path.display(), error = %e, "unreadable masked index epoch");
                }
            }
        }

        for (uri, stat) in &self.units {
            if stat.unmatched == 0 && stat.matched > 0 {
                plan.delete_units.push(uri.clone());
            } else if stat.matched > 0 {
                plan.safe_units.push(uri.clone());
            }
        }

        let every_entry_matched = self
            .epochs
            .iter()
            .all(|epoch| epoch.matched == epoch.total);
        let anything_matched = self.epochs.iter().any(|epoch| epoch.matched > 0);
        plan.full = every_entry_matched
            && anything_matched
            && plan.safe_units.is_empty()
            && !self.has_foreign_mounts;

        // On a full wipe the container disappears; otherwise matched
        // entries are hidden record by record.
        if !plan.full {
            for epoch in &self.epochs {
                if epoch.total == 0 || epoch.matched == 0 {
                    continue;
                }
                if epoch.matched == epoch.total {
                    plan.mask_entries.push(epoch.toc_ref.clone());
                } else {
                    plan.rewrite_epochs.push(epoch.toc_ref.clone());
                }
            }
        }

        // Index files whose every live epoch is matched somewhere: after
        // masking and rewriting, nothing live points into them.
        let mut files: BTreeMap<PathBuf, (usize, usize)> = BTreeMap::new();
        for epoch in &self.epochs {
            let slot = files.entry(epoch.toc_ref.path.clone()).or_default();
            slot.0 += 1;
            if epoch.total > 0 && epoch.matched > 0 {
                slot.1 += 1;
            }
        }
        for (path, (total, touched)) in files {
            if total == touched {
                plan.delete_index_files.push(path);
            }
        }
        if plan.full {
            plan.delete_index_files.extend(index_files_masked.clone());
            plan.delete_index_files.sort();
            plan.delete_index_files.dedup();
            plan.delete_units.extend(masked_only_units.iter().cloned());
            plan.delete_units.sort();
            plan.delete_units.dedup();
        }

        // Residual check: everything physically present must be accounted
        // to the TOC machinery, a referenced index file, or a referenced
        // store unit.
        let mut accounted: BTreeSet<PathBuf> = BTreeSet::new();
        accounted.insert(reader.directory().join(TOC_FILE_NAME));
        accounted.insert(reader.directory().join(SCHEMA_FILE_NAME));
        accounted.insert(reader.directory().join("toc.lock"));
        for sub in &reader.snapshot().subtocs {
            accounted.insert(sub.clone());
        }
        for epoch in &self.epochs {
            accounted.insert(epoch.toc_ref.path.clone());
        }
        for path in &index_files_masked {
            accounted.insert(path.clone());
        }
        for uri in referenced.iter() {
            if uri.scheme() == "file" {
                accounted.insert(uri.as_path());
            }
        }
        // A physical store unit no index entry (live or masked) accounts
        // for is a residual.
        for uri in store_units {
            if !referenced.contains(uri) {
                plan.residuals.push(uri.as_path());
            }
        }
        if let Ok(dir) = std::fs::read_dir(reader.directory()) {
            for entry in dir.flatten() {
                let path = entry.path();
                if !accounted.contains(&path) {
                    plan.residuals.push(path);
                }
            }
        }
        plan.residuals.sort();
        plan.residuals.dedup();

        Ok(plan)
    }
}

#[async_trait]
impl Visitor for WipeVisitor {
    async fn visit_index(
        &mut self,
        reader: &TocCatalogueReader,
        loaded: &LoadedIndex,
    ) -> Result<bool, CatalogueError> {
        if loaded.toc_ref.path.parent() != Some(reader.directory()) {
            self.has_foreign_mounts = true;
            return Ok(false);
        }
        self.epochs.push(EpochStat {
            toc_ref: loaded.toc_ref.clone(),
            total: 0,
            matched: 0,
        });
        Ok(true)
    }

    async fn visit_datum(
        &mut self,
        db_key: &Key,
        loaded: &LoadedIndex,
        entry: &IndexEntry,
    ) -> Result<(), CatalogueError> {
        let matched = entry_matches(&self.request, db_key, loaded, entry);
        if let Some(epoch) = self.epochs.last_mut() {
            epoch.total += 1;
            if matched {
                epoch.matched += 1;
            }
        }
        if let Some(uri) = entry.location.uri() {
            let stat = self.units.entry(uri.clone()).or_default();
            if matched {
                stat.matched += 1;
            } else {
                stat.unmatched += 1;
            }
        }
        Ok(())
    }
}
