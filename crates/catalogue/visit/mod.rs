pub mod list;
pub mod purge;
pub mod report;
pub mod wipe;

pub use list::{ListElement, ListVisitor};
pub use purge::{PurgeReport, PurgeVisitor};
pub use report::{DumpVisitor, StatsReport, StatsVisitor, StatusReport, StatusVisitor};
pub use wipe::{WipePlan, WipeVisitor};

use crate::error::CatalogueError;
use crate::index::IndexEntry;
use crate::reader::{LoadedIndex, TocCatalogueReader};
use crate::Catalogue;
use async_trait::async_trait;
use sfdb_common::{Key, Request};

/// Traversal hooks over databases, their indexes and their entries.
/// Returning false from a `visit_*` hook skips that subtree.
#[async_trait]
pub trait Visitor: Send {
    async fn visit_database(
        &mut self,
        _reader: &TocCatalogueReader,
    ) -> Result<bool, CatalogueError> {
        Ok(true)
    }

    async fn visit_index(
        &mut self,
        _reader: &TocCatalogueReader,
        _loaded: &LoadedIndex,
    ) -> Result<bool, CatalogueError> {
        Ok(true)
    }

    async fn visit_datum(
        &mut self,
        db_key: &Key,
        loaded: &LoadedIndex,
        entry: &IndexEntry,
    ) -> Result<(), CatalogueError>;

    async fn catalogue_complete(
        &mut self,
        _reader: &TocCatalogueReader,
    ) -> Result<(), CatalogueError> {
        Ok(())
    }
}

/// Drives a visitor over one open catalogue, filtering indexes and entries
/// against the request. Indexes are visited in TOC order so that later
/// epochs shadow earlier ones for visitors that de-duplicate.
pub async fn traverse(
    reader: &TocCatalogueReader,
    request: &Request,
    visitor: &mut dyn Visitor,
) -> Result<(), CatalogueError> {
    if !visitor.visit_database(reader).await? {
        return Ok(());
    }
    for loaded in reader.indexes(false) {
        if !loaded.index.key().conforms_to(request) {
            continue;
        }
        if !visitor.visit_index(reader, loaded).await? {
            continue;
        }
        for entry in loaded.index.entries() {
            if !entry.datum_key.conforms_to(request) {
                continue;
            }
            visitor.visit_datum(reader.db_key(), loaded, entry).await?;
        }
    }
    visitor.catalogue_complete(reader).await
}

/// The full key of one entry: database + index + datum levels merged, with
/// any mount remap layered over the database pairs.
pub fn full_key(db_key: &Key, loaded: &LoadedIndex, entry: &IndexEntry) -> Key {
    let mut key = match loaded.remap() {
        Some(remap) => db_key.overlaid_with(remap),
        None => db_key.clone(),
    };
    key = key.overlaid_with(loaded.index.key());
    key.overlaid_with(&entry.datum_key)
}
