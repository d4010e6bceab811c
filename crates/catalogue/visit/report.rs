use super::{full_key, Visitor};
use crate::error::CatalogueError;
use crate::index::IndexEntry;
use crate::reader::{LoadedIndex, TocCatalogueReader};
use crate::Catalogue;
use async_trait::async_trait;
use sfdb_common::{ControlIdentifiers, Key};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Human-readable dump of databases, indexes and entries.
#[derive(Default)]
pub struct DumpVisitor {
    out: String,
}

impl DumpVisitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_text(self) -> String {
        self.out
    }
}

#[async_trait]
impl Visitor for DumpVisitor {
    async fn visit_database(
        &mut self,
        reader: &TocCatalogueReader,
    ) -> Result<bool, CatalogueError> {
        let _ = writeln!(self.out, "database {}", reader.db_key());
        let _ = writeln!(self.out, "  uri {}", reader.uri());
        Ok(true)
    }

    async fn visit_index(
        &mut self,
        _reader: &TocCatalogueReader,
        loaded: &LoadedIndex,
    ) -> Result<bool, CatalogueError> {
        let _ = writeln!(
            self.out,
            "  index {} [{}@{}] entries={} timestamp={}",
            loaded.index.key(),
            loaded.toc_ref.path.display(),
            loaded.toc_ref.offset,
            loaded.index.len(),
            loaded.index.timestamp(),
        );
        Ok(true)
    }

    async fn visit_datum(
        &mut self,
        db_key: &Key,
        loaded: &LoadedIndex,
        entry: &IndexEntry,
    ) -> Result<(), CatalogueError> {
        let _ = writeln!(
            self.out,
            "    {} -> {}",
            full_key(db_key, loaded, entry),
            entry.location,
        );
        Ok(())
    }
}

/// Aggregate counts over the visited subtree.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsReport {
    pub databases: usize,
    pub indexes: usize,
    pub fields: usize,
    pub field_bytes: u64,
}

#[derive(Default)]
pub struct StatsVisitor {
    report: StatsReport,
}

impl StatsVisitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_report(self) -> StatsReport {
        self.report
    }
}

#[async_trait]
impl Visitor for StatsVisitor {
    async fn visit_database(
        &mut self,
        _reader: &TocCatalogueReader,
    ) -> Result<bool, CatalogueError> {
        self.report.databases += 1;
        Ok(true)
    }

    async fn visit_index(
        &mut self,
        _reader: &TocCatalogueReader,
        _loaded: &LoadedIndex,
    ) -> Result<bool, CatalogueError> {
        self.report.indexes += 1;
        Ok(true)
    }

    async fn visit_datum(
        &mut self,
        _db_key: &Key,
        _loaded: &LoadedIndex,
        entry: &IndexEntry,
    ) -> Result<(), CatalogueError> {
        self.report.fields += 1;
        self.report.field_bytes += entry.location.length();
        Ok(())
    }
}

/// Per-database control state.
#[derive(Debug, Default, Clone)]
pub struct StatusReport {
    pub databases: BTreeMap<String, ControlIdentifiers>,
}

#[derive(Default)]
pub struct StatusVisitor {
    report: StatusReport,
}

impl StatusVisitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_report(self) -> StatusReport {
        self.report
    }
}

#[async_trait]
impl Visitor for StatusVisitor {
    async fn visit_database(
        &mut self,
        reader: &TocCatalogueReader,
    ) -> Result<bool, CatalogueError> {
        self.report
            .databases
            .insert(reader.db_key().to_string(), reader.disabled());
        // Status only needs the database level.
        Ok(false)
    }

    async fn visit_datum(
        &mut self,
        _db_key: &Key,
        _loaded: &LoadedIndex,
        _entry: &IndexEntry,
    ) -> Result<(), CatalogueError> {
        Ok(())
    }
}
