use crate::error::CatalogueError;
use crate::index::Index;
use crate::toc::{read_toc, TocIndexRef, TocSnapshot, TOC_FILE_NAME};
use crate::{Catalogue, CatalogueReader};
use async_trait::async_trait;
use sfdb_common::{ControlIdentifiers, Key, SfdbUri};
use sfdb_store::FieldLocation;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One index epoch materialised from the TOC, with the remap it was
/// mounted under.
#[derive(Debug)]
pub struct LoadedIndex {
    pub index: Index,
    pub toc_ref: TocIndexRef,
}

impl LoadedIndex {
    pub fn remap(&self) -> Option<&Key> {
        self.toc_ref.remap_key.as_ref()
    }
}

/// Read side of one database's catalogue: a snapshot of the TOC taken at
/// open time, with every effective index epoch materialised.
pub struct TocCatalogueReader {
    db_key: Key,
    directory: PathBuf,
    snapshot: TocSnapshot,
    indexes: Vec<LoadedIndex>,
    matching: Vec<usize>,
    current_key: Option<Key>,
}

impl TocCatalogueReader {
    /// Opens the database under `root` named by `db_key`'s values.
    pub fn open(root: &Path, db_key: &Key) -> Result<Self, CatalogueError> {
        Self::open_directory(root.join(db_key.values_to_string()))
    }

    pub fn open_directory(directory: impl Into<PathBuf>) -> Result<Self, CatalogueError> {
        let directory = directory.into();
        let snapshot = read_toc(directory.join(TOC_FILE_NAME))?;

        let mut indexes = Vec::with_capacity(snapshot.entries.len());
        for toc_ref in &snapshot.entries {
            let index = Index::load(&toc_ref.path, toc_ref.offset)?;
            indexes.push(LoadedIndex {
                index,
                toc_ref: toc_ref.clone(),
            });
        }
        debug!(
            db = %snapshot.db_key,
            indexes = indexes.len(),
            "opened catalogue reader"
        );

        Ok(Self {
            db_key: snapshot.db_key.clone(),
            directory,
            snapshot,
            indexes,
            matching: Vec::new(),
            current_key: None,
        })
    }

    /// True iff a database exists under `root` for `db_key`.
    pub fn exists(root: &Path, db_key: &Key) -> bool {
        root.join(db_key.values_to_string())
            .join(TOC_FILE_NAME)
            .exists()
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn snapshot(&self) -> &TocSnapshot {
        &self.snapshot
    }

    /// All loaded indexes; `sorted` groups them by file and offset for
    /// sequential iteration.
    pub fn indexes(&self, sorted: bool) -> Vec<&LoadedIndex> {
        let mut refs: Vec<&LoadedIndex> = self.indexes.iter().collect();
        if sorted {
            refs.sort_by(|a, b| {
                (&a.toc_ref.path, a.toc_ref.offset).cmp(&(&b.toc_ref.path, b.toc_ref.offset))
            });
        }
        refs
    }

    fn retrieve_sync(&self, datum_key: &Key) -> Option<FieldLocation> {
        // Epochs are loaded in TOC order; the newest wins, so scan backwards.
        for &i in self.matching.iter().rev() {
            let loaded = &self.indexes[i];
            if !loaded.index.may_contain(datum_key) {
                continue;
            }
            if let Some(location) = loaded.index.get(datum_key, loaded.remap()) {
                return Some(location);
            }
        }
        None
    }
}

impl Catalogue for TocCatalogueReader {
    fn db_key(&self) -> &Key {
        &self.db_key
    }

    fn uri(&self) -> SfdbUri {
        SfdbUri::file(&self.directory)
    }

    fn disabled(&self) -> ControlIdentifiers {
        self.snapshot.disabled
    }
}

#[async_trait]
impl CatalogueReader for TocCatalogueReader {
    fn select_index(&mut self, index_key: &Key) -> bool {
        if self.current_key.as_ref() == Some(index_key) {
            return !self.matching.is_empty();
        }
        self.current_key = Some(index_key.clone());
        self.matching = self
            .indexes
            .iter()
            .enumerate()
            .filter(|(_, loaded)| loaded.index.key() == index_key)
            .map(|(i, _)| i)
            .collect();
        debug!(
            index = %index_key,
            matches = self.matching.len(),
            "selected index"
        );
        !self.matching.is_empty()
    }

    fn deselect_index(&mut self) {
        self.current_key = None;
        self.matching.clear();
    }

    async fn retrieve(
        &mut self,
        datum_key: &Key,
    ) -> Result<Option<FieldLocation>, CatalogueError> {
        Ok(self.retrieve_sync(datum_key))
    }

    async fn axis(&mut self, keyword: &str) -> Result<Option<BTreeSet<String>>, CatalogueError> {
        let mut merged: Option<BTreeSet<String>> = None;
        for &i in &self.matching {
            if let Some(values) = self.indexes[i].index.axes().values(keyword) {
                merged
                    .get_or_insert_with(BTreeSet::new)
                    .extend(values.iter().cloned());
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::SerialisationVersion;
    use crate::writer::TocCatalogueWriter;
    use crate::CatalogueWriter;
    use sfdb_common::schema::test_support::example_schema;
    use std::sync::Arc;

    fn db_key() -> Key {
        Key::from_pairs([("class", "od"), ("stream", "oper"), ("date", "20260801")])
    }

    fn index_key() -> Key {
        Key::from_pairs([("type", "fc"), ("levtype", "sfc")])
    }

    fn datum(step: &str) -> Key {
        Key::from_pairs([("step", step), ("param", "130")])
    }

    fn location(offset: u64) -> FieldLocation {
        FieldLocation::file(
            SfdbUri::parse("file:/data/unit.data").expect("uri"),
            offset,
            4,
        )
    }

    async fn populate(root: &Path) {
        let mut writer = TocCatalogueWriter::create(
            root,
            db_key(),
            &Arc::new(example_schema()),
            SerialisationVersion::default(),
            false,
        )
        .expect("writer");
        writer.select_index(&index_key()).expect("select");
        writer
            .archive(&datum("0"), location(0))
            .await
            .expect("archive");
        writer
            .archive(&datum("6"), location(4))
            .await
            .expect("archive");
        writer.flush(2).await.expect("flush");
        writer.close().await.expect("close");
    }

    #[tokio::test]
    async fn reader_sees_flushed_entries() {
        let root = tempfile::tempdir().expect("tempdir");
        populate(root.path()).await;

        let mut reader = TocCatalogueReader::open(root.path(), &db_key()).expect("open");
        assert!(reader.select_index(&index_key()));
        let hit = reader.retrieve(&datum("6")).await.expect("retrieve");
        assert_eq!(hit, Some(location(4)));
        assert_eq!(reader.retrieve(&datum("12")).await.expect("retrieve"), None);
    }

    #[tokio::test]
    async fn reader_is_a_snapshot() {
        let root = tempfile::tempdir().expect("tempdir");
        populate(root.path()).await;

        let mut reader = TocCatalogueReader::open(root.path(), &db_key()).expect("open");

        // Writes after the snapshot are not visible to this reader.
        let mut writer = TocCatalogueWriter::create(
            root.path(),
            db_key(),
            &Arc::new(example_schema()),
            SerialisationVersion::default(),
            false,
        )
        .expect("writer");
        writer.select_index(&index_key()).expect("select");
        writer
            .archive(&datum("12"), location(8))
            .await
            .expect("archive");
        writer.flush(1).await.expect("flush");
        writer.close().await.expect("close");

        assert!(reader.select_index(&index_key()));
        assert_eq!(reader.retrieve(&datum("12")).await.expect("retrieve"), None);

        let mut fresh = TocCatalogueReader::open(root.path(), &db_key()).expect("open");
        assert!(fresh.select_index(&index_key()));
        assert_eq!(
            fresh.retrieve(&datum("12")).await.expect("retrieve"),
            Some(location(8))
        );
    }

    #[tokio::test]
    async fn axis_unions_selected_indexes() {
        let root = tempfile::tempdir().expect("tempdir");
        populate(root.path()).await;

        let mut reader = TocCatalogueReader::open(root.path(), &db_key()).expect("open");
        reader.select_index(&index_key());
        let steps = reader.axis("step").await.expect("axis").expect("present");
        assert_eq!(
            steps,
            BTreeSet::from(["0".to_string(), "6".to_string()])
        );
        assert_eq!(reader.axis("nonexistent").await.expect("axis"), None);
    }

    #[test]
    fn missing_db_is_not_found() {
        let root = tempfile::tempdir().expect("tempdir");
        assert!(!TocCatalogueReader::exists(root.path(), &db_key()));
        assert!(matches!(
            TocCatalogueReader::open(root.path(), &db_key()),
            Err(CatalogueError::DbNotFound(_))
        ));
    }
}
