use crate::error::CatalogueError;
use crate::index::{fingerprint, Index, INDEX_SUFFIX};
use crate::toc::{read_toc, TocIndexRef, TocPayload, TocWriter, TOC_FILE_NAME};
use crate::version::SerialisationVersion;
use crate::{Catalogue, CatalogueWriter};
use async_trait::async_trait;
use indexmap::IndexMap;
use sfdb_common::{ControlAction, ControlIdentifier, ControlIdentifiers, Key, Schema, SfdbUri};
use sfdb_store::FieldLocation;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Append side of one database's catalogue.
///
/// Owns the TOC writer and the set of in-progress indexes. Every `flush`
/// publishes the dirty indexes as a single block of TOC INDEX records, so a
/// reader either sees the whole epoch or none of it.
pub struct TocCatalogueWriter {
    db_key: Key,
    directory: PathBuf,
    toc: TocWriter,
    indexes: IndexMap<String, Index>,
    current: Option<String>,
    archived_since_flush: usize,
    disabled: ControlIdentifiers,
    closed: bool,
}

impl TocCatalogueWriter {
    pub fn create(
        root: &Path,
        db_key: Key,
        schema: &Arc<Schema>,
        version: SerialisationVersion,
        use_sub_toc: bool,
    ) -> Result<Self, CatalogueError> {
        let directory = root.join(db_key.values_to_string());
        let toc = TocWriter::create(&directory, db_key.clone(), schema, version, use_sub_toc)?;
        // Control history is in the master TOC, wherever our appends go.
        let snapshot = read_toc(directory.join(TOC_FILE_NAME))?;
        Ok(Self {
            db_key,
            directory,
            toc,
            indexes: IndexMap::new(),
            current: None,
            archived_since_flush: 0,
            disabled: snapshot.disabled,
            closed: false,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn index_path(&self, index_key: &Key) -> PathBuf {
        let unique: u32 = rand::random();
        self.directory.join(format!(
            "{}.{unique:08x}.{INDEX_SUFFIX}",
            index_key.values_to_string()
        ))
    }

    /// Masks the given TOC records, for purge and partial wipe.
    pub fn mask_entries(&self, entries: &[TocIndexRef]) -> Result<(), CatalogueError> {
        let payloads: Vec<TocPayload> = entries.iter().map(|e| e.clear_payload()).collect();
        self.toc.append_master(&payloads)
    }

    /// Appends prepared records to the master TOC as one atomic block.
    /// Used by wipe to publish rewritten epochs together with the masks of
    /// the epochs they replace.
    pub fn append_records(&self, payloads: &[TocPayload]) -> Result<(), CatalogueError> {
        self.toc.append_master(payloads)
    }

    /// A fresh, uniquely named index file path for `index_key`.
    pub fn new_index_path(&self, index_key: &Key) -> PathBuf {
        self.index_path(index_key)
    }
}

impl Catalogue for TocCatalogueWriter {
    fn db_key(&self) -> &Key {
        &self.db_key
    }

    fn uri(&self) -> SfdbUri {
        SfdbUri::file(&self.directory)
    }

    fn disabled(&self) -> ControlIdentifiers {
        self.disabled
    }
}

#[async_trait]
impl CatalogueWriter for TocCatalogueWriter {
    fn select_index(&mut self, index_key: &Key) -> Result<(), CatalogueError> {
        let fp = fingerprint(index_key);
        if self.current.as_deref() == Some(fp.as_str()) {
            return Ok(());
        }
        if !self.indexes.contains_key(&fp) {
            let path = self.index_path(index_key);
            debug!(index = %index_key, path = %path.display(), "creating index");
            self.indexes
                .insert(fp.clone(), Index::new_writer(index_key.clone(), path));
        }
        self.current = Some(fp);
        Ok(())
    }

    fn deselect_index(&mut self) {
        self.current = None;
    }

    async fn archive(
        &mut self,
        datum_key: &Key,
        location: FieldLocation,
    ) -> Result<(), CatalogueError> {
        let current = self
            .current
            .as_ref()
            .ok_or(CatalogueError::NoIndexSelected)?;
        let index = self
            .indexes
            .get_mut(current)
            .ok_or(CatalogueError::NoIndexSelected)?;
        index.put(datum_key, location);
        self.archived_since_flush += 1;
        Ok(())
    }

    async fn flush(&mut self, expected: usize) -> Result<(), CatalogueError> {
        if self.archived_since_flush != expected {
            return Err(CatalogueError::FlushCountMismatch {
                expected,
                observed: self.archived_since_flush,
            });
        }

        let mut payloads = Vec::new();
        for index in self.indexes.values_mut() {
            let timestamp = index.timestamp();
            if let Some((offset, axes)) = index.flush()? {
                let path = index
                    .path()
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                payloads.push(TocPayload::Index {
                    index_key: index.key().clone(),
                    path,
                    offset,
                    axes,
                    timestamp,
                });
            }
        }
        self.toc.append(&payloads)?;
        self.archived_since_flush = 0;
        Ok(())
    }

    async fn overlay_db(
        &mut self,
        other_db_key: &Key,
        other_toc: SfdbUri,
        varying: &BTreeSet<String>,
        unmount: bool,
    ) -> Result<(), CatalogueError> {
        if other_db_key.len() != self.db_key.len() {
            return Err(CatalogueError::MountMismatch {
                host: self.db_key.to_string(),
                other: other_db_key.to_string(),
            });
        }
        for (name, value) in self.db_key.iter() {
            match other_db_key.get(name) {
                Some(other_value) if other_value == value => {}
                Some(_) if varying.contains(name) => {}
                _ => {
                    return Err(CatalogueError::MountMismatch {
                        host: self.db_key.to_string(),
                        other: other_db_key.to_string(),
                    })
                }
            }
        }

        if unmount {
            let snapshot = read_toc(self.directory.join(TOC_FILE_NAME))?;
            let mounted = snapshot
                .subtocs
                .iter()
                .any(|path| *path == other_toc.as_path());
            if !mounted {
                return Err(CatalogueError::Usage(format!(
                    "cannot unmount {other_toc}: not currently mounted"
                )));
            }
            self.toc
                .append_master(&[TocPayload::SubTocClear { uri: other_toc }])
        } else {
            self.toc.append_master(&[TocPayload::SubToc { uri: other_toc }])
        }
    }

    async fn hide_contents(&mut self) -> Result<(), CatalogueError> {
        self.toc.append_master(&[TocPayload::ClearAll])
    }

    async fn control(
        &mut self,
        action: ControlAction,
        identifiers: &[ControlIdentifier],
    ) -> Result<(), CatalogueError> {
        self.disabled.apply(action, identifiers.iter().copied());
        self.toc.append_master(&[TocPayload::Control {
            disabled: self.disabled,
        }])
    }

    async fn close(&mut self) -> Result<(), CatalogueError> {
        if self.closed {
            warn!(db = %self.db_key, "catalogue writer closed twice");
            return Ok(());
        }
        self.flush(self.archived_since_flush).await?;
        self.deselect_index();
        self.indexes.clear();
        self.closed = true;
        Ok(())
    }
}

impl Drop for TocCatalogueWriter {
    fn drop(&mut self) {
        if !self.closed && self.archived_since_flush > 0 {
            warn!(
                db = %self.db_key,
                unflushed = self.archived_since_flush,
                "catalogue writer dropped with unflushed archives"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfdb_common::schema::test_support::example_schema;

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

    fn new_writer(root: &Path) -> TocCatalogueWriter {
        TocCatalogueWriter::create(
            root,
            db_key(),
            &Arc::new(example_schema()),
            SerialisationVersion::default(),
            false,
        )
        .expect("writer")
    }

    #[tokio::test]
    async fn archive_requires_a_selected_index() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut writer = new_writer(root.path());
        assert!(matches!(
            writer.archive(&datum("0"), location(0)).await,
            Err(CatalogueError::NoIndexSelected)
        ));
    }

    #[tokio::test]
    async fn flush_publishes_index_records() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut writer = new_writer(root.path());
        writer.select_index(&index_key()).expect("select");
        writer.archive(&datum("0"), location(0)).await.expect("archive");
        writer.archive(&datum("6"), location(4)).await.expect("archive");
        writer.flush(2).await.expect("flush");

        let snapshot = read_toc(writer.directory().join(TOC_FILE_NAME)).expect("read");
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].index_key, index_key());
        assert!(snapshot.entries[0].axes.contains_key("step"));
    }

    #[tokio::test]
    async fn flush_count_mismatch_is_fatal() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut writer = new_writer(root.path());
        writer.select_index(&index_key()).expect("select");
        writer.archive(&datum("0"), location(0)).await.expect("archive");
        assert!(matches!(
            writer.flush(3).await,
            Err(CatalogueError::FlushCountMismatch {
                expected: 3,
                observed: 1
            })
        ));
    }

    #[tokio::test]
    async fn empty_flush_is_idempotent() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut writer = new_writer(root.path());
        writer.flush(0).await.expect("flush");
        writer.flush(0).await.expect("flush again");
        let snapshot = read_toc(writer.directory().join(TOC_FILE_NAME)).expect("read");
        assert!(snapshot.entries.is_empty());
    }

    #[tokio::test]
    async fn control_bits_persist_across_writers() {
        let root = tempfile::tempdir().expect("tempdir");
        {
            let mut writer = new_writer(root.path());
            writer
                .control(ControlAction::Disable, &[ControlIdentifier::Wipe])
                .await
                .expect("control");
            writer.close().await.expect("close");
        }
        let writer = new_writer(root.path());
        assert!(!writer.enabled(ControlIdentifier::Wipe));
        assert!(writer.enabled(ControlIdentifier::Retrieve));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut writer = new_writer(root.path());
        writer.close().await.expect("close");
        writer.close().await.expect("second close");
    }
}
