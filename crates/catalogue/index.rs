use crate::error::CatalogueError;
use crate::toc::AxesSnapshot;
use bytes::BufMut;
use indexmap::IndexMap;
use sfdb_codec::{
    structs::{Decoder, Encoder},
    CodecError, SfdbDecode, SfdbEncode,
};
use sfdb_common::Key;
use sfdb_store::FieldLocation;
use std::collections::BTreeSet;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub const INDEX_SUFFIX: &str = "index";

const BLOB_MARKER: [u8; 4] = *b"SIDX";

/// Per-keyword sets of observed values.
///
/// Axes are a sound over-approximation of index membership: a value missing
/// from a present axis proves absence, anything else proves nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Axes(AxesSnapshot);

impl Axes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: AxesSnapshot) -> Self {
        Self(snapshot)
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        self.0
            .entry(name.to_string())
            .or_default()
            .insert(value.to_string());
    }

    pub fn observe(&mut self, key: &Key) {
        for (name, value) in key.iter() {
            self.insert(name, value);
        }
    }

    pub fn merge(&mut self, other: &AxesSnapshot) {
        for (name, values) in other {
            self.0
                .entry(name.clone())
                .or_default()
                .extend(values.iter().cloned());
        }
    }

    pub fn values(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.0.get(name)
    }

    /// False only when some keyword of `key` has an axis here that does not
    /// contain its value. False positives allowed, false negatives not.
    pub fn may_contain(&self, key: &Key) -> bool {
        for (name, value) in key.iter() {
            if let Some(values) = self.0.get(name) {
                if !values.contains(value) {
                    return false;
                }
            }
        }
        true
    }

    pub fn snapshot(&self) -> &AxesSnapshot {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One indexed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub datum_key: Key,
    pub location: FieldLocation,
}

impl SfdbEncode for IndexEntry {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.datum_key)
            .encode_field(&self.location)
            .finish();
    }
}

impl SfdbDecode for IndexEntry {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let decoder = Decoder::new(buf);
        let (datum_key, decoder) = decoder.decode_field::<Key>("datum_key")?;
        let (location, decoder) = decoder.decode_field::<FieldLocation>("location")?;
        Ok((
            Self {
                datum_key,
                location,
            },
            decoder.finish(),
        ))
    }
}

/// A second-level grouping of datum keys sharing one index key.
///
/// A writer-mode index accumulates entries in memory; `flush` appends the
/// epoch as one blob at the end of the index file (the file only ever
/// grows) and starts a fresh epoch. Reader-mode indexes are decoded from a
/// `(path, offset)` pair recorded in the TOC.
#[derive(Debug)]
pub struct Index {
    key: Key,
    path: PathBuf,
    timestamp: i64,
    axes: Axes,
    entries: IndexMap<String, IndexEntry>,
    dirty: bool,
}

fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Canonical lookup fingerprint of a datum key.
pub fn fingerprint(datum_key: &Key) -> String {
    datum_key.values_to_string()
}

impl Index {
    pub fn new_writer(key: Key, path: PathBuf) -> Self {
        Self {
            key,
            path,
            timestamp: now_epoch_seconds(),
            axes: Axes::new(),
            entries: IndexMap::new(),
            dirty: false,
        }
    }

    /// Decodes one flushed epoch from `path` at `offset`.
    pub fn load(path: &Path, offset: u64) -> Result<Self, CatalogueError> {
        let mut file = std::fs::File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut header = [0_u8; 8];
        file.read_exact(&mut header)?;
        if header[..4] != BLOB_MARKER {
            return Err(CatalogueError::TocCorrupt(format!(
                "index blob marker missing in {} at {offset}",
                path.display()
            )));
        }
        let payload_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut payload = vec![0_u8; payload_len + 4];
        file.read_exact(&mut payload)?;
        let (payload, crc_bytes) = payload.split_at(payload_len);
        let crc: [u8; 4] = crc_bytes
            .try_into()
            .map_err(|_| CatalogueError::TocCorrupt("index blob CRC missing".into()))?;
        if u32::from_be_bytes(crc) != crc32fast::hash(payload) {
            return Err(CatalogueError::TocCorrupt(format!(
                "index blob CRC mismatch in {}",
                path.display()
            )));
        }

        let decoder = Decoder::new(payload);
        let (key, decoder) = decoder.decode_field::<Key>("index_key")?;
        let (timestamp, decoder) = decoder.decode_field::<i64>("timestamp")?;
        let (axes, decoder) = decoder.decode_field::<AxesSnapshot>("axes")?;
        let (entry_list, decoder) = decoder.decode_field::<Vec<IndexEntry>>("entries")?;
        if !decoder.is_done() {
            return Err(CatalogueError::TocCorrupt(
                "trailing bytes in index blob".into(),
            ));
        }

        let mut entries = IndexMap::with_capacity(entry_list.len());
        for entry in entry_list {
            entries.insert(fingerprint(&entry.datum_key), entry);
        }
        Ok(Self {
            key,
            path: path.to_path_buf(),
            timestamp,
            axes: Axes::from_snapshot(axes),
            entries,
            dirty: false,
        })
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn axes(&self) -> &Axes {
        &self.axes
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Last writer wins within a flush epoch; axes only ever grow.
    pub fn put(&mut self, datum_key: &Key, location: FieldLocation) {
        self.axes.observe(datum_key);
        self.entries.insert(
            fingerprint(datum_key),
            IndexEntry {
                datum_key: datum_key.clone(),
                location,
            },
        );
        self.dirty = true;
    }

    /// Looks up a datum key; a hit from a mounted DB carries `remap` so the
    /// caller can translate the field back into host coordinates.
    pub fn get(&self, datum_key: &Key, remap: Option<&Key>) -> Option<FieldLocation> {
        let entry = self.entries.get(&fingerprint(datum_key))?;
        Some(match remap {
            Some(remap) if !remap.is_empty() => entry.location.clone().with_remap(remap.clone()),
            _ => entry.location.clone(),
        })
    }

    pub fn may_contain(&self, datum_key: &Key) -> bool {
        self.axes.may_contain(datum_key)
    }

    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    /// Appends the current epoch to the index file and starts a new one.
    /// Returns the blob offset and the flushed axes, or `None` when there
    /// was nothing to write.
    pub fn flush(&mut self) -> Result<Option<(u64, AxesSnapshot)>, CatalogueError> {
        if !self.dirty {
            return Ok(None);
        }

        let mut payload = Vec::new();
        let entry_list: Vec<IndexEntry> = self.entries.values().cloned().collect();
        Encoder::new(&mut payload)
            .encode_field(&self.key)
            .encode_field(&self.timestamp)
            .encode_field(self.axes.snapshot())
            .encode_field(&entry_list)
            .finish();

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let offset = file.seek(SeekFrom::End(0))?;
        let mut blob = Vec::with_capacity(payload.len() + 12);
        blob.put_slice(&BLOB_MARKER);
        blob.put_u32(payload.len() as u32);
        blob.put_slice(&payload);
        blob.put_u32(crc32fast::hash(&payload));
        file.write_all(&blob)?;
        file.sync_all()?;

        debug!(
            index = %self.key,
            path = %self.path.display(),
            offset,
            entries = entry_list.len(),
            "flushed index epoch"
        );

        let flushed_axes = self.axes.snapshot().clone();
        self.entries.clear();
        self.axes = Axes::new();
        self.timestamp = now_epoch_seconds();
        self.dirty = false;
        Ok(Some((offset, flushed_axes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfdb_common::SfdbUri;
    use sfdb_store::FieldLocation;

    fn datum(step: &str) -> Key {
        Key::from_pairs([("step", step), ("param", "130")])
    }

    fn location(offset: u64) -> FieldLocation {
        FieldLocation::file(
            SfdbUri::parse("file:/data/fdb/db/fc,sfc.0001.data").expect("uri"),
            offset,
            4,
        )
    }

    #[test]
    fn put_then_get_with_axes() {
        let mut index = Index::new_writer(
            Key::from_pairs([("type", "fc")]),
            PathBuf::from("/tmp/unused.index"),
        );
        index.put(&datum("0"), location(0));
        index.put(&datum("6"), location(4));

        assert_eq!(index.get(&datum("0"), None), Some(location(0)));
        assert!(index.may_contain(&datum("6")));
        // "12" is outside the step axis: provably absent.
        assert!(!index.may_contain(&datum("12")));
        assert!(index.get(&datum("12"), None).is_none());
    }

    #[test]
    fn last_writer_wins_within_an_epoch() {
        let mut index = Index::new_writer(
            Key::from_pairs([("type", "fc")]),
            PathBuf::from("/tmp/unused.index"),
        );
        index.put(&datum("0"), location(0));
        index.put(&datum("0"), location(400));
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(&datum("0"), None), Some(location(400)));
    }

    #[test]
    fn remapped_hits_carry_the_remap_key() {
        let mut index = Index::new_writer(
            Key::from_pairs([("type", "fc")]),
            PathBuf::from("/tmp/unused.index"),
        );
        index.put(&datum("0"), location(0));

        let remap = Key::from_pairs([("date", "20260801")]);
        let hit = index.get(&datum("0"), Some(&remap)).expect("hit");
        assert_eq!(hit.remap_key(), Some(&remap));
    }

    #[test]
    fn flush_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fc,sfc.0001.index");
        let mut index = Index::new_writer(Key::from_pairs([("type", "fc")]), path.clone());
        index.put(&datum("0"), location(0));
        index.put(&datum("6"), location(4));

        let (offset, axes) = index.flush().expect("flush").expect("dirty");
        assert_eq!(offset, 0);
        assert!(axes.contains_key("step"));
        // Fresh epoch after flush.
        assert!(index.is_empty());
        assert!(!index.dirty());

        let loaded = Index::load(&path, offset).expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(&datum("6"), None), Some(location(4)));
        assert!(loaded.may_contain(&datum("0")));
    }

    #[test]
    fn the_index_file_grows_monotonically() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fc,sfc.0001.index");
        let mut index = Index::new_writer(Key::from_pairs([("type", "fc")]), path.clone());

        index.put(&datum("0"), location(0));
        let (first, _) = index.flush().expect("flush").expect("dirty");
        index.put(&datum("6"), location(4));
        let (second, _) = index.flush().expect("flush").expect("dirty");
        assert!(second > first);

        // Both epochs stay readable.
        assert_eq!(Index::load(&path, first).expect("load").len(), 1);
        assert_eq!(Index::load(&path, second).expect("load").len(), 1);
    }

    #[test]
    fn flush_without_changes_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fc,sfc.0001.index");
        let mut index = Index::new_writer(Key::from_pairs([("type", "fc")]), path);
        assert!(index.flush().expect("flush").is_none());
    }
}
