use crate::error::CatalogueError;
use crate::toc::record::{AxesSnapshot, TocPayload, TocRecord};
use crate::version::SerialisationVersion;
use sfdb_common::{ControlIdentifiers, Key, Schema, SfdbUri};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Master log file inside a DB directory.
pub const TOC_FILE_NAME: &str = "toc";
/// Copy of the schema the DB was created with.
pub const SCHEMA_FILE_NAME: &str = "schema";
const LOCK_FILE_NAME: &str = "toc.lock";

const LOCK_RETRIES: u32 = 20;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Advisory lock over a DB directory's master TOC. Removed on drop.
struct TocLock {
    path: PathBuf,
}

impl TocLock {
    fn acquire(directory: &Path) -> Result<Self, CatalogueError> {
        let path = directory.join(LOCK_FILE_NAME);
        for _ in 0..LOCK_RETRIES {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CatalogueError::TocLocked(path.display().to_string()))
    }
}

impl Drop for TocLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release toc lock");
        }
    }
}

/// Append side of a database's table of contents.
///
/// In direct mode the writer holds the TOC lock for its lifetime and appends
/// straight to the master log. In sub-TOC mode appends go to a private
/// per-process log published into the master by a single SUB_TOC record, so
/// concurrent ingestion never serialises on the master lock.
pub struct TocWriter {
    directory: PathBuf,
    db_key: Key,
    version: SerialisationVersion,
    /// Private log this writer appends to, when in sub-TOC mode.
    sub_path: Option<PathBuf>,
    /// Held for the writer's lifetime in direct mode.
    lifetime_lock: Option<TocLock>,
}

impl TocWriter {
    pub fn create(
        directory: impl AsRef<Path>,
        db_key: Key,
        schema: &Schema,
        version: SerialisationVersion,
        use_sub_toc: bool,
    ) -> Result<Self, CatalogueError> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)?;

        let lock = TocLock::acquire(&directory)?;
        let master = directory.join(TOC_FILE_NAME);
        if !master.exists() {
            debug!(db = %db_key, path = %master.display(), "initialising table of contents");
            let init = TocRecord::new(
                version.used(),
                TocPayload::Init {
                    db_key: db_key.clone(),
                    schema_digest: schema.digest(),
                    writer_pid: std::process::id(),
                },
            );
            append_bytes(&master, &init.to_bytes())?;
            std::fs::write(directory.join(SCHEMA_FILE_NAME), schema.source())?;
        } else {
            // Existing DB: the init record must agree on what this DB is.
            let snapshot = read_toc(&master)?;
            if snapshot.db_key != db_key {
                return Err(CatalogueError::TocCorrupt(format!(
                    "database key mismatch: toc has {}, writer wants {db_key}",
                    snapshot.db_key
                )));
            }
            if snapshot.schema_digest != schema.digest() {
                warn!(db = %db_key, "schema digest differs from the one this DB was created with");
            }
        }

        let mut writer = Self {
            directory,
            db_key,
            version,
            sub_path: None,
            lifetime_lock: None,
        };

        if use_sub_toc {
            let unique: u32 = rand::random();
            let sub_path = writer.directory.join(format!(
                "toc.{}.{unique:08x}.sub",
                std::process::id()
            ));
            let init = TocRecord::new(
                version.used(),
                TocPayload::Init {
                    db_key: writer.db_key.clone(),
                    schema_digest: schema.digest(),
                    writer_pid: std::process::id(),
                },
            );
            append_bytes(&sub_path, &init.to_bytes())?;
            // Publish the private log, then release the master lock.
            let record = TocRecord::new(
                version.used(),
                TocPayload::SubToc {
                    uri: SfdbUri::file(&sub_path),
                },
            );
            append_bytes(&writer.directory.join(TOC_FILE_NAME), &record.to_bytes())?;
            drop(lock);
            writer.sub_path = Some(sub_path);
        } else {
            writer.lifetime_lock = Some(lock);
        }

        Ok(writer)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn db_key(&self) -> &Key {
        &self.db_key
    }

    pub fn toc_uri(&self) -> SfdbUri {
        SfdbUri::file(self.directory.join(TOC_FILE_NAME))
    }

    pub fn version(&self) -> &SerialisationVersion {
        &self.version
    }

    /// Appends records to this writer's log as one contiguous block write.
    pub fn append(&self, payloads: &[TocPayload]) -> Result<(), CatalogueError> {
        if payloads.is_empty() {
            return Ok(());
        }
        let mut block = Vec::new();
        for payload in payloads {
            block.extend_from_slice(
                &TocRecord::new(self.version.used(), payload.clone()).to_bytes(),
            );
        }
        match &self.sub_path {
            Some(sub) => append_bytes(sub, &block),
            None => append_bytes(&self.directory.join(TOC_FILE_NAME), &block),
        }
    }

    /// Appends to the master log regardless of mode, taking the short lock
    /// when this writer does not already hold it.
    pub fn append_master(&self, payloads: &[TocPayload]) -> Result<(), CatalogueError> {
        if payloads.is_empty() {
            return Ok(());
        }
        let mut block = Vec::new();
        for payload in payloads {
            block.extend_from_slice(
                &TocRecord::new(self.version.used(), payload.clone()).to_bytes(),
            );
        }
        let master = self.directory.join(TOC_FILE_NAME);
        if self.lifetime_lock.is_some() {
            append_bytes(&master, &block)
        } else {
            let _lock = TocLock::acquire(&self.directory)?;
            append_bytes(&master, &block)
        }
    }
}

fn append_bytes(path: &Path, bytes: &[u8]) -> Result<(), CatalogueError> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// One effective (unmasked) INDEX record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocIndexRef {
    pub index_key: Key,
    /// Absolute path of the index file.
    pub path: PathBuf,
    pub offset: u64,
    pub axes: AxesSnapshot,
    pub timestamp: i64,
    /// Key correction for entries mounted from another database.
    pub remap_key: Option<Key>,
    /// The TOC file this record was read from.
    pub origin: PathBuf,
}

impl TocIndexRef {
    /// The CLEAR payload that masks exactly this record.
    pub fn clear_payload(&self) -> TocPayload {
        TocPayload::Clear {
            path: self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            offset: self.offset,
        }
    }
}

/// A reader's view of a TOC at open time.
#[derive(Debug, Default)]
pub struct TocSnapshot {
    pub db_key: Key,
    pub schema_digest: u32,
    pub entries: Vec<TocIndexRef>,
    /// INDEX records hidden by CLEAR/CLEAR_ALL, kept for wipe accounting.
    pub masked: Vec<TocIndexRef>,
    pub subtocs: Vec<PathBuf>,
    pub disabled: ControlIdentifiers,
}

struct LoadContext {
    visited: BTreeSet<PathBuf>,
    cleared: BTreeSet<(String, u64)>,
    raw: Vec<TocIndexRef>,
    subtocs: Vec<PathBuf>,
    db_key: Option<Key>,
    schema_digest: u32,
    disabled: ControlIdentifiers,
}

/// Streams a TOC (and any mounted sub-TOCs) into a snapshot, applying
/// CLEAR/SUB_TOC_CLEAR/CLEAR_ALL masking. Cycles between TOC files are
/// corruption.
pub fn read_toc(toc_path: impl AsRef<Path>) -> Result<TocSnapshot, CatalogueError> {
    let toc_path = toc_path.as_ref();
    let mut ctx = LoadContext {
        visited: BTreeSet::new(),
        cleared: BTreeSet::new(),
        raw: Vec::new(),
        subtocs: Vec::new(),
        db_key: None,
        schema_digest: 0,
        disabled: ControlIdentifiers::none(),
    };
    load_toc_file(toc_path, None, &mut ctx, true)?;

    let db_key = ctx
        .db_key
        .ok_or_else(|| CatalogueError::TocCorrupt("toc has no init record".into()))?;

    let mut snapshot = TocSnapshot {
        db_key,
        schema_digest: ctx.schema_digest,
        entries: Vec::new(),
        masked: Vec::new(),
        subtocs: ctx.subtocs,
        disabled: ctx.disabled,
    };
    for entry in ctx.raw {
        let reference = (
            entry
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            entry.offset,
        );
        if ctx.cleared.contains(&reference) {
            snapshot.masked.push(entry);
        } else {
            snapshot.entries.push(entry);
        }
    }
    Ok(snapshot)
}

fn load_toc_file(
    toc_path: &Path,
    inherited_remap: Option<Key>,
    ctx: &mut LoadContext,
    top_level: bool,
) -> Result<(), CatalogueError> {
    let canonical = toc_path
        .canonicalize()
        .unwrap_or_else(|_| toc_path.to_path_buf());
    if !ctx.visited.insert(canonical) {
        return Err(CatalogueError::SubTocCycle(toc_path.display().to_string()));
    }

    let directory = toc_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let mut file = std::fs::File::open(toc_path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CatalogueError::DbNotFound(toc_path.display().to_string()),
        _ => CatalogueError::Io(e),
    })?;

    let mut records = Vec::new();
    while let Some(record) = TocRecord::read_from(&mut file)? {
        records.push(record);
    }

    // Masking prepass over this file: CLEAR references and SUB_TOC_CLEAR
    // unmounts apply wherever the target lives; CLEAR_ALL hides everything
    // strictly before the last one in the same file.
    let mut sub_cleared: BTreeSet<String> = BTreeSet::new();
    let mut clear_all_pos: Option<usize> = None;
    for (i, record) in records.iter().enumerate() {
        match &record.payload {
            TocPayload::Clear { path, offset } => {
                ctx.cleared.insert((path.clone(), *offset));
            }
            TocPayload::SubTocClear { uri } => {
                sub_cleared.insert(uri.to_string());
            }
            TocPayload::ClearAll => clear_all_pos = Some(i),
            _ => {}
        }
    }

    let mut local_remap = inherited_remap;
    let mut mounts: Vec<(PathBuf, Option<Key>)> = Vec::new();

    for (i, record) in records.into_iter().enumerate() {
        let hidden = clear_all_pos.map(|pos| i < pos).unwrap_or(false);
        match record.payload {
            TocPayload::Init {
                db_key,
                schema_digest,
                writer_pid: _,
            } => {
                if top_level {
                    ctx.schema_digest = schema_digest;
                    ctx.db_key = Some(db_key);
                } else if let Some(host) = &ctx.db_key {
                    // Entries mounted from a differently-keyed DB are
                    // remapped into the host's coordinates.
                    if local_remap.is_none() {
                        let remap = key_difference(host, &db_key);
                        if !remap.is_empty() {
                            local_remap = Some(remap);
                        }
                    }
                }
            }
            TocPayload::Index {
                index_key,
                path,
                offset,
                axes,
                timestamp,
            } if !hidden => {
                ctx.raw.push(TocIndexRef {
                    index_key,
                    path: directory.join(&path),
                    offset,
                    axes,
                    timestamp,
                    remap_key: local_remap.clone(),
                    origin: toc_path.to_path_buf(),
                });
            }
            TocPayload::SubToc { uri } if !hidden => {
                if !sub_cleared.contains(&uri.to_string()) {
                    mounts.push((uri.as_path(), local_remap.clone()));
                }
            }
            TocPayload::Control { disabled } if !hidden && top_level => {
                // Last record wins; each record carries the full mask.
                ctx.disabled = disabled;
            }
            _ => {}
        }
    }

    for (path, remap) in mounts {
        ctx.subtocs.push(path.clone());
        load_toc_file(&path, remap, ctx, false)?;
    }
    Ok(())
}

/// Pairs of `host` whose values differ from (or are missing in) `other`.
fn key_difference(host: &Key, other: &Key) -> Key {
    let mut diff = Key::new();
    for (name, value) in host.iter() {
        if other.get(name) != Some(value) {
            diff.insert(name, value);
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toc::record::TocPayload;
    use sfdb_common::schema::test_support::example_schema;
    use sfdb_common::ControlIdentifier;

    fn db_key() -> Key {
        Key::from_pairs([("class", "od"), ("stream", "oper"), ("date", "20260801")])
    }

    fn index_payload(path: &str, offset: u64) -> TocPayload {
        TocPayload::Index {
            index_key: Key::from_pairs([("type", "fc"), ("levtype", "sfc")]),
            path: path.to_string(),
            offset,
            axes: AxesSnapshot::new(),
            timestamp: 1_754_000_000,
        }
    }

    fn new_writer(dir: &Path, use_sub_toc: bool) -> TocWriter {
        TocWriter::create(
            dir,
            db_key(),
            &example_schema(),
            SerialisationVersion::default(),
            use_sub_toc,
        )
        .expect("writer")
    }

    #[test]
    fn init_then_index_records_are_visible() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = new_writer(dir.path(), false);
        writer
            .append(&[index_payload("a.index", 0), index_payload("a.index", 4096)])
            .expect("append");

        let snapshot = read_toc(dir.path().join(TOC_FILE_NAME)).expect("read");
        assert_eq!(snapshot.db_key, db_key());
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.entries[0].path, dir.path().join("a.index"));
    }

    #[test]
    fn clear_masks_a_single_index_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = new_writer(dir.path(), false);
        writer
            .append(&[index_payload("a.index", 0), index_payload("a.index", 4096)])
            .expect("append");
        writer
            .append(&[TocPayload::Clear {
                path: "a.index".into(),
                offset: 0,
            }])
            .expect("append clear");

        let snapshot = read_toc(dir.path().join(TOC_FILE_NAME)).expect("read");
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].offset, 4096);
        assert_eq!(snapshot.masked.len(), 1);
    }

    #[test]
    fn clear_all_hides_everything_before_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = new_writer(dir.path(), false);
        writer
            .append(&[index_payload("a.index", 0)])
            .expect("append");
        writer.append(&[TocPayload::ClearAll]).expect("clear all");
        writer
            .append(&[index_payload("b.index", 0)])
            .expect("append after");

        let snapshot = read_toc(dir.path().join(TOC_FILE_NAME)).expect("read");
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].path, dir.path().join("b.index"));
    }

    #[test]
    fn sub_toc_mounts_and_unmounts() {
        let host_dir = tempfile::tempdir().expect("tempdir");
        let guest_dir = tempfile::tempdir().expect("tempdir");

        let guest = new_writer(guest_dir.path(), false);
        guest
            .append(&[index_payload("g.index", 0)])
            .expect("guest append");

        let host = new_writer(host_dir.path(), false);
        let guest_toc = SfdbUri::file(guest_dir.path().join(TOC_FILE_NAME));
        host.append(&[TocPayload::SubToc {
            uri: guest_toc.clone(),
        }])
        .expect("mount");

        let snapshot = read_toc(host_dir.path().join(TOC_FILE_NAME)).expect("read");
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.subtocs.len(), 1);

        host.append(&[TocPayload::SubTocClear { uri: guest_toc }])
            .expect("unmount");
        let snapshot = read_toc(host_dir.path().join(TOC_FILE_NAME)).expect("read");
        assert!(snapshot.entries.is_empty());
    }

    #[test]
    fn sub_toc_cycles_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = new_writer(dir.path(), false);
        // A TOC that mounts itself.
        writer
            .append(&[TocPayload::SubToc {
                uri: SfdbUri::file(dir.path().join(TOC_FILE_NAME)),
            }])
            .expect("append");

        assert!(matches!(
            read_toc(dir.path().join(TOC_FILE_NAME)),
            Err(CatalogueError::SubTocCycle(_))
        ));
    }

    #[test]
    fn sub_toc_mode_publishes_a_private_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = new_writer(dir.path(), true);
        writer
            .append(&[index_payload("s.index", 0)])
            .expect("append");

        // The entry arrives through the mounted sub-toc.
        let snapshot = read_toc(dir.path().join(TOC_FILE_NAME)).expect("read");
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.subtocs.len(), 1);
        assert_ne!(snapshot.entries[0].origin, dir.path().join(TOC_FILE_NAME));
    }

    #[test]
    fn two_direct_writers_are_mutually_exclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _first = new_writer(dir.path(), false);
        // The second direct-mode writer cannot take the lifetime lock.
        let second = TocWriter::create(
            dir.path(),
            db_key(),
            &example_schema(),
            SerialisationVersion::default(),
            false,
        );
        assert!(matches!(second, Err(CatalogueError::TocLocked(_))));
    }

    #[test]
    fn mounted_foreign_db_entries_carry_a_remap() {
        let host_dir = tempfile::tempdir().expect("tempdir");
        let guest_dir = tempfile::tempdir().expect("tempdir");

        let guest_key = Key::from_pairs([("class", "od"), ("stream", "oper"), ("date", "20260707")]);
        let guest = TocWriter::create(
            guest_dir.path(),
            guest_key,
            &example_schema(),
            SerialisationVersion::default(),
            false,
        )
        .expect("guest writer");
        guest
            .append(&[index_payload("g.index", 0)])
            .expect("guest append");

        let host = new_writer(host_dir.path(), false);
        host.append(&[TocPayload::SubToc {
            uri: SfdbUri::file(guest_dir.path().join(TOC_FILE_NAME)),
        }])
        .expect("mount");

        let snapshot = read_toc(host_dir.path().join(TOC_FILE_NAME)).expect("read");
        assert_eq!(snapshot.entries.len(), 1);
        let remap = snapshot.entries[0].remap_key.as_ref().expect("remap");
        assert_eq!(remap.get("date"), Some("20260801"));
        assert_eq!(remap.get("class"), None);
    }

    #[test]
    fn control_records_set_the_disabled_mask() {
        let dir = tempfile::tempdir().expect("tempdir");
        let writer = new_writer(dir.path(), false);
        writer
            .append(&[TocPayload::Control {
                disabled: ControlIdentifiers::of([ControlIdentifier::Wipe]),
            }])
            .expect("append");

        let snapshot = read_toc(dir.path().join(TOC_FILE_NAME)).expect("read");
        assert!(!snapshot.disabled.enabled(ControlIdentifier::Wipe));
        assert!(snapshot.disabled.enabled(ControlIdentifier::List));
    }
}
