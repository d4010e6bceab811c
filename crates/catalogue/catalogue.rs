pub mod engine;
pub mod error;
pub mod index;
pub mod reader;
pub mod toc;
pub mod version;
pub mod visit;
pub mod writer;

pub use engine::Engine;
pub use error::CatalogueError;
pub use index::{Axes, Index, IndexEntry};
pub use reader::{LoadedIndex, TocCatalogueReader};
pub use version::SerialisationVersion;
pub use writer::TocCatalogueWriter;

use async_trait::async_trait;
use sfdb_common::{ControlAction, ControlIdentifier, ControlIdentifiers, Key, SfdbUri};
use sfdb_store::FieldLocation;
use std::collections::BTreeSet;

/// Common surface of the index side of one database, shared by local
/// catalogues and their remote proxies.
pub trait Catalogue: Send {
    fn db_key(&self) -> &Key;

    fn uri(&self) -> SfdbUri;

    /// The set of disabled operations currently in force.
    fn disabled(&self) -> ControlIdentifiers;

    fn enabled(&self, id: ControlIdentifier) -> bool {
        self.disabled().enabled(id)
    }
}

/// Read contract: a snapshot view of the TOC taken at open time.
#[async_trait]
pub trait CatalogueReader: Catalogue {
    /// Selects the indexes matching `index_key` for subsequent retrievals.
    /// Returns false when nothing matches. Idempotent.
    fn select_index(&mut self, index_key: &Key) -> bool;

    fn deselect_index(&mut self);

    /// First hit across the selected indexes, in TOC order.
    async fn retrieve(&mut self, datum_key: &Key)
        -> Result<Option<FieldLocation>, CatalogueError>;

    /// Union of the named axis across the selected indexes.
    async fn axis(&mut self, keyword: &str) -> Result<Option<BTreeSet<String>>, CatalogueError>;
}

/// Write contract: exclusive append rights on the TOC for the writer's
/// lifetime (or a private sub-TOC in concurrent-ingestion mode).
#[async_trait]
pub trait CatalogueWriter: Catalogue {
    /// Makes `index_key` current, creating the index on first use.
    /// Idempotent: re-selecting the current key has no further effect.
    fn select_index(&mut self, index_key: &Key) -> Result<(), CatalogueError>;

    fn deselect_index(&mut self);

    /// Records one field under the current index. Usage error without a
    /// selected index.
    async fn archive(
        &mut self,
        datum_key: &Key,
        location: FieldLocation,
    ) -> Result<(), CatalogueError>;

    /// Flushes all dirty indexes and publishes them in the TOC. `expected`
    /// must equal the number of `archive` calls since the previous flush;
    /// a mismatch is a consistency error. Flushing twice with nothing in
    /// between is a no-op.
    async fn flush(&mut self, expected: usize) -> Result<(), CatalogueError>;

    /// Mounts (or unmounts) another database into this one. Keys may only
    /// differ on `varying` keywords.
    async fn overlay_db(
        &mut self,
        other_db_key: &Key,
        other_toc: SfdbUri,
        varying: &BTreeSet<String>,
        unmount: bool,
    ) -> Result<(), CatalogueError>;

    /// Masks every record currently in the TOC.
    async fn hide_contents(&mut self) -> Result<(), CatalogueError>;

    /// Flips control bits and persists the result in the TOC.
    async fn control(
        &mut self,
        action: ControlAction,
        identifiers: &[ControlIdentifier],
    ) -> Result<(), CatalogueError>;

    /// Flushes outstanding state and releases the TOC. Idempotent.
    async fn close(&mut self) -> Result<(), CatalogueError>;
}
