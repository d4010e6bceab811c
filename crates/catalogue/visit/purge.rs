use super::Visitor;
use crate::error::CatalogueError;
use crate::index::{fingerprint, IndexEntry};
use crate::reader::{LoadedIndex, TocCatalogueReader};
use crate::toc::TocIndexRef;
use async_trait::async_trait;
use sfdb_common::{Key, SfdbUri};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// What a purge would (or did) do: index epochs whose every entry is
/// shadowed by a later epoch of the same index key, and the store units
/// referenced by nothing else.
#[derive(Debug, Default)]
pub struct PurgeReport {
    pub duplicate_fields: usize,
    pub maskable: Vec<TocIndexRef>,
    pub removable_units: Vec<SfdbUri>,
}

struct EpochRecord {
    toc_ref: TocIndexRef,
    index_key_fp: String,
    entries: Vec<(String, Option<SfdbUri>)>,
}

/// Identifies fields duplicated across index epochs. Within one index key,
/// a later epoch's entry shadows any earlier entry with the same datum
/// fingerprint; epochs consisting entirely of shadowed entries are
/// maskable, and their store units become removable once no live entry
/// references them.
#[derive(Default)]
pub struct PurgeVisitor {
    epochs: Vec<EpochRecord>,
}

impl PurgeVisitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_report(self) -> PurgeReport {
        let mut report = PurgeReport::default();

        // Last-seen epoch per (index key, datum) wins; visit order is TOC
        // order, so later wins by overwrite.
        let mut winner: HashMap<(String, String), usize> = HashMap::new();
        for (epoch_pos, epoch) in self.epochs.iter().enumerate() {
            for (datum_fp, _) in &epoch.entries {
                winner.insert((epoch.index_key_fp.clone(), datum_fp.clone()), epoch_pos);
            }
        }

        let mut live_units: BTreeSet<SfdbUri> = BTreeSet::new();
        let mut masked_units: BTreeMap<SfdbUri, usize> = BTreeMap::new();
        let mut maskable_pos = Vec::new();

        for (epoch_pos, epoch) in self.epochs.iter().enumerate() {
            let mut shadowed = 0;
            for (datum_fp, unit) in &epoch.entries {
                let key = (epoch.index_key_fp.clone(), datum_fp.clone());
                if winner.get(&key) != Some(&epoch_pos) {
                    shadowed += 1;
                    if let Some(unit) = unit {
                        *masked_units.entry(unit.clone()).or_default() += 1;
                    }
                } else if let Some(unit) = unit {
                    live_units.insert(unit.clone());
                }
            }
            report.duplicate_fields += shadowed;
            if shadowed == epoch.entries.len() && !epoch.entries.is_empty() {
                maskable_pos.push(epoch_pos);
            }
        }

        for pos in maskable_pos {
            report.maskable.push(self.epochs[pos].toc_ref.clone());
        }
        report.removable_units = masked_units
            .into_keys()
            .filter(|unit| !live_units.contains(unit))
            .collect();
        report
    }
}

#[async_trait]
impl Visitor for PurgeVisitor {
    async fn visit_index(
        &mut self,
        _reader: &TocCatalogueReader,
        loaded: &LoadedIndex,
    ) -> Result<bool, CatalogueError> {
        self.epochs.push(EpochRecord {
            toc_ref: loaded.toc_ref.clone(),
            index_key_fp: fingerprint(loaded.index.key()),
            entries: Vec::new(),
        });
        Ok(true)
    }

    async fn visit_datum(
        &mut self,
        _db_key: &Key,
        _loaded: &LoadedIndex,
        entry: &IndexEntry,
    ) -> Result<(), CatalogueError> {
        if let Some(epoch) = self.epochs.last_mut() {
            epoch.entries.push((
                fingerprint(&entry.datum_key),
                entry.location.uri().cloned(),
            ));
        }
        Ok(())
    }
}
