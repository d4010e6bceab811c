use super::{full_key, Visitor};
use crate::error::CatalogueError;
use crate::index::IndexEntry;
use crate::reader::LoadedIndex;
use async_trait::async_trait;
use bytes::BufMut;
use sfdb_codec::{
    structs::{Decoder, Encoder},
    CodecError, SfdbDecode, SfdbEncode,
};
use sfdb_common::Key;
use sfdb_store::FieldLocation;
use std::collections::HashMap;

/// One listed field: its full key, where its bytes live, and the timestamp
/// of the index epoch that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListElement {
    pub key: Key,
    pub location: FieldLocation,
    pub timestamp: i64,
}

impl SfdbEncode for ListElement {
    fn encode(&self, buf: &mut dyn BufMut) {
        Encoder::new(buf)
            .encode_field(&self.key)
            .encode_field(&self.location)
            .encode_field(&self.timestamp)
            .finish();
    }
}

impl SfdbDecode for ListElement {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let decoder = Decoder::new(buf);
        let (key, decoder) = decoder.decode_field::<Key>("key")?;
        let (location, decoder) = decoder.decode_field::<FieldLocation>("location")?;
        let (timestamp, decoder) = decoder.decode_field::<i64>("timestamp")?;
        Ok((
            Self {
                key,
                location,
                timestamp,
            },
            decoder.finish(),
        ))
    }
}

/// Collects `(full key, location)` pairs. With de-duplication on, entries
/// are keyed into a hypercube over the full key's coordinates and the most
/// recent index epoch wins.
pub struct ListVisitor {
    dedup: bool,
    elements: Vec<ListElement>,
    cube: HashMap<String, usize>,
}

impl ListVisitor {
    pub fn new(dedup: bool) -> Self {
        Self {
            dedup,
            elements: Vec::new(),
            cube: HashMap::new(),
        }
    }

    pub fn into_elements(self) -> Vec<ListElement> {
        self.elements
    }
}

#[async_trait]
impl Visitor for ListVisitor {
    async fn visit_datum(
        &mut self,
        db_key: &Key,
        loaded: &LoadedIndex,
        entry: &IndexEntry,
    ) -> Result<(), CatalogueError> {
        let key = full_key(db_key, loaded, entry);
        let element = ListElement {
            key,
            location: entry.location.clone(),
            timestamp: loaded.index.timestamp(),
        };
        if self.dedup {
            let coordinate = element.key.to_string();
            match self.cube.get(&coordinate) {
                Some(&i) => {
                    // Collapse duplicates to the most recent epoch.
                    if element.timestamp >= self.elements[i].timestamp {
                        self.elements[i] = element;
                    }
                }
                None => {
                    self.cube.insert(coordinate, self.elements.len());
                    self.elements.push(element);
                }
            }
        } else {
            self.elements.push(element);
        }
        Ok(())
    }
}
