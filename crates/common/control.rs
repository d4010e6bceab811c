use sfdb_codec::{CodecError, SfdbDecode, SfdbEncode};
use std::fmt::Display;

/// Operations that can be switched off per database. A disabled bit makes
/// the database appear non-existent to that operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlIdentifier {
    List = 0,
    Retrieve = 1,
    Archive = 2,
    Wipe = 3,
    UniqueRoot = 4,
}

impl ControlIdentifier {
    pub const ALL: [ControlIdentifier; 5] = [
        ControlIdentifier::List,
        ControlIdentifier::Retrieve,
        ControlIdentifier::Archive,
        ControlIdentifier::Wipe,
        ControlIdentifier::UniqueRoot,
    ];

    fn bit(self) -> u64 {
        1 << (self as u8)
    }
}

impl Display for ControlIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ControlIdentifier::List => "list",
            ControlIdentifier::Retrieve => "retrieve",
            ControlIdentifier::Archive => "archive",
            ControlIdentifier::Wipe => "wipe",
            ControlIdentifier::UniqueRoot => "unique-root",
        };
        name.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Disable,
    Enable,
}

/// Set of *disabled* operations. The empty set means everything is allowed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlIdentifiers {
    disabled: u64,
}

impl ControlIdentifiers {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn of(identifiers: impl IntoIterator<Item = ControlIdentifier>) -> Self {
        let mut set = Self::default();
        for id in identifiers {
            set.disable(id);
        }
        set
    }

    pub fn enabled(&self, id: ControlIdentifier) -> bool {
        self.disabled & id.bit() == 0
    }

    pub fn disable(&mut self, id: ControlIdentifier) {
        self.disabled |= id.bit();
    }

    pub fn enable(&mut self, id: ControlIdentifier) {
        self.disabled &= !id.bit();
    }

    pub fn apply(&mut self, action: ControlAction, ids: impl IntoIterator<Item = ControlIdentifier>) {
        for id in ids {
            match action {
                ControlAction::Disable => self.disable(id),
                ControlAction::Enable => self.enable(id),
            }
        }
    }

    /// Effective state when this writer-side set is combined with history
    /// read back from disk: a bit disabled on either side stays disabled.
    pub fn merged_with(&self, other: &ControlIdentifiers) -> ControlIdentifiers {
        ControlIdentifiers {
            disabled: self.disabled | other.disabled,
        }
    }
}

impl Display for ControlIdentifiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let disabled: Vec<String> = ControlIdentifier::ALL
            .into_iter()
            .filter(|id| !self.enabled(*id))
            .map(|id| id.to_string())
            .collect();
        write!(f, "disabled[{}]", disabled.join(","))
    }
}

impl SfdbEncode for ControlIdentifiers {
    fn encode(&self, buf: &mut dyn bytes::BufMut) {
        self.disabled.encode(buf);
    }
}

impl SfdbDecode for ControlIdentifiers {
    fn decode_unfinished(buf: &[u8]) -> Result<(Self, &[u8]), CodecError> {
        let (disabled, rest) = u64::decode_unfinished(buf)?;
        Ok((Self { disabled }, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allows_everything() {
        let ids = ControlIdentifiers::none();
        for id in ControlIdentifier::ALL {
            assert!(ids.enabled(id));
        }
    }

    #[test]
    fn disable_then_enable_round_trip() {
        let mut ids = ControlIdentifiers::none();
        ids.apply(
            ControlAction::Disable,
            [ControlIdentifier::Wipe, ControlIdentifier::Archive],
        );
        assert!(!ids.enabled(ControlIdentifier::Wipe));
        assert!(ids.enabled(ControlIdentifier::List));

        ids.apply(ControlAction::Enable, [ControlIdentifier::Wipe]);
        assert!(ids.enabled(ControlIdentifier::Wipe));
        assert!(!ids.enabled(ControlIdentifier::Archive));
    }

    #[test]
    fn merge_keeps_the_stricter_side() {
        let mut writer = ControlIdentifiers::none();
        writer.disable(ControlIdentifier::Retrieve);
        let mut history = ControlIdentifiers::none();
        history.disable(ControlIdentifier::List);

        let effective = writer.merged_with(&history);
        assert!(!effective.enabled(ControlIdentifier::Retrieve));
        assert!(!effective.enabled(ControlIdentifier::List));
        assert!(effective.enabled(ControlIdentifier::Archive));
    }
}
