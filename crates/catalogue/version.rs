use crate::error::CatalogueError;
use sfdb_common::config::ENV_SERIALISATION_VERSION;

/// TOC record serialisation versions this build can read.
pub const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u16> = 1..=2;

/// Version written by this build unless pinned lower.
pub const LATEST_VERSION: u16 = 2;

/// The TOC serialisation version in force for a writer.
///
/// Defaults to the latest; `FDB_SERIALISATION_VERSION` pins it lower so new
/// writers can interoperate with deployments still running older readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialisationVersion {
    used: u16,
}

impl Default for SerialisationVersion {
    fn default() -> Self {
        Self {
            used: LATEST_VERSION,
        }
    }
}

impl SerialisationVersion {
    pub fn from_env() -> Result<Self, CatalogueError> {
        match std::env::var(ENV_SERIALISATION_VERSION) {
            Ok(text) => {
                let pinned: u16 = text.parse().map_err(|_| {
                    CatalogueError::Usage(format!(
                        "{ENV_SERIALISATION_VERSION}='{text}' is not a version number"
                    ))
                })?;
                Self::pinned(pinned)
            }
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn pinned(version: u16) -> Result<Self, CatalogueError> {
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(CatalogueError::UnsupportedVersion {
                found: version,
                latest: LATEST_VERSION,
            });
        }
        Ok(Self { used: version })
    }

    pub fn used(&self) -> u16 {
        self.used
    }
}

/// Readers accept any enumerated version and refuse newer ones outright.
pub fn check_readable(version: u16) -> Result<(), CatalogueError> {
    if SUPPORTED_VERSIONS.contains(&version) {
        Ok(())
    } else {
        Err(CatalogueError::UnsupportedVersion {
            found: version,
            latest: LATEST_VERSION,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_is_supported() {
        assert!(check_readable(LATEST_VERSION).is_ok());
        assert!(check_readable(1).is_ok());
    }

    #[test]
    fn newer_than_latest_is_refused() {
        assert!(matches!(
            check_readable(LATEST_VERSION + 1),
            Err(CatalogueError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn pin_outside_range_is_an_error() {
        assert!(SerialisationVersion::pinned(0).is_err());
        assert!(SerialisationVersion::pinned(99).is_err());
        assert_eq!(
            SerialisationVersion::pinned(1).expect("pin").used(),
            1
        );
    }
}
