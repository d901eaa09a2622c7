//! Electrode map: resolution of electrode numbers (1-140) to matrix
//! addresses, rebuilt from two chained external key/value sources.
//!
//! The first source maps an electrode number to an external pin id, the
//! second maps matrix positions to external pin ids. Entries the sources
//! cannot resolve fall back to the deterministic default layout so that a
//! hardware actuator never sees an unresolved electrode.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{NUM_COLS, NUM_ELECTRODES, NUM_ROWS};

/// Resolved matrix position of one electrode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectrodeAddress {
    pub row: u8,
    pub col: u8,
}

/// Errors from mapping ingestion and rebuild.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("failed to read mapping file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse mapping file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("mapping value out of range for key \"{key}\": {value}")]
    OutOfRange { key: String, value: u16 },
}

/// Opaque key -> value resolver the electrode map is rebuilt from.
pub trait MappingSource {
    fn resolve(&self, key: &str) -> Option<u16>;
}

/// Key/value table deserialized from one mapping file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSource(BTreeMap<String, u16>);

impl From<BTreeMap<String, u16>> for TableSource {
    fn from(table: BTreeMap<String, u16>) -> Self {
        Self(table)
    }
}

impl FromIterator<(String, u16)> for TableSource {
    fn from_iter<I: IntoIterator<Item = (String, u16)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl MappingSource for TableSource {
    fn resolve(&self, key: &str) -> Option<u16> {
        self.0.get(key).copied()
    }
}

/// A source with no entries, used when a mapping file is absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptySource;

impl MappingSource for EmptySource {
    fn resolve(&self, _key: &str) -> Option<u16> {
        None
    }
}

// On-disk layout of ElectrodeMap.json: electrode number -> external pin id.
#[derive(Debug, Deserialize)]
struct ElectrodeMapFile {
    mapping: BTreeMap<String, u16>,
}

// On-disk layout of PinMap.json: "row,col" -> external pin id.
#[derive(Debug, Deserialize)]
struct PinMapFile {
    electrodes: BTreeMap<String, u16>,
}

/// Loads the electrode-number -> external-pin-id source from ElectrodeMap.json.
pub fn load_electrode_map(path: impl AsRef<Path>) -> Result<TableSource, MapError> {
    let text = fs::read_to_string(path)?;
    let file: ElectrodeMapFile = serde_json::from_str(&text)?;
    Ok(TableSource(file.mapping))
}

/// Loads the "row,col" -> external-pin-id source from PinMap.json.
pub fn load_pin_map(path: impl AsRef<Path>) -> Result<TableSource, MapError> {
    let text = fs::read_to_string(path)?;
    let file: PinMapFile = serde_json::from_str(&text)?;
    Ok(TableSource(file.electrodes))
}

/// Electrode number (1-140) to matrix address table. Every entry is always
/// resolved; entries the external sources cannot supply use the default
/// layout row = (n-1)/14, col = (n-1)%14.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectrodeMap {
    table: Vec<ElectrodeAddress>,
}

impl ElectrodeMap {
    fn default_address(electrode: u16) -> ElectrodeAddress {
        let index = (electrode - 1) as usize;
        ElectrodeAddress {
            row: (index / NUM_COLS) as u8,
            col: (index % NUM_COLS) as u8,
        }
    }

    /// The deterministic 1:1 fallback table.
    pub fn with_default() -> Self {
        let table = (1..=NUM_ELECTRODES as u16).map(Self::default_address).collect();
        Self { table }
    }

    /// Matrix address of an electrode. None outside [1,140]; always Some
    /// inside, the fallback guarantees totality.
    pub fn resolve(&self, electrode: u16) -> Option<ElectrodeAddress> {
        if electrode < 1 || electrode > NUM_ELECTRODES as u16 {
            return None;
        }
        Some(self.table[(electrode - 1) as usize])
    }

    /// Re-derives the whole table from the two sources. All-or-nothing: the
    /// new table is staged and swapped in only once every entry derived
    /// cleanly, so a failed rebuild leaves the active table intact.
    ///
    /// Entries the sources do not cover degrade to the default layout. A
    /// value outside its domain is corrupt data and fails the rebuild.
    pub fn rebuild(
        &mut self,
        electrode_to_pin: &dyn MappingSource,
        pin_to_address: &dyn MappingSource,
    ) -> Result<(), MapError> {
        // Invert the "row,col" -> pin id source into pin id -> address.
        let mut pin_address: Vec<Option<ElectrodeAddress>> = vec![None; NUM_ELECTRODES];
        for row in 0..NUM_ROWS {
            for col in 0..NUM_COLS {
                let key = format!("{row},{col}");
                if let Some(pin) = pin_to_address.resolve(&key) {
                    if pin < 1 || pin > NUM_ELECTRODES as u16 {
                        return Err(MapError::OutOfRange { key, value: pin });
                    }
                    pin_address[(pin - 1) as usize] = Some(ElectrodeAddress {
                        row: row as u8,
                        col: col as u8,
                    });
                }
            }
        }

        // Chain electrode -> pin id -> address; any break in the chain keeps
        // the default entry for that electrode.
        let mut table = Vec::with_capacity(NUM_ELECTRODES);
        let mut fallbacks = 0usize;
        for electrode in 1..=NUM_ELECTRODES as u16 {
            let key = electrode.to_string();
            let resolved = match electrode_to_pin.resolve(&key) {
                Some(pin) if (1..=NUM_ELECTRODES as u16).contains(&pin) => {
                    pin_address[(pin - 1) as usize]
                }
                Some(pin) => return Err(MapError::OutOfRange { key, value: pin }),
                None => None,
            };
            match resolved {
                Some(address) => table.push(address),
                None => {
                    fallbacks += 1;
                    table.push(Self::default_address(electrode));
                }
            }
        }

        if fallbacks > 0 {
            warn!("electrode map rebuilt with {} default entries", fallbacks);
        } else {
            info!("electrode map rebuilt from external sources");
        }
        self.table = table;
        Ok(())
    }
}
