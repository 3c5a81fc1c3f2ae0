use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::relocation::Offset;
use crate::error::{Error, Result};
use crate::image::ProcessImage;
use crate::version::Version;

/// Version-independent identifier of a function or object in the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub u64);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical ID with its raw offset in every supported build.
#[derive(Debug, Clone, Copy)]
pub struct VersionedOffset {
    pub id: Id,
    pub offsets: &'static [(Version, usize)],
}

impl VersionedOffset {
    pub const fn new(id: u64, offsets: &'static [(Version, usize)]) -> Self {
        Self {
            id: Id(id),
            offsets,
        }
    }

    pub fn for_version(&self, version: Version) -> Option<usize> {
        self.offsets
            .iter()
            .find(|(v, _)| *v == version)
            .map(|&(_, offset)| offset)
    }
}

/// ID -> raw offset map for one exact host build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OffsetTable {
    entries: BTreeMap<Id, usize>,
}

impl OffsetTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: Id, offset: usize) -> Option<usize> {
        self.entries.insert(id, offset)
    }

    pub fn raw(&self, id: Id) -> Option<usize> {
        self.entries.get(&id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id, usize)> + '_ {
        self.entries.iter().map(|(&id, &offset)| (id, offset))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Offset tables for every supported host build, keyed by exact version.
///
/// Serialized as `{ "1.7.23.0": { "<id>": <offset>, ... }, ... }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionTable {
    tables: BTreeMap<Version, OffsetTable>,
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from static per-ID lists.
    pub fn from_entries(entries: &[VersionedOffset]) -> Self {
        let mut table = Self::new();
        for entry in entries {
            for &(version, offset) in entry.offsets {
                table.insert(version, entry.id, offset);
            }
        }
        table
    }

    pub fn insert(&mut self, version: Version, id: Id, offset: usize) {
        self.tables.entry(version).or_default().insert(id, offset);
    }

    /// Table for exactly `version`.
    pub fn select(&self, version: Version) -> Result<SelectedTable<'_>> {
        let table = self
            .tables
            .get(&version)
            .ok_or(Error::UnsupportedVersion(version))?;
        debug!("Selected offset table for {} ({} IDs)", version, table.len());
        Ok(SelectedTable { version, table })
    }

    /// Table for the build `image` was loaded from.
    pub fn select_for(&self, image: &ProcessImage) -> Result<SelectedTable<'_>> {
        self.select(image.version())
    }

    pub fn versions(&self) -> impl Iterator<Item = Version> + '_ {
        self.tables.keys().copied()
    }

    pub fn get(&self, version: Version) -> Option<&OffsetTable> {
        self.tables.get(&version)
    }

    pub fn merge(&mut self, other: VersionTable) {
        for (version, table) in other.tables {
            let target = self.tables.entry(version).or_default();
            for (id, offset) in table.iter() {
                target.insert(id, offset);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let table: Self = serde_json::from_str(&content)?;
        info!(
            "Loaded offset tables for {} versions from {}",
            table.tables.len(),
            path.as_ref().display()
        );
        Ok(table)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// An [`OffsetTable`] together with the build it was selected for.
#[derive(Debug, Clone, Copy)]
pub struct SelectedTable<'a> {
    version: Version,
    table: &'a OffsetTable,
}

impl SelectedTable<'_> {
    pub fn version(&self) -> Version {
        self.version
    }

    /// Offset of `id` in the selected build.
    pub fn offset(&self, id: Id) -> Result<Offset> {
        self.table
            .raw(id)
            .map(Offset::new)
            .ok_or(Error::UnknownId {
                id: id.0,
                version: self.version,
            })
    }

    pub fn table(&self) -> &OffsetTable {
        self.table
    }
}
