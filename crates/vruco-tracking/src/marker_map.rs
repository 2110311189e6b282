use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::source::MarkerFamily;

/// Error raised while persisting or restoring a marker map.
#[derive(Debug, thiserror::Error)]
pub enum MarkerMapError {
    /// Reading or writing the map file failed.
    #[error("Failed to access the marker map file. {0}")]
    Io(#[from] std::io::Error),

    /// The file is not a valid marker map document.
    #[error("Invalid marker map document. {0}")]
    Json(#[from] serde_json::Error),

    /// Two entries share the same marker id.
    #[error("Marker {0} appears more than once")]
    DuplicateId(u32),

    /// The marker size is not a positive finite length.
    #[error("Invalid marker size {0}")]
    InvalidMarkerSize(f64),
}

/// Room-space location of one marker's corners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerMapEntry {
    /// Marker id.
    pub id: u32,
    /// Corners in room space, in the same winding as the detections.
    pub points: [[f64; 3]; 4],
}

/// The set of markers with known room-space corners.
///
/// Built by room setup and then shared read-only; a new setup produces a new
/// map rather than editing this one.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerMap {
    family: MarkerFamily,
    marker_size: f64,
    entries: BTreeMap<u32, MarkerMapEntry>,
}

#[derive(Serialize, Deserialize)]
struct MarkerMapDocument {
    family: MarkerFamily,
    marker_size: f64,
    markers: Vec<MarkerMapEntry>,
}

impl MarkerMap {
    /// An empty map for markers of `family` with side length `marker_size` metres.
    pub fn new(family: MarkerFamily, marker_size: f64) -> Self {
        Self {
            family,
            marker_size,
            entries: BTreeMap::new(),
        }
    }

    /// Build a map from entries, rejecting duplicate ids.
    pub fn from_entries(
        family: MarkerFamily,
        marker_size: f64,
        entries: impl IntoIterator<Item = MarkerMapEntry>,
    ) -> Result<Self, MarkerMapError> {
        if !(marker_size.is_finite() && marker_size > 0.0) {
            return Err(MarkerMapError::InvalidMarkerSize(marker_size));
        }
        let mut map = Self::new(family, marker_size);
        for entry in entries {
            let id = entry.id;
            if map.entries.insert(id, entry).is_some() {
                return Err(MarkerMapError::DuplicateId(id));
            }
        }
        Ok(map)
    }

    /// Marker family the map was built for.
    pub fn family(&self) -> MarkerFamily {
        self.family
    }

    /// Physical side length of the markers, in metres.
    pub fn marker_size(&self) -> f64 {
        self.marker_size
    }

    /// Look up one marker.
    pub fn get(&self, id: u32) -> Option<&MarkerMapEntry> {
        self.entries.get(&id)
    }

    /// Whether `id` is mapped.
    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    /// Entries ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = &MarkerMapEntry> {
        self.entries.values()
    }

    /// Number of mapped markers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no marker is mapped.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String, MarkerMapError> {
        let doc = MarkerMapDocument {
            family: self.family,
            marker_size: self.marker_size,
            markers: self.entries.values().cloned().collect(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Parse a JSON document written by [`MarkerMap::to_json`].
    pub fn from_json(text: &str) -> Result<Self, MarkerMapError> {
        let doc: MarkerMapDocument = serde_json::from_str(text)?;
        Self::from_entries(doc.family, doc.marker_size, doc.markers)
    }

    /// Write the map to `path` as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MarkerMapError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Read a map previously written with [`MarkerMap::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MarkerMapError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}
