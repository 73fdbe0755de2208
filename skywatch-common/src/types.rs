use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Cached orbital elements for one catalogued object.
///
/// `element_set` is the raw 3-line form (title line, line 1, line 2) joined
/// with `\n`. The catalog id is the NORAD catalog number as it appears in
/// columns 3-7 of line 1, e.g. `"00900"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrbitalElementRecord {
    pub catalog_id: String,
    pub name: String,
    pub element_set: String,
    #[serde(default)]
    pub is_favorite: bool,

    /// International designator (OMM `OBJECT_ID`), e.g. "1964-063C"
    #[serde(default)]
    pub international_designator: Option<String>,

    /// Element epoch as published in the catalog metadata
    #[serde(default)]
    pub epoch: Option<NaiveDateTime>,
}

impl OrbitalElementRecord {
    pub fn new(
        catalog_id: impl Into<String>,
        name: impl Into<String>,
        element_set: impl Into<String>,
    ) -> Self {
        Self {
            catalog_id: catalog_id.into(),
            name: name.into(),
            element_set: element_set.into(),
            is_favorite: false,
            international_designator: None,
            epoch: None,
        }
    }

    /// The two data lines of the element set, skipping the title line.
    pub fn element_lines(&self) -> Option<(&str, &str)> {
        let mut lines = self
            .element_set
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty());

        let first = lines.next()?;
        if first.starts_with("1 ") {
            // Two-line form without a title
            return Some((first, lines.next()?));
        }
        Some((lines.next()?, lines.next()?))
    }

    /// Case-normalized prefix match on the object name. An empty prefix
    /// matches everything.
    pub fn name_starts_with(&self, prefix: &str) -> bool {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return true;
        }
        self.name.to_lowercase().starts_with(&prefix.to_lowercase())
    }
}

/// Earth-fixed Cartesian position, in kilometres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CartesianPosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl CartesianPosition {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(self.x * factor, self.y * factor, self.z * factor)
    }
}

/// Latitude/longitude on the reference ellipsoid, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeodeticPoint {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
}

/// One plotted object in a published batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayPosition {
    pub catalog_id: String,
    pub name: String,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
}

impl DisplayPosition {
    pub fn from_record(record: &OrbitalElementRecord, point: GeodeticPoint) -> Self {
        Self {
            catalog_id: record.catalog_id.clone(),
            name: record.name.clone(),
            latitude_deg: point.latitude_deg,
            longitude_deg: point.longitude_deg,
        }
    }
}

impl std::fmt::Display for DisplayPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) {:.4}°, {:.4}°",
            self.name, self.catalog_id, self.latitude_deg, self.longitude_deg
        )
    }
}
