//! Collection registry
//!
//! Maps a generic collection name and processing level to the collection
//! identifiers a provider understands, plus the product-name fragments that
//! restrict a shared provider collection to one product family.
//!
//! Reference tables ship embedded in the binary and can be replaced by a
//! directory laid out as `sensors.csv` plus `collections/<provider>.csv`.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::constraint::{end_of_day, ConstraintError, NameConstraint, TimeRange};
use crate::error::ErrorKind;

/// Embedded sensor table
const SENSORS_CSV: &str = include_str!("sensors.csv");

/// Global sensor table (loaded once)
static SENSORS: Lazy<Result<Arc<SensorTable>, RegistryError>> =
    Lazy::new(|| SensorTable::from_reader(SENSORS_CSV.as_bytes()).map(Arc::new));

fn embedded_collections(provider: &str) -> Option<&'static str> {
    match provider {
        "cdse" => Some(include_str!("collections/cdse.csv")),
        "cnes" => Some(include_str!("collections/cnes.csv")),
        "creodias" => Some(include_str!("collections/creodias.csv")),
        "eumdac" => Some(include_str!("collections/eumdac.csv")),
        "google" => Some(include_str!("collections/google.csv")),
        "nasa" => Some(include_str!("collections/nasa.csv")),
        "theia" => Some(include_str!("collections/theia.csv")),
        "usgs" => Some(include_str!("collections/usgs.csv")),
        _ => None,
    }
}

/// Where reference tables are read from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReferenceSource {
    /// Tables compiled into the binary
    #[default]
    Embedded,
    /// `sensors.csv` and `collections/<provider>.csv` under this directory
    Directory(PathBuf),
}

impl ReferenceSource {
    /// Load the sensor table
    pub fn sensors(&self) -> RegistryResult<Arc<SensorTable>> {
        match self {
            ReferenceSource::Embedded => SensorTable::load().map_err(Clone::clone),
            ReferenceSource::Directory(dir) => {
                SensorTable::from_path(&dir.join("sensors.csv")).map(Arc::new)
            }
        }
    }

    /// Load the collection table of `provider`
    pub fn collections(&self, provider: &str) -> RegistryResult<CollectionTable> {
        match self {
            ReferenceSource::Embedded => {
                let csv = embedded_collections(provider).ok_or_else(|| {
                    RegistryError::MissingReferenceData(format!(
                        "no embedded collection table for provider '{provider}'"
                    ))
                })?;
                CollectionTable::from_reader(provider, csv.as_bytes())
            }
            ReferenceSource::Directory(dir) => CollectionTable::from_path(
                provider,
                &dir.join("collections").join(format!("{provider}.csv")),
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CollectionRow {
    sand_name: String,
    level: u8,
    collections: String,
    contains: Option<String>,
}

/// Resolved collection for one `(sand_name, level)` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRecord {
    sand_name: String,
    level: u8,
    provider_collection_ids: Vec<String>,
    implied_name_constraint: Vec<String>,
}

impl CollectionRecord {
    /// Create a record
    pub fn new(
        sand_name: impl Into<String>,
        level: u8,
        provider_collection_ids: Vec<String>,
        implied_name_constraint: Vec<String>,
    ) -> Self {
        Self {
            sand_name: sand_name.into(),
            level,
            provider_collection_ids,
            implied_name_constraint,
        }
    }

    /// Generic collection name
    pub fn sand_name(&self) -> &str {
        &self.sand_name
    }

    /// Processing level
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Provider collection identifiers, in table order
    pub fn provider_collection_ids(&self) -> &[String] {
        &self.provider_collection_ids
    }

    /// Name fragments every product of this collection must contain
    pub fn implied_name_constraint(&self) -> &[String] {
        &self.implied_name_constraint
    }

    /// Implied fragments as a [`NameConstraint`] ready to be merged
    pub fn name_constraint(&self) -> NameConstraint {
        NameConstraint::with_contains(self.implied_name_constraint.iter().cloned())
    }
}

fn split_words(field: &str) -> Vec<String> {
    field.split_whitespace().map(str::to_string).collect()
}

/// Per-provider collection table
#[derive(Debug, Clone)]
pub struct CollectionTable {
    provider: String,
    records: Vec<CollectionRecord>,
}

impl CollectionTable {
    /// Parse a table from CSV (`sand_name,level,collections,contains`)
    pub fn from_reader<R: Read>(provider: &str, reader: R) -> RegistryResult<Self> {
        let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut records = Vec::new();
        for (line, row) in csv_reader.deserialize::<CollectionRow>().enumerate() {
            let row = row.map_err(|e| {
                RegistryError::ParseError(format!("{provider} collection table row {}: {e}", line + 1))
            })?;
            let ids = split_words(&row.collections);
            if ids.is_empty() {
                return Err(RegistryError::ParseError(format!(
                    "{provider} collection table: '{}' level {} has no provider collection",
                    row.sand_name, row.level
                )));
            }
            records.push(CollectionRecord::new(
                row.sand_name,
                row.level,
                ids,
                row.contains.as_deref().map(split_words).unwrap_or_default(),
            ));
        }
        debug!(provider, rows = records.len(), "Loaded collection table");
        Ok(Self {
            provider: provider.to_string(),
            records,
        })
    }

    /// Parse a table from a file, failing loudly when it is absent
    pub fn from_path(provider: &str, path: &Path) -> RegistryResult<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            RegistryError::MissingReferenceData(format!("{}: {e}", path.display()))
        })?;
        Self::from_reader(provider, file)
    }

    /// Provider key of this table
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// All rows
    pub fn records(&self) -> &[CollectionRecord] {
        &self.records
    }

    /// Distinct generic names, sorted
    pub fn sand_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.records.iter().map(|r| r.sand_name()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Look up the unique row for `(sand_name, level)`
    pub fn lookup(&self, sand_name: &str, level: u8) -> RegistryResult<&CollectionRecord> {
        let rows: Vec<&CollectionRecord> =
            self.records.iter().filter(|r| r.sand_name == sand_name).collect();
        if rows.is_empty() {
            return Err(RegistryError::UnknownCollection {
                provider: self.provider.clone(),
                name: sand_name.to_string(),
            });
        }
        let matching: Vec<&CollectionRecord> =
            rows.iter().copied().filter(|r| r.level == level).collect();
        match matching.as_slice() {
            [] => {
                let mut available: Vec<u8> = rows.iter().map(|r| r.level).collect();
                available.sort_unstable();
                available.dedup();
                Err(RegistryError::UnsupportedLevel {
                    provider: self.provider.clone(),
                    name: sand_name.to_string(),
                    level,
                    available,
                })
            }
            [record] => Ok(*record),
            _ => Err(RegistryError::AmbiguousCollection {
                provider: self.provider.clone(),
                name: sand_name.to_string(),
                level,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SensorRow {
    sand_name: String,
    launch_date: String,
    end_date: String,
    #[serde(default)]
    description: String,
}

/// Mission lifetime of one generic collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorRecord {
    sand_name: String,
    launch_date: NaiveDate,
    end_date: Option<NaiveDate>,
    description: String,
}

impl SensorRecord {
    /// Generic collection name
    pub fn sand_name(&self) -> &str {
        &self.sand_name
    }

    /// Launch date
    pub fn launch_date(&self) -> NaiveDate {
        self.launch_date
    }

    /// End of operations, `None` while the mission is still running
    pub fn end_date(&self) -> Option<NaiveDate> {
        self.end_date
    }

    /// Long description
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Global sensor table
#[derive(Debug, Clone)]
pub struct SensorTable {
    entries: HashMap<String, SensorRecord>,
}

impl SensorTable {
    /// Embedded table, parsed once and shared
    pub fn load() -> Result<Arc<Self>, &'static RegistryError> {
        SENSORS.as_ref().map(Arc::clone)
    }

    /// Parse from CSV (`sand_name,launch_date,end_date,description`, `x` = still operating)
    pub fn from_reader<R: Read>(reader: R) -> RegistryResult<Self> {
        let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut entries = HashMap::new();
        for row in csv_reader.deserialize::<SensorRow>() {
            let row = row.map_err(|e| RegistryError::ParseError(format!("sensor table: {e}")))?;
            let parse = |value: &str| {
                NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| {
                    RegistryError::ParseError(format!(
                        "sensor table: invalid date '{value}' for {}: {e}",
                        row.sand_name
                    ))
                })
            };
            let launch_date = parse(&row.launch_date)?;
            let end_date = match row.end_date.as_str() {
                "x" | "" => None,
                value => Some(parse(value)?),
            };
            entries.insert(
                row.sand_name.clone(),
                SensorRecord {
                    sand_name: row.sand_name,
                    launch_date,
                    end_date,
                    description: row.description,
                },
            );
        }
        Ok(Self { entries })
    }

    /// Parse from a file, failing loudly when it is absent
    pub fn from_path(path: &Path) -> RegistryResult<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            RegistryError::MissingReferenceData(format!("{}: {e}", path.display()))
        })?;
        Self::from_reader(file)
    }

    /// Sensor record of `sand_name`
    pub fn get(&self, sand_name: &str) -> RegistryResult<&SensorRecord> {
        self.entries
            .get(sand_name)
            .ok_or_else(|| RegistryError::UnknownSensor(sand_name.to_string()))
    }

    /// Fill open bounds of `time` from the mission lifetime and check it fits
    ///
    /// A missing start becomes the launch date; a missing end becomes now, or
    /// the last day of operations for a finished mission.
    pub fn resolve_time(&self, sand_name: &str, time: &TimeRange) -> RegistryResult<TimeRange> {
        let sensor = self.get(sand_name)?;
        let launch = sensor.launch_date.and_time(NaiveTime::MIN).and_utc();
        let last = sensor.end_date.map(end_of_day);

        let start = time.start().unwrap_or(launch);
        let end: DateTime<Utc> = time.end().unwrap_or_else(|| last.unwrap_or_else(Utc::now));

        if start < launch {
            return Err(ConstraintError::InvalidConstraint(format!(
                "{sand_name} was launched on {}, start {start} is earlier",
                sensor.launch_date
            ))
            .into());
        }
        if let Some(last) = last {
            if end > last {
                return Err(ConstraintError::InvalidConstraint(format!(
                    "{sand_name} stopped operating on {}, end {end} is later",
                    last.date_naive()
                ))
                .into());
            }
        }
        Ok(TimeRange::new(Some(start), Some(end))?)
    }
}

/// Row of [`CollectionResolver::available_collections`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionInfo {
    /// Generic collection name
    pub sand_name: String,
    /// Levels offered by the provider
    pub levels: Vec<u8>,
    /// Launch date
    pub launch_date: NaiveDate,
    /// End of operations
    pub end_date: Option<NaiveDate>,
    /// Long description
    pub description: String,
}

/// Cached `(sand_name, level)` lookup over one provider table
///
/// Tables are immutable once loaded; only the memo of resolved records is
/// written after construction.
#[derive(Debug)]
pub struct CollectionResolver {
    table: CollectionTable,
    sensors: Arc<SensorTable>,
    cache: RwLock<HashMap<(String, u8), CollectionRecord>>,
}

impl CollectionResolver {
    /// Build a resolver over already loaded tables
    pub fn new(table: CollectionTable, sensors: Arc<SensorTable>) -> Self {
        Self {
            table,
            sensors,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load both tables of `provider` from `source`
    pub fn load(provider: &str, source: &ReferenceSource) -> RegistryResult<Self> {
        Ok(Self::new(source.collections(provider)?, source.sensors()?))
    }

    /// Provider key
    pub fn provider(&self) -> &str {
        self.table.provider()
    }

    /// Sensor table shared by every resolver
    pub fn sensors(&self) -> &SensorTable {
        &self.sensors
    }

    /// Resolve `(sand_name, level)`
    ///
    /// Fails with [`RegistryError::UnknownCollection`] when the name is not in
    /// the table at all and [`RegistryError::UnsupportedLevel`] when only the
    /// level is missing.
    pub fn resolve(&self, sand_name: &str, level: u8) -> RegistryResult<CollectionRecord> {
        let key = (sand_name.to_string(), level);
        if let Ok(cache) = self.cache.read() {
            if let Some(hit) = cache.get(&key) {
                return Ok(hit.clone());
            }
        }

        let record = self.table.lookup(sand_name, level)?.clone();
        debug!(
            provider = self.provider(),
            sand_name,
            level,
            collections = ?record.provider_collection_ids(),
            "Resolved collection"
        );
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(key, record.clone());
        }
        Ok(record)
    }

    /// Every collection of the provider joined with its sensor record
    pub fn available_collections(&self) -> RegistryResult<Vec<CollectionInfo>> {
        self.table
            .sand_names()
            .into_iter()
            .map(|name| {
                let sensor = self.sensors.get(name)?;
                let mut levels: Vec<u8> = self
                    .table
                    .records()
                    .iter()
                    .filter(|r| r.sand_name() == name)
                    .map(|r| r.level())
                    .collect();
                levels.sort_unstable();
                Ok(CollectionInfo {
                    sand_name: name.to_string(),
                    levels,
                    launch_date: sensor.launch_date(),
                    end_date: sensor.end_date(),
                    description: sensor.description().to_string(),
                })
            })
            .collect()
    }
}

/// Errors raised by the registry
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// A reference table could not be found
    #[error("missing reference data: {0}")]
    MissingReferenceData(String),

    /// A reference table is malformed
    #[error("reference table parse error: {0}")]
    ParseError(String),

    /// Collection name absent from the provider table
    #[error("unknown collection '{name}' for provider {provider}")]
    UnknownCollection {
        /// Provider key
        provider: String,
        /// Requested name
        name: String,
    },

    /// Collection exists but not at the requested level
    #[error("collection '{name}' has no level {level} for provider {provider} (available: {available:?})")]
    UnsupportedLevel {
        /// Provider key
        provider: String,
        /// Requested name
        name: String,
        /// Requested level
        level: u8,
        /// Levels present in the table
        available: Vec<u8>,
    },

    /// More than one row for `(name, level)`
    #[error("collection '{name}' level {level} is listed more than once for provider {provider}")]
    AmbiguousCollection {
        /// Provider key
        provider: String,
        /// Requested name
        name: String,
        /// Requested level
        level: u8,
    },

    /// Collection name absent from the sensor table
    #[error("collection '{0}' is missing from the sensor table")]
    UnknownSensor(String),

    /// Time window does not fit the mission lifetime
    #[error(transparent)]
    Constraint(#[from] ConstraintError),
}

impl RegistryError {
    /// Fieldless classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::MissingReferenceData(_) => ErrorKind::MissingReferenceData,
            RegistryError::ParseError(_) => ErrorKind::Parse,
            RegistryError::UnknownCollection { .. } | RegistryError::UnknownSensor(_) => {
                ErrorKind::UnknownCollection
            }
            RegistryError::UnsupportedLevel { .. } => ErrorKind::UnsupportedLevel,
            RegistryError::AmbiguousCollection { .. } => ErrorKind::AmbiguousCollection,
            RegistryError::Constraint(e) => e.kind(),
        }
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;
