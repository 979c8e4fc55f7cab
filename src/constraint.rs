//! Canonical search constraints
//!
//! Time windows, geometries and product-name predicates shared by every
//! provider adapter. Everything here is pure: validation, longitude
//! convention conversion and name matching never touch the network.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::error::ErrorKind;

/// Half-width in degrees of the box built around a [`GeoConstraint::Point`]
/// when a provider refuses degenerate geometries.
pub const DEFAULT_POINT_EXTENT: f64 = 0.1;

/// Errors raised while building or validating constraints
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConstraintError {
    /// Out-of-range or contradictory constraint
    #[error("invalid constraint: {0}")]
    InvalidConstraint(String),
}

impl ConstraintError {
    /// Fieldless classification
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidConstraint
    }
}

/// Result type for constraint operations
pub type ConstraintResult<T> = Result<T, ConstraintError>;

/// Acquisition time window
///
/// A missing start means "since the collection was launched" and is
/// resolved against the sensor table; a missing end means "up to now".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// Build a window, rejecting `start > end`
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> ConstraintResult<Self> {
        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                return Err(ConstraintError::InvalidConstraint(format!(
                    "time range start {s} is after end {e}"
                )));
            }
        }
        Ok(Self { start, end })
    }

    /// Window with neither bound set
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Parse a window from `YYYY-MM-DD` or RFC 3339 strings
    ///
    /// A date-only start is taken at 00:00:00 and a date-only end at
    /// 23:59:59 so the named day is fully included.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> ConstraintResult<Self> {
        let start = start.map(parse_start).transpose()?;
        let end = end.map(parse_end).transpose()?;
        Self::new(start, end)
    }

    /// Start bound, if any
    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    /// End bound, if any
    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    /// Whether `instant` falls inside the window (open bounds accept everything)
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| instant >= s) && self.end.map_or(true, |e| instant <= e)
    }
}

fn try_parse_rfc3339(input: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    // No designator: assume UTC
    DateTime::parse_from_rfc3339(&format!("{input}Z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_date(input: &str, what: &str) -> ConstraintResult<NaiveDate> {
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|e| ConstraintError::InvalidConstraint(format!("invalid {what} '{input}': {e}")))
}

/// Parse a start instant; date-only input maps to the start of that day
pub fn parse_start(input: &str) -> ConstraintResult<DateTime<Utc>> {
    let input = input.trim();
    if let Some(dt) = try_parse_rfc3339(input) {
        return Ok(dt);
    }
    Ok(parse_date(input, "start time")?.and_time(NaiveTime::MIN).and_utc())
}

/// Parse an end instant; date-only input maps to the end of that day
pub fn parse_end(input: &str) -> ConstraintResult<DateTime<Utc>> {
    let input = input.trim();
    if let Some(dt) = try_parse_rfc3339(input) {
        return Ok(dt);
    }
    Ok(end_of_day(parse_date(input, "end time")?))
}

/// Last second of `date` in UTC
pub fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    let last = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
    date.and_time(last).and_utc()
}

/// Longitude convention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LonConvention {
    /// Longitudes in `[-180, 180)`
    Centered0,
    /// Longitudes in `[0, 360)`
    Centered180,
}

impl LonConvention {
    /// Center meridian of the convention in degrees
    pub fn center(self) -> f64 {
        match self {
            LonConvention::Centered0 => 0.0,
            LonConvention::Centered180 => 180.0,
        }
    }

    /// Convert one longitude into this convention
    pub fn normalize(self, lon: f64) -> f64 {
        let pivot = 180.0 - self.center();
        (lon + pivot).rem_euclid(360.0) - pivot
    }
}

/// Tiling grid used by [`GeoConstraint::TileCode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileScheme {
    /// Military Grid Reference System (Sentinel-2 tiles such as `31TCJ`)
    Mgrs,
    /// VENµS site codes
    Venus,
}

impl fmt::Display for TileScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileScheme::Mgrs => write!(f, "MGRS"),
            TileScheme::Venus => write!(f, "VENUS"),
        }
    }
}

impl FromStr for TileScheme {
    type Err = ConstraintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "MGRS" => Ok(TileScheme::Mgrs),
            "VENUS" => Ok(TileScheme::Venus),
            other => Err(ConstraintError::InvalidConstraint(format!(
                "unknown tile scheme '{other}', expected MGRS or VENUS"
            ))),
        }
    }
}

/// Spatial constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GeoConstraint {
    /// Single location
    Point {
        /// Latitude in degrees
        lat: f64,
        /// Longitude in degrees
        lon: f64,
    },
    /// Latitude/longitude box
    BoundingBox {
        /// Southern edge
        latmin: f64,
        /// Northern edge
        latmax: f64,
        /// Western edge
        lonmin: f64,
        /// Eastern edge
        lonmax: f64,
    },
    /// Provider tile identifier, independent of any longitude convention
    TileCode {
        /// Tiling grid
        scheme: TileScheme,
        /// Tile code within the grid
        code: String,
    },
}

impl GeoConstraint {
    /// Validated point
    pub fn point(lat: f64, lon: f64) -> ConstraintResult<Self> {
        validate_lat_lon(lat, lon)?;
        Ok(GeoConstraint::Point { lat, lon })
    }

    /// Validated bounding box
    pub fn bbox(latmin: f64, latmax: f64, lonmin: f64, lonmax: f64) -> ConstraintResult<Self> {
        validate_lat_lon(latmin, lonmin)?;
        validate_lat_lon(latmax, lonmax)?;
        if latmin > latmax {
            return Err(ConstraintError::InvalidConstraint(format!(
                "bounding box latmin {latmin} is above latmax {latmax}"
            )));
        }
        Ok(GeoConstraint::BoundingBox { latmin, latmax, lonmin, lonmax })
    }

    /// Tile code constraint
    pub fn tile(scheme: TileScheme, code: impl Into<String>) -> Self {
        GeoConstraint::TileCode { scheme, code: code.into() }
    }

    /// Re-check coordinate ranges of an already built constraint
    pub fn validate(&self) -> ConstraintResult<()> {
        match self {
            GeoConstraint::Point { lat, lon } => validate_lat_lon(*lat, *lon),
            GeoConstraint::BoundingBox { latmin, latmax, lonmin, lonmax } => {
                validate_lat_lon(*latmin, *lonmin)?;
                validate_lat_lon(*latmax, *lonmax)?;
                if latmin > latmax {
                    return Err(ConstraintError::InvalidConstraint(format!(
                        "bounding box latmin {latmin} is above latmax {latmax}"
                    )));
                }
                Ok(())
            }
            GeoConstraint::TileCode { code, .. } if code.trim().is_empty() => Err(
                ConstraintError::InvalidConstraint("tile code cannot be empty".to_string()),
            ),
            GeoConstraint::TileCode { .. } => Ok(()),
        }
    }

    /// Expand a point into a box of `half_width` degrees; other variants are unchanged
    pub fn expand(&self, half_width: f64) -> Self {
        match self {
            GeoConstraint::Point { lat, lon } => GeoConstraint::BoundingBox {
                latmin: (lat - half_width).max(-90.0),
                latmax: (lat + half_width).min(90.0),
                lonmin: lon - half_width,
                lonmax: lon + half_width,
            },
            other => other.clone(),
        }
    }

    /// `(lonmin, latmin, lonmax, latmax)`, the order used by STAC and OpenSearch
    pub fn bounds(&self) -> Option<(f64, f64, f64, f64)> {
        match self {
            GeoConstraint::Point { lat, lon } => Some((*lon, *lat, *lon, *lat)),
            GeoConstraint::BoundingBox { latmin, latmax, lonmin, lonmax } => {
                Some((*lonmin, *latmin, *lonmax, *latmax))
            }
            GeoConstraint::TileCode { .. } => None,
        }
    }

    /// WKT rendering (`POINT` or closed `POLYGON`), `None` for tile codes
    pub fn to_wkt(&self) -> Option<String> {
        match self {
            GeoConstraint::Point { lat, lon } => Some(format!("POINT({lon} {lat})")),
            GeoConstraint::BoundingBox { latmin, latmax, lonmin, lonmax } => Some(format!(
                "POLYGON(({lonmin} {latmin},{lonmax} {latmin},{lonmax} {latmax},{lonmin} {latmax},{lonmin} {latmin}))"
            )),
            GeoConstraint::TileCode { .. } => None,
        }
    }
}

/// Convert every longitude of `geo` into `target`
///
/// Tile codes pass through untouched.
pub fn normalize_geo(geo: &GeoConstraint, target: LonConvention) -> GeoConstraint {
    match geo {
        GeoConstraint::Point { lat, lon } => GeoConstraint::Point {
            lat: *lat,
            lon: target.normalize(*lon),
        },
        GeoConstraint::BoundingBox { latmin, latmax, lonmin, lonmax } => {
            GeoConstraint::BoundingBox {
                latmin: *latmin,
                latmax: *latmax,
                lonmin: target.normalize(*lonmin),
                lonmax: target.normalize(*lonmax),
            }
        }
        tile @ GeoConstraint::TileCode { .. } => tile.clone(),
    }
}

/// Check a coordinate pair
///
/// Latitude outside `[-90, 90]` is an error. Longitude outside both accepted
/// conventions only logs a warning since some providers tolerate it.
pub fn validate_lat_lon(lat: f64, lon: f64) -> ConstraintResult<()> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(ConstraintError::InvalidConstraint(format!(
            "latitude {lat} outside [-90, 90]"
        )));
    }
    if !(-180.0..360.0).contains(&lon) {
        warn!(lat, lon, "Longitude outside [-180, 360), forwarding as-is");
    }
    Ok(())
}

/// Conjunction of product-name predicates
///
/// A candidate matches when every listed substring, prefix, suffix and glob
/// matches. The empty constraint matches everything. Prefixes, suffixes and
/// globs are sets so that [`NameConstraint::add`] stays a pure union.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameConstraint {
    contains: BTreeSet<String>,
    startswith: BTreeSet<String>,
    endswith: BTreeSet<String>,
    glob: BTreeSet<String>,
}

impl NameConstraint {
    /// Empty constraint
    pub fn new() -> Self {
        Self::default()
    }

    /// Constraint requiring every substring in `parts`
    pub fn with_contains<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut name = Self::new();
        for part in parts {
            name = name.contains(part);
        }
        name
    }

    /// Require `part` somewhere in the name
    pub fn contains(mut self, part: impl Into<String>) -> Self {
        let part = part.into();
        if !part.is_empty() {
            self.contains.insert(part);
        }
        self
    }

    /// Require the name to start with `prefix`
    pub fn startswith(mut self, prefix: impl Into<String>) -> Self {
        self.startswith.insert(prefix.into());
        self
    }

    /// Require the name to end with `suffix`
    pub fn endswith(mut self, suffix: impl Into<String>) -> Self {
        self.endswith.insert(suffix.into());
        self
    }

    /// Require the whole name to match a shell-style pattern (`*`, `?`)
    pub fn glob(mut self, pattern: impl Into<String>) -> Self {
        self.glob.insert(pattern.into());
        self
    }

    /// Union `extra` into this constraint; nothing already present is dropped
    pub fn add(&mut self, extra: &NameConstraint) {
        self.contains.extend(extra.contains.iter().cloned());
        self.startswith.extend(extra.startswith.iter().cloned());
        self.endswith.extend(extra.endswith.iter().cloned());
        self.glob.extend(extra.glob.iter().cloned());
    }

    /// Whether no predicate is set
    pub fn is_empty(&self) -> bool {
        self.contains.is_empty()
            && self.startswith.is_empty()
            && self.endswith.is_empty()
            && self.glob.is_empty()
    }

    /// Required substrings
    pub fn contained(&self) -> impl Iterator<Item = &str> {
        self.contains.iter().map(String::as_str)
    }

    /// Required prefixes
    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.startswith.iter().map(String::as_str)
    }

    /// Required suffixes
    pub fn suffixes(&self) -> impl Iterator<Item = &str> {
        self.endswith.iter().map(String::as_str)
    }

    /// Required glob patterns
    pub fn globs(&self) -> impl Iterator<Item = &str> {
        self.glob.iter().map(String::as_str)
    }

    /// Evaluate the conjunction against `candidate`
    pub fn matches(&self, candidate: &str) -> bool {
        self.contains.iter().all(|c| candidate.contains(c.as_str()))
            && self.startswith.iter().all(|p| candidate.starts_with(p.as_str()))
            && self.endswith.iter().all(|s| candidate.ends_with(s.as_str()))
            && self.glob.iter().all(|g| glob_match(g, candidate))
    }
}

/// Anchored shell-style match where `*` is any run and `?` one character
pub fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains(['*', '?']) {
        return pattern == value;
    }

    let pat: Vec<char> = pattern.chars().collect();
    let val: Vec<char> = value.chars().collect();
    let (mut p, mut v) = (0, 0);
    // Position of the last star and the value index it is currently absorbing up to
    let mut backtrack: Option<(usize, usize)> = None;

    while v < val.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == val[v]) {
            p += 1;
            v += 1;
        } else if p < pat.len() && pat[p] == '*' {
            backtrack = Some((p, v));
            p += 1;
        } else if let Some((star, absorbed)) = backtrack {
            p = star + 1;
            v = absorbed + 1;
            backtrack = Some((star, absorbed + 1));
        } else {
            return false;
        }
    }

    pat[p..].iter().all(|&c| c == '*')
}
