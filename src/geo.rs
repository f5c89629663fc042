// 🌍 Geo Primitives - coordinate keys and great-circle distance
//
// A Location is a value-type key: equality and hashing are structural over
// the two numeric fields. The decimal text the geocoder (or the API) gave us
// is carried alongside so persisted files keep the original precision.

use crate::error::{HarvestError, HarvestResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Mean Earth radius used for every distance in the dataset
pub const EARTH_RADIUS_KM: f64 = 6367.0;

// ============================================================================
// COORDINATE
// ============================================================================

/// One decimal-degree value plus the exact text it was read from.
#[derive(Debug, Clone)]
pub struct Coordinate {
    degrees: f64,
    text: Box<str>,
}

impl Coordinate {
    pub fn parse(text: &str) -> HarvestResult<Self> {
        let trimmed = text.trim();
        let degrees: f64 = trimmed
            .parse()
            .map_err(|_| HarvestError::SourceData(format!("Invalid coordinate: {:?}", text)))?;

        if !degrees.is_finite() {
            return Err(HarvestError::SourceData(format!(
                "Coordinate is not finite: {:?}",
                text
            )));
        }

        Ok(Coordinate {
            // Fold -0.0 into 0.0 so both hash alike
            degrees: if degrees == 0.0 { 0.0 } else { degrees },
            text: trimmed.into(),
        })
    }

    pub fn degrees(&self) -> f64 {
        self.degrees
    }

    /// The verbatim decimal text
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl PartialEq for Coordinate {
    fn eq(&self, other: &Self) -> bool {
        self.degrees.to_bits() == other.degrees.to_bits()
    }
}

impl Eq for Coordinate {}

impl Hash for Coordinate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.degrees.to_bits().hash(state);
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

// ============================================================================
// LOCATION
// ============================================================================

/// A (lat, lon) point. Serialized as `"<lat> <lon>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Location {
    lat: Coordinate,
    lon: Coordinate,
}

impl Location {
    pub fn new(lat: &str, lon: &str) -> HarvestResult<Self> {
        let lat = Coordinate::parse(lat)?;
        let lon = Coordinate::parse(lon)?;

        if !(-90.0..=90.0).contains(&lat.degrees()) {
            return Err(HarvestError::SourceData(format!("Latitude out of range: {}", lat)));
        }
        if !(-180.0..=180.0).contains(&lon.degrees()) {
            return Err(HarvestError::SourceData(format!("Longitude out of range: {}", lon)));
        }

        Ok(Location { lat, lon })
    }

    /// Parse the API's `"<lat> <lon>"` pair format
    pub fn parse_pair(pair: &str) -> HarvestResult<Self> {
        let mut parts = pair.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(lat), Some(lon), None) => Location::new(lat, lon),
            _ => Err(HarvestError::SourceData(format!(
                "Invalid coordinate pair: {:?}",
                pair
            ))),
        }
    }

    pub fn lat(&self) -> &Coordinate {
        &self.lat
    }

    pub fn lon(&self) -> &Coordinate {
        &self.lon
    }

    /// Great-circle distance in kilometres
    pub fn distance_km(&self, other: &Location) -> f64 {
        haversine_km(
            self.lat.degrees(),
            self.lon.degrees(),
            other.lat.degrees(),
            other.lon.degrees(),
        )
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.lat, self.lon)
    }
}

impl TryFrom<String> for Location {
    type Error = HarvestError;

    fn try_from(value: String) -> HarvestResult<Self> {
        Location::parse_pair(&value)
    }
}

impl From<Location> for String {
    fn from(loc: Location) -> String {
        loc.to_string()
    }
}

/// Haversine distance between two points given in decimal degrees.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let lat1_r = lat1.to_radians();
    let lat2_r = lat2.to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1_r.cos() * lat2_r.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_KM * c
}
