// 🔌 Source Collaborators - lending API documents and geocoder answers
//
// The harvest engine never talks HTTP itself. It sees two capabilities:
// `JsonSource::fetch_json(url)` and `Geocoder::geocode(text)`. Everything
// here is about interpreting what those return.

use crate::error::{HarvestError, HarvestResult};
use crate::geo::Location;
use serde::Deserialize;
use serde_json::Value;
use std::thread;
use std::time::Duration;

// ============================================================================
// COLLABORATOR TRAITS
// ============================================================================

/// Paginated lending API: one JSON document per URL.
pub trait JsonSource {
    fn fetch_json(&mut self, url: &str) -> HarvestResult<Value>;
}

/// Free text → coordinates. `Ok(None)` means "no match".
pub trait Geocoder {
    fn geocode(&mut self, query: &str) -> HarvestResult<Option<Location>>;
}

/// Fixed blocking pause observed before each external call.
#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    delay: Duration,
}

impl Throttle {
    pub fn new(delay: Duration) -> Self {
        Throttle { delay }
    }

    pub fn pause(&self) {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
    }
}

// ============================================================================
// DOCUMENT HANDLING
// ============================================================================

/// Parse a response body and reject API-level error payloads.
pub fn parse_document(body: &str) -> HarvestResult<Value> {
    let doc: Value = serde_json::from_str(body)
        .map_err(|_| HarvestError::SourceData(format!("Couldn't parse JSON: {}", body)))?;
    check_api_error(doc)
}

/// A document carrying both `code` and `message` is a failure, not data.
pub fn check_api_error(doc: Value) -> HarvestResult<Value> {
    if let (Some(code), Some(message)) = (doc.get("code"), doc.get("message")) {
        return Err(HarvestError::SourceData(format!(
            "{}: {}",
            scalar_text(code).unwrap_or_else(|| code.to_string()),
            scalar_text(message).unwrap_or_else(|| message.to_string()),
        )));
    }
    Ok(doc)
}

/// `page`/`pages` block of a listing document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Paging {
    pub page: u32,
    pub pages: u32,
}

impl Paging {
    pub fn from_document(doc: &Value) -> HarvestResult<Self> {
        let paging = doc
            .get("paging")
            .ok_or_else(|| HarvestError::SourceData("Listing has no paging block".to_string()))?;
        Paging::deserialize(paging)
            .map_err(|e| HarvestError::SourceData(format!("Invalid paging block: {}", e)))
    }

    pub fn is_last(&self) -> bool {
        self.page >= self.pages
    }
}

/// The array stored under `key`, or an empty slice when absent.
pub fn items<'a>(doc: &'a Value, key: &str) -> &'a [Value] {
    doc.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Text of a JSON string or number, verbatim.
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// A loan with the two fields the graph needs.
#[derive(Debug, Clone, PartialEq)]
pub struct LoanRecord {
    pub id: String,
    pub location: Location,
}

impl LoanRecord {
    /// Missing `id` or `location.geo.pairs` → IncompleteRecord.
    pub fn from_value(value: &Value) -> HarvestResult<Self> {
        let id = value
            .get("id")
            .and_then(scalar_text)
            .ok_or_else(|| HarvestError::IncompleteRecord("loan without id".to_string()))?;

        let pairs = value
            .pointer("/location/geo/pairs")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                HarvestError::IncompleteRecord(format!("loan {} has no location", id))
            })?;

        Ok(LoanRecord {
            location: Location::parse_pair(pairs)?,
            id,
        })
    }
}

/// A lender as it appears in profiles, rosters and loan lender lists.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LenderRecord {
    #[serde(default)]
    pub uid: Option<String>,

    #[serde(default)]
    pub whereabouts: Option<String>,

    #[serde(default)]
    pub country_code: Option<String>,

    #[serde(default)]
    pub loan_count: Option<u64>,
}

impl LenderRecord {
    pub fn from_value(value: &Value) -> HarvestResult<Self> {
        LenderRecord::deserialize(value)
            .map_err(|e| HarvestError::SourceData(format!("Invalid lender record: {}", e)))
    }

    pub fn has_location(&self) -> bool {
        self.whereabouts
            .as_deref()
            .map(|w| !w.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn display_uid(&self) -> &str {
        self.uid.as_deref().unwrap_or("<anonymous>")
    }
}

/// Interpret a legacy geocoder answer: `Placemark[0].Point.coordinates`
/// holds `[lon, lat, ...]`; no `Placemark` means no match.
pub fn parse_geocode_response(doc: &Value) -> HarvestResult<Option<Location>> {
    let placemarks = match doc.get("Placemark").and_then(Value::as_array) {
        Some(p) if !p.is_empty() => p,
        _ => return Ok(None),
    };

    let coords = placemarks[0]
        .pointer("/Point/coordinates")
        .and_then(Value::as_array)
        .ok_or_else(|| HarvestError::SourceData("Placemark without coordinates".to_string()))?;

    match (coords.first().and_then(scalar_text), coords.get(1).and_then(scalar_text)) {
        (Some(lon), Some(lat)) => Location::new(&lat, &lon).map(Some),
        _ => Err(HarvestError::SourceData(format!(
            "Malformed coordinates: {}",
            Value::Array(coords.clone())
        ))),
    }
}

// ============================================================================
// ENDPOINTS
// ============================================================================

/// URL builder for the lending API.
#[derive(Debug, Clone)]
pub struct Endpoints {
    base: String,
}

impl Endpoints {
    pub fn new(base: &str) -> Self {
        Endpoints {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn lender(&self, lender_id: &str) -> String {
        format!("{}/lenders/{}.json", self.base, urlencoding::encode(lender_id))
    }

    pub fn lender_loans(&self, lender_id: &str, page: u32) -> String {
        format!(
            "{}/lenders/{}/loans.json?page={}",
            self.base,
            urlencoding::encode(lender_id),
            page
        )
    }

    pub fn team_by_shortname(&self, shortname: &str) -> String {
        format!(
            "{}/teams/using_shortname/{}.json",
            self.base,
            urlencoding::encode(shortname)
        )
    }

    pub fn team_lenders(&self, team_id: &str, page: u32) -> String {
        format!("{}/teams/{}/lenders.json?page={}", self.base, team_id, page)
    }

    pub fn team_loans(&self, team_id: &str, page: u32) -> String {
        format!("{}/teams/{}/loans.json?page={}", self.base, team_id, page)
    }

    pub fn loan_lenders(&self, loan_id: &str, page: u32) -> String {
        format!("{}/loans/{}/lenders.json?page={}", self.base, loan_id, page)
    }
}
