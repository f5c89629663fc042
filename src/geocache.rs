// 🗺️ Geo Cache - memoized free text → coordinates, including misses
//
// Every answer from the geocoder is committed before `resolve` returns,
// whether the caller goes on to succeed or not. A lookup is paid for once.

use crate::config::NegativeCachePolicy;
use crate::error::{HarvestError, HarvestResult};
use crate::geo::Location;
use crate::source::{Geocoder, LenderRecord, Throttle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// URL fragments lenders paste into their whereabouts
const JUNK_SUBSTRINGS: [&str; 4] = [
    "http://www.kivafriends.org",
    "http://kivafriends.org",
    "www.kivafriends.org",
    "kivafriends.org",
];

/// Canonical cache key for a lender's free-text location.
///
/// Lower-cased whereabouts, `", " + COUNTRY` appended, junk URLs removed.
pub fn normalize_location_text(whereabouts: &str, country_code: Option<&str>) -> HarvestResult<String> {
    if whereabouts.trim().is_empty() {
        return Err(HarvestError::IncompleteRecord(
            "lender has no location set".to_string(),
        ));
    }

    let mut text = whereabouts.to_lowercase();
    if let Some(code) = country_code.filter(|c| !c.trim().is_empty()) {
        text.push_str(", ");
        text.push_str(&code.to_uppercase());
    }

    for junk in JUNK_SUBSTRINGS {
        text = text.replace(junk, "");
    }

    Ok(text)
}

// ============================================================================
// CACHE ENTRY
// ============================================================================

/// Persisted as either `"<lat> <lon>"` or `{"invalid_since": "<rfc3339>"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheEntry {
    Resolved(Location),
    Invalid { invalid_since: DateTime<Utc> },
}

// ============================================================================
// GEO CACHE
// ============================================================================

pub struct GeoCache {
    entries: BTreeMap<String, CacheEntry>,
    policy: NegativeCachePolicy,
    throttle: Throttle,
    lookups: usize,
}

impl GeoCache {
    pub fn new(policy: NegativeCachePolicy, delay: Duration) -> Self {
        GeoCache {
            entries: BTreeMap::new(),
            policy,
            throttle: Throttle::new(delay),
            lookups: 0,
        }
    }

    /// Rehydrate from persisted entries
    pub fn with_entries(mut self, entries: BTreeMap<String, CacheEntry>) -> Self {
        self.entries = entries;
        self
    }

    /// Resolve normalized text, asking the geocoder only on a miss.
    pub fn resolve<G: Geocoder + ?Sized>(&mut self, geocoder: &mut G, text: &str) -> HarvestResult<Location> {
        match self.entries.get(text) {
            Some(CacheEntry::Resolved(location)) => return Ok(location.clone()),
            Some(CacheEntry::Invalid { invalid_since }) if !self.is_expired(*invalid_since) => {
                return Err(HarvestError::InvalidLocation {
                    text: text.to_string(),
                    cached: true,
                });
            }
            Some(CacheEntry::Invalid { .. }) => {
                debug!(location = text, "Negative cache entry expired, asking the geocoder again");
            }
            None => {}
        }

        self.throttle.pause();
        self.lookups += 1;
        debug!(location = text, "Geocoding lender location");

        match geocoder.geocode(text) {
            Ok(Some(location)) => {
                self.entries
                    .insert(text.to_string(), CacheEntry::Resolved(location.clone()));
                Ok(location)
            }
            Ok(None) => {
                self.mark_invalid(text);
                warn!(location = text, "Marked lender location as invalid");
                Err(HarvestError::InvalidLocation {
                    text: text.to_string(),
                    cached: false,
                })
            }
            Err(err) => {
                // A failed call counts as a miss too; the budget sees the original error
                self.mark_invalid(text);
                Err(err)
            }
        }
    }

    /// Normalize a lender's whereabouts and resolve it.
    pub fn resolve_lender<G: Geocoder + ?Sized>(
        &mut self,
        geocoder: &mut G,
        lender: &LenderRecord,
    ) -> HarvestResult<Location> {
        let text = normalize_location_text(
            lender.whereabouts.as_deref().unwrap_or(""),
            lender.country_code.as_deref(),
        )?;
        self.resolve(geocoder, &text)
    }

    fn mark_invalid(&mut self, text: &str) {
        self.entries.insert(
            text.to_string(),
            CacheEntry::Invalid {
                invalid_since: Utc::now(),
            },
        );
    }

    fn is_expired(&self, since: DateTime<Utc>) -> bool {
        match self.policy {
            NegativeCachePolicy::Permanent => false,
            NegativeCachePolicy::RetryAfter(window) => {
                let age = Utc::now().signed_duration_since(since);
                age.to_std().map(|age| age >= window).unwrap_or(false)
            }
        }
    }

    pub fn entries(&self) -> &BTreeMap<String, CacheEntry> {
        &self.entries
    }

    pub fn get(&self, text: &str) -> Option<&CacheEntry> {
        self.entries.get(text)
    }

    /// External geocoding calls made by this instance
    pub fn lookups(&self) -> usize {
        self.lookups
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
