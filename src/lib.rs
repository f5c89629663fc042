// Loan Atlas - Core Library
// Harvests lender → loan relationships into a resumable location graph

pub mod error;      // Error kinds + per-run error budget
pub mod config;     // Defaults + LOAN_ATLAS_* overrides
pub mod geo;        // Coordinates, locations, great-circle distance
pub mod source;     // Collaborator traits + API document handling
pub mod geocache;   // Location text → coordinates, positive and negative
pub mod index;      // Stable integer ids per location namespace
pub mod graph;      // Lender location → loan location aggregate
pub mod ledger;     // Processed loan ids + snapshot cursor
pub mod persistence; // Flat-file state store
pub mod harvest;    // Resumable fetch loop
pub mod render;     // Per-run export + renderer handoff

#[cfg(feature = "http")]
pub mod client;     // Blocking HTTP collaborators

// Re-export commonly used types
pub use error::{ErrorBudget, HarvestError, HarvestResult};
pub use config::{HarvestConfig, NegativeCachePolicy};
pub use geo::{haversine_km, Coordinate, Location, EARTH_RADIUS_KM};
pub use source::{
    Endpoints, Geocoder, JsonSource, LenderRecord, LoanRecord, Paging, Throttle,
};
pub use geocache::{normalize_location_text, CacheEntry, GeoCache};
pub use index::{IndexAllocator, Namespace};
pub use graph::{LenderLocationRecord, LoanEdge, LoanLocationRecord, RelationshipGraph};
pub use ledger::DedupLedger;
pub use persistence::{HarvestState, StateStore};
pub use harvest::{FoldOutcome, HarvestReport, Harvester, PageFlow};
pub use render::{dataset_exists, export_dataset, Renderer};

#[cfg(feature = "http")]
pub use client::{HttpGeocoder, HttpSource};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
