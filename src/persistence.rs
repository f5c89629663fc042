// 💾 Persistence - all harvest state as a handful of flat files
//
// lender_locations.csv   idx;lat;lon;count
// loan_locations.csv     idx;lat;lon;count
// lender_loans.csv       lender_idx;loan_idx;count;distance;lender_lat;lender_lon;loan_lat;loan_lon
// locations.json         normalized text → "<lat> <lon>" | {"invalid_since": ...}
// loan_ids.json          {"file_num": n, "processed": [...]}
//
// Every save rewrites every file in full. Each file goes to a sibling temp
// file first and is renamed over the old one. The ledger is written last so
// it never claims more than the graph files hold.

use crate::config::HarvestConfig;
use crate::error::{HarvestError, HarvestResult};
use crate::geo::Location;
use crate::geocache::{CacheEntry, GeoCache};
use crate::graph::RelationshipGraph;
use crate::ledger::DedupLedger;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const LENDER_LOCATIONS_FILE: &str = "lender_locations.csv";
pub const LOAN_LOCATIONS_FILE: &str = "loan_locations.csv";
pub const LENDER_LOANS_FILE: &str = "lender_loans.csv";
pub const LOCATIONS_FILE: &str = "locations.json";
pub const LEDGER_FILE: &str = "loan_ids.json";

pub(crate) const DELIMITER: u8 = b';';

// ============================================================================
// HARVEST STATE
// ============================================================================

/// Everything a run mutates, loaded at start and saved after each batch.
pub struct HarvestState {
    pub graph: RelationshipGraph,
    pub cache: GeoCache,
    pub ledger: DedupLedger,
}

impl HarvestState {
    /// Empty state wired with the configured cache policy and geocoder pause
    pub fn empty(config: &HarvestConfig) -> Self {
        HarvestState {
            graph: RelationshipGraph::new(),
            cache: GeoCache::new(config.negative_cache, config.geocode_delay),
            ledger: DedupLedger::new(),
        }
    }
}

// ============================================================================
// ROWS
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct LocationRow {
    idx: u32,
    lat: String,
    lon: String,
    count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct EdgeRow {
    lender_idx: u32,
    loan_idx: u32,
    count: u64,
    distance: f64,
    lender_lat: String,
    lender_lon: String,
    loan_lat: String,
    loan_lon: String,
}

impl LocationRow {
    fn new(idx: u32, location: &Location, count: u64) -> Self {
        LocationRow {
            idx,
            lat: location.lat().as_str().to_string(),
            lon: location.lon().as_str().to_string(),
            count,
        }
    }

    fn location(&self) -> Result<Location, String> {
        Location::new(&self.lat, &self.lon).map_err(|e| format!("row {}: {}", self.idx, e))
    }
}

// ============================================================================
// STATE STORE
// ============================================================================

pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        StateStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Whether any state file exists yet
    pub fn has_state(&self) -> bool {
        [
            LENDER_LOCATIONS_FILE,
            LOAN_LOCATIONS_FILE,
            LENDER_LOANS_FILE,
            LOCATIONS_FILE,
            LEDGER_FILE,
        ]
        .iter()
        .any(|f| self.path(f).exists())
    }

    /// Rehydrate state. Missing files mean "nothing yet"; unreadable or
    /// inconsistent files are errors.
    pub fn load(&self, config: &HarvestConfig) -> HarvestResult<HarvestState> {
        let mut state = HarvestState::empty(config);

        let path = self.path(LENDER_LOCATIONS_FILE);
        for row in read_rows::<LocationRow>(&path)? {
            let location = row.location().map_err(|e| HarvestError::io(&path, e))?;
            state
                .graph
                .restore_lender_location(row.idx, location, row.count)
                .map_err(|e| HarvestError::io(&path, e))?;
        }

        let path = self.path(LOAN_LOCATIONS_FILE);
        for row in read_rows::<LocationRow>(&path)? {
            let location = row.location().map_err(|e| HarvestError::io(&path, e))?;
            state
                .graph
                .restore_loan_location(row.idx, location, row.count)
                .map_err(|e| HarvestError::io(&path, e))?;
        }

        let path = self.path(LENDER_LOANS_FILE);
        for row in read_rows::<EdgeRow>(&path)? {
            state
                .graph
                .restore_edge(row.lender_idx, row.loan_idx, row.count, row.distance)
                .map_err(|e| HarvestError::io(&path, e))?;
        }

        if let Some(entries) = read_json::<BTreeMap<String, CacheEntry>>(&self.path(LOCATIONS_FILE))? {
            state.cache = state.cache.with_entries(entries);
        }

        if let Some(ledger) = read_json::<DedupLedger>(&self.path(LEDGER_FILE))? {
            state.ledger = ledger;
        }

        info!(
            dir = %self.dir.display(),
            lender_locations = state.graph.lender_location_count(),
            loan_locations = state.graph.loan_location_count(),
            edges = state.graph.edge_count(),
            cached_locations = state.cache.len(),
            processed_loans = state.ledger.processed_count(),
            cursor = state.ledger.cursor(),
            "Loaded existing harvest state"
        );
        Ok(state)
    }

    /// Rewrite every state file from the in-memory state.
    pub fn save(&self, state: &HarvestState) -> HarvestResult<()> {
        fs::create_dir_all(&self.dir).map_err(|e| HarvestError::io(&self.dir, e))?;
        let graph = &state.graph;

        let lenders = graph
            .lender_locations()
            .map(|r| LocationRow::new(r.id, &r.location, r.aggregate_count));
        replace_file(&self.path(LENDER_LOCATIONS_FILE), &csv_bytes(lenders)?)?;

        let loans = graph
            .loan_locations()
            .map(|r| LocationRow::new(r.id, &r.location, r.aggregate_count));
        replace_file(&self.path(LOAN_LOCATIONS_FILE), &csv_bytes(loans)?)?;

        let edges = graph.edges().map(|(lender, loan, edge)| EdgeRow {
            lender_idx: lender.id,
            loan_idx: loan.id,
            count: edge.pairwise_count,
            distance: edge.distance_km,
            lender_lat: lender.location.lat().as_str().to_string(),
            lender_lon: lender.location.lon().as_str().to_string(),
            loan_lat: loan.location.lat().as_str().to_string(),
            loan_lon: loan.location.lon().as_str().to_string(),
        });
        replace_file(&self.path(LENDER_LOANS_FILE), &csv_bytes(edges)?)?;

        let path = self.path(LOCATIONS_FILE);
        let json = serde_json::to_vec(state.cache.entries()).map_err(|e| HarvestError::io(&path, e))?;
        replace_file(&path, &json)?;

        let path = self.path(LEDGER_FILE);
        let json = serde_json::to_vec(&state.ledger).map_err(|e| HarvestError::io(&path, e))?;
        replace_file(&path, &json)?;

        debug!(dir = %self.dir.display(), "Saved harvest state");
        Ok(())
    }
}

// ============================================================================
// FILE HELPERS
// ============================================================================

/// Semicolon-delimited CSV with a header row, built in memory.
pub(crate) fn csv_bytes<T: Serialize>(rows: impl Iterator<Item = T>) -> HarvestResult<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(DELIMITER)
        .from_writer(Vec::new());
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| HarvestError::io("<csv buffer>", e))?;
    }
    writer
        .into_inner()
        .map_err(|e| HarvestError::io("<csv buffer>", e))
}

/// Write to `<file>.tmp` beside the target, then rename over it.
pub(crate) fn replace_file(path: &Path, contents: &[u8]) -> HarvestResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents).map_err(|e| HarvestError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| HarvestError::io(path, e))
}

fn read_rows<T: DeserializeOwned>(path: &Path) -> HarvestResult<Vec<T>> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(HarvestError::io(path, e)),
    };

    csv::ReaderBuilder::new()
        .delimiter(DELIMITER)
        .has_headers(true)
        .from_reader(file)
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .map_err(|e| HarvestError::io(path, e))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> HarvestResult<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(HarvestError::io(path, e)),
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| HarvestError::io(path, e))
}
