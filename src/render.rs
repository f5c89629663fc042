// 🗺️ Dataset Export - per-run CSV files for the map renderer
//
// <data_dir>/<run_id>_lenders.csv        lat;lon;count
// <data_dir>/<run_id>_loans.csv          lat;lon;count
// <data_dir>/<run_id>_lender_loans.csv   lender_lat;lender_lon;loan_lat;loan_lon;distance;count
//
// The renderer is an external command that reads these three files.

use crate::error::{HarvestError, HarvestResult};
use crate::graph::RelationshipGraph;
use crate::persistence::{csv_bytes, replace_file};
use anyhow::{bail, Context};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

#[derive(Debug, Serialize)]
struct PointRow<'a> {
    lat: &'a str,
    lon: &'a str,
    count: u64,
}

#[derive(Debug, Serialize)]
struct PairRow<'a> {
    lender_lat: &'a str,
    lender_lon: &'a str,
    loan_lat: &'a str,
    loan_lon: &'a str,
    distance: f64,
    count: u64,
}

/// The three export paths for a run, in lenders / loans / pairs order
pub fn dataset_paths(data_dir: &Path, run_id: &str) -> [PathBuf; 3] {
    [
        data_dir.join(format!("{}_lenders.csv", run_id)),
        data_dir.join(format!("{}_loans.csv", run_id)),
        data_dir.join(format!("{}_lender_loans.csv", run_id)),
    ]
}

pub fn dataset_exists(data_dir: &Path, run_id: &str) -> bool {
    dataset_paths(data_dir, run_id).iter().all(|p| p.is_file())
}

/// Write the renderer's view of the graph.
pub fn export_dataset(data_dir: &Path, run_id: &str, graph: &RelationshipGraph) -> HarvestResult<()> {
    if graph.lender_location_count() == 0 || graph.loan_location_count() == 0 {
        return Err(HarvestError::SourceData(
            "There was not enough data (no lenders with valid locations or no loans) to create a map".to_string(),
        ));
    }

    fs::create_dir_all(data_dir).map_err(|e| HarvestError::io(data_dir, e))?;
    let [lenders_path, loans_path, pairs_path] = dataset_paths(data_dir, run_id);

    let lenders = graph
        .lender_locations()
        .filter(|r| r.aggregate_count > 0)
        .map(|r| PointRow {
            lat: r.location.lat().as_str(),
            lon: r.location.lon().as_str(),
            count: r.aggregate_count,
        });
    replace_file(&lenders_path, &csv_bytes(lenders)?)?;

    let loans = graph.loan_locations().map(|r| PointRow {
        lat: r.location.lat().as_str(),
        lon: r.location.lon().as_str(),
        count: r.aggregate_count,
    });
    replace_file(&loans_path, &csv_bytes(loans)?)?;

    let pairs = graph.edges().map(|(lender, loan, edge)| PairRow {
        lender_lat: lender.location.lat().as_str(),
        lender_lon: lender.location.lon().as_str(),
        loan_lat: loan.location.lat().as_str(),
        loan_lon: loan.location.lon().as_str(),
        distance: edge.distance_km,
        count: edge.pairwise_count,
    });
    replace_file(&pairs_path, &csv_bytes(pairs)?)?;

    info!(
        run_id,
        lender_locations = graph.lender_location_count(),
        loan_locations = graph.loan_location_count(),
        edges = graph.edge_count(),
        "Exported map dataset"
    );
    Ok(())
}

// ============================================================================
// RENDERER
// ============================================================================

/// External map renderer: `command[0] command[1..] <run_id>`
#[derive(Debug, Clone)]
pub struct Renderer {
    command: Vec<String>,
}

impl Renderer {
    pub fn new(command: Vec<String>) -> Self {
        Renderer { command }
    }

    /// Run the renderer for a run id and wait for it.
    pub fn render(&self, run_id: &str) -> anyhow::Result<()> {
        let (program, args) = match self.command.split_first() {
            Some(split) => split,
            None => bail!("No renderer command configured"),
        };

        info!(program = program.as_str(), run_id, "Drawing map");
        let status = Command::new(program)
            .args(args)
            .arg(run_id)
            .status()
            .with_context(|| format!("Failed to start renderer {}", program))?;

        if !status.success() {
            bail!("Renderer {} exited with {}", program, status);
        }
        Ok(())
    }
}
