// 🕸️ Relationship Graph - lender locations → loan locations
//
// Bipartite aggregate: each lender location counts the loans attributed to
// it and keeps one edge per loan location it funded, with a pairwise count
// and a distance fixed when the edge is first created. Nothing is ever
// removed; counts only grow.

use crate::geo::Location;
use crate::index::{IndexAllocator, Namespace};
use serde::Serialize;
use std::collections::BTreeMap;

// ============================================================================
// RECORDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoanEdge {
    pub loan_location_id: u32,
    pub pairwise_count: u64,
    pub distance_km: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LenderLocationRecord {
    pub id: u32,
    pub location: Location,
    pub aggregate_count: u64,

    /// Keyed by loan-location id (one id per loan location)
    pub outgoing: BTreeMap<u32, LoanEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoanLocationRecord {
    pub id: u32,
    pub location: Location,
    pub aggregate_count: u64,
}

// ============================================================================
// GRAPH
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationshipGraph {
    allocator: IndexAllocator,
    lenders: BTreeMap<u32, LenderLocationRecord>,
    loans: BTreeMap<u32, LoanLocationRecord>,
}

impl RelationshipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more loan at this location.
    pub fn record_loan_location(&mut self, location: &Location) -> u32 {
        let id = self.ensure_loan_location(location);
        if let Some(record) = self.loans.get_mut(&id) {
            record.aggregate_count += 1;
        }
        id
    }

    /// Attribute one loan at `loan_location` to the lender location.
    ///
    /// Creates missing records, bumps the lender's aggregate count, then
    /// either creates the edge (computing its distance) or bumps it.
    pub fn record_lender_loan(&mut self, lender_location: &Location, loan_location: &Location) -> &LoanEdge {
        let loan_id = self.ensure_loan_location(loan_location);
        let lender_id = self.allocator.id_for(lender_location, Namespace::Lender);

        let lender = self
            .lenders
            .entry(lender_id)
            .or_insert_with(|| LenderLocationRecord {
                id: lender_id,
                location: lender_location.clone(),
                aggregate_count: 0,
                outgoing: BTreeMap::new(),
            });
        lender.aggregate_count += 1;

        let from = &lender.location;
        lender
            .outgoing
            .entry(loan_id)
            .and_modify(|edge| edge.pairwise_count += 1)
            .or_insert_with(|| LoanEdge {
                loan_location_id: loan_id,
                pairwise_count: 1,
                distance_km: from.distance_km(loan_location),
            })
    }

    /// Id of the lender location, creating an empty record on first sight.
    pub fn ensure_lender_location(&mut self, location: &Location) -> u32 {
        let id = self.allocator.id_for(location, Namespace::Lender);
        self.lenders.entry(id).or_insert_with(|| LenderLocationRecord {
            id,
            location: location.clone(),
            aggregate_count: 0,
            outgoing: BTreeMap::new(),
        });
        id
    }

    /// Id of the loan location, creating an empty record on first sight.
    pub fn ensure_loan_location(&mut self, location: &Location) -> u32 {
        let id = self.allocator.id_for(location, Namespace::Loan);
        self.loans.entry(id).or_insert_with(|| LoanLocationRecord {
            id,
            location: location.clone(),
            aggregate_count: 0,
        });
        id
    }

    // ========================================================================
    // REHYDRATION (rows read back from disk, ids kept as-is)
    // ========================================================================

    pub fn restore_lender_location(&mut self, id: u32, location: Location, aggregate_count: u64) -> Result<(), String> {
        self.allocator
            .register(location.clone(), id, Namespace::Lender)?;
        self.lenders.insert(
            id,
            LenderLocationRecord {
                id,
                location,
                aggregate_count,
                outgoing: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn restore_loan_location(&mut self, id: u32, location: Location, aggregate_count: u64) -> Result<(), String> {
        self.allocator.register(location.clone(), id, Namespace::Loan)?;
        self.loans.insert(
            id,
            LoanLocationRecord {
                id,
                location,
                aggregate_count,
            },
        );
        Ok(())
    }

    /// Both endpoints must already be restored.
    pub fn restore_edge(&mut self, lender_id: u32, loan_id: u32, pairwise_count: u64, distance_km: f64) -> Result<(), String> {
        if !self.loans.contains_key(&loan_id) {
            return Err(format!("edge points at unknown loan location {}", loan_id));
        }
        let lender = self
            .lenders
            .get_mut(&lender_id)
            .ok_or_else(|| format!("edge starts at unknown lender location {}", lender_id))?;

        if lender.outgoing.contains_key(&loan_id) {
            return Err(format!("duplicate edge {} -> {}", lender_id, loan_id));
        }
        lender.outgoing.insert(
            loan_id,
            LoanEdge {
                loan_location_id: loan_id,
                pairwise_count,
                distance_km,
            },
        );
        Ok(())
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn lender_locations(&self) -> impl Iterator<Item = &LenderLocationRecord> {
        self.lenders.values()
    }

    pub fn loan_locations(&self) -> impl Iterator<Item = &LoanLocationRecord> {
        self.loans.values()
    }

    pub fn lender_location(&self, id: u32) -> Option<&LenderLocationRecord> {
        self.lenders.get(&id)
    }

    pub fn loan_location(&self, id: u32) -> Option<&LoanLocationRecord> {
        self.loans.get(&id)
    }

    pub fn lender_at(&self, location: &Location) -> Option<&LenderLocationRecord> {
        self.allocator
            .get(location, Namespace::Lender)
            .and_then(|id| self.lenders.get(&id))
    }

    pub fn loan_at(&self, location: &Location) -> Option<&LoanLocationRecord> {
        self.allocator
            .get(location, Namespace::Loan)
            .and_then(|id| self.loans.get(&id))
    }

    pub fn edge(&self, lender_location: &Location, loan_location: &Location) -> Option<&LoanEdge> {
        let loan_id = self.allocator.get(loan_location, Namespace::Loan)?;
        self.lender_at(lender_location)?.outgoing.get(&loan_id)
    }

    /// `(lender record, loan record, edge)` for every edge, ordered by ids
    pub fn edges(&self) -> impl Iterator<Item = (&LenderLocationRecord, &LoanLocationRecord, &LoanEdge)> {
        self.lenders.values().flat_map(move |lender| {
            lender.outgoing.values().filter_map(move |edge| {
                self.loans
                    .get(&edge.loan_location_id)
                    .map(|loan| (lender, loan, edge))
            })
        })
    }

    pub fn edge_count(&self) -> usize {
        self.lenders.values().map(|l| l.outgoing.len()).sum()
    }

    pub fn lender_location_count(&self) -> usize {
        self.lenders.len()
    }

    pub fn loan_location_count(&self) -> usize {
        self.loans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lenders.is_empty() && self.loans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::EARTH_RADIUS_KM;

    fn loc(pair: &str) -> Location {
        Location::parse_pair(pair).unwrap()
    }

    #[test]
    fn test_two_lenders_one_loan_location() {
        let l1 = loc("10 10");
        let l2 = loc("20 20");
        let m = loc("10 10");
        let mut graph = RelationshipGraph::new();

        graph.record_loan_location(&m);
        graph.record_lender_loan(&l1, &m);
        graph.record_loan_location(&m);
        graph.record_lender_loan(&l2, &m);

        assert_eq!(graph.lender_location_count(), 2);
        assert_eq!(graph.loan_location_count(), 1);
        assert_eq!(graph.loan_at(&m).unwrap().aggregate_count, 2);

        for lender in [&l1, &l2] {
            let record = graph.lender_at(lender).unwrap();
            assert_eq!(record.aggregate_count, 1);
            assert_eq!(record.outgoing.len(), 1);
            assert_eq!(graph.edge(lender, &m).unwrap().pairwise_count, 1);
        }

        assert_eq!(graph.edge(&l1, &m).unwrap().distance_km, 0.0);
        let expected = l2.distance_km(&m);
        assert_eq!(graph.edge(&l2, &m).unwrap().distance_km, expected);
        assert!(expected > 1500.0 && expected < 1600.0);
    }

    #[test]
    fn test_edge_distance_fixed_on_increment() {
        let lender = loc("0 0");
        let loan = loc("0 90");
        let mut graph = RelationshipGraph::new();

        let first = graph.record_lender_loan(&lender, &loan).distance_km;
        for _ in 0..4 {
            graph.record_lender_loan(&lender, &loan);
        }

        let edge = graph.edge(&lender, &loan).unwrap();
        assert_eq!(edge.pairwise_count, 5);
        assert_eq!(edge.distance_km, first);
        assert!((first - EARTH_RADIUS_KM * std::f64::consts::FRAC_PI_2).abs() < 1e-6);
    }

    #[test]
    fn test_pairwise_counts_sum_to_aggregate() {
        let lender = loc("1 1");
        let mut graph = RelationshipGraph::new();
        for pair in ["2 2", "3 3", "2 2", "4 4", "2 2"] {
            graph.record_lender_loan(&lender, &loc(pair));
        }

        let record = graph.lender_at(&lender).unwrap();
        let sum: u64 = record.outgoing.values().map(|e| e.pairwise_count).sum();
        assert_eq!(record.aggregate_count, 5);
        assert_eq!(sum, record.aggregate_count);
        assert_eq!(graph.edge_count(), 3);
    }

    #[test]
    fn test_same_point_gets_independent_ids() {
        let here = loc("5 5");
        let elsewhere = loc("6 6");
        let mut graph = RelationshipGraph::new();

        graph.ensure_lender_location(&elsewhere);
        graph.record_lender_loan(&here, &here);

        assert_eq!(graph.lender_at(&here).unwrap().id, 1);
        assert_eq!(graph.loan_at(&here).unwrap().id, 0);
    }

    #[test]
    fn test_restore_then_continue() {
        let mut graph = RelationshipGraph::new();
        graph.restore_lender_location(4, loc("1 1"), 3).unwrap();
        graph.restore_loan_location(9, loc("2 2"), 3).unwrap();
        graph.restore_edge(4, 9, 3, 157.0).unwrap();

        graph.record_loan_location(&loc("2 2"));
        graph.record_lender_loan(&loc("1 1"), &loc("2 2"));
        graph.record_lender_loan(&loc("7 7"), &loc("2 2"));

        let edge = graph.edge(&loc("1 1"), &loc("2 2")).unwrap();
        assert_eq!(edge.pairwise_count, 4);
        assert_eq!(edge.distance_km, 157.0);
        assert_eq!(graph.lender_at(&loc("7 7")).unwrap().id, 5);
        assert_eq!(graph.loan_at(&loc("2 2")).unwrap().aggregate_count, 4);
    }

    #[test]
    fn test_restore_rejects_dangling_edges() {
        let mut graph = RelationshipGraph::new();
        graph.restore_lender_location(0, loc("1 1"), 1).unwrap();

        assert!(graph.restore_edge(0, 3, 1, 10.0).is_err());
        assert!(graph.restore_edge(2, 0, 1, 10.0).is_err());
    }
}
