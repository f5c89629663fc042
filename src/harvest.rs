// 🔄 Resumable Fetch Loop - pages in, graph updates out
//
// Per listing:  FETCHING_PAGE → EVALUATING_PAGE → (FETCHING_PAGE | CAUGHT_UP)
//
// Listings arrive newest-first. Each unseen loan is pushed to the FRONT of
// the pending queue, so draining the queue folds the oldest new loan first.
// The first loan already in the ledger ends the walk: everything older was
// folded by an earlier run. That shortcut relies on the API never
// reordering historical pages.
//
// Per-record failures are logged, charged to the error budget and skipped.
// Whatever way a harvest ends, state is flushed before returning.

use crate::config::HarvestConfig;
use crate::error::{ErrorBudget, HarvestError, HarvestResult};
use crate::geo::Location;
use crate::ledger::DedupLedger;
use crate::persistence::{HarvestState, StateStore};
use crate::source::{items, scalar_text, Endpoints, Geocoder, JsonSource, LenderRecord, LoanRecord, Paging, Throttle};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What the page visitor decided after evaluating one page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFlow {
    Continue,
    CaughtUp,
}

/// How a single loan ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    /// Folded with this many lender edges (may be zero)
    Folded(usize),
    NoLenders,
    NoLocatedLenders,
}

/// Counters for one harvest run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HarvestReport {
    pub pages_fetched: usize,
    pub new_loans: usize,
    pub folded_loans: usize,
    pub lender_edges: usize,
    pub skipped_loans: usize,
    pub batches: usize,
    /// Full state rewrites
    pub saves: usize,
    pub errors: usize,
    pub warnings: usize,
}

impl HarvestReport {
    pub fn summary(&self) -> String {
        format!(
            "{} new loan(s), {} folded, {} edge update(s), {} skipped, {} error(s), {} warning(s)",
            self.new_loans,
            self.folded_loans,
            self.lender_edges,
            self.skipped_loans,
            self.errors,
            self.warnings
        )
    }
}

// ============================================================================
// HARVESTER
// ============================================================================

pub struct Harvester<S: JsonSource, G: Geocoder> {
    source: S,
    geocoder: G,
    endpoints: Endpoints,
    throttle: Throttle,
    budget: ErrorBudget,
    store: StateStore,
    state: HarvestState,
    interrupt: Option<Arc<AtomicBool>>,
    report: HarvestReport,
}

impl<S: JsonSource, G: Geocoder> Harvester<S, G> {
    pub fn new(config: &HarvestConfig, store: StateStore, state: HarvestState, source: S, geocoder: G) -> Self {
        Harvester {
            source,
            geocoder,
            endpoints: Endpoints::new(&config.api_base),
            throttle: Throttle::new(config.source_delay),
            budget: ErrorBudget::new(config.max_errors),
            store,
            state,
            interrupt: None,
            report: HarvestReport::default(),
        }
    }

    /// Load whatever the store holds and build a harvester over it.
    pub fn open(config: &HarvestConfig, store: StateStore, source: S, geocoder: G) -> HarvestResult<Self> {
        let state = store.load(config)?;
        Ok(Harvester::new(config, store, state, source, geocoder))
    }

    /// Stop between records once this flag flips.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn state(&self) -> &HarvestState {
        &self.state
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.state.ledger
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn geocoder(&self) -> &G {
        &self.geocoder
    }

    pub fn report(&self) -> HarvestReport {
        let mut report = self.report.clone();
        report.errors = self.budget.errors();
        report.warnings = self.budget.warnings();
        report
    }

    pub fn into_state(self) -> HarvestState {
        self.state
    }

    /// Persist everything accumulated so far.
    pub fn flush(&mut self) -> HarvestResult<()> {
        self.store.save(&self.state)?;
        self.report.saves += 1;
        Ok(())
    }

    // ========================================================================
    // MODES
    // ========================================================================

    /// One lender: every new loan becomes an edge from the lender's location.
    pub fn harvest_lender(&mut self, lender_id: &str) -> HarvestResult<HarvestReport> {
        let result = self.harvest_lender_inner(lender_id);
        self.finish(result)
    }

    /// A lending team: new team loans, attributed to the team members who funded them.
    pub fn harvest_team(&mut self, shortname: &str) -> HarvestResult<HarvestReport> {
        let result = self.harvest_team_inner(shortname);
        self.finish(result)
    }

    /// Bulk snapshot files `<dir>/<n>.json`, resuming at the ledger cursor.
    ///
    /// Stops after `max_batches` files that contributed a loan, or at the
    /// first missing file.
    pub fn harvest_snapshots(&mut self, dir: &Path, max_batches: usize) -> HarvestResult<HarvestReport> {
        let result = self.harvest_snapshots_inner(dir, max_batches);
        self.finish(result)
    }

    fn finish(&mut self, result: HarvestResult<()>) -> HarvestResult<HarvestReport> {
        let flushed = self.flush();
        if let Err(err) = &flushed {
            error!(error = %err, "Could not flush harvest state");
        }
        if let Err(err) = &result {
            error!(error = %err, "Harvest stopped early");
        }
        result?;
        flushed?;
        Ok(self.report())
    }

    fn harvest_lender_inner(&mut self, lender_id: &str) -> HarvestResult<()> {
        info!(lender = lender_id, "Fetching lender profile");
        let doc = self.fetch(&self.endpoints.lender(lender_id))?;
        let lender = items(&doc, "lenders")
            .first()
            .map(LenderRecord::from_value)
            .transpose()?
            .ok_or_else(|| HarvestError::SourceData(format!("No lender found for {}", lender_id)))?;

        if lender.loan_count.unwrap_or(0) == 0 {
            return Err(HarvestError::SourceData(format!(
                "{} does not have any loans",
                lender.display_uid()
            )));
        }

        let lender_location = match self.state.cache.resolve_lender(&mut self.geocoder, &lender) {
            Ok(location) => location,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                return Err(HarvestError::SourceData(format!(
                    "Could not place {}: {}",
                    lender.display_uid(),
                    err
                )))
            }
        };
        info!(
            lender = lender_id,
            location = %lender_location,
            loan_count = lender.loan_count.unwrap_or(0),
            "Collecting new loans"
        );

        let endpoints = self.endpoints.clone();
        let id = lender_id.to_string();
        let mut pending = self.collect_new_loans(move |page| endpoints.lender_loans(&id, page))?;

        while let Some(loan) = pending.pop_front() {
            self.check_interrupt()?;
            if self.fold_direct(&loan, &lender_location) {
                self.flush()?;
            }
        }
        self.report.batches += 1;
        Ok(())
    }

    fn harvest_team_inner(&mut self, shortname: &str) -> HarvestResult<()> {
        info!(team = shortname, "Fetching team profile");
        let doc = self.fetch(&self.endpoints.team_by_shortname(shortname))?;
        let team_id = items(&doc, "teams")
            .first()
            .and_then(|team| team.get("id"))
            .and_then(scalar_text)
            .ok_or_else(|| HarvestError::SourceData(format!("No team found for {}", shortname)))?;

        let members = self.team_members(&team_id)?;
        self.retry_failed_loans(Some(&members))?;
        info!(team = shortname, members = members.len(), "Collecting new team loans");

        let endpoints = self.endpoints.clone();
        let id = team_id.clone();
        let mut pending = self.collect_new_loans(move |page| endpoints.team_loans(&id, page))?;

        while let Some(loan) = pending.pop_front() {
            self.check_interrupt()?;
            let outcome = self.fold_loan(&loan, Some(&members));
            self.absorb(&loan, outcome)?;
            self.flush()?;
        }
        self.report.batches += 1;
        Ok(())
    }

    fn harvest_snapshots_inner(&mut self, dir: &Path, max_batches: usize) -> HarvestResult<()> {
        self.retry_failed_loans(None)?;
        let mut batches_with_loans = 0;

        while batches_with_loans < max_batches {
            self.check_interrupt()?;
            let path = snapshot_path(dir, self.state.ledger.cursor());
            let doc = match read_snapshot(&path) {
                Ok(Some(doc)) => doc,
                Ok(None) => {
                    info!(file = %path.display(), "No more snapshot files");
                    break;
                }
                Err(err) => {
                    self.record_failure(&format!("snapshot {}", path.display()), err)?;
                    break;
                }
            };

            info!(file = %path.display(), "Processing snapshot batch");
            let folded_before = self.report.folded_loans;
            for value in items(&doc, "loans") {
                self.check_interrupt()?;
                let loan = match LoanRecord::from_value(value) {
                    Ok(loan) => loan,
                    Err(err) => {
                        self.record_failure("snapshot loan", err)?;
                        continue;
                    }
                };
                if self.state.ledger.is_processed(&loan.id) {
                    continue;
                }

                self.report.new_loans += 1;
                let outcome = self.fold_loan(&loan, None);
                self.absorb(&loan, outcome)?;
            }

            // Batch fully folded: only now may the cursor move
            let folded = self.report.folded_loans - folded_before;
            self.state.ledger.advance_cursor();
            self.flush()?;
            self.report.batches += 1;
            info!(file = %path.display(), folded, "Snapshot batch done");

            if folded > 0 {
                batches_with_loans += 1;
            }
        }
        Ok(())
    }

    // ========================================================================
    // PAGE WALKING
    // ========================================================================

    /// Page through a listing until `page > pages` or the visitor catches up.
    pub fn walk_pages<U, V>(&mut self, url_for: U, mut visit: V) -> HarvestResult<()>
    where
        U: Fn(u32) -> String,
        V: FnMut(&mut Self, &Value) -> HarvestResult<PageFlow>,
    {
        let mut page: u32 = 0;
        let mut pages: u32 = 1;

        loop {
            page += 1;
            if page > pages {
                break;
            }
            self.check_interrupt()?;

            let url = url_for(page);
            debug!(page, pages, url = url.as_str(), "Fetching page");
            let doc = self.fetch(&url)?;
            self.report.pages_fetched += 1;

            let paging = Paging::from_document(&doc)?;
            page = paging.page.max(page);
            pages = paging.pages;

            if visit(self, &doc)? == PageFlow::CaughtUp {
                debug!(page, "Caught up with previously processed data");
                break;
            }
        }
        Ok(())
    }

    /// New loans from a newest-first listing, oldest at the front.
    pub fn collect_new_loans<U>(&mut self, url_for: U) -> HarvestResult<VecDeque<LoanRecord>>
    where
        U: Fn(u32) -> String,
    {
        let mut pending: VecDeque<LoanRecord> = VecDeque::new();
        let mut queued: HashSet<String> = HashSet::new();

        self.walk_pages(url_for, |h, doc| {
            for value in items(doc, "loans") {
                let loan = match LoanRecord::from_value(value) {
                    Ok(loan) => loan,
                    Err(err) => {
                        h.record_failure("listed loan", err)?;
                        continue;
                    }
                };

                if h.state.ledger.is_processed(&loan.id) {
                    return Ok(PageFlow::CaughtUp);
                }
                // A page boundary shifting under us can repeat a loan
                if queued.insert(loan.id.clone()) {
                    pending.push_front(loan);
                }
            }
            Ok(PageFlow::Continue)
        })?;

        self.report.new_loans += pending.len();
        info!(new_loans = pending.len(), "Listing walk finished");
        Ok(pending)
    }

    // ========================================================================
    // FOLDING
    // ========================================================================

    /// Lender mode: the lender location is already known.
    fn fold_direct(&mut self, loan: &LoanRecord, lender_location: &Location) -> bool {
        if !self.state.ledger.mark_processed(&loan.id) {
            return false;
        }
        self.state.graph.record_loan_location(&loan.location);
        self.state.graph.record_lender_loan(lender_location, &loan.location);
        self.report.folded_loans += 1;
        self.report.lender_edges += 1;
        true
    }

    /// Fetch a loan's lenders and fold one edge per located lender.
    ///
    /// When `members` is given only those uids count. A failed lender fetch
    /// leaves the loan unmarked and queued for the next run.
    ///
    /// Lender locations are resolved before the graph is touched; the graph
    /// update and the ledger mark then happen together, and only after that
    /// are failures charged to the budget. An abort never leaves a loan half
    /// folded.
    pub fn fold_loan(&mut self, loan: &LoanRecord, members: Option<&HashSet<String>>) -> HarvestResult<FoldOutcome> {
        if self.state.ledger.is_processed(&loan.id) {
            return Ok(FoldOutcome::Folded(0));
        }

        let lenders = match self.lenders_for_loan(&loan.id) {
            Ok(lenders) => lenders,
            Err(err) => {
                if !err.is_fatal() {
                    self.state.ledger.queue_retry(&loan.id, &loan.location);
                }
                return Err(err);
            }
        };

        if lenders.is_empty() {
            self.state.ledger.mark_processed(&loan.id);
            self.budget.warn();
            warn!(loan_id = loan.id.as_str(), "Loan did not have any lenders");
            return Ok(FoldOutcome::NoLenders);
        }
        if !lenders.iter().any(LenderRecord::has_location) {
            self.state.ledger.mark_processed(&loan.id);
            self.budget.warn();
            warn!(loan_id = loan.id.as_str(), "Loan did not have any lenders with a location");
            return Ok(FoldOutcome::NoLocatedLenders);
        }

        let mut located: Vec<Location> = Vec::new();
        let mut failures: Vec<(String, HarvestError)> = Vec::new();
        for lender in &lenders {
            if let Some(members) = members {
                match &lender.uid {
                    Some(uid) if members.contains(uid) => {}
                    _ => continue,
                }
            }
            if !lender.has_location() {
                continue;
            }

            match self.state.cache.resolve_lender(&mut self.geocoder, lender) {
                Ok(lender_location) => located.push(lender_location),
                Err(err) => {
                    let context = format!("lender {} on loan {}", lender.display_uid(), loan.id);
                    failures.push((context, err));
                }
            }
        }

        self.state.graph.record_loan_location(&loan.location);
        for lender_location in &located {
            self.state.graph.record_lender_loan(lender_location, &loan.location);
        }
        self.state.ledger.mark_processed(&loan.id);
        self.report.folded_loans += 1;
        self.report.lender_edges += located.len();

        if located.is_empty() {
            self.budget.warn();
            warn!(loan_id = loan.id.as_str(), "No lenders were folded for loan");
        }

        for (context, err) in failures {
            self.record_failure(&context, err)?;
        }
        Ok(FoldOutcome::Folded(located.len()))
    }

    /// Fold loans parked by an earlier run before reading anything new.
    fn retry_failed_loans(&mut self, members: Option<&HashSet<String>>) -> HarvestResult<()> {
        let queued = self.state.ledger.retry_queue();
        if queued.is_empty() {
            return Ok(());
        }

        info!(loans = queued.len(), "Retrying loans whose lenders could not be fetched");
        for (id, location) in queued {
            self.check_interrupt()?;
            let loan = LoanRecord { id, location };
            let outcome = self.fold_loan(&loan, members);
            self.absorb(&loan, outcome)?;
            self.flush()?;
        }
        Ok(())
    }

    /// Book-keeping for a fold attempt; only fatal errors escape.
    fn absorb(&mut self, loan: &LoanRecord, outcome: HarvestResult<FoldOutcome>) -> HarvestResult<()> {
        match outcome {
            Ok(FoldOutcome::Folded(edges)) => {
                debug!(loan_id = loan.id.as_str(), edges, "Folded loan");
                Ok(())
            }
            Ok(_) => {
                self.report.skipped_loans += 1;
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                self.report.skipped_loans += 1;
                self.record_failure(&format!("loan {}", loan.id), err)
            }
        }
    }

    fn lenders_for_loan(&mut self, loan_id: &str) -> HarvestResult<Vec<LenderRecord>> {
        let endpoints = self.endpoints.clone();
        let id = loan_id.to_string();
        let mut lenders = Vec::new();

        self.walk_pages(
            move |page| endpoints.loan_lenders(&id, page),
            |h, doc| {
                for value in items(doc, "lenders") {
                    match LenderRecord::from_value(value) {
                        Ok(lender) => lenders.push(lender),
                        Err(err) => h.record_failure("loan lender", err)?,
                    }
                }
                Ok(PageFlow::Continue)
            },
        )?;
        Ok(lenders)
    }

    fn team_members(&mut self, team_id: &str) -> HarvestResult<HashSet<String>> {
        let endpoints = self.endpoints.clone();
        let id = team_id.to_string();
        let mut members = HashSet::new();

        self.walk_pages(
            move |page| endpoints.team_lenders(&id, page),
            |_, doc| {
                members.extend(
                    items(doc, "lenders")
                        .iter()
                        .filter_map(|l| l.get("uid").and_then(Value::as_str))
                        .map(str::to_string),
                );
                Ok(PageFlow::Continue)
            },
        )?;
        Ok(members)
    }

    // ========================================================================
    // PLUMBING
    // ========================================================================

    fn fetch(&mut self, url: &str) -> HarvestResult<Value> {
        self.throttle.pause();
        self.source.fetch_json(url)
    }

    fn check_interrupt(&self) -> HarvestResult<()> {
        match &self.interrupt {
            Some(flag) if flag.load(Ordering::SeqCst) => Err(HarvestError::Interrupted),
            _ => Ok(()),
        }
    }

    /// Log a per-record failure and charge the budget. Fatal errors pass through.
    fn record_failure(&mut self, context: &str, err: HarvestError) -> HarvestResult<()> {
        if err.is_fatal() {
            return Err(err);
        }

        match &err {
            HarvestError::IncompleteRecord(reason) => {
                debug!(context, reason = reason.as_str(), "Skipping incomplete record");
            }
            HarvestError::InvalidLocation { cached: true, text } => {
                debug!(context, location = text.as_str(), "Skipping lender with known invalid location");
            }
            HarvestError::InvalidLocation { text, .. } => {
                self.budget.warn();
                warn!(context, location = text.as_str(), "Could not place lender location");
            }
            _ => {
                error!(context, error = %err, "Unexpected error while processing record");
            }
        }
        self.budget.charge(&err)
    }
}

// ============================================================================
// SNAPSHOT FILES
// ============================================================================

pub fn snapshot_path(dir: &Path, batch: u32) -> PathBuf {
    dir.join(format!("{}.json", batch))
}

/// `Ok(None)` when the file does not exist.
fn read_snapshot(path: &Path) -> HarvestResult<Option<Value>> {
    let body = match fs::read_to_string(path) {
        Ok(body) => body,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(HarvestError::io(path, e)),
    };
    serde_json::from_str(&body)
        .map(Some)
        .map_err(|e| HarvestError::SourceData(format!("Couldn't parse {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::check_api_error;
    use serde_json::json;
    use std::collections::HashMap;

    const API: &str = "http://api.test/v1";

    #[derive(Default)]
    struct FakeSource {
        docs: HashMap<String, Value>,
        calls: Vec<String>,
    }

    impl FakeSource {
        fn add(&mut self, path: &str, doc: Value) {
            self.docs.insert(format!("{}/{}", API, path), doc);
        }

        fn fetched(&self, path: &str) -> bool {
            self.calls.iter().any(|u| u == &format!("{}/{}", API, path))
        }
    }

    impl JsonSource for FakeSource {
        fn fetch_json(&mut self, url: &str) -> HarvestResult<Value> {
            self.calls.push(url.to_string());
            match self.docs.get(url) {
                Some(doc) => check_api_error(doc.clone()),
                None => Err(HarvestError::SourceData(format!("404 for {}", url))),
            }
        }
    }

    struct FakeGeocoder {
        answers: HashMap<String, String>,
        calls: Vec<String>,
    }

    impl FakeGeocoder {
        fn new(answers: &[(&str, &str)]) -> Self {
            FakeGeocoder {
                answers: answers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                calls: Vec::new(),
            }
        }
    }

    impl Geocoder for FakeGeocoder {
        fn geocode(&mut self, query: &str) -> HarvestResult<Option<Location>> {
            self.calls.push(query.to_string());
            self.answers
                .get(query)
                .map(|pair| Location::parse_pair(pair))
                .transpose()
        }
    }

    fn config() -> HarvestConfig {
        HarvestConfig {
            api_base: API.to_string(),
            ..HarvestConfig::default()
        }
        .without_delays()
    }

    fn loan(id: u64, pair: &str) -> Value {
        json!({"id": id, "location": {"geo": {"pairs": pair}}})
    }

    fn listing(key: &str, page: u32, pages: u32, entries: Vec<Value>) -> Value {
        json!({"paging": {"page": page, "pages": pages}, key: entries})
    }

    fn lender(uid: &str, whereabouts: &str, country: &str) -> Value {
        json!({"uid": uid, "whereabouts": whereabouts, "country_code": country})
    }

    fn loc(pair: &str) -> Location {
        Location::parse_pair(pair).unwrap()
    }

    /// Lender "seand" in Seattle with loans 5,4,3 new and 2 already seen
    fn lender_source() -> FakeSource {
        let mut source = FakeSource::default();
        source.add(
            "lenders/seand.json",
            json!({"lenders": [{"uid": "seand", "whereabouts": "Seattle", "country_code": "US", "loan_count": 5}]}),
        );
        source.add(
            "lenders/seand/loans.json?page=1",
            listing("loans", 1, 2, vec![loan(5, "5 5"), loan(4, "4 4"), loan(3, "3 3"), loan(2, "2 2")]),
        );
        source.add(
            "lenders/seand/loans.json?page=2",
            listing("loans", 2, 2, vec![loan(1, "1 1")]),
        );
        source
    }

    fn seattle() -> FakeGeocoder {
        FakeGeocoder::new(&[("seattle, US", "47.6 -122.3")])
    }

    fn harvester_with_seen<S: JsonSource, G: Geocoder>(
        dir: &Path,
        seen: &[&str],
        source: S,
        geocoder: G,
    ) -> Harvester<S, G> {
        let config = config();
        let mut state = HarvestState::empty(&config);
        for id in seen {
            state.ledger.mark_processed(id);
        }
        Harvester::new(&config, StateStore::new(dir), state, source, geocoder)
    }

    #[test]
    fn test_stopping_rule_folds_oldest_new_loan_first() {
        let tmp = tempfile::tempdir().unwrap();
        let mut h = harvester_with_seen(tmp.path(), &["2"], lender_source(), seattle());

        let report = h.harvest_lender("seand").unwrap();

        assert_eq!(report.new_loans, 3);
        assert_eq!(report.folded_loans, 3);
        assert!(!h.source().fetched("lenders/seand/loans.json?page=2"));

        let graph = &h.state().graph;
        assert_eq!(graph.loan_at(&loc("3 3")).unwrap().id, 0);
        assert_eq!(graph.loan_at(&loc("4 4")).unwrap().id, 1);
        assert_eq!(graph.loan_at(&loc("5 5")).unwrap().id, 2);
        assert!(graph.loan_at(&loc("1 1")).is_none());

        let seattle = graph.lender_at(&loc("47.6 -122.3")).unwrap();
        assert_eq!(seattle.aggregate_count, 3);
        assert!(h.ledger().is_processed("5"));
        assert!(!h.ledger().is_processed("1"));
    }

    #[test]
    fn test_pending_queue_is_chronological() {
        let tmp = tempfile::tempdir().unwrap();
        let mut h = harvester_with_seen(tmp.path(), &["2"], lender_source(), seattle());

        let pending = h
            .collect_new_loans(|page| format!("{}/lenders/seand/loans.json?page={}", API, page))
            .unwrap();
        let ids: Vec<&str> = pending.iter().map(|l| l.id.as_str()).collect();

        assert_eq!(ids, vec!["3", "4", "5"]);
        assert_eq!(h.report().pages_fetched, 1);
    }

    #[test]
    fn test_walks_every_page_when_nothing_seen() {
        let tmp = tempfile::tempdir().unwrap();
        let mut h = harvester_with_seen(tmp.path(), &[], lender_source(), seattle());

        let report = h.harvest_lender("seand").unwrap();

        assert_eq!(report.new_loans, 5);
        assert!(h.source().fetched("lenders/seand/loans.json?page=2"));
        assert_eq!(h.state().graph.loan_at(&loc("1 1")).unwrap().id, 0);
    }

    #[test]
    fn test_second_pass_over_same_pages_changes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut h = harvester_with_seen(tmp.path(), &[], lender_source(), seattle());

        h.harvest_lender("seand").unwrap();
        let before = h.state().graph.clone();
        let ledger_before = h.ledger().clone();

        h.harvest_lender("seand").unwrap();

        assert_eq!(h.state().graph, before);
        assert_eq!(h.ledger(), &ledger_before);
        assert_eq!(h.geocoder().calls.len(), 1);
    }

    #[test]
    fn test_lender_without_loans_fails_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let mut source = FakeSource::default();
        source.add(
            "lenders/idle.json",
            json!({"lenders": [{"uid": "idle", "whereabouts": "Oslo", "loan_count": 0}]}),
        );
        let mut h = harvester_with_seen(tmp.path(), &[], source, seattle());

        let err = h.harvest_lender("idle").unwrap_err();
        assert_eq!(err.to_string(), "Source data error: idle does not have any loans");
    }

    #[test]
    fn test_unplaceable_lender_fails_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let mut source = lender_source();
        source.add(
            "lenders/seand.json",
            json!({"lenders": [{"uid": "seand", "whereabouts": "Atlantis", "loan_count": 5}]}),
        );
        let mut h = harvester_with_seen(tmp.path(), &[], source, seattle());

        let err = h.harvest_lender("seand").unwrap_err();
        assert!(matches!(err, HarvestError::SourceData(_)));
        assert!(!h.source().fetched("lenders/seand/loans.json?page=1"));
    }

    fn team_source() -> FakeSource {
        let mut source = FakeSource::default();
        source.add(
            "teams/using_shortname/buildkiva.json",
            json!({"teams": [{"id": 77, "shortname": "buildkiva"}]}),
        );
        source.add(
            "teams/77/lenders.json?page=1",
            listing("lenders", 1, 1, vec![json!({"uid": "ann"}), json!({"uid": "bob"})]),
        );
        source.add(
            "teams/77/loans.json?page=1",
            listing("loans", 1, 1, vec![loan(11, "-1.28 36.82"), loan(10, "14.6 121.0")]),
        );
        source.add(
            "loans/10/lenders.json?page=1",
            listing(
                "lenders",
                1,
                1,
                vec![
                    lender("ann", "Seattle", "US"),
                    lender("carol", "London", "GB"),
                    lender("bob", "Atlantis", "XX"),
                ],
            ),
        );
        source.add(
            "loans/11/lenders.json?page=1",
            listing(
                "lenders",
                1,
                1,
                vec![lender("ann", "Seattle", "US"), lender("bob", "Atlantis", "XX")],
            ),
        );
        source
    }

    #[test]
    fn test_team_harvest_counts_only_members() {
        let tmp = tempfile::tempdir().unwrap();
        let mut h = harvester_with_seen(tmp.path(), &[], team_source(), seattle());

        let report = h.harvest_team("buildkiva").unwrap();

        let graph = &h.state().graph;
        assert_eq!(graph.loan_at(&loc("14.6 121.0")).unwrap().id, 0);
        assert_eq!(graph.loan_at(&loc("-1.28 36.82")).unwrap().id, 1);
        assert_eq!(graph.lender_location_count(), 1);

        let ann = graph.lender_at(&loc("47.6 -122.3")).unwrap();
        assert_eq!(ann.aggregate_count, 2);
        assert_eq!(ann.outgoing.len(), 2);

        // carol is not on the team; bob's location is looked up once
        assert_eq!(h.geocoder().calls, vec!["seattle, US", "atlantis, XX"]);
        assert_eq!(report.errors, 1);
        assert_eq!(report.folded_loans, 2);
        assert_eq!(report.lender_edges, 2);
    }

    #[test]
    fn test_failed_sub_fetch_leaves_loan_for_next_run() {
        let tmp = tempfile::tempdir().unwrap();
        let mut source = team_source();
        source.add(
            "loans/11/lenders.json?page=1",
            json!({"code": "org.kiva.ServerError", "message": "try later"}),
        );
        let mut h = harvester_with_seen(tmp.path(), &[], source, seattle());

        let report = h.harvest_team("buildkiva").unwrap();

        assert!(h.ledger().is_processed("10"));
        assert!(!h.ledger().is_processed("11"));
        assert!(h.ledger().is_queued_for_retry("11"));
        assert_eq!(report.skipped_loans, 1);
        assert!(h.state().graph.loan_at(&loc("-1.28 36.82")).is_none());
    }

    #[test]
    fn test_failed_loan_is_retried_next_run() {
        let tmp = tempfile::tempdir().unwrap();
        let mut broken = team_source();
        broken.add(
            "loans/10/lenders.json?page=1",
            json!({"code": "org.kiva.ServerError", "message": "try later"}),
        );
        let mut h = harvester_with_seen(tmp.path(), &[], broken, seattle());
        h.harvest_team("buildkiva").unwrap();
        assert!(!h.ledger().is_processed("10"));
        assert!(h.ledger().is_processed("11"));

        // Newer loan 11 is processed, so the listing alone would never reach 10 again
        let config = config();
        let mut h = Harvester::open(&config, StateStore::new(tmp.path()), team_source(), seattle()).unwrap();
        h.harvest_team("buildkiva").unwrap();

        assert!(h.ledger().is_processed("10"));
        assert_eq!(h.ledger().retry_count(), 0);
        let graph = &h.state().graph;
        assert_eq!(graph.loan_at(&loc("14.6 121.0")).unwrap().aggregate_count, 1);
        assert_eq!(graph.lender_at(&loc("47.6 -122.3")).unwrap().aggregate_count, 2);
    }

    #[test]
    fn test_failed_snapshot_loan_survives_cursor_move() {
        let tmp = tempfile::tempdir().unwrap();
        let snapshots = tmp.path().join("loans");
        fs::create_dir_all(&snapshots).unwrap();
        fs::write(snapshot_path(&snapshots, 1), json!({"loans": [loan(5, "5 5")]}).to_string()).unwrap();

        let config = config();
        let mut h = Harvester::open(&config, StateStore::new(tmp.path()), FakeSource::default(), seattle()).unwrap();
        h.harvest_snapshots(&snapshots, 1).unwrap();
        assert_eq!(h.ledger().cursor(), 2);
        assert!(h.ledger().is_queued_for_retry("5"));

        let mut source = FakeSource::default();
        source.add(
            "loans/5/lenders.json?page=1",
            listing("lenders", 1, 1, vec![lender("ann", "Seattle", "US")]),
        );
        let mut h = Harvester::open(&config, StateStore::new(tmp.path()), source, seattle()).unwrap();
        h.harvest_snapshots(&snapshots, 1).unwrap();

        assert!(h.ledger().is_processed("5"));
        assert_eq!(h.ledger().cursor(), 2);
        assert_eq!(h.state().graph.loan_at(&loc("5 5")).unwrap().aggregate_count, 1);
    }

    #[test]
    fn test_budget_abort_inside_a_loan_folds_it_whole() {
        let tmp = tempfile::tempdir().unwrap();
        let snapshots = tmp.path().join("loans");
        fs::create_dir_all(&snapshots).unwrap();
        fs::write(snapshot_path(&snapshots, 1), json!({"loans": [loan(1, "10 10")]}).to_string()).unwrap();

        let source = || {
            let mut source = FakeSource::default();
            source.add(
                "loans/1/lenders.json?page=1",
                listing(
                    "lenders",
                    1,
                    1,
                    vec![
                        lender("a", "Here", "XX"),
                        lender("b", "Nowhere1", "XX"),
                        lender("c", "Nowhere2", "XX"),
                    ],
                ),
            );
            source
        };
        let geocoder = || FakeGeocoder::new(&[("here, XX", "10 10")]);
        let config = HarvestConfig {
            max_errors: 1,
            ..config()
        };

        let mut h = Harvester::open(&config, StateStore::new(tmp.path()), source(), geocoder()).unwrap();
        match h.harvest_snapshots(&snapshots, 1) {
            Err(HarvestError::TooManyErrors { count, tolerance }) => {
                assert_eq!((count, tolerance), (2, 1));
            }
            other => panic!("expected TooManyErrors, got {:?}", other),
        }

        let saved = StateStore::new(tmp.path()).load(&config).unwrap();
        assert!(saved.ledger.is_processed("1"));
        assert_eq!(saved.ledger.cursor(), 1);
        assert_eq!(saved.graph.loan_at(&loc("10 10")).unwrap().aggregate_count, 1);
        assert_eq!(saved.graph.lender_at(&loc("10 10")).unwrap().aggregate_count, 1);

        // The batch is replayed, but the loan is already in the ledger
        let mut h = Harvester::open(&config, StateStore::new(tmp.path()), source(), geocoder()).unwrap();
        h.harvest_snapshots(&snapshots, 1).unwrap();
        assert_eq!(h.state().graph, saved.graph);
        assert_eq!(h.ledger().cursor(), 2);
    }

    #[test]
    fn test_lender_mode_saves_after_each_loan() {
        let tmp = tempfile::tempdir().unwrap();
        let mut h = harvester_with_seen(tmp.path(), &["2"], lender_source(), seattle());

        let report = h.harvest_lender("seand").unwrap();

        // One save per folded loan plus the closing one
        assert_eq!(report.folded_loans, 3);
        assert_eq!(report.saves, 4);
    }

    #[test]
    fn test_error_budget_aborts_and_flushes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut source = FakeSource::default();
        source.add(
            "teams/using_shortname/broken.json",
            json!({"teams": [{"id": 5}]}),
        );
        source.add("teams/5/lenders.json?page=1", listing("lenders", 1, 1, vec![]));
        source.add(
            "teams/5/loans.json?page=1",
            listing("loans", 1, 1, vec![loan(3, "3 3"), loan(2, "2 2"), loan(1, "1 1")]),
        );

        let config = HarvestConfig {
            max_errors: 1,
            ..config()
        };
        let state = HarvestState::empty(&config);
        let mut h = Harvester::new(&config, StateStore::new(tmp.path()), state, source, seattle());

        match h.harvest_team("broken") {
            Err(HarvestError::TooManyErrors { count, tolerance }) => {
                assert_eq!(count, 2);
                assert_eq!(tolerance, 1);
            }
            other => panic!("expected TooManyErrors, got {:?}", other),
        }
        assert!(!h.source().fetched("loans/3/lenders.json?page=1"));
        assert!(tmp.path().join("loan_ids.json").exists());
        assert_eq!(h.ledger().processed_count(), 0);
    }

    #[test]
    fn test_interrupt_flushes_what_was_learned() {
        let tmp = tempfile::tempdir().unwrap();
        let flag = Arc::new(AtomicBool::new(true));
        let mut h = harvester_with_seen(tmp.path(), &[], lender_source(), seattle()).with_interrupt(flag);

        let err = h.harvest_lender("seand").unwrap_err();
        assert!(matches!(err, HarvestError::Interrupted));

        let cache = fs::read_to_string(tmp.path().join("locations.json")).unwrap();
        assert!(cache.contains("seattle, US"));
    }

    #[test]
    fn test_snapshot_batches_resume_at_cursor() {
        let tmp = tempfile::tempdir().unwrap();
        let snapshots = tmp.path().join("loans");
        let state_dir = tmp.path().join("state");
        fs::create_dir_all(&snapshots).unwrap();
        fs::write(
            snapshot_path(&snapshots, 1),
            json!({"loans": [loan(1, "1 1"), {"id": 2}, loan(3, "3 3")]}).to_string(),
        )
        .unwrap();
        fs::write(snapshot_path(&snapshots, 2), json!({"loans": [loan(1, "1 1")]}).to_string()).unwrap();
        fs::write(snapshot_path(&snapshots, 3), json!({"loans": [loan(4, "4 4")]}).to_string()).unwrap();

        let config = config();
        let mut h = Harvester::open(&config, StateStore::new(&state_dir), snapshot_source(), seattle()).unwrap();
        let report = h.harvest_snapshots(&snapshots, 1).unwrap();

        assert_eq!(report.batches, 1);
        assert_eq!(h.ledger().cursor(), 2);
        assert!(h.ledger().is_processed("1"));
        assert!(h.ledger().is_processed("3"));
        assert!(!h.ledger().is_processed("2"));

        // Fresh process: reload from disk and keep going
        let mut h = Harvester::open(&config, StateStore::new(&state_dir), snapshot_source(), seattle()).unwrap();
        assert_eq!(h.ledger().cursor(), 2);

        let report = h.harvest_snapshots(&snapshots, 5).unwrap();
        assert_eq!(report.batches, 2);
        assert_eq!(h.ledger().cursor(), 4);
        assert!(!h.source().fetched("loans/1/lenders.json?page=1"));
        assert!(h.geocoder().calls.is_empty());

        let ann = h.state().graph.lender_at(&loc("47.6 -122.3")).unwrap();
        assert_eq!(ann.aggregate_count, 2);
        assert_eq!(h.state().graph.loan_location_count(), 2);
    }

    fn snapshot_source() -> FakeSource {
        let mut source = FakeSource::default();
        source.add(
            "loans/1/lenders.json?page=1",
            listing("lenders", 1, 1, vec![lender("ann", "Seattle", "US")]),
        );
        source.add("loans/3/lenders.json?page=1", listing("lenders", 1, 1, vec![]));
        source.add(
            "loans/4/lenders.json?page=1",
            listing("lenders", 1, 1, vec![lender("ann", "Seattle", "US")]),
        );
        source
    }
}
