use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::error::{CatalogError, KernelError, TurnWarning};
use crate::memory::{self, Delta, FilterMemory};
use crate::plan::{compile_checked, ParamStyle, QueryPlan, RenderedQuery};
use crate::record::{ProductRecord, RawRow};
use crate::reducer::reduce;
use crate::season::MonthDay;
use crate::vocabulary::CanonicalVocabulary;

/// One fetch issued by a turn.
#[derive(Debug, Clone, Copy)]
pub struct CatalogRequest<'a> {
    pub plan: &'a QueryPlan,
    pub query: &'a RenderedQuery,
    pub timeout: Duration,
}

/// Executes compiled queries against the product catalog.
pub trait CatalogSource {
    /// Placeholder syntax the backend expects.
    fn param_style(&self) -> ParamStyle {
        ParamStyle::Question
    }

    /// Fetch every row matching the request, within `request.timeout`.
    ///
    /// # Errors
    /// Returns [`CatalogError::TimedOut`] when the deadline passes, or another
    /// [`CatalogError`] when the backend fails.
    fn fetch(&self, request: &CatalogRequest<'_>) -> Result<Vec<RawRow>, CatalogError>;
}

/// Shared, read-only collaborators for processing turns.
#[derive(Clone, Copy)]
pub struct TurnContext<'a> {
    pub vocabulary: &'a CanonicalVocabulary,
    pub config: &'a EngineConfig,
    pub catalog: &'a dyn CatalogSource,
    /// Date that `now` resolves to.
    pub today: MonthDay,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Memory to use for the next turn.
    pub memory: FilterMemory,
    pub plan: QueryPlan,
    pub query: RenderedQuery,
    pub records: Vec<ProductRecord>,
    pub warnings: Vec<TurnWarning>,
    pub candidate_count: usize,
    pub exhausted: bool,
}

#[must_use]
pub fn create_session() -> FilterMemory {
    let memory = FilterMemory::new();
    tracing::info!(seed = memory.sample_seed, "session created");
    memory
}

#[must_use]
pub fn reset_session(memory: &FilterMemory) -> FilterMemory {
    tracing::info!("session reset");
    memory::reset(memory)
}

/// Run one turn: apply deltas, compile, fetch, then reduce.
///
/// `memory` is only borrowed; on error the caller keeps its current memory and may retry
/// with the same deltas.
///
/// # Errors
/// Returns [`KernelError::ConstraintResolution`] when no usable predicate can be compiled,
/// [`KernelError::Validation`] for an invalid catalog view name, and
/// [`KernelError::CatalogFetch`] when the catalog fails or exceeds the timeout.
pub fn process_turn(
    ctx: &TurnContext<'_>,
    memory: &FilterMemory,
    deltas: &[Delta],
) -> Result<TurnOutcome, KernelError> {
    let transition = memory::apply(memory, deltas, ctx.vocabulary);
    let plan = compile_checked(&transition.memory, &transition.unresolved, ctx.today)?;
    let query = plan.render(&ctx.config.catalog_view, ctx.catalog.param_style())?;
    tracing::debug!(predicates = ?plan.explain(), sql = %query.sql, "compiled turn plan");

    let timeout = ctx.config.fetch_timeout();
    let started = Instant::now();
    let fetched = ctx.catalog.fetch(&CatalogRequest { plan: &plan, query: &query, timeout });
    let elapsed = started.elapsed();
    let rows = match fetched {
        Ok(_) if elapsed > timeout => Err(CatalogError::TimedOut { elapsed_ms: millis(elapsed) }),
        other => other,
    }
    .map_err(|err| {
        tracing::warn!(error = %err, retryable = err.is_retryable(), "catalog fetch failed");
        KernelError::from(err)
    })?;
    tracing::debug!(rows = rows.len(), elapsed_ms = millis(elapsed), "catalog fetch finished");

    let reduction = reduce(&rows, &transition.memory, ctx.config.sample_cap);
    let mut warnings = transition.warnings;
    warnings.extend(reduction.warnings);

    Ok(TurnOutcome {
        memory: reduction.memory,
        plan,
        query,
        records: reduction.records,
        warnings,
        candidate_count: reduction.candidate_count,
        exhausted: reduction.exhausted,
    })
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Catalog held in memory that evaluates plans directly. Rows that cannot be coerced are
/// returned unfiltered, as a backend would, so the reducer reports them.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    rows: Vec<RawRow>,
    failure: Option<CatalogError>,
    delay: Option<Duration>,
}

impl InMemoryCatalog {
    #[must_use]
    pub fn new(rows: Vec<RawRow>) -> Self {
        Self { rows, failure: None, delay: None }
    }

    #[must_use]
    pub fn from_records(records: &[ProductRecord]) -> Self {
        Self::new(records.iter().map(ProductRecord::to_row).collect())
    }

    /// Every fetch fails with `failure`.
    #[must_use]
    pub fn with_failure(mut self, failure: CatalogError) -> Self {
        self.failure = Some(failure);
        self
    }

    /// Every fetch blocks for `delay` before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl CatalogSource for InMemoryCatalog {
    fn fetch(&self, request: &CatalogRequest<'_>) -> Result<Vec<RawRow>, CatalogError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        Ok(self
            .rows
            .iter()
            .filter(|row| match ProductRecord::try_from_row(row) {
                Ok(record) => request.plan.matches(&record),
                Err(_) => true,
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::memory::FilterCategory;
    use crate::vocabulary::ColorBucket;

    fn vocab() -> CanonicalVocabulary {
        match CanonicalVocabulary::builtin() {
            Ok(vocab) => vocab,
            Err(err) => panic!("builtin vocabulary must load: {err}"),
        }
    }

    fn today() -> MonthDay {
        match MonthDay::new(12, 20) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture date: {err}"),
        }
    }

    fn context<'a>(
        vocabulary: &'a CanonicalVocabulary,
        config: &'a EngineConfig,
        catalog: &'a dyn CatalogSource,
    ) -> TurnContext<'a> {
        TurnContext { vocabulary, config, catalog, today: today() }
    }

    fn flower(
        key: &str,
        name: &str,
        bucket: ColorBucket,
        price: f64,
        effort: &str,
    ) -> ProductRecord {
        let mut record = ProductRecord::new(key, name);
        record.color_flags.insert(bucket);
        record.variant_price = Some(price);
        record.effort_level = Some(effort.to_string());
        record
    }

    fn scenario_catalog() -> InMemoryCatalog {
        InMemoryCatalog::from_records(&[
            flower("M-1", "Red Rose Dozen", ColorBucket::Red, 59.0, "Ready To Go"),
            flower("M-2", "Crimson Centerpiece", ColorBucket::Red, 100.0, "ready to go"),
            flower("M-3", "Burgundy Bud Vases", ColorBucket::Red, 12.5, "Ready To Go"),
            flower("N-1", "Red Rose Kit", ColorBucket::Red, 80.0, "DIY In A Kit"),
            flower("N-2", "Grand Red Arch", ColorBucket::Red, 450.0, "Ready To Go"),
            flower("N-3", "Blue Hydrangea Box", ColorBucket::Blue, 40.0, "Ready To Go"),
            ProductRecord::new("N-4", "Unpriced Red"),
            flower("N-5", "Scratch Red Bulk", ColorBucket::Red, 30.0, "DIY From Scratch"),
        ])
    }

    fn scenario_deltas() -> Vec<Delta> {
        vec![
            Delta::add(FilterCategory::ColorsInclude, "red"),
            Delta::replace(FilterCategory::PriceMax, "100"),
            Delta::replace(FilterCategory::EffortLevel, "ready to go"),
        ]
    }

    #[test]
    fn scenario_turn_returns_exactly_the_matching_rows() {
        let (vocabulary, config, catalog) = (vocab(), EngineConfig::default(), scenario_catalog());
        let ctx = context(&vocabulary, &config, &catalog);
        let outcome = match process_turn(&ctx, &FilterMemory::with_seed(17), &scenario_deltas()) {
            Ok(outcome) => outcome,
            Err(err) => panic!("turn failed: {err}"),
        };
        let keys: BTreeSet<&str> =
            outcome.records.iter().map(|record| record.key.as_str()).collect();
        assert_eq!(keys, BTreeSet::from(["M-1", "M-2", "M-3"]));
        assert_eq!(outcome.candidate_count, 3);
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.memory.shown_product_keys.len(), 3);
        assert_eq!(outcome.plan.predicates.len(), 3);
    }

    #[test]
    fn failed_fetch_is_retryable_and_commits_nothing() {
        let (vocabulary, config) = (vocab(), EngineConfig::default());
        let reset = CatalogError::Unavailable("connection reset".to_string());
        let broken = scenario_catalog().with_failure(reset);
        let memory = FilterMemory::with_seed(17);
        let ctx = context(&vocabulary, &config, &broken);

        let err = process_turn(&ctx, &memory, &scenario_deltas());
        assert!(matches!(&err, Err(error) if error.is_retryable()));
        assert_eq!(memory, FilterMemory::with_seed(17));

        let healthy = scenario_catalog();
        let retry_ctx = TurnContext { catalog: &healthy, ..ctx };
        assert!(process_turn(&retry_ctx, &memory, &scenario_deltas()).is_ok());
    }

    #[test]
    fn backend_errors_are_not_retryable() {
        let (vocabulary, config) = (vocab(), EngineConfig::default());
        let missing = CatalogError::Backend("no such column".to_string());
        let broken = scenario_catalog().with_failure(missing);
        let ctx = context(&vocabulary, &config, &broken);
        let result = process_turn(&ctx, &FilterMemory::with_seed(1), &scenario_deltas());
        assert!(matches!(result, Err(KernelError::CatalogFetch { retryable: false, .. })));
    }

    #[test]
    fn slow_fetch_reports_timeout() {
        let vocabulary = vocab();
        let config = EngineConfig { fetch_timeout_ms: 1, ..EngineConfig::default() };
        let slow = scenario_catalog().with_delay(Duration::from_millis(25));
        let ctx = context(&vocabulary, &config, &slow);
        let result = process_turn(&ctx, &FilterMemory::with_seed(1), &scenario_deltas());
        assert!(matches!(
            result,
            Err(KernelError::CatalogFetch {
                source: CatalogError::TimedOut { .. },
                retryable: true
            })
        ));
    }

    #[test]
    fn unresolved_first_turn_refuses_to_query_everything() {
        let (vocabulary, config, catalog) = (vocab(), EngineConfig::default(), scenario_catalog());
        let ctx = context(&vocabulary, &config, &catalog);
        let plaid = Delta::add(FilterCategory::ColorsInclude, "plaid");
        let result = process_turn(&ctx, &FilterMemory::with_seed(1), &[plaid]);
        assert!(matches!(result, Err(KernelError::ConstraintResolution { .. })));
    }

    #[test]
    fn unresolved_delta_alongside_constraints_only_warns() {
        let (vocabulary, config, catalog) = (vocab(), EngineConfig::default(), scenario_catalog());
        let ctx = context(&vocabulary, &config, &catalog);
        let mut deltas = scenario_deltas();
        deltas.push(Delta::add(FilterCategory::Occasions, "bar mitzvah"));
        let outcome = match process_turn(&ctx, &FilterMemory::with_seed(1), &deltas) {
            Ok(outcome) => outcome,
            Err(err) => panic!("turn failed: {err}"),
        };
        assert_eq!(outcome.records.len(), 3);
        assert!(matches!(
            outcome.warnings.as_slice(),
            [TurnWarning::UnresolvedVocabulary { category: FilterCategory::Occasions, .. }]
        ));
    }

    #[test]
    fn around_budget_keeps_prices_within_twenty_dollars() {
        let (vocabulary, config, catalog) = (vocab(), EngineConfig::default(), scenario_catalog());
        let ctx = context(&vocabulary, &config, &catalog);
        let deltas = [
            Delta::add(FilterCategory::ColorsInclude, "red"),
            Delta::replace(FilterCategory::PriceMax, "around $75"),
        ];
        let outcome = match process_turn(&ctx, &FilterMemory::with_seed(9), &deltas) {
            Ok(outcome) => outcome,
            Err(err) => panic!("turn failed: {err}"),
        };
        let keys: BTreeSet<&str> =
            outcome.records.iter().map(|record| record.key.as_str()).collect();
        assert_eq!(keys, BTreeSet::from(["M-1", "N-1"]));
        assert_eq!(outcome.memory.price_around, Some(75.0));
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn follow_up_turns_page_through_unseen_products() {
        let vocabulary = vocab();
        let config = EngineConfig { sample_cap: 2, ..EngineConfig::default() };
        let catalog = scenario_catalog();
        let ctx = context(&vocabulary, &config, &catalog);

        let first = match process_turn(&ctx, &FilterMemory::with_seed(3), &scenario_deltas()) {
            Ok(outcome) => outcome,
            Err(err) => panic!("first turn failed: {err}"),
        };
        let second = match process_turn(&ctx, &first.memory, &[]) {
            Ok(outcome) => outcome,
            Err(err) => panic!("second turn failed: {err}"),
        };
        assert_eq!(first.records.len(), 2);
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.memory.sample_seed, first.memory.sample_seed);
        assert!(first.records.iter().all(|record| !second.records.contains(record)));
    }

    #[test]
    fn reset_session_forgets_constraints_and_history() {
        let (vocabulary, config, catalog) = (vocab(), EngineConfig::default(), scenario_catalog());
        let ctx = context(&vocabulary, &config, &catalog);
        let outcome = match process_turn(&ctx, &create_session(), &scenario_deltas()) {
            Ok(outcome) => outcome,
            Err(err) => panic!("turn failed: {err}"),
        };
        let fresh = reset_session(&outcome.memory);
        assert!(fresh.is_unconstrained());
        assert!(fresh.shown_product_keys.is_empty());
    }
}
