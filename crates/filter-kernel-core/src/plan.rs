use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::memory::{
    Delta, EffortSelector, FilterCategory, FilterMemory, SeasonConstraint, PRICE_AROUND_WINDOW,
};
use crate::record::{columns, ProductRecord};
use crate::season::{self, MonthDay};
use crate::vocabulary::{normalize, ColorBucket};

/// A single compiled filter condition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PredicateNode {
    AnyColor { buckets: BTreeSet<ColorBucket> },
    NoColor { buckets: BTreeSet<ColorBucket> },
    PriceAtLeast { amount: f64 },
    PriceAtMost { amount: f64 },
    PriceBetween { low: f64, high: f64 },
    /// The variant name mentions the count, e.g. "100 Stems".
    VariantMentions { count: u32 },
    Effort { selector: EffortSelector, negated: bool },
    AnyOccasion { labels: BTreeSet<String> },
    NoOccasion { labels: BTreeSet<String> },
    AnyFlowerType { labels: BTreeSet<String> },
    NoFlowerType { labels: BTreeSet<String> },
    AvailableOn { date: MonthDay, now: bool },
    YearRound,
    Seasonal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaggedPredicate {
    pub category: FilterCategory,
    pub node: PredicateNode,
}

/// Conjunction of predicates rebuilt from a [`FilterMemory`] on every turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QueryPlan {
    pub predicates: Vec<TaggedPredicate>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParamStyle {
    /// `?1, ?2, ...` as used by SQLite.
    #[default]
    Question,
    /// `$1, $2, ...` as used by PostgreSQL.
    Dollar,
}

/// Bound value of a rendered query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum QueryParam {
    Int(i64),
    Float(f64),
    Text(String),
}

/// Parameterized SQL ready for a catalog source. User text only ever appears in `params`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderedQuery {
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub style: ParamStyle,
}

/// Compile against today's UTC date.
#[must_use]
pub fn compile(memory: &FilterMemory) -> QueryPlan {
    compile_as_of(memory, MonthDay::from_date(time::OffsetDateTime::now_utc().date()))
}

/// One predicate per non-empty constraint, in a fixed category order.
#[must_use]
pub fn compile_as_of(memory: &FilterMemory, today: MonthDay) -> QueryPlan {
    let mut predicates = Vec::new();
    let mut push = |category, node| predicates.push(TaggedPredicate { category, node });

    if !memory.colors_include.is_empty() {
        let buckets = memory.colors_include.clone();
        push(FilterCategory::ColorsInclude, PredicateNode::AnyColor { buckets });
    }
    if !memory.colors_exclude.is_empty() {
        let buckets = memory.colors_exclude.clone();
        push(FilterCategory::ColorsExclude, PredicateNode::NoColor { buckets });
    }
    if let Some(amount) = memory.price_min {
        push(FilterCategory::PriceMin, PredicateNode::PriceAtLeast { amount });
    }
    if let Some(amount) = memory.price_max {
        push(FilterCategory::PriceMax, PredicateNode::PriceAtMost { amount });
    }
    if let Some(target) = memory.price_around {
        let low = (target - PRICE_AROUND_WINDOW).max(0.0);
        let high = target + PRICE_AROUND_WINDOW;
        push(FilterCategory::PriceAround, PredicateNode::PriceBetween { low, high });
    }
    if let Some(count) = memory.quantity {
        push(FilterCategory::Quantity, PredicateNode::VariantMentions { count });
    }
    if let Some(selector) = &memory.effort_level {
        let category = if memory.effort_negated {
            FilterCategory::EffortExcluded
        } else {
            FilterCategory::EffortLevel
        };
        let negated = memory.effort_negated;
        push(category, PredicateNode::Effort { selector: selector.clone(), negated });
    }
    if !memory.occasions.is_empty() {
        let labels = memory.occasions.iter().map(|label| normalize(label)).collect();
        push(FilterCategory::Occasions, PredicateNode::AnyOccasion { labels });
    }
    if !memory.occasions_excluded.is_empty() {
        let labels = memory.occasions_excluded.iter().map(|label| normalize(label)).collect();
        push(FilterCategory::OccasionsExcluded, PredicateNode::NoOccasion { labels });
    }
    if !memory.flower_types.is_empty() {
        let labels = memory.flower_types.iter().map(|label| normalize(label)).collect();
        push(FilterCategory::FlowerTypes, PredicateNode::AnyFlowerType { labels });
    }
    if !memory.flower_types_excluded.is_empty() {
        let labels = memory.flower_types_excluded.iter().map(|label| normalize(label)).collect();
        push(FilterCategory::FlowerTypesExcluded, PredicateNode::NoFlowerType { labels });
    }
    if let Some(constraint) = memory.season_constraint {
        let node = match constraint {
            SeasonConstraint::Now => PredicateNode::AvailableOn { date: today, now: true },
            SeasonConstraint::Explicit(date) => PredicateNode::AvailableOn { date, now: false },
            SeasonConstraint::YearRoundOnly => PredicateNode::YearRound,
            SeasonConstraint::SeasonalOnly => PredicateNode::Seasonal,
        };
        push(FilterCategory::Season, node);
    }

    QueryPlan { predicates }
}

/// Compile, refusing to return an unfiltered plan when the turn carried constraints that
/// could not be resolved.
///
/// # Errors
/// Returns [`KernelError::ConstraintResolution`] when the plan is empty while unresolved
/// deltas are pending, or while the memory still holds constraints.
pub fn compile_checked(
    memory: &FilterMemory,
    unresolved: &[Delta],
    today: MonthDay,
) -> Result<QueryPlan, KernelError> {
    let plan = compile_as_of(memory, today);
    if !plan.is_empty() {
        return Ok(plan);
    }
    if !unresolved.is_empty() {
        let values: Vec<&str> =
            unresolved.iter().filter_map(|delta| delta.raw_value.as_deref()).collect();
        return Err(KernelError::ConstraintResolution {
            message: format!("no usable constraint; unresolved values: {}", values.join(", ")),
            unresolved: unresolved.to_vec(),
        });
    }
    if !memory.is_unconstrained() {
        return Err(KernelError::ConstraintResolution {
            message: "memory holds constraints that compiled to no predicate".to_string(),
            unresolved: Vec::new(),
        });
    }
    Ok(plan)
}

impl QueryPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    #[must_use]
    pub fn categories(&self) -> Vec<FilterCategory> {
        self.predicates.iter().map(|predicate| predicate.category).collect()
    }

    /// A copy of the plan without the predicate for `category`.
    #[must_use]
    pub fn without(&self, category: FilterCategory) -> Self {
        Self {
            predicates: self
                .predicates
                .iter()
                .filter(|predicate| predicate.category != category)
                .cloned()
                .collect(),
        }
    }

    /// One human-readable line per predicate.
    #[must_use]
    pub fn explain(&self) -> Vec<String> {
        self.predicates
            .iter()
            .map(|predicate| format!("{}: {}", predicate.category, predicate.node))
            .collect()
    }

    /// Evaluate the plan against an already-coerced record.
    #[must_use]
    pub fn matches(&self, record: &ProductRecord) -> bool {
        self.predicates.iter().all(|predicate| predicate.node.matches(record))
    }

    /// Render to parameterized SQL against `view`.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when `view` is not a plain identifier.
    pub fn render(&self, view: &str, style: ParamStyle) -> Result<RenderedQuery, KernelError> {
        if !is_identifier(view) {
            return Err(KernelError::Validation(format!("invalid catalog view name `{view}`")));
        }
        let mut binder = Binder { style, params: Vec::new() };
        let clauses: Vec<String> =
            self.predicates.iter().map(|predicate| predicate.node.render(&mut binder)).collect();

        let mut sql = format!("SELECT {} FROM {view}", columns::select_list().join(", "));
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(columns::UNIQUE_ID);

        Ok(RenderedQuery { sql, params: binder.params, style })
    }
}

impl PredicateNode {
    #[must_use]
    pub fn matches(&self, record: &ProductRecord) -> bool {
        let price = record.variant_price;
        match self {
            Self::AnyColor { buckets } => {
                buckets.iter().any(|bucket| record.color_flags.contains(bucket))
            }
            Self::NoColor { buckets } => {
                buckets.iter().all(|bucket| !record.color_flags.contains(bucket))
            }
            Self::PriceAtLeast { amount } => price.is_some_and(|price| price >= *amount),
            Self::PriceAtMost { amount } => price.is_some_and(|price| price <= *amount),
            Self::PriceBetween { low, high } => {
                price.is_some_and(|price| price >= *low && price <= *high)
            }
            Self::VariantMentions { count } => record
                .variant_name
                .as_deref()
                .is_some_and(|name| name.contains(&count.to_string())),
            Self::Effort { selector, negated } => {
                let known =
                    record.effort_level.as_deref().map(normalize).filter(|level| !level.is_empty());
                match (selector, known) {
                    (EffortSelector::Unknown, known) => known.is_none() != *negated,
                    (EffortSelector::Level(_), None) => false,
                    (EffortSelector::Level(label), Some(level)) => {
                        (level == normalize(label)) != *negated
                    }
                }
            }
            Self::AnyOccasion { labels } => !record.occasion_labels().is_disjoint(labels),
            Self::NoOccasion { labels } => record.occasion_labels().is_disjoint(labels),
            Self::AnyFlowerType { labels } => {
                labels.iter().any(|label| mentions_flower(record, label))
            }
            Self::NoFlowerType { labels } => {
                !labels.iter().any(|label| mentions_flower(record, label))
            }
            Self::AvailableOn { date, .. } => {
                season::availability(&record.season_ranges, record.year_round(), *date).is_true()
            }
            Self::YearRound => record.year_round().is_true(),
            Self::Seasonal => record.year_round().is_false(),
        }
    }

    fn render(&self, binder: &mut Binder) -> String {
        let price = columns::VARIANT_PRICE;
        match self {
            Self::AnyColor { buckets } => {
                let terms: Vec<String> =
                    buckets.iter().map(|bucket| format!("{} = TRUE", bucket.column())).collect();
                format!("({})", terms.join(" OR "))
            }
            Self::NoColor { buckets } => {
                let terms: Vec<String> =
                    buckets.iter().map(|bucket| format!("{} = FALSE", bucket.column())).collect();
                format!("({})", terms.join(" AND "))
            }
            Self::PriceAtLeast { amount } => {
                format!("{price} >= {}", binder.bind(QueryParam::Float(*amount)))
            }
            Self::PriceAtMost { amount } => {
                format!("{price} <= {}", binder.bind(QueryParam::Float(*amount)))
            }
            Self::PriceBetween { low, high } => {
                let low = binder.bind(QueryParam::Float(*low));
                let high = binder.bind(QueryParam::Float(*high));
                format!("({price} >= {low} AND {price} <= {high})")
            }
            Self::VariantMentions { count } => {
                let pattern = binder.bind(QueryParam::Text(format!("%{count}%")));
                format!("COALESCE({}, '') LIKE {pattern}", columns::VARIANT_NAME)
            }
            Self::Effort { selector, negated } => render_effort(selector, *negated, binder),
            Self::AnyOccasion { labels } => {
                let terms: Vec<String> =
                    labels.iter().map(|label| render_occasion(label, binder)).collect();
                format!("({})", terms.join(" OR "))
            }
            Self::NoOccasion { labels } => {
                let terms: Vec<String> = labels
                    .iter()
                    .map(|label| format!("NOT {}", render_occasion(label, binder)))
                    .collect();
                format!("({})", terms.join(" AND "))
            }
            Self::AnyFlowerType { labels } => {
                let terms: Vec<String> =
                    labels.iter().map(|label| render_flower(label, binder)).collect();
                format!("({})", terms.join(" OR "))
            }
            Self::NoFlowerType { labels } => {
                let terms: Vec<String> = labels
                    .iter()
                    .map(|label| format!("NOT {}", render_flower(label, binder)))
                    .collect();
                format!("({})", terms.join(" AND "))
            }
            Self::AvailableOn { date, .. } => {
                let target = binder.bind(QueryParam::Int(i64::from(date.ordinal())));
                let mut terms = vec![year_round_sql()];
                terms.extend(columns::SEASON_RANGES.iter().map(|range| {
                    let start = format!("({} * 100 + {})", range.start_month, range.start_day);
                    let end = format!("({} * 100 + {})", range.end_month, range.end_day);
                    let inside = format!(
                        "({start} <= {end} AND {target} >= {start} AND {target} <= {end})"
                    );
                    let wrapped =
                        format!("({start} > {end} AND ({target} >= {start} OR {target} <= {end}))");
                    format!("({} AND ({inside} OR {wrapped}))", usable_sql(range))
                }));
                format!("({})", terms.join(" OR "))
            }
            Self::YearRound => year_round_sql(),
            Self::Seasonal => {
                let usable: Vec<String> = columns::SEASON_RANGES.iter().map(usable_sql).collect();
                format!(
                    "(NOT {} AND ({} IS NOT NULL OR {}))",
                    year_round_sql(),
                    columns::IS_YEAR_ROUND,
                    usable.join(" OR ")
                )
            }
        }
    }
}

impl Display for PredicateNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let buckets = |set: &BTreeSet<ColorBucket>| {
            set.iter().map(|bucket| bucket.as_str()).collect::<Vec<_>>().join(", ")
        };
        let labels = |set: &BTreeSet<String>| {
            set.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
        };
        match self {
            Self::AnyColor { buckets: set } => write!(f, "has any color of {}", buckets(set)),
            Self::NoColor { buckets: set } => write!(f, "has none of {}", buckets(set)),
            Self::PriceAtLeast { amount } => write!(f, "price >= {amount:.2}"),
            Self::PriceAtMost { amount } => write!(f, "price <= {amount:.2}"),
            Self::PriceBetween { low, high } => {
                write!(f, "price between {low:.2} and {high:.2}")
            }
            Self::VariantMentions { count } => write!(f, "variant mentions {count}"),
            Self::Effort { selector: EffortSelector::Unknown, negated: false } => {
                f.write_str("effort level is unknown")
            }
            Self::Effort { selector: EffortSelector::Unknown, negated: true } => {
                f.write_str("effort level is known")
            }
            Self::Effort { selector, negated } => {
                write!(f, "effort level {} {selector}", if *negated { "is not" } else { "is" })
            }
            Self::AnyOccasion { labels: set } => write!(f, "tagged for any of {}", labels(set)),
            Self::NoOccasion { labels: set } => write!(f, "tagged for none of {}", labels(set)),
            Self::AnyFlowerType { labels: set } => write!(f, "contains any of {}", labels(set)),
            Self::NoFlowerType { labels: set } => write!(f, "contains none of {}", labels(set)),
            Self::AvailableOn { date, now: true } => write!(f, "available now ({date})"),
            Self::AvailableOn { date, now: false } => write!(f, "available on {date}"),
            Self::YearRound => f.write_str("available year-round"),
            Self::Seasonal => f.write_str("seasonal only"),
        }
    }
}

struct Binder {
    style: ParamStyle,
    params: Vec<QueryParam>,
}

impl Binder {
    fn bind(&mut self, param: QueryParam) -> String {
        self.params.push(param);
        let index = self.params.len();
        match self.style {
            ParamStyle::Question => format!("?{index}"),
            ParamStyle::Dollar => format!("${index}"),
        }
    }
}

fn render_effort(selector: &EffortSelector, negated: bool, binder: &mut Binder) -> String {
    let column = columns::DIY_LEVEL;
    let unknown = format!("({column} IS NULL OR TRIM({column}) = '')");
    let known = format!("({column} IS NOT NULL AND TRIM({column}) <> '')");
    match (selector, negated) {
        (EffortSelector::Unknown, false) => unknown,
        (EffortSelector::Unknown, true) => known,
        (EffortSelector::Level(label), false) => {
            format!("LOWER(TRIM({column})) = {}", binder.bind(QueryParam::Text(normalize(label))))
        }
        (EffortSelector::Level(label), true) => format!(
            "({known} AND LOWER(TRIM({column})) <> {})",
            binder.bind(QueryParam::Text(normalize(label)))
        ),
    }
}

/// Matches one label against the delimiter-joined occasion field, stored as `a; b`.
fn render_occasion(label: &str, binder: &mut Binder) -> String {
    let placeholder = binder.bind(QueryParam::Text(format!("%;{};%", escape_like(label))));
    format!("{} LIKE {placeholder} ESCAPE '\\'", occasion_field_sql())
}

fn occasion_field_sql() -> String {
    let field = format!("LOWER(TRIM(COALESCE({}, '')))", columns::HOLIDAY_OCCASION);
    let commas = format!("REPLACE({field}, ',', ';')");
    let spaced = format!("REPLACE(REPLACE({commas}, '; ', ';'), ' ;', ';')");
    format!("(';' || {spaced} || ';')")
}

fn render_flower(label: &str, binder: &mut Binder) -> String {
    let placeholder = binder.bind(QueryParam::Text(format!("%{}%", escape_like(label))));
    let searched = [
        columns::PRODUCT_TYPE,
        columns::PRODUCT_NAME,
        columns::GROUP_CATEGORY,
        columns::RECIPE,
    ];
    let terms: Vec<String> = searched
        .iter()
        .map(|column| format!("LOWER(COALESCE({column}, '')) LIKE {placeholder} ESCAPE '\\'"))
        .collect();
    format!("({})", terms.join(" OR "))
}

fn usable_sql(range: &columns::SeasonColumns) -> String {
    format!(
        "({} IS NOT NULL AND {} IS NOT NULL AND {} IS NOT NULL AND {} IS NOT NULL)",
        range.start_month, range.start_day, range.end_month, range.end_day
    )
}

fn year_round_sql() -> String {
    let mut terms = vec![format!("COALESCE({}, FALSE) = TRUE", columns::IS_YEAR_ROUND)];
    terms.extend(columns::SEASON_RANGES.iter().map(|range| {
        format!(
            "({} AND {} = 1 AND {} = 1 AND {} = 12 AND {} = 31)",
            usable_sql(range),
            range.start_month,
            range.start_day,
            range.end_month,
            range.end_day
        )
    }));
    format!("({})", terms.join(" OR "))
}

fn mentions_flower(record: &ProductRecord, label: &str) -> bool {
    [
        record.product_type.as_deref(),
        Some(record.product_name.as_str()),
        record.group_category.as_deref(),
        record.recipe.as_deref(),
    ]
    .into_iter()
    .flatten()
    .any(|field| field.to_lowercase().contains(label))
}

/// Escape `\`, `%` and `_` for a `LIKE ... ESCAPE '\'` pattern.
#[must_use]
pub fn escape_like(text: &str) -> String {
    text.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn is_identifier(name: &str) -> bool {
    let mut parts = name.split('.');
    let valid = |part: &str| {
        let mut chars = part.chars();
        chars.next().is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let count = name.split('.').count();
    (1..=2).contains(&count) && parts.all(valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::season::{SeasonRange, TriState};

    fn md(month: u8, day: u8) -> MonthDay {
        match MonthDay::new(month, day) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture date: {err}"),
        }
    }

    fn scenario_memory() -> FilterMemory {
        let mut memory = FilterMemory::with_seed(1);
        memory.colors_include.insert(ColorBucket::Red);
        memory.price_max = Some(100.0);
        memory.effort_level = Some(EffortSelector::Level("ready to go".to_string()));
        memory
    }

    fn product(key: &str, name: &str) -> ProductRecord {
        ProductRecord::new(key, name)
    }

    #[test]
    fn scenario_compiles_to_color_price_and_effort() {
        let plan = compile_as_of(&scenario_memory(), md(6, 1));
        assert_eq!(
            plan.categories(),
            vec![
                FilterCategory::ColorsInclude,
                FilterCategory::PriceMax,
                FilterCategory::EffortLevel
            ]
        );
        assert_eq!(
            plan.explain(),
            vec![
                "colors_include: has any color of red".to_string(),
                "price_max: price <= 100.00".to_string(),
                "effort_level: effort level is ready to go".to_string(),
            ]
        );

        let rendered = match plan.render("flowers", ParamStyle::Question) {
            Ok(rendered) => rendered,
            Err(err) => panic!("render failed: {err}"),
        };
        assert!(rendered
            .sql
            .contains("FROM flowers WHERE (has_red = TRUE) AND variant_price <= ?1"));
        assert!(rendered.sql.contains("LOWER(TRIM(diy_level)) = ?2"));
        assert!(rendered.sql.ends_with("ORDER BY unique_id"));
        assert_eq!(
            rendered.params,
            vec![QueryParam::Float(100.0), QueryParam::Text("ready to go".to_string())]
        );
    }

    #[test]
    fn empty_memory_compiles_to_unfiltered_query() {
        let plan = compile_as_of(&FilterMemory::with_seed(1), md(1, 1));
        assert!(plan.is_empty());
        let rendered = plan.render("flowers", ParamStyle::Dollar);
        assert!(matches!(
            rendered,
            Ok(query) if !query.sql.contains("WHERE") && query.params.is_empty()
        ));
    }

    #[test]
    fn empty_plan_with_unresolved_delta_is_an_error() {
        let unresolved = vec![Delta::add(FilterCategory::ColorsInclude, "plaid")];
        let result = compile_checked(&FilterMemory::with_seed(1), &unresolved, md(1, 1));
        assert!(matches!(
            result,
            Err(KernelError::ConstraintResolution { unresolved: pending, .. }) if pending.len() == 1
        ));

        let ok = compile_checked(&scenario_memory(), &unresolved, md(1, 1));
        assert!(ok.is_ok());
    }

    #[test]
    fn dollar_style_numbers_placeholders() {
        let mut memory = scenario_memory();
        memory.price_min = Some(20.0);
        let plan = compile_as_of(&memory, md(1, 1));
        let rendered = match plan.render("catalog.flowers", ParamStyle::Dollar) {
            Ok(rendered) => rendered,
            Err(err) => panic!("render failed: {err}"),
        };
        assert!(rendered.sql.contains("variant_price >= $1"));
        assert!(rendered.sql.contains("variant_price <= $2"));
        assert!(rendered.sql.contains("= $3"));
        assert!(!rendered.sql.contains('?'));
    }

    #[test]
    fn hostile_values_only_reach_bound_parameters() {
        let hostile = "rose'); DROP TABLE flowers; --";
        let mut memory = FilterMemory::with_seed(1);
        memory.flower_types.insert(hostile.to_string());
        memory.occasions.insert("wedding' OR '1'='1".to_string());
        memory.effort_level = Some(EffortSelector::Level("x' OR 1=1 --".to_string()));

        let plan = compile_as_of(&memory, md(1, 1));
        let rendered = match plan.render("flowers", ParamStyle::Question) {
            Ok(rendered) => rendered,
            Err(err) => panic!("render failed: {err}"),
        };
        assert!(!rendered.sql.contains("DROP"));
        assert!(!rendered.sql.contains("1=1"));
        assert!(!rendered.sql.contains("'1'"));
        assert!(rendered
            .params
            .iter()
            .any(|param| matches!(param, QueryParam::Text(text) if text.contains("drop table"))));
    }

    #[test]
    fn view_name_must_be_an_identifier() {
        let plan = compile_as_of(&scenario_memory(), md(1, 1));
        for view in ["flowers; DROP TABLE x", "", "1flowers", "a.b.c", "flow ers"] {
            let rendered = plan.render(view, ParamStyle::Question);
            assert!(matches!(rendered, Err(KernelError::Validation(_))), "{view}");
        }
        assert!(plan.render("public.flowers_v2", ParamStyle::Question).is_ok());
    }

    #[test]
    fn like_escaping_neutralizes_wildcards() {
        assert_eq!(escape_like("100%_a\\b"), "100\\%\\_a\\\\b");
    }

    #[test]
    fn without_removes_only_the_tagged_predicate() {
        let plan = compile_as_of(&scenario_memory(), md(1, 1));
        let trimmed = plan.without(FilterCategory::PriceMax);
        assert_eq!(
            trimmed.categories(),
            vec![FilterCategory::ColorsInclude, FilterCategory::EffortLevel]
        );
        assert_eq!(plan.predicates.len(), 3);
    }

    #[test]
    fn scenario_plan_matches_only_qualifying_records() {
        let plan = compile_as_of(&scenario_memory(), md(1, 1));
        let mut hit = product("A", "Red Roses");
        hit.color_flags.insert(ColorBucket::Red);
        hit.variant_price = Some(100.0);
        hit.effort_level = Some("Ready To Go".to_string());
        assert!(plan.matches(&hit));

        let mut expensive = hit.clone();
        expensive.variant_price = Some(100.01);
        assert!(!plan.matches(&expensive));

        let mut unpriced = hit.clone();
        unpriced.variant_price = None;
        assert!(!plan.matches(&unpriced));

        let mut unknown_effort = hit.clone();
        unknown_effort.effort_level = None;
        assert!(!plan.matches(&unknown_effort));

        let mut blue = hit;
        blue.color_flags = BTreeSet::from([ColorBucket::Blue]);
        assert!(!plan.matches(&blue));
    }

    #[test]
    fn unknown_effort_matches_neither_polarity_unless_requested() {
        let level = EffortSelector::Level("DIY In A Kit".to_string());
        let unknown = product("U", "Mystery");
        let mut kit = product("K", "Kit");
        kit.effort_level = Some("diy in a kit".to_string());

        let positive = PredicateNode::Effort { selector: level.clone(), negated: false };
        let negative = PredicateNode::Effort { selector: level, negated: true };
        assert!(!positive.matches(&unknown));
        assert!(!negative.matches(&unknown));
        assert!(positive.matches(&kit));
        assert!(!negative.matches(&kit));

        let only_unknown =
            PredicateNode::Effort { selector: EffortSelector::Unknown, negated: false };
        assert!(only_unknown.matches(&unknown));
        assert!(!only_unknown.matches(&kit));
    }

    #[test]
    fn occasions_match_by_token_not_whole_field() {
        let mut record = product("O", "Celebration Box");
        record.occasions_raw = Some("Wedding; Valentine's Day; Anniversary".to_string());
        let wanted = |labels: &[&str]| PredicateNode::AnyOccasion {
            labels: labels.iter().map(|label| (*label).to_string()).collect(),
        };
        assert!(wanted(&["anniversary"]).matches(&record));
        assert!(wanted(&["birthday", "valentine's day"]).matches(&record));
        assert!(!wanted(&["day"]).matches(&record));
        assert!(!wanted(&["birthday"]).matches(&record));
    }

    #[test]
    fn flower_types_search_type_name_and_group() {
        let mut record = product("F", "Blush Garden Bundle");
        record.product_type = Some("Garden Roses, Ranunculus".to_string());
        let any = PredicateNode::AnyFlowerType { labels: BTreeSet::from(["rose".to_string()]) };
        let none = PredicateNode::NoFlowerType { labels: BTreeSet::from(["rose".to_string()]) };
        assert!(any.matches(&record));
        assert!(!none.matches(&record));
        assert!(none.matches(&product("G", "Tulip Box")));
    }

    #[test]
    fn season_filters_exclude_unknown_availability() {
        let mut winter = product("W", "Winter Greens");
        winter.season_ranges[0] = SeasonRange::new(md(11, 1), md(2, 28));
        winter.is_year_round = TriState::False;
        let mut always = product("Y", "Everyday Roses");
        always.is_year_round = TriState::True;
        let mut full_range = product("R", "Range Roses");
        full_range.season_ranges[2] = SeasonRange::new(md(1, 1), md(12, 31));
        let unknown = product("N", "No Data");

        let on = |date| PredicateNode::AvailableOn { date, now: false };
        assert!(on(md(12, 25)).matches(&winter));
        assert!(!on(md(6, 1)).matches(&winter));
        assert!(on(md(6, 1)).matches(&always));
        assert!(on(md(6, 1)).matches(&full_range));
        assert!(!on(md(6, 1)).matches(&unknown));

        assert!(PredicateNode::YearRound.matches(&always));
        assert!(PredicateNode::YearRound.matches(&full_range));
        assert!(!PredicateNode::YearRound.matches(&winter));
        assert!(!PredicateNode::YearRound.matches(&unknown));
        assert!(PredicateNode::Seasonal.matches(&winter));
        assert!(!PredicateNode::Seasonal.matches(&always));
        assert!(!PredicateNode::Seasonal.matches(&unknown));
    }

    #[test]
    fn now_resolves_against_the_supplied_date() {
        let mut memory = FilterMemory::with_seed(1);
        memory.season_constraint = Some(SeasonConstraint::Now);
        let plan = compile_as_of(&memory, md(12, 25));
        assert_eq!(
            plan.predicates[0].node,
            PredicateNode::AvailableOn { date: md(12, 25), now: true }
        );
        let rendered = match plan.render("flowers", ParamStyle::Question) {
            Ok(rendered) => rendered,
            Err(err) => panic!("render failed: {err}"),
        };
        assert_eq!(rendered.params, vec![QueryParam::Int(1225)]);
        assert_eq!(rendered.sql.matches("?1").count(), 12);
    }

    #[test]
    fn deserialized_memory_with_stray_effort_polarity_is_refused() {
        let mut stored = match serde_json::to_value(FilterMemory::with_seed(7)) {
            Ok(value) => value,
            Err(err) => panic!("memory should serialize: {err}"),
        };
        stored["effort_negated"] = serde_json::Value::Bool(true);
        let memory: FilterMemory = match serde_json::from_value(stored) {
            Ok(memory) => memory,
            Err(err) => panic!("memory should deserialize: {err}"),
        };
        assert!(compile_as_of(&memory, md(1, 1)).is_empty());
        assert!(!memory.is_unconstrained());

        let result = compile_checked(&memory, &[], md(1, 1));
        assert!(matches!(
            result,
            Err(KernelError::ConstraintResolution { unresolved, .. }) if unresolved.is_empty()
        ));
    }

    #[test]
    fn around_price_is_a_clamped_inclusive_window() {
        let mut memory = FilterMemory::with_seed(1);
        memory.price_around = Some(75.0);
        let plan = compile_as_of(&memory, md(1, 1));
        assert_eq!(
            plan.predicates[0].node,
            PredicateNode::PriceBetween { low: 55.0, high: 95.0 }
        );
        assert_eq!(plan.explain(), vec!["price_around: price between 55.00 and 95.00"]);

        let priced = |amount| {
            let mut record = product("P", "Peonies");
            record.variant_price = amount;
            record
        };
        assert!(plan.matches(&priced(Some(55.0))));
        assert!(plan.matches(&priced(Some(95.0))));
        assert!(!plan.matches(&priced(Some(95.01))));
        assert!(!plan.matches(&priced(None)));

        memory.price_around = Some(10.0);
        let cheap = compile_as_of(&memory, md(1, 1));
        assert_eq!(cheap.predicates[0].node, PredicateNode::PriceBetween { low: 0.0, high: 30.0 });

        let rendered = match cheap.render("flowers", ParamStyle::Question) {
            Ok(rendered) => rendered,
            Err(err) => panic!("render failed: {err}"),
        };
        assert!(rendered.sql.contains("(variant_price >= ?1 AND variant_price <= ?2)"));
        assert_eq!(rendered.params, vec![QueryParam::Float(0.0), QueryParam::Float(30.0)]);
    }

    #[test]
    fn quantity_matches_the_variant_name() {
        let node = PredicateNode::VariantMentions { count: 100 };
        let mut hundred = product("Q", "Bulk Roses");
        hundred.variant_name = Some("100 Stems".to_string());
        let mut fifty = hundred.clone();
        fifty.variant_name = Some("50 Stems".to_string());
        assert!(node.matches(&hundred));
        assert!(!node.matches(&fifty));
        assert!(!node.matches(&product("N", "No Variant")));

        let mut memory = FilterMemory::with_seed(1);
        memory.quantity = Some(100);
        let plan = compile_as_of(&memory, md(1, 1));
        let rendered = match plan.render("flowers", ParamStyle::Question) {
            Ok(rendered) => rendered,
            Err(err) => panic!("render failed: {err}"),
        };
        assert!(rendered.sql.contains("COALESCE(variant_name, '') LIKE ?1"));
        assert_eq!(rendered.params, vec![QueryParam::Text("%100%".to_string())]);
    }

    #[test]
    fn excluded_occasions_pass_untagged_records() {
        let node = PredicateNode::NoOccasion { labels: BTreeSet::from(["sympathy".to_string()]) };
        let mut funeral = product("S", "Lilies");
        funeral.occasions_raw = Some("Sympathy, Funeral".to_string());
        let mut party = product("B", "Balloons Bouquet");
        party.occasions_raw = Some("Birthday".to_string());
        assert!(!node.matches(&funeral));
        assert!(node.matches(&party));
        assert!(node.matches(&product("U", "Untagged")));
        assert_eq!(node.to_string(), "tagged for none of sympathy");
    }

    #[test]
    fn flower_types_also_search_the_recipe() {
        let mut record = product("R", "Garden Party Box");
        record.recipe = Some("3 Ranunculus, 5 Garden Roses".to_string());
        let labels = BTreeSet::from(["ranunculus".to_string()]);
        let node = PredicateNode::AnyFlowerType { labels };
        assert!(node.matches(&record));

        let mut memory = FilterMemory::with_seed(1);
        memory.flower_types.insert("ranunculus".to_string());
        let plan = compile_as_of(&memory, md(1, 1));
        let rendered = match plan.render("flowers", ParamStyle::Question) {
            Ok(rendered) => rendered,
            Err(err) => panic!("render failed: {err}"),
        };
        assert!(rendered.sql.contains("LOWER(COALESCE(recipe_metafield, '')) LIKE ?1"));
    }
}
