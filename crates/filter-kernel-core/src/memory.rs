use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TurnWarning;
use crate::season::MonthDay;
use crate::vocabulary::{CanonicalValue, CanonicalVocabulary, ColorBucket};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeltaAction {
    Add,
    Remove,
    Replace,
    Clear,
}

impl DeltaAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Replace => "replace",
            Self::Clear => "clear",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "add" => Some(Self::Add),
            "remove" => Some(Self::Remove),
            "replace" => Some(Self::Replace),
            "clear" => Some(Self::Clear),
            _ => None,
        }
    }

    /// Application phase within one call: removals and clears, then replaces, then adds.
    fn phase(self) -> u8 {
        match self {
            Self::Remove | Self::Clear => 0,
            Self::Replace => 1,
            Self::Add => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FilterCategory {
    ColorsInclude,
    ColorsExclude,
    PriceMin,
    PriceMax,
    /// Target price with a fixed window on both sides.
    PriceAround,
    /// Stem or unit count matched against the variant name.
    Quantity,
    EffortLevel,
    EffortExcluded,
    Occasions,
    OccasionsExcluded,
    FlowerTypes,
    FlowerTypesExcluded,
    Season,
}

impl FilterCategory {
    pub const ALL: [Self; 13] = [
        Self::ColorsInclude,
        Self::ColorsExclude,
        Self::PriceMin,
        Self::PriceMax,
        Self::PriceAround,
        Self::Quantity,
        Self::EffortLevel,
        Self::EffortExcluded,
        Self::Occasions,
        Self::OccasionsExcluded,
        Self::FlowerTypes,
        Self::FlowerTypesExcluded,
        Self::Season,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ColorsInclude => "colors_include",
            Self::ColorsExclude => "colors_exclude",
            Self::PriceMin => "price_min",
            Self::PriceMax => "price_max",
            Self::PriceAround => "price_around",
            Self::Quantity => "quantity",
            Self::EffortLevel => "effort_level",
            Self::EffortExcluded => "effort_excluded",
            Self::Occasions => "occasions",
            Self::OccasionsExcluded => "occasions_excluded",
            Self::FlowerTypes => "flower_types",
            Self::FlowerTypesExcluded => "flower_types_excluded",
            Self::Season => "season",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|category| category.as_str() == value)
    }

    /// Singleton categories take `replace`; set categories take `add` and `remove`.
    #[must_use]
    pub fn is_singleton(self) -> bool {
        matches!(
            self,
            Self::PriceMin
                | Self::PriceMax
                | Self::PriceAround
                | Self::Quantity
                | Self::EffortLevel
                | Self::EffortExcluded
                | Self::Season
        )
    }
}

impl Display for FilterCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured instruction produced by the intent parser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delta {
    pub action: DeltaAction,
    #[serde(default)]
    pub category: Option<FilterCategory>,
    #[serde(default)]
    pub raw_value: Option<String>,
}

impl Delta {
    #[must_use]
    pub fn add(category: FilterCategory, raw_value: &str) -> Self {
        Self::with_value(DeltaAction::Add, category, raw_value)
    }

    #[must_use]
    pub fn remove(category: FilterCategory, raw_value: &str) -> Self {
        Self::with_value(DeltaAction::Remove, category, raw_value)
    }

    /// Remove without a value: unsets a singleton or empties a set category.
    #[must_use]
    pub fn remove_all(category: FilterCategory) -> Self {
        Self { action: DeltaAction::Remove, category: Some(category), raw_value: None }
    }

    #[must_use]
    pub fn replace(category: FilterCategory, raw_value: &str) -> Self {
        Self::with_value(DeltaAction::Replace, category, raw_value)
    }

    #[must_use]
    pub fn clear() -> Self {
        Self { action: DeltaAction::Clear, category: None, raw_value: None }
    }

    fn with_value(action: DeltaAction, category: FilterCategory, raw_value: &str) -> Self {
        Self { action, category: Some(category), raw_value: Some(raw_value.to_string()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "kind", content = "label", rename_all = "snake_case")]
pub enum EffortSelector {
    Level(String),
    /// Matches only rows whose effort level is missing.
    Unknown,
}

impl Display for EffortSelector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Level(label) => f.write_str(label),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "kind", content = "date", rename_all = "snake_case")]
pub enum SeasonConstraint {
    Now,
    Explicit(MonthDay),
    YearRoundOnly,
    SeasonalOnly,
}

impl Display for SeasonConstraint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Now => f.write_str("available now"),
            Self::Explicit(date) => write!(f, "available on {date}"),
            Self::YearRoundOnly => f.write_str("year-round only"),
            Self::SeasonalOnly => f.write_str("seasonal only"),
        }
    }
}

/// Accumulated constraints of one conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FilterMemory {
    pub colors_include: BTreeSet<ColorBucket>,
    pub colors_exclude: BTreeSet<ColorBucket>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    /// Center of a `PRICE_AROUND_WINDOW` band on both sides.
    #[serde(default)]
    pub price_around: Option<f64>,
    #[serde(default)]
    pub quantity: Option<u32>,
    pub effort_level: Option<EffortSelector>,
    pub effort_negated: bool,
    pub occasions: BTreeSet<String>,
    #[serde(default)]
    pub occasions_excluded: BTreeSet<String>,
    pub flower_types: BTreeSet<String>,
    pub flower_types_excluded: BTreeSet<String>,
    pub season_constraint: Option<SeasonConstraint>,
    pub shown_product_keys: BTreeSet<String>,
    /// Normalized display names already surfaced, so sibling variant rows stay hidden.
    #[serde(default)]
    pub shown_group_keys: BTreeSet<String>,
    pub sample_seed: u64,
}

/// Half-width of the band a `price_around` target expands to.
pub const PRICE_AROUND_WINDOW: f64 = 20.0;

/// Borrowed view of every field that counts as a constraint.
#[derive(Debug, Serialize, PartialEq)]
pub struct ConstraintView<'a> {
    pub colors_include: &'a BTreeSet<ColorBucket>,
    pub colors_exclude: &'a BTreeSet<ColorBucket>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub price_around: Option<f64>,
    pub quantity: Option<u32>,
    pub effort_level: Option<&'a EffortSelector>,
    pub effort_negated: bool,
    pub occasions: &'a BTreeSet<String>,
    pub occasions_excluded: &'a BTreeSet<String>,
    pub flower_types: &'a BTreeSet<String>,
    pub flower_types_excluded: &'a BTreeSet<String>,
    pub season_constraint: Option<SeasonConstraint>,
}

impl FilterMemory {
    /// Empty memory with a fresh random seed.
    #[must_use]
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    #[must_use]
    pub fn with_seed(sample_seed: u64) -> Self {
        Self { sample_seed, ..Self::default() }
    }

    #[must_use]
    pub fn constraints(&self) -> ConstraintView<'_> {
        ConstraintView {
            colors_include: &self.colors_include,
            colors_exclude: &self.colors_exclude,
            price_min: self.price_min,
            price_max: self.price_max,
            price_around: self.price_around,
            quantity: self.quantity,
            effort_level: self.effort_level.as_ref(),
            effort_negated: self.effort_negated,
            occasions: &self.occasions,
            occasions_excluded: &self.occasions_excluded,
            flower_types: &self.flower_types,
            flower_types_excluded: &self.flower_types_excluded,
            season_constraint: self.season_constraint,
        }
    }

    /// True when no constraint is set. Shown keys and the seed are not constraints.
    #[must_use]
    pub fn is_unconstrained(&self) -> bool {
        self.constraints() == Self::default().constraints()
    }

    fn clear_category(&mut self, category: FilterCategory) {
        match category {
            FilterCategory::ColorsInclude => self.colors_include.clear(),
            FilterCategory::ColorsExclude => self.colors_exclude.clear(),
            FilterCategory::PriceMin => self.price_min = None,
            FilterCategory::PriceMax => self.price_max = None,
            FilterCategory::PriceAround => self.price_around = None,
            FilterCategory::Quantity => self.quantity = None,
            FilterCategory::EffortLevel | FilterCategory::EffortExcluded => {
                let negated = category == FilterCategory::EffortExcluded;
                if self.effort_negated == negated {
                    self.effort_level = None;
                    self.effort_negated = false;
                }
            }
            FilterCategory::Occasions => self.occasions.clear(),
            FilterCategory::OccasionsExcluded => self.occasions_excluded.clear(),
            FilterCategory::FlowerTypes => self.flower_types.clear(),
            FilterCategory::FlowerTypesExcluded => self.flower_types_excluded.clear(),
            FilterCategory::Season => self.season_constraint = None,
        }
    }
}

/// Result of applying one turn's deltas.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub memory: FilterMemory,
    pub warnings: Vec<TurnWarning>,
    /// Deltas dropped because their text matched no canonical value.
    pub unresolved: Vec<Delta>,
}

/// Apply `deltas` to `memory` without side effects.
///
/// Deltas run in phases (remove and clear, then replace, then add), preserving input
/// order inside a phase. Deltas that cannot be resolved or do not fit their category are
/// dropped with a warning. The seed is re-derived only when the constraints changed.
#[must_use]
pub fn apply(
    memory: &FilterMemory,
    deltas: &[Delta],
    vocabulary: &CanonicalVocabulary,
) -> Transition {
    let mut ordered: Vec<&Delta> = deltas.iter().collect();
    ordered.sort_by_key(|delta| delta.action.phase());

    let mut next = memory.clone();
    let mut warnings = Vec::new();
    let mut unresolved = Vec::new();

    for delta in ordered {
        if let Err(outcome) = apply_one(&mut next, delta, vocabulary) {
            match outcome {
                Dropped::Unresolved(warning) => {
                    unresolved.push(delta.clone());
                    warnings.push(warning);
                }
                Dropped::Rejected(warning) => warnings.push(warning),
            }
        }
    }

    for warning in &warnings {
        tracing::warn!(kind = warning.as_str(), ?warning, "dropped filter delta");
    }

    if next.constraints() != memory.constraints() {
        next.sample_seed = derive_seed(memory.sample_seed, &next.constraints());
        tracing::debug!(seed = next.sample_seed, "constraints changed; sample seed re-derived");
    }

    Transition { memory: next, warnings, unresolved }
}

enum Dropped {
    Unresolved(TurnWarning),
    Rejected(TurnWarning),
}

fn apply_one(
    memory: &mut FilterMemory,
    delta: &Delta,
    vocabulary: &CanonicalVocabulary,
) -> Result<(), Dropped> {
    if delta.action == DeltaAction::Clear {
        *memory = FilterMemory::with_seed(memory.sample_seed);
        return Ok(());
    }

    let unsupported = || {
        Dropped::Rejected(TurnWarning::UnsupportedAction {
            action: delta.action,
            category: delta.category,
        })
    };
    let Some(category) = delta.category else {
        return Err(unsupported());
    };
    let fits = match delta.action {
        DeltaAction::Replace => category.is_singleton(),
        DeltaAction::Add => !category.is_singleton(),
        DeltaAction::Remove | DeltaAction::Clear => true,
    };
    if !fits {
        return Err(unsupported());
    }

    let Some(raw_value) = delta.raw_value.as_deref() else {
        if delta.action == DeltaAction::Remove {
            memory.clear_category(category);
            return Ok(());
        }
        return Err(Dropped::Rejected(TurnWarning::InvalidValue {
            category,
            raw_value: None,
            reason: "missing value".to_string(),
        }));
    };

    if delta.action == DeltaAction::Remove && category.is_singleton() {
        memory.clear_category(category);
        return Ok(());
    }

    let Some(value) = vocabulary.resolve(category, raw_value) else {
        return Err(Dropped::Unresolved(TurnWarning::UnresolvedVocabulary {
            category,
            raw_value: raw_value.to_string(),
        }));
    };

    let invalid = |reason: &str| {
        Dropped::Rejected(TurnWarning::InvalidValue {
            category,
            raw_value: Some(raw_value.to_string()),
            reason: reason.to_string(),
        })
    };
    let adding = delta.action == DeltaAction::Add;

    match (category, value) {
        (FilterCategory::ColorsInclude, CanonicalValue::Colors(buckets)) => {
            for bucket in buckets {
                if adding {
                    memory.colors_exclude.remove(&bucket);
                    memory.colors_include.insert(bucket);
                } else {
                    memory.colors_include.remove(&bucket);
                }
            }
        }
        (FilterCategory::ColorsExclude, CanonicalValue::Colors(buckets)) => {
            for bucket in buckets {
                if adding {
                    memory.colors_include.remove(&bucket);
                    memory.colors_exclude.insert(bucket);
                } else {
                    memory.colors_exclude.remove(&bucket);
                }
            }
        }
        (FilterCategory::PriceMin, CanonicalValue::Price(value)) => {
            if memory.price_max.is_some_and(|max| value > max) {
                return Err(invalid("price_min would exceed price_max"));
            }
            memory.price_min = Some(value);
            memory.price_around = None;
        }
        (FilterCategory::PriceMax, CanonicalValue::Price(value)) => {
            if memory.price_min.is_some_and(|min| value < min) {
                return Err(invalid("price_max would fall below price_min"));
            }
            memory.price_max = Some(value);
            memory.price_around = None;
        }
        (
            FilterCategory::PriceMin | FilterCategory::PriceMax | FilterCategory::PriceAround,
            CanonicalValue::PriceAround(value),
        )
        | (FilterCategory::PriceAround, CanonicalValue::Price(value)) => {
            memory.price_around = Some(value);
            memory.price_min = None;
            memory.price_max = None;
        }
        (FilterCategory::Quantity, CanonicalValue::Quantity(count)) => {
            memory.quantity = Some(count);
        }
        (FilterCategory::EffortLevel, CanonicalValue::Effort(selector)) => {
            memory.effort_level = Some(selector);
            memory.effort_negated = false;
        }
        (FilterCategory::EffortExcluded, CanonicalValue::Effort(selector)) => {
            memory.effort_level = Some(selector);
            memory.effort_negated = true;
        }
        (FilterCategory::Occasions, CanonicalValue::Occasion(label)) => {
            if adding {
                memory.occasions_excluded.remove(&label);
            }
            update_set(&mut memory.occasions, label, adding);
        }
        (FilterCategory::OccasionsExcluded, CanonicalValue::Occasion(label)) => {
            if adding {
                memory.occasions.remove(&label);
            }
            update_set(&mut memory.occasions_excluded, label, adding);
        }
        (FilterCategory::FlowerTypes, CanonicalValue::FlowerType(label)) => {
            if adding {
                memory.flower_types_excluded.remove(&label);
            }
            update_set(&mut memory.flower_types, label, adding);
        }
        (FilterCategory::FlowerTypesExcluded, CanonicalValue::FlowerType(label)) => {
            if adding {
                memory.flower_types.remove(&label);
            }
            update_set(&mut memory.flower_types_excluded, label, adding);
        }
        (FilterCategory::Season, CanonicalValue::Season(constraint)) => {
            memory.season_constraint = Some(constraint);
        }
        _ => return Err(invalid("value does not fit category")),
    }
    Ok(())
}

fn update_set(set: &mut BTreeSet<String>, label: String, adding: bool) {
    if adding {
        set.insert(label);
    } else {
        set.remove(&label);
    }
}

/// Same result as applying a single `clear` delta.
#[must_use]
pub fn reset(memory: &FilterMemory) -> FilterMemory {
    let mut next = FilterMemory::with_seed(memory.sample_seed);
    if next.constraints() != memory.constraints() {
        next.sample_seed = derive_seed(memory.sample_seed, &next.constraints());
    }
    next
}

/// Deterministic successor seed: SHA-256 over the previous seed and the constraint set.
#[must_use]
pub fn derive_seed(previous: u64, constraints: &ConstraintView<'_>) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(previous.to_le_bytes());
    hasher.update(serde_json::to_vec(constraints).unwrap_or_default());
    let digest = hasher.finalize();
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}
