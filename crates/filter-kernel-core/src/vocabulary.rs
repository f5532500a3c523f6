use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::memory::{EffortSelector, FilterCategory, SeasonConstraint};
use crate::season::MonthDay;

const BUILTIN_VOCABULARY_YAML: &str = include_str!("../config/vocabulary.yaml");

static NO_MEMBERS: BTreeSet<String> = BTreeSet::new();

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ColorBucket {
    Red,
    Pink,
    White,
    Yellow,
    Orange,
    Purple,
    Blue,
    Green,
}

impl ColorBucket {
    pub const ALL: [Self; 8] = [
        Self::Red,
        Self::Pink,
        Self::White,
        Self::Yellow,
        Self::Orange,
        Self::Purple,
        Self::Blue,
        Self::Green,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Pink => "pink",
            Self::White => "white",
            Self::Yellow => "yellow",
            Self::Orange => "orange",
            Self::Purple => "purple",
            Self::Blue => "blue",
            Self::Green => "green",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "red" => Some(Self::Red),
            "pink" => Some(Self::Pink),
            "white" => Some(Self::White),
            "yellow" => Some(Self::Yellow),
            "orange" => Some(Self::Orange),
            "purple" => Some(Self::Purple),
            "blue" => Some(Self::Blue),
            "green" => Some(Self::Green),
            _ => None,
        }
    }

    /// Boolean flag column of the catalog view for this bucket.
    #[must_use]
    pub fn column(self) -> &'static str {
        match self {
            Self::Red => "has_red",
            Self::Pink => "has_pink",
            Self::White => "has_white",
            Self::Yellow => "has_yellow",
            Self::Orange => "has_orange",
            Self::Purple => "has_purple",
            Self::Blue => "has_blue",
            Self::Green => "has_green",
        }
    }
}

impl Display for ColorBucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved, canonical form of one delta value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CanonicalValue {
    Colors(Vec<ColorBucket>),
    Price(f64),
    /// Approximate target price ("around $75").
    PriceAround(f64),
    Quantity(u32),
    Effort(EffortSelector),
    Occasion(String),
    FlowerType(String),
    Season(SeasonConstraint),
}

/// Serialized vocabulary tables: canonical label -> synonyms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VocabularyConfig {
    pub colors: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub color_synonyms: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub color_families: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub effort_levels: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub occasions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub flower_types: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub seasons: BTreeMap<String, MonthDay>,
}

/// Process-wide lookup tables, immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalVocabulary {
    members: BTreeMap<ColorBucket, BTreeSet<String>>,
    color_lookup: BTreeMap<String, ColorBucket>,
    color_families: BTreeMap<String, Vec<ColorBucket>>,
    effort_lookup: BTreeMap<String, String>,
    occasion_lookup: BTreeMap<String, String>,
    flower_lookup: BTreeMap<String, String>,
    season_anchors: BTreeMap<String, MonthDay>,
}

impl CanonicalVocabulary {
    /// The vocabulary shipped with the crate.
    ///
    /// # Errors
    /// Returns [`KernelError::Config`] if the embedded tables are inconsistent.
    pub fn builtin() -> Result<Self, KernelError> {
        Self::from_yaml_str(BUILTIN_VOCABULARY_YAML)
    }

    /// # Errors
    /// Returns [`KernelError::Config`] when the YAML is unreadable or the tables are inconsistent.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, KernelError> {
        let config: VocabularyConfig = serde_yaml::from_str(yaml)
            .map_err(|err| KernelError::Config(format!("invalid vocabulary yaml: {err}")))?;
        Self::from_config(&config)
    }

    /// Build lookup tables, rejecting any raw name that lands in two buckets or two labels.
    ///
    /// # Errors
    /// Returns [`KernelError::Config`] on unknown buckets or conflicting synonyms.
    pub fn from_config(config: &VocabularyConfig) -> Result<Self, KernelError> {
        let mut members: BTreeMap<ColorBucket, BTreeSet<String>> =
            ColorBucket::ALL.iter().map(|bucket| (*bucket, BTreeSet::new())).collect();
        let mut color_lookup = BTreeMap::new();

        for bucket in ColorBucket::ALL {
            color_lookup.insert(bucket.as_str().to_string(), bucket);
        }
        for (name, raw_members) in &config.colors {
            let bucket = parse_bucket(name)?;
            for raw in raw_members {
                let key = normalize(raw);
                insert_color(&mut color_lookup, &key, bucket)?;
                members.entry(bucket).or_default().insert(key);
            }
            members.entry(bucket).or_default().insert(bucket.as_str().to_string());
        }
        for (name, synonyms) in &config.color_synonyms {
            let bucket = parse_bucket(name)?;
            for raw in synonyms {
                insert_color(&mut color_lookup, &normalize(raw), bucket)?;
            }
        }

        let mut color_families = BTreeMap::new();
        for (name, buckets) in &config.color_families {
            let key = normalize(name);
            if color_lookup.contains_key(&key) {
                return Err(KernelError::Config(format!(
                    "color family `{key}` shadows a color name"
                )));
            }
            let resolved = buckets
                .iter()
                .map(|bucket| parse_bucket(bucket))
                .collect::<Result<Vec<_>, _>>()?;
            color_families.insert(key, resolved);
        }

        Ok(Self {
            members,
            color_lookup,
            color_families,
            effort_lookup: label_lookup("effort level", &config.effort_levels)?,
            occasion_lookup: label_lookup("occasion", &config.occasions)?,
            flower_lookup: label_lookup("flower type", &config.flower_types)?,
            season_anchors: config
                .seasons
                .iter()
                .map(|(name, anchor)| (normalize(name), *anchor))
                .collect(),
        })
    }

    /// Map free text to its canonical value for `category`; `None` when nothing matches.
    #[must_use]
    pub fn resolve(&self, category: FilterCategory, raw: &str) -> Option<CanonicalValue> {
        let text = normalize(raw);
        if text.is_empty() {
            return None;
        }
        match category {
            FilterCategory::ColorsInclude | FilterCategory::ColorsExclude => {
                self.resolve_colors(&text).map(CanonicalValue::Colors)
            }
            FilterCategory::PriceMin | FilterCategory::PriceMax | FilterCategory::PriceAround => {
                resolve_price(category, &text)
            }
            FilterCategory::Quantity => parse_quantity(&text).map(CanonicalValue::Quantity),
            FilterCategory::EffortLevel | FilterCategory::EffortExcluded => {
                self.resolve_effort(&text).map(CanonicalValue::Effort)
            }
            FilterCategory::Occasions | FilterCategory::OccasionsExcluded => {
                self.occasion_lookup.get(&text).cloned().map(CanonicalValue::Occasion)
            }
            FilterCategory::FlowerTypes | FilterCategory::FlowerTypesExcluded => {
                self.resolve_flower_type(&text).map(CanonicalValue::FlowerType)
            }
            FilterCategory::Season => self.resolve_season(&text).map(CanonicalValue::Season),
        }
    }

    /// Raw catalog color names grouped under `bucket`, including the bucket name itself.
    #[must_use]
    pub fn members_of(&self, bucket: ColorBucket) -> &BTreeSet<String> {
        self.members.get(&bucket).unwrap_or(&NO_MEMBERS)
    }

    #[must_use]
    pub fn bucket_for_color(&self, raw: &str) -> Option<ColorBucket> {
        self.color_lookup.get(&normalize(raw)).copied()
    }

    /// Buckets present in a delimiter-joined raw color string.
    #[must_use]
    pub fn buckets_in(&self, colors_raw: &str) -> BTreeSet<ColorBucket> {
        split_list(colors_raw).filter_map(|name| self.bucket_for_color(name)).collect()
    }

    /// Raw color names with no bucket. They never match a color predicate.
    #[must_use]
    pub fn unmapped_colors(&self, colors_raw: &str) -> BTreeSet<String> {
        split_list(colors_raw)
            .map(normalize)
            .filter(|name| !self.color_lookup.contains_key(name))
            .collect()
    }

    #[must_use]
    pub fn effort_labels(&self) -> BTreeSet<&str> {
        self.effort_lookup.values().map(String::as_str).collect()
    }

    #[must_use]
    pub fn occasion_labels(&self) -> BTreeSet<&str> {
        self.occasion_lookup.values().map(String::as_str).collect()
    }

    fn resolve_colors(&self, text: &str) -> Option<Vec<ColorBucket>> {
        if let Some(bucket) = self.color_lookup.get(text) {
            return Some(vec![*bucket]);
        }
        self.color_families.get(text).cloned()
    }

    fn resolve_effort(&self, text: &str) -> Option<EffortSelector> {
        if matches!(text, "unknown" | "unspecified" | "not specified" | "unknown only") {
            return Some(EffortSelector::Unknown);
        }
        self.effort_lookup.get(text).cloned().map(EffortSelector::Level)
    }

    fn resolve_flower_type(&self, text: &str) -> Option<String> {
        if let Some(label) = self.flower_lookup.get(text) {
            return Some(label.clone());
        }
        if !text.chars().all(|c| c.is_alphabetic() || matches!(c, ' ' | '\'' | '-')) {
            return None;
        }
        Some(singularize(text))
    }

    fn resolve_season(&self, text: &str) -> Option<SeasonConstraint> {
        match text {
            "now" | "today" | "right now" | "currently" | "this week" | "in season"
            | "in season now" => return Some(SeasonConstraint::Now),
            "year round" | "year-round" | "all year" | "all year round" | "anytime"
            | "always available" => return Some(SeasonConstraint::YearRoundOnly),
            "seasonal" | "seasonal only" | "not year round" | "limited season" => {
                return Some(SeasonConstraint::SeasonalOnly)
            }
            _ => {}
        }
        if let Some(anchor) = self.season_anchors.get(text) {
            return Some(SeasonConstraint::Explicit(*anchor));
        }
        parse_month_day(text).map(SeasonConstraint::Explicit)
    }
}

fn parse_bucket(name: &str) -> Result<ColorBucket, KernelError> {
    ColorBucket::parse(&normalize(name))
        .ok_or_else(|| KernelError::Config(format!("unknown color bucket `{name}`")))
}

fn insert_color(
    lookup: &mut BTreeMap<String, ColorBucket>,
    key: &str,
    bucket: ColorBucket,
) -> Result<(), KernelError> {
    match lookup.get(key) {
        Some(existing) if *existing != bucket => Err(KernelError::Config(format!(
            "color `{key}` is listed in both {existing} and {bucket}"
        ))),
        _ => {
            lookup.insert(key.to_string(), bucket);
            Ok(())
        }
    }
}

fn label_lookup(
    kind: &str,
    table: &BTreeMap<String, Vec<String>>,
) -> Result<BTreeMap<String, String>, KernelError> {
    let mut lookup: BTreeMap<String, String> = BTreeMap::new();
    for (label, synonyms) in table {
        let canonical = label.trim().to_string();
        for synonym in std::iter::once(label).chain(synonyms) {
            let key = normalize(synonym);
            if let Some(existing) = lookup.get(&key) {
                if *existing != canonical {
                    return Err(KernelError::Config(format!(
                        "{kind} synonym `{key}` maps to both `{existing}` and `{canonical}`"
                    )));
                }
            }
            lookup.insert(key, canonical.clone());
        }
    }
    Ok(lookup)
}

/// Lowercase, trim, collapse inner whitespace, and fold typographic apostrophes.
#[must_use]
pub fn normalize(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .replace(['\u{2019}', '\u{2018}'], "'")
}

/// Split a catalog multi-value field on `;` or `,`.
pub fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split([';', ',']).map(str::trim).filter(|item| !item.is_empty())
}

fn singularize(text: &str) -> String {
    if let Some(stem) = text.strip_suffix("ies") {
        if stem.len() >= 2 {
            return format!("{stem}y");
        }
    }
    let keeps_s = ["ss", "us", "is"].iter().any(|suffix| text.ends_with(suffix));
    if text.len() > 3 && text.ends_with('s') && !keeps_s {
        return text[..text.len() - 1].to_string();
    }
    text.to_string()
}

const APPROXIMATE_PREFIXES: [&str; 8] =
    ["around", "about", "approximately", "roughly", "close to", "nearly", "near", "~"];

/// An approximate amount in any price category becomes a target price.
fn resolve_price(category: FilterCategory, text: &str) -> Option<CanonicalValue> {
    let approximate = APPROXIMATE_PREFIXES
        .iter()
        .find_map(|prefix| text.strip_prefix(prefix))
        .map(str::trim_start);
    match approximate {
        Some(amount) => parse_price(amount).map(CanonicalValue::PriceAround),
        None if category == FilterCategory::PriceAround => {
            parse_price(text).map(CanonicalValue::PriceAround)
        }
        None => parse_price(text).map(CanonicalValue::Price),
    }
}

/// First positive whole number in the text ("100 stems", "a bunch of 25"); "dozen" is 12.
#[must_use]
pub fn parse_quantity(text: &str) -> Option<u32> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    if digits.is_empty() {
        return text.split_whitespace().any(|word| word == "dozen").then_some(12);
    }
    digits.parse::<u32>().ok().filter(|count| *count > 0)
}

/// Parse "$1,250.50", "100", "100 dollars" into a non-negative amount.
#[must_use]
pub fn parse_price(text: &str) -> Option<f64> {
    let cleaned: String = text
        .trim_end_matches("dollars")
        .trim_end_matches("usd")
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    let value = cleaned.parse::<f64>().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}

fn month_number(token: &str) -> Option<u8> {
    let month = match token.trim_end_matches('.') {
        "january" | "jan" => 1,
        "february" | "feb" => 2,
        "march" | "mar" => 3,
        "april" | "apr" => 4,
        "may" => 5,
        "june" | "jun" => 6,
        "july" | "jul" => 7,
        "august" | "aug" => 8,
        "september" | "sept" | "sep" => 9,
        "october" | "oct" => 10,
        "november" | "nov" => 11,
        "december" | "dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn day_number(token: &str) -> Option<u8> {
    let digits = token
        .trim_end_matches("st")
        .trim_end_matches("nd")
        .trim_end_matches("rd")
        .trim_end_matches("th");
    digits.parse::<u8>().ok()
}

/// "May 12", "12th of May", "5/12", "5-12"; a bare month name resolves to mid-month.
#[must_use]
pub fn parse_month_day(text: &str) -> Option<MonthDay> {
    if let Some((month, day)) = text.split_once(['/', '-']) {
        let month = month.trim().parse::<u8>().ok()?;
        let day = day.trim().parse::<u8>().ok()?;
        return MonthDay::new(month, day).ok();
    }
    let tokens: Vec<&str> = text
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty() && *token != "of")
        .collect();
    let (month, day) = match tokens.as_slice() {
        [month] => (month_number(month)?, 15),
        [first, second] => match month_number(first) {
            Some(month) => (month, day_number(second)?),
            None => (month_number(second)?, day_number(first)?),
        },
        _ => return None,
    };
    MonthDay::new(month, day).ok()
}
