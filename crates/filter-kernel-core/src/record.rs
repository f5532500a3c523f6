use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KernelError;
use crate::season::{self, SeasonRange, TriState};
use crate::vocabulary::{normalize, split_list, ColorBucket};

/// One catalog row as returned by a catalog source, keyed by column name.
pub type RawRow = BTreeMap<String, Value>;

/// Column names of the denormalized catalog view.
pub mod columns {
    pub const UNIQUE_ID: &str = "unique_id";
    pub const PRODUCT_NAME: &str = "product_name";
    pub const VARIANT_NAME: &str = "variant_name";
    pub const VARIANT_PRICE: &str = "variant_price";
    pub const DESCRIPTION: &str = "description_clean";
    pub const COLORS_RAW: &str = "colors_raw";
    pub const IS_YEAR_ROUND: &str = "is_year_round";
    pub const DIY_LEVEL: &str = "diy_level";
    pub const HOLIDAY_OCCASION: &str = "holiday_occasion";
    pub const PRODUCT_TYPE: &str = "product_type_all_flowers";
    pub const GROUP_CATEGORY: &str = "group_category";
    /// Free-text list of the stems an arrangement is built from.
    pub const RECIPE: &str = "recipe_metafield";

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SeasonColumns {
        pub start_month: &'static str,
        pub start_day: &'static str,
        pub end_month: &'static str,
        pub end_day: &'static str,
    }

    pub const SEASON_RANGES: [SeasonColumns; 3] = [
        SeasonColumns {
            start_month: "season_start_month",
            start_day: "season_start_day",
            end_month: "season_end_month",
            end_day: "season_end_day",
        },
        SeasonColumns {
            start_month: "season_range_2_start_month",
            start_day: "season_range_2_start_day",
            end_month: "season_range_2_end_month",
            end_day: "season_range_2_end_day",
        },
        SeasonColumns {
            start_month: "season_range_3_start_month",
            start_day: "season_range_3_start_day",
            end_month: "season_range_3_end_month",
            end_day: "season_range_3_end_day",
        },
    ];

    /// Every column a query selects, in output order.
    #[must_use]
    pub fn select_list() -> Vec<&'static str> {
        let mut list = vec![
            UNIQUE_ID,
            PRODUCT_NAME,
            VARIANT_NAME,
            VARIANT_PRICE,
            DESCRIPTION,
            COLORS_RAW,
        ];
        list.extend(super::ColorBucket::ALL.iter().map(|bucket| bucket.column()));
        for range in SEASON_RANGES {
            list.extend([range.start_month, range.start_day, range.end_month, range.end_day]);
        }
        list.extend([
            IS_YEAR_ROUND,
            DIY_LEVEL,
            HOLIDAY_OCCASION,
            PRODUCT_TYPE,
            GROUP_CATEGORY,
            RECIPE,
        ]);
        list
    }
}

/// A catalog product coerced into typed form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductRecord {
    pub key: String,
    pub product_name: String,
    pub variant_name: Option<String>,
    pub variant_price: Option<f64>,
    pub description: Option<String>,
    pub colors_raw: Option<String>,
    /// Buckets whose catalog flag is true.
    pub color_flags: BTreeSet<ColorBucket>,
    pub season_ranges: [SeasonRange; 3],
    /// The catalog's explicit year-round flag.
    pub is_year_round: TriState,
    pub effort_level: Option<String>,
    pub occasions_raw: Option<String>,
    pub product_type: Option<String>,
    pub group_category: Option<String>,
    #[serde(default)]
    pub recipe: Option<String>,
}

impl ProductRecord {
    /// Minimal record with every optional attribute absent.
    #[must_use]
    pub fn new(key: &str, product_name: &str) -> Self {
        Self {
            key: key.to_string(),
            product_name: product_name.to_string(),
            variant_name: None,
            variant_price: None,
            description: None,
            colors_raw: None,
            color_flags: BTreeSet::new(),
            season_ranges: [SeasonRange::default(); 3],
            is_year_round: TriState::Unknown,
            effort_level: None,
            occasions_raw: None,
            product_type: None,
            group_category: None,
            recipe: None,
        }
    }

    /// Coerce a raw row.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] naming the first column that cannot be coerced.
    pub fn try_from_row(row: &RawRow) -> Result<Self, KernelError> {
        let key = row_key(row)
            .ok_or_else(|| KernelError::Validation(format!("{} is missing", columns::UNIQUE_ID)))?;
        let product_name = text(row, columns::PRODUCT_NAME)?.ok_or_else(|| {
            KernelError::Validation(format!("{} is missing", columns::PRODUCT_NAME))
        })?;

        let mut color_flags = BTreeSet::new();
        for bucket in ColorBucket::ALL {
            match boolean(row, bucket.column())? {
                Some(true) => {
                    color_flags.insert(bucket);
                }
                Some(false) => {}
                None => {
                    return Err(KernelError::Validation(format!("{} is missing", bucket.column())));
                }
            }
        }

        let mut season_ranges = [SeasonRange::default(); 3];
        for (slot, names) in season_ranges.iter_mut().zip(columns::SEASON_RANGES) {
            let range = SeasonRange {
                start_month: small_int(row, names.start_month)?,
                start_day: small_int(row, names.start_day)?,
                end_month: small_int(row, names.end_month)?,
                end_day: small_int(row, names.end_day)?,
            };
            let complete = range.start_month.is_some()
                && range.start_day.is_some()
                && range.end_month.is_some()
                && range.end_day.is_some();
            if complete && range.bounds().is_none() {
                return Err(KernelError::Validation(format!(
                    "{} holds an impossible calendar date",
                    names.start_month
                )));
            }
            *slot = range;
        }

        Ok(Self {
            key,
            product_name,
            variant_name: text(row, columns::VARIANT_NAME)?,
            variant_price: number(row, columns::VARIANT_PRICE)?,
            description: text(row, columns::DESCRIPTION)?,
            colors_raw: text(row, columns::COLORS_RAW)?,
            color_flags,
            season_ranges,
            is_year_round: TriState::from_option(boolean(row, columns::IS_YEAR_ROUND)?),
            effort_level: text(row, columns::DIY_LEVEL)?,
            occasions_raw: text(row, columns::HOLIDAY_OCCASION)?,
            product_type: text(row, columns::PRODUCT_TYPE)?,
            group_category: text(row, columns::GROUP_CATEGORY)?,
            recipe: text(row, columns::RECIPE)?,
        })
    }

    /// Inverse of [`Self::try_from_row`].
    #[must_use]
    pub fn to_row(&self) -> RawRow {
        let optional_text =
            |value: &Option<String>| value.clone().map_or(Value::Null, Value::String);
        let mut row = RawRow::new();
        row.insert(columns::UNIQUE_ID.to_string(), Value::String(self.key.clone()));
        row.insert(columns::PRODUCT_NAME.to_string(), Value::String(self.product_name.clone()));
        row.insert(columns::VARIANT_NAME.to_string(), optional_text(&self.variant_name));
        row.insert(
            columns::VARIANT_PRICE.to_string(),
            self.variant_price.map_or(Value::Null, Value::from),
        );
        row.insert(columns::DESCRIPTION.to_string(), optional_text(&self.description));
        row.insert(columns::COLORS_RAW.to_string(), optional_text(&self.colors_raw));
        for bucket in ColorBucket::ALL {
            let flag = Value::Bool(self.color_flags.contains(&bucket));
            row.insert(bucket.column().to_string(), flag);
        }
        for (range, names) in self.season_ranges.iter().zip(columns::SEASON_RANGES) {
            for (name, value) in [
                (names.start_month, range.start_month),
                (names.start_day, range.start_day),
                (names.end_month, range.end_month),
                (names.end_day, range.end_day),
            ] {
                row.insert(name.to_string(), value.map_or(Value::Null, Value::from));
            }
        }
        row.insert(
            columns::IS_YEAR_ROUND.to_string(),
            self.is_year_round.as_option().map_or(Value::Null, Value::Bool),
        );
        row.insert(columns::DIY_LEVEL.to_string(), optional_text(&self.effort_level));
        row.insert(columns::HOLIDAY_OCCASION.to_string(), optional_text(&self.occasions_raw));
        row.insert(columns::PRODUCT_TYPE.to_string(), optional_text(&self.product_type));
        row.insert(columns::GROUP_CATEGORY.to_string(), optional_text(&self.group_category));
        row.insert(columns::RECIPE.to_string(), optional_text(&self.recipe));
        row
    }

    /// Copy with the effort and occasion fields in the normalized form that compiled SQL
    /// compares against: lowercase, single-spaced, straight apostrophes, occasion labels
    /// joined with `"; "`.
    #[must_use]
    pub fn with_match_text(&self) -> Self {
        let mut canonical = self.clone();
        canonical.effort_level =
            self.effort_level.as_deref().map(normalize).filter(|level| !level.is_empty());
        let labels: Vec<String> = self
            .occasions_raw
            .as_deref()
            .map(split_list)
            .into_iter()
            .flatten()
            .map(normalize)
            .filter(|label| !label.is_empty())
            .collect();
        canonical.occasions_raw = (!labels.is_empty()).then(|| labels.join("; "));
        canonical
    }

    /// Year-round status combining the explicit flag with a full-calendar range.
    #[must_use]
    pub fn year_round(&self) -> TriState {
        season::is_year_round(&self.season_ranges, self.is_year_round.as_option())
    }

    /// Every occasion label in the joined occasion field, normalized.
    #[must_use]
    pub fn occasion_labels(&self) -> BTreeSet<String> {
        self.occasions_raw.as_deref().map(split_list).into_iter().flatten().map(normalize).collect()
    }

    /// Grouping key across row shapes: the case- and whitespace-normalized display name.
    #[must_use]
    pub fn group_key(&self) -> String {
        normalize(&self.product_name)
    }
}

/// The identifying key of a raw row, if it has one.
#[must_use]
pub fn row_key(row: &RawRow) -> Option<String> {
    match row.get(columns::UNIQUE_ID)? {
        Value::String(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

fn text(row: &RawRow, column: &str) -> Result<Option<String>, KernelError> {
    match row.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => {
            let trimmed = value.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Some(Value::Number(value)) => Ok(Some(value.to_string())),
        Some(other) => Err(KernelError::Validation(format!("{column} is not text: {other}"))),
    }
}

fn number(row: &RawRow, column: &str) -> Result<Option<f64>, KernelError> {
    match row.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(value)) => Ok(value.as_f64()),
        Some(Value::String(value)) if value.trim().is_empty() => Ok(None),
        Some(Value::String(value)) => value
            .trim()
            .trim_start_matches('$')
            .replace(',', "")
            .parse::<f64>()
            .map(Some)
            .map_err(|_| KernelError::Validation(format!("{column} is not numeric: {value}"))),
        Some(other) => Err(KernelError::Validation(format!("{column} is not numeric: {other}"))),
    }
}

fn boolean(row: &RawRow, column: &str) -> Result<Option<bool>, KernelError> {
    let invalid =
        |value: &Value| KernelError::Validation(format!("{column} is not boolean: {value}"));
    match row.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(value)) => Ok(Some(*value)),
        Some(value @ Value::Number(number)) => match number.as_i64() {
            Some(0) => Ok(Some(false)),
            Some(1) => Ok(Some(true)),
            _ => Err(invalid(value)),
        },
        Some(value @ Value::String(text)) => match normalize(text).as_str() {
            "true" | "t" | "1" | "yes" => Ok(Some(true)),
            "false" | "f" | "0" | "no" => Ok(Some(false)),
            "" => Ok(None),
            _ => Err(invalid(value)),
        },
        Some(other) => Err(invalid(other)),
    }
}

fn small_int(row: &RawRow, column: &str) -> Result<Option<u8>, KernelError> {
    let invalid = || KernelError::Validation(format!("{column} is not a calendar number"));
    match row.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(value)) => value
            .as_u64()
            .and_then(|value| u8::try_from(value).ok())
            .map(Some)
            .ok_or_else(invalid),
        Some(Value::String(value)) if value.trim().is_empty() => Ok(None),
        Some(Value::String(value)) => value.trim().parse::<u8>().map(Some).map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}
