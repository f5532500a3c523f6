//! Conversational filter accumulation and query synthesis for a product catalog.
//!
//! A session's [`FilterMemory`] is updated by [`apply`] from parsed deltas, compiled into a
//! [`QueryPlan`], rendered to parameterized SQL, executed by a [`CatalogSource`], and the
//! rows are reduced to a small non-repeating sample by [`reduce`].

pub mod config;
pub mod error;
pub mod memory;
pub mod plan;
pub mod record;
pub mod reducer;
pub mod season;
pub mod session;
pub mod vocabulary;

pub use config::EngineConfig;
pub use error::{CatalogError, KernelError, TurnWarning};
pub use memory::{
    apply, derive_seed, reset, ConstraintView, Delta, DeltaAction, EffortSelector, FilterCategory,
    FilterMemory, SeasonConstraint, Transition, PRICE_AROUND_WINDOW,
};
pub use plan::{
    compile, compile_as_of, compile_checked, escape_like, ParamStyle, PredicateNode, QueryParam,
    QueryPlan, RenderedQuery, TaggedPredicate,
};
pub use record::{columns, row_key, ProductRecord, RawRow};
pub use reducer::{reduce, Reduction, DEFAULT_SAMPLE_CAP};
pub use season::{availability, is_available, is_year_round, MonthDay, SeasonRange, TriState};
pub use session::{
    create_session, process_turn, reset_session, CatalogRequest, CatalogSource, InMemoryCatalog,
    TurnContext, TurnOutcome,
};
pub use vocabulary::{
    normalize, parse_price, parse_quantity, CanonicalValue, CanonicalVocabulary, ColorBucket,
    VocabularyConfig,
};
