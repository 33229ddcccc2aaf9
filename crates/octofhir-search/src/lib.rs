//! FHIR search parameter parsing and translation into storage queries.

pub mod parameters;
pub mod parser;
pub mod registry;
pub mod translator;

pub use parameters::{SearchModifier, SearchParameter, SearchParameterType, SearchPrefix};
pub use parser::{
    ParsedParam, ParsedParameters, ParsedValue, SearchParameterParser, SearchValidationError,
};
pub use registry::SearchParameterRegistry;
pub use translator::{QueryTranslator, Translation};
