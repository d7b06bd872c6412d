pub mod executor;
pub mod outcome;
pub mod types;

pub use executor::{FlowExecutor, ReconcileReport, parse_parameters};
pub use outcome::{FlowOutcomeService, OutcomeResponse};
