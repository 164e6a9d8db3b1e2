pub mod controller;
pub mod types;

pub use controller::SearchController;
pub use types::{PerformedSearch, RegexSearch, SearchOptions, TextSearch};
