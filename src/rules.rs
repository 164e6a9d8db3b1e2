pub mod pattern_index;
pub mod rules_manager;
pub mod types;

pub use pattern_index::{PatternIndex, PatternMatch};
pub use rules_manager::RulesManager;
pub use types::{Pattern, PatternOrigin, Rule, RuleFilter};
