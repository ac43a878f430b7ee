//! Rule subsystem: the expression language, the evaluating engine with
//! its compile cache and evidence extraction, and the JSON rule-file
//! loader.

pub mod engine;
pub mod expr;
pub mod loader;

pub use engine::RuleEngine;
pub use loader::{load_rule_file, RuleFile};
