//! Rule model, list parsing, rule store and document filtering

pub mod category;
pub mod classify;
pub mod domain;
pub mod error;
pub mod html;
pub mod rule_parser;
pub mod selector;
pub mod store;
pub mod trigger;

pub use category::{Category, CategoryMask, EngineOption, EngineToggles, OptionSet};
pub use classify::{ClassifyRequest, ContentVerdict};
pub use error::RuleError;
pub use html::{ContentEncoding, DocumentFilter, DocumentOutcome};
pub use rule_parser::{parse_filter_list, parse_trigger_list, ParsedList, ParsedRule};
pub use selector::{CategorizedSelector, SelectorException};
pub use store::{LoadCounts, RuleCounts, RuleMatches, RuleStore};
pub use trigger::{RequestInfo, TextTrigger, TriggerPattern, TriggerTarget};
