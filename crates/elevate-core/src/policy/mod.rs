//! Authorization policy: the file-backed store, its evaluator and the
//! watcher that triggers reloads.

pub mod evaluator;
pub mod store;
pub mod watcher;

pub use evaluator::{AuthRequirement, DecisionSource, PolicyDecision, PolicyEvaluator, StoreState};
pub use store::{
    ActionPattern, PolicyEntry, PolicyLoadError, PolicyResult, PolicyStore, PolicyValue, RuleScope,
    StoreMatch,
};
pub use watcher::PolicyWatcher;
