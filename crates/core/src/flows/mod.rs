pub mod engine;
pub mod states;

pub use engine::PurchaseFlow;
pub use states::{PurchaseEvent, TransitionOutcome};
