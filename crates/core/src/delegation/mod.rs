pub mod resolver;
pub mod store;

pub use resolver::DelegationResolver;
pub use store::{DelegationStore, StoreOutcome};
