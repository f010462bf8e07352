pub mod balance;
pub mod catalog;
pub mod config;
pub mod credits;
pub mod csv;
pub mod dispatch;
pub mod gate;
pub mod idempotency;
pub mod ledger;
pub mod model;
pub mod store;
pub mod unlock;

pub use catalog::{Catalog, ContentUnit, StaticCatalog};
pub use config::LedgerConfig;
pub use credits::Credits;
pub use dispatch::Dispatcher;
pub use gate::{EntitlementGate, GateDecision, GatePolicy, GateType};
pub use ledger::{LedgerError, LedgerService};
pub use model::{
    AdjustDirection, EntryContext, EntryKind, GrantKind, LedgerEntry, Page, TransactionOutcome,
    UnlockOutcome,
};
pub use store::{StoreError, TransactionLog};
pub use unlock::UnlockCoordinator;
