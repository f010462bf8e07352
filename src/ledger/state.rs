use crate::Credits;
use crate::model::UserId;

/// Point-in-time view of one user's account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSummary {
    pub user: UserId,
    pub balance: Credits,
    pub entries: usize,
    /// Includes free unlocks, which leave no ledger entry.
    pub entitlements: usize,
}
