//! Command-stream driver.
//!
//! Applies a stream of [`Command`]s to the ledger in arrival order. Refused
//! commands are skipped; a store failure stops the stream, since every later
//! command would be judged against a log in an unknown state.

use std::sync::Arc;
use thiserror::Error;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::catalog::{Catalog, StaticCatalog};
use crate::config::LedgerConfig;
use crate::gate::EntitlementGate;
use crate::ledger::{AccountSummary, LedgerError, LedgerService};
use crate::model::Command;
use crate::store::{StoreError, TransactionLog};
use crate::unlock::UnlockCoordinator;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{command} for user {user} refused: {reason}")]
    Refused {
        command: &'static str,
        user: String,
        reason: LedgerError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Dispatcher<C> {
    coordinator: UnlockCoordinator<C>,
}

impl Dispatcher<StaticCatalog> {
    /// Open the log and wire every component as configured.
    pub async fn from_config(config: &LedgerConfig) -> Result<Self, StoreError> {
        let log = match &config.ledger.journal_path {
            Some(path) => TransactionLog::open(path).await?,
            None => TransactionLog::in_memory(),
        };
        let ledger = Arc::new(LedgerService::from_settings(Arc::new(log), &config.ledger));
        let gate = EntitlementGate::new(Arc::new(config.catalog()), config.bonus_tiers.clone());
        Ok(Self::new(UnlockCoordinator::new(ledger, gate)))
    }
}

impl<C: Catalog> Dispatcher<C> {
    pub fn new(coordinator: UnlockCoordinator<C>) -> Self {
        Self { coordinator }
    }

    /// Run the dispatcher over the given command stream
    pub async fn run(&self, mut stream: impl Stream<Item = Command> + Unpin) -> Result<(), StoreError> {
        while let Some(command) = stream.next().await {
            match self.apply(command).await {
                Ok(()) => {}
                // already logged by the ledger; refusals do not stop the stream
                Err(DispatchError::Refused { .. }) => {}
                Err(DispatchError::Store(e)) => return Err(e),
            }
        }
        Ok(())
    }

    /// Apply a single command
    pub async fn apply(&self, command: Command) -> Result<(), DispatchError> {
        let name = command.name();
        let user = command.user().to_string();
        let ledger = self.coordinator.ledger();

        let refusal = match command {
            Command::Grant {
                user,
                amount,
                kind,
                context,
                key,
            } => ledger.grant(&user, amount, kind, context, &key).await?.error,
            Command::Spend {
                user,
                amount,
                context,
                key,
            } => ledger.spend(&user, amount, context, &key).await?.error,
            Command::Adjust {
                admin,
                user,
                amount,
                direction,
                reason,
                key,
            } => {
                ledger
                    .admin_adjust(&admin, &user, amount, direction, &reason, &key)
                    .await?
                    .error
            }
            Command::Unlock { user, content, key } => {
                self.coordinator.unlock(&user, &content, &key).await?.error
            }
            Command::Refund { user, entry, key } => ledger.refund(&user, entry, &key).await?.error,
            Command::Bonus {
                user,
                content,
                seconds,
                key,
            } => self
                .coordinator
                .claim_engagement_bonus(&user, &content, seconds, &key)
                .await?
                .transaction
                .and_then(|outcome| outcome.error),
        };

        match refusal {
            None => {
                debug!(command = name, user = %user, "command applied");
                Ok(())
            }
            Some(reason) => Err(DispatchError::Refused {
                command: name,
                user,
                reason,
            }),
        }
    }

    pub async fn accounts(&self) -> Vec<AccountSummary> {
        self.coordinator.ledger().accounts().await
    }
}
