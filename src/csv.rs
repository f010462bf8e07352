use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::Credits;
use crate::ledger::AccountSummary;
use crate::model::{AdjustDirection, Command, EntryContext, EntryId, GrantKind};

/// Errors that can occur when reading commands or writing the report
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized operation '{op}'")]
    UnrecognizedOp { line: usize, op: String },

    #[error("line {line}: {op} missing {field}")]
    MissingField {
        line: usize,
        op: String,
        field: &'static str,
    },

    #[error("line {line}: {op} has unknown kind '{kind}'")]
    UnknownKind { line: usize, op: String, kind: String },

    #[error("failed to write report: {0}")]
    Write(#[from] csv::Error),
}

#[derive(Debug, Deserialize)]
struct InputRow {
    op: String,
    user: String,
    key: Option<String>,
    amount: Option<i64>,
    kind: Option<String>,
    content: Option<String>,
    admin: Option<String>,
    reason: Option<String>,
    entry: Option<EntryId>,
    seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    user: &'a str,
    balance: i64,
    entries: usize,
    entitlements: usize,
}

/// Read ledger commands from a csv file
pub fn read_commands(
    path: impl AsRef<Path>,
) -> Result<impl Iterator<Item = Result<Command, CsvError>>, CsvError> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.display().to_string(),
            source,
        })?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            parse_row(line, row)
        }))
}

fn parse_row(line: usize, row: InputRow) -> Result<Command, CsvError> {
    let op = row.op.to_ascii_lowercase();
    let missing = |field: &'static str| CsvError::MissingField {
        line,
        op: op.clone(),
        field,
    };
    let unknown_kind = |kind: &str| CsvError::UnknownKind {
        line,
        op: op.clone(),
        kind: kind.to_string(),
    };

    let key = row.key.clone().ok_or_else(|| missing("key"))?;
    let amount = || row.amount.map(Credits::new).ok_or_else(|| missing("amount"));
    let content = || row.content.clone().ok_or_else(|| missing("content"));

    let command = match op.as_str() {
        "grant" => {
            let kind = match row.kind.as_deref().unwrap_or("purchase") {
                "purchase" => GrantKind::Purchase,
                "admin_grant" => GrantKind::AdminGrant,
                "bonus" => GrantKind::Bonus,
                "promo" => GrantKind::Promo,
                other => return Err(unknown_kind(other)),
            };
            let context = match &row.reason {
                Some(reason) => EntryContext::default().with_reason(reason.clone()),
                None => EntryContext::default(),
            };
            Command::Grant {
                user: row.user,
                amount: amount()?,
                kind,
                context,
                key,
            }
        }
        "spend" => Command::Spend {
            context: row.content.clone().map(|c| EntryContext::content(c)).unwrap_or_default(),
            amount: amount()?,
            user: row.user,
            key,
        },
        "adjust" => {
            let direction = match row.kind.as_deref() {
                Some("grant") => AdjustDirection::Grant,
                Some("deduct") => AdjustDirection::Deduct,
                Some(other) => return Err(unknown_kind(other)),
                None => return Err(missing("kind")),
            };
            Command::Adjust {
                admin: row.admin.clone().ok_or_else(|| missing("admin"))?,
                amount: amount()?,
                reason: row.reason.clone().unwrap_or_default(),
                user: row.user,
                direction,
                key,
            }
        }
        "unlock" => Command::Unlock {
            content: content()?,
            user: row.user,
            key,
        },
        "refund" => Command::Refund {
            entry: row.entry.ok_or_else(|| missing("entry"))?,
            user: row.user,
            key,
        },
        "bonus" => Command::Bonus {
            content: content()?,
            seconds: row.seconds.ok_or_else(|| missing("seconds"))?,
            user: row.user,
            key,
        },
        _ => {
            return Err(CsvError::UnrecognizedOp {
                line,
                op: row.op,
            });
        }
    };
    Ok(command)
}

/// Write account summaries in csv format
pub fn write_accounts<'a>(
    writer: impl io::Write,
    accounts: impl IntoIterator<Item = &'a AccountSummary>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(writer);

    for account in accounts {
        writer.serialize(OutputRow {
            user: &account.user,
            balance: account.balance.get(),
            entries: account.entries,
            entitlements: account.entitlements,
        })?;
    }

    writer.flush().map_err(|e| CsvError::Write(e.into()))?;
    Ok(())
}
