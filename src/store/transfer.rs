//! Transfer transaction
//!
//! Moves `amount` from one account to another inside a single transaction:
//!
//! 1. insert the transfer row
//! 2. insert the debit entry (`-amount`) for the source
//! 3. insert the credit entry (`+amount`) for the destination
//! 4. apply both balance deltas, smaller account id first
//!
//! Amount positivity, distinct accounts and matching currencies are checked by
//! the caller. Sufficient funds are not checked here.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::StoreError;
use super::executor::TxExecutor;
use super::models::{
    Account, AddAccountBalanceParams, CreateEntryParams, CreateTransferParams, Entry, Transfer,
};
use super::ordering::{UpdateOrder, update_order};
use super::querier::Querier;

/// Input of a transfer transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

/// Everything a committed transfer wrote, labeled by logical role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

/// Run the transfer algorithm on `executor`.
///
/// Returns only after all five writes committed; on any failure none of them
/// is visible.
pub async fn transfer_tx<E>(
    executor: &E,
    cancel: &CancellationToken,
    arg: TransferTxParams,
) -> Result<TransferTxResult, StoreError>
where
    E: TxExecutor,
{
    let debit = arg
        .amount
        .checked_neg()
        .ok_or_else(|| StoreError::Aborted(format!("amount {} out of range", arg.amount)))?;

    let result = executor
        .exec_tx(cancel, move |q| {
            Box::pin(async move {
                let transfer = q
                    .create_transfer(CreateTransferParams {
                        from_account_id: arg.from_account_id,
                        to_account_id: arg.to_account_id,
                        amount: arg.amount,
                    })
                    .await?;

                let from_entry = q
                    .create_entry(CreateEntryParams {
                        account_id: arg.from_account_id,
                        amount: debit,
                    })
                    .await?;

                let to_entry = q
                    .create_entry(CreateEntryParams {
                        account_id: arg.to_account_id,
                        amount: arg.amount,
                    })
                    .await?;

                debug!(
                    transfer_id = transfer.id,
                    from_entry_id = from_entry.id,
                    to_entry_id = to_entry.id,
                    "Transfer rows created"
                );

                let (from_account, to_account) =
                    match update_order(arg.from_account_id, arg.to_account_id) {
                        UpdateOrder::SourceFirst => {
                            add_money(q, arg.from_account_id, debit, arg.to_account_id, arg.amount)
                                .await?
                        }
                        UpdateOrder::DestinationFirst => {
                            let (to_account, from_account) = add_money(
                                q,
                                arg.to_account_id,
                                arg.amount,
                                arg.from_account_id,
                                debit,
                            )
                            .await?;
                            (from_account, to_account)
                        }
                    };

                Ok(TransferTxResult {
                    transfer,
                    from_account,
                    to_account,
                    from_entry,
                    to_entry,
                })
            })
        })
        .await?;

    info!(
        transfer_id = result.transfer.id,
        from_account_id = arg.from_account_id,
        to_account_id = arg.to_account_id,
        amount = arg.amount,
        "Transfer committed"
    );
    Ok(result)
}

/// Apply two deltas in the given order, returning the rows in that order
async fn add_money(
    q: &dyn Querier,
    account_id1: i64,
    amount1: i64,
    account_id2: i64,
    amount2: i64,
) -> Result<(Account, Account), StoreError> {
    let account1 = q
        .add_account_balance(AddAccountBalanceParams {
            id: account_id1,
            amount: amount1,
        })
        .await?;

    let account2 = q
        .add_account_balance(AddAccountBalanceParams {
            id: account_id2,
            amount: amount2,
        })
        .await?;

    Ok((account1, account2))
}
