// 提现请求访问（PostgreSQL）

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

use super::{StoreError, WithdrawalChange};
use crate::{
    domain::{PageRequest, WithdrawalRequest, WithdrawalStatus},
    infrastructure::db::PgPool,
};

const WITHDRAWAL_COLUMNS: &str = "id, account_id, amount, amount_sats, destination, status, \
     source_index, debit_entry_id, tx_ref, raw_tx, network_fee_sats, failure_reason, \
     created_at, updated_at";

#[derive(Debug, FromRow)]
struct WithdrawalRow {
    id: Uuid,
    account_id: Uuid,
    amount: i64,
    amount_sats: i64,
    destination: String,
    status: String,
    source_index: i64,
    debit_entry_id: Uuid,
    tx_ref: Option<String>,
    raw_tx: Option<String>,
    network_fee_sats: Option<i64>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WithdrawalRow> for WithdrawalRequest {
    type Error = StoreError;

    fn try_from(row: WithdrawalRow) -> Result<Self, Self::Error> {
        let status = WithdrawalStatus::from_db(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("status of withdrawal {}", row.id)))?;
        let source_index = u32::try_from(row.source_index)
            .map_err(|_| StoreError::Corrupt(format!("source_index of withdrawal {}", row.id)))?;

        Ok(WithdrawalRequest {
            id: row.id,
            account_id: row.account_id,
            amount: row.amount,
            amount_sats: row.amount_sats,
            destination: row.destination,
            status,
            source_index,
            debit_entry_id: row.debit_entry_id,
            tx_ref: row.tx_ref,
            raw_tx: row.raw_tx,
            network_fee_sats: row.network_fee_sats,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// 在事务内写入提现状态变更
pub(crate) async fn apply_change(
    conn: &mut PgConnection,
    change: &WithdrawalChange,
) -> Result<(), StoreError> {
    match change {
        WithdrawalChange::Open(new) => {
            sqlx::query(
                "INSERT INTO withdrawal_requests
                    (id, account_id, amount, amount_sats, destination, status, source_index,
                     debit_entry_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(new.id)
            .bind(new.account_id)
            .bind(new.amount)
            .bind(new.amount_sats)
            .bind(&new.destination)
            .bind(WithdrawalStatus::Requested.to_db_string())
            .bind(new.source_index as i64)
            .bind(new.debit_entry_id)
            .execute(&mut *conn)
            .await?;
            Ok(())
        }
        WithdrawalChange::Transition {
            id,
            from,
            to,
            patch,
        } => {
            if !from.can_transition_to(to) {
                return Err(StoreError::InvalidTransition {
                    id: *id,
                    from: *from,
                    to: *to,
                });
            }
            let result = sqlx::query(
                "UPDATE withdrawal_requests
                 SET status = $3,
                     tx_ref = COALESCE($4, tx_ref),
                     raw_tx = COALESCE($5, raw_tx),
                     network_fee_sats = COALESCE($6, network_fee_sats),
                     failure_reason = COALESCE($7, failure_reason),
                     updated_at = NOW()
                 WHERE id = $1 AND status = $2",
            )
            .bind(id)
            .bind(from.to_db_string())
            .bind(to.to_db_string())
            .bind(&patch.tx_ref)
            .bind(&patch.raw_tx)
            .bind(patch.network_fee_sats)
            .bind(&patch.failure_reason)
            .execute(&mut *conn)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(());
            }

            let exists: Option<String> =
                sqlx::query_scalar("SELECT status FROM withdrawal_requests WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&mut *conn)
                    .await?;

            match exists {
                Some(_) => Err(StoreError::WithdrawalStateMismatch {
                    id: *id,
                    expected: *from,
                }),
                None => Err(StoreError::WithdrawalNotFound(*id)),
            }
        }
    }
}

pub async fn find_withdrawal(
    pool: &PgPool,
    id: Uuid,
) -> Result<Option<WithdrawalRequest>, StoreError> {
    let row = sqlx::query_as::<_, WithdrawalRow>(&format!(
        "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawal_requests WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(WithdrawalRequest::try_from).transpose()
}

pub async fn list_by_status(
    pool: &PgPool,
    status: WithdrawalStatus,
    updated_before: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<WithdrawalRequest>, StoreError> {
    let rows = sqlx::query_as::<_, WithdrawalRow>(&format!(
        "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawal_requests
         WHERE status = $1 AND updated_at <= $2
         ORDER BY updated_at ASC
         LIMIT $3"
    ))
    .bind(status.to_db_string())
    .bind(updated_before)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(WithdrawalRequest::try_from).collect()
}

pub async fn list_for_account(
    pool: &PgPool,
    account_id: Uuid,
    page: PageRequest,
) -> Result<(Vec<WithdrawalRequest>, u64), StoreError> {
    let rows = sqlx::query_as::<_, WithdrawalRow>(&format!(
        "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawal_requests
         WHERE account_id = $1
         ORDER BY created_at DESC
         LIMIT $2 OFFSET $3"
    ))
    .bind(account_id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(pool)
    .await?;

    let total: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM withdrawal_requests WHERE account_id = $1")
            .bind(account_id)
            .fetch_one(pool)
            .await?;

    let data = rows
        .into_iter()
        .map(WithdrawalRequest::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((data, total.max(0) as u64))
}
