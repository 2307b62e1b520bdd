// 流水与对局托管访问（PostgreSQL）

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

use super::{
    pg_accounts, pg_withdrawals, DepositGuard, EntryUpdate, EscrowChange, LedgerBatch, StoreError,
};
use crate::{
    domain::{
        BalanceType, EntryStatus, EscrowState, LedgerKind, LedgerTransaction, MatchEscrow,
        MatchOutcome, NewLedgerEntry, NewMatchEscrow, PageRequest,
    },
    infrastructure::db::PgPool,
};

const ENTRY_COLUMNS: &str = "id, seq, account_id, kind, balance_type, delta, status, \
     idempotency_key, match_id, withdrawal_id, deposit_address, chain_amount_sats, \
     chain_reference, note, created_at, updated_at";

#[derive(Debug, FromRow)]
struct LedgerRow {
    id: Uuid,
    seq: i64,
    account_id: Uuid,
    kind: String,
    balance_type: String,
    delta: i64,
    status: String,
    idempotency_key: Option<String>,
    match_id: Option<Uuid>,
    withdrawal_id: Option<Uuid>,
    deposit_address: Option<String>,
    chain_amount_sats: Option<i64>,
    chain_reference: Option<String>,
    note: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for LedgerTransaction {
    type Error = StoreError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str| StoreError::Corrupt(format!("{} of entry {}", field, row.id));

        Ok(LedgerTransaction {
            kind: LedgerKind::from_db(&row.kind).ok_or_else(|| corrupt("kind"))?,
            balance_type: row
                .balance_type
                .parse::<BalanceType>()
                .map_err(|_| corrupt("balance_type"))?,
            status: EntryStatus::from_db(&row.status).ok_or_else(|| corrupt("status"))?,
            id: row.id,
            seq: row.seq,
            account_id: row.account_id,
            delta: row.delta,
            idempotency_key: row.idempotency_key,
            match_id: row.match_id,
            withdrawal_id: row.withdrawal_id,
            deposit_address: row.deposit_address,
            chain_amount_sats: row.chain_amount_sats,
            chain_reference: row.chain_reference,
            note: row.note,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct EscrowRow {
    match_id: Uuid,
    account_a: Uuid,
    account_b: Uuid,
    balance_type: String,
    stake: i64,
    state: String,
    outcome: Option<String>,
    platform_fee: Option<i64>,
    created_at: DateTime<Utc>,
    settled_at: Option<DateTime<Utc>>,
}

impl TryFrom<EscrowRow> for MatchEscrow {
    type Error = StoreError;

    fn try_from(row: EscrowRow) -> Result<Self, Self::Error> {
        let corrupt =
            |field: &str| StoreError::Corrupt(format!("{} of escrow {}", field, row.match_id));

        let outcome = match row.outcome.as_deref() {
            Some(s) => Some(MatchOutcome::from_db(s).ok_or_else(|| corrupt("outcome"))?),
            None => None,
        };

        Ok(MatchEscrow {
            balance_type: row
                .balance_type
                .parse::<BalanceType>()
                .map_err(|_| corrupt("balance_type"))?,
            state: EscrowState::from_db(&row.state).ok_or_else(|| corrupt("state"))?,
            outcome,
            match_id: row.match_id,
            account_a: row.account_a,
            account_b: row.account_b,
            stake: row.stake,
            platform_fee: row.platform_fee,
            created_at: row.created_at,
            settled_at: row.settled_at,
        })
    }
}

/// 写入一条流水；幂等键冲突时返回 None
pub(crate) async fn insert_entry(
    conn: &mut PgConnection,
    entry: NewLedgerEntry,
) -> Result<Option<LedgerTransaction>, StoreError> {
    let row = sqlx::query_as::<_, LedgerRow>(&format!(
        "INSERT INTO ledger_transactions
            (id, account_id, kind, balance_type, delta, status, idempotency_key, match_id,
             withdrawal_id, deposit_address, chain_amount_sats, chain_reference, note)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
         ON CONFLICT (idempotency_key) DO NOTHING
         RETURNING {ENTRY_COLUMNS}"
    ))
    .bind(entry.id)
    .bind(entry.account_id)
    .bind(entry.kind.to_db_string())
    .bind(entry.balance_type.to_db_string())
    .bind(entry.delta)
    .bind(entry.status.to_db_string())
    .bind(&entry.idempotency_key)
    .bind(entry.match_id)
    .bind(entry.withdrawal_id)
    .bind(&entry.deposit_address)
    .bind(entry.chain_amount_sats)
    .bind(&entry.chain_reference)
    .bind(&entry.note)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(LedgerTransaction::try_from).transpose()
}

async fn update_entry(conn: &mut PgConnection, update: &EntryUpdate) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE ledger_transactions
         SET status = $2, chain_reference = COALESCE($3, chain_reference), updated_at = NOW()
         WHERE id = $1",
    )
    .bind(update.entry_id)
    .bind(update.status.to_db_string())
    .bind(&update.chain_reference)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::EntryNotFound(update.entry_id));
    }
    Ok(())
}

async fn open_escrow(conn: &mut PgConnection, new: &NewMatchEscrow) -> Result<(), StoreError> {
    let result = sqlx::query(
        "INSERT INTO match_escrows (match_id, account_a, account_b, balance_type, stake, state)
         VALUES ($1, $2, $3, $4, $5, 'escrowed')
         ON CONFLICT (match_id) DO NOTHING",
    )
    .bind(new.match_id)
    .bind(new.account_a)
    .bind(new.account_b)
    .bind(new.balance_type.to_db_string())
    .bind(new.stake)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::EscrowExists(new.match_id));
    }
    Ok(())
}

async fn settle_escrow(
    conn: &mut PgConnection,
    match_id: Uuid,
    outcome: MatchOutcome,
    platform_fee: i64,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE match_escrows
         SET state = 'settled', outcome = $2, platform_fee = $3, settled_at = NOW()
         WHERE match_id = $1 AND state = 'escrowed'",
    )
    .bind(match_id)
    .bind(outcome.to_db_string())
    .bind(platform_fee)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    let exists: Option<String> =
        sqlx::query_scalar("SELECT state FROM match_escrows WHERE match_id = $1")
            .bind(match_id)
            .fetch_optional(&mut *conn)
            .await?;

    match exists {
        Some(_) => Err(StoreError::EscrowSettled(match_id)),
        None => Err(StoreError::EscrowNotFound(match_id)),
    }
}

/// 在单个数据库事务中提交批次
pub async fn apply(
    pool: &PgPool,
    lock_timeout_ms: u64,
    batch: LedgerBatch,
) -> Result<Vec<LedgerTransaction>, StoreError> {
    let mut tx = pool.begin().await?;

    // 锁等待超时映射为 55P03 → Conflict
    sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", lock_timeout_ms))
        .execute(&mut *tx)
        .await?;

    let touched = batch.touched_accounts();
    let present = pg_accounts::lock_accounts(&mut tx, &touched).await?;
    if let Some(missing) = touched.iter().find(|id| !present.contains(id)) {
        return Err(StoreError::AccountNotFound(*missing));
    }

    // 账户行已锁定，同一地址的其他入账只能在本事务之后提交
    if let Some(guard) = &batch.deposit_guard {
        check_deposit_guard(&mut tx, guard).await?;
    }

    for ((account_id, balance_type), delta) in batch.net_deltas()? {
        if delta != 0 && !pg_accounts::apply_delta(&mut tx, account_id, balance_type, delta).await?
        {
            return Err(StoreError::InsufficientFunds {
                account_id,
                balance_type,
            });
        }
    }

    let mut inserted = Vec::with_capacity(batch.postings.len());
    for posting in batch.postings {
        let key = posting.idempotency_key.clone();
        match insert_entry(&mut tx, posting).await? {
            Some(record) => inserted.push(record),
            None => return Err(StoreError::DuplicateIdempotencyKey(key.unwrap_or_default())),
        }
    }

    for update in &batch.entry_updates {
        update_entry(&mut tx, update).await?;
    }

    match &batch.escrow {
        Some(EscrowChange::Open(new)) => open_escrow(&mut tx, new).await?,
        Some(EscrowChange::Settle {
            match_id,
            outcome,
            platform_fee,
        }) => settle_escrow(&mut tx, *match_id, *outcome, *platform_fee).await?,
        None => {}
    }

    if let Some(change) = &batch.withdrawal {
        pg_withdrawals::apply_change(&mut tx, change).await?;
    }

    if let Some(claim) = &batch.bonus {
        pg_accounts::claim_bonus(&mut tx, claim).await?;
    }

    tx.commit().await?;
    Ok(inserted)
}

pub async fn find_by_idempotency_key(
    pool: &PgPool,
    key: &str,
) -> Result<Option<LedgerTransaction>, StoreError> {
    let row = sqlx::query_as::<_, LedgerRow>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM ledger_transactions WHERE idempotency_key = $1"
    ))
    .bind(key)
    .fetch_optional(pool)
    .await?;

    row.map(LedgerTransaction::try_from).transpose()
}

const CREDITED_TOTAL_SQL: &str = "SELECT COALESCE(SUM(chain_amount_sats), 0)::BIGINT
     FROM ledger_transactions
     WHERE kind = 'deposit' AND status = 'confirmed' AND deposit_address = $1";

async fn check_deposit_guard(
    conn: &mut PgConnection,
    guard: &DepositGuard,
) -> Result<(), StoreError> {
    let total: i64 = sqlx::query_scalar(CREDITED_TOTAL_SQL)
        .bind(&guard.address)
        .fetch_one(&mut *conn)
        .await?;

    let actual = total.max(0) as u64;
    if actual != guard.credited_before {
        return Err(StoreError::StaleDepositTotal {
            address: guard.address.clone(),
            expected: guard.credited_before,
            actual,
        });
    }
    Ok(())
}

pub async fn credited_deposit_total(pool: &PgPool, address: &str) -> Result<u64, StoreError> {
    let total: i64 = sqlx::query_scalar(CREDITED_TOTAL_SQL)
        .bind(address)
        .fetch_one(pool)
        .await?;

    Ok(total.max(0) as u64)
}

pub async fn list_transactions(
    pool: &PgPool,
    account_id: Uuid,
    page: PageRequest,
) -> Result<(Vec<LedgerTransaction>, u64), StoreError> {
    let rows = sqlx::query_as::<_, LedgerRow>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM ledger_transactions
         WHERE account_id = $1
         ORDER BY seq DESC
         LIMIT $2 OFFSET $3"
    ))
    .bind(account_id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(pool)
    .await?;

    let total: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM ledger_transactions WHERE account_id = $1")
            .bind(account_id)
            .fetch_one(pool)
            .await?;

    let data = rows
        .into_iter()
        .map(LedgerTransaction::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((data, total.max(0) as u64))
}

pub async fn find_escrow(pool: &PgPool, match_id: Uuid) -> Result<Option<MatchEscrow>, StoreError> {
    let row = sqlx::query_as::<_, EscrowRow>(
        "SELECT match_id, account_a, account_b, balance_type, stake, state, outcome,
                platform_fee, created_at, settled_at
         FROM match_escrows WHERE match_id = $1",
    )
    .bind(match_id)
    .fetch_optional(pool)
    .await?;

    row.map(MatchEscrow::try_from).transpose()
}
