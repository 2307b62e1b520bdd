// 账户表访问（PostgreSQL）

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

use super::{BonusClaim, DepositTarget, StoreError};
use crate::{
    domain::{Account, Balances, BalanceType, LedgerKind, NewAccount, NewLedgerEntry},
    infrastructure::db::PgPool,
};

const ACCOUNT_COLUMNS: &str = "id, external_ref, play_balance, real_balance, deposit_address, \
     derivation_index, last_bonus_at, created_at, updated_at";

#[derive(Debug, FromRow)]
pub(crate) struct AccountRow {
    pub id: Uuid,
    pub external_ref: String,
    pub play_balance: i64,
    pub real_balance: i64,
    pub deposit_address: Option<String>,
    pub derivation_index: Option<i64>,
    pub last_bonus_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        let derivation_index = row
            .derivation_index
            .map(u32::try_from)
            .transpose()
            .map_err(|_| StoreError::Corrupt(format!("derivation_index of account {}", row.id)))?;

        Ok(Account {
            id: row.id,
            external_ref: row.external_ref,
            balances: Balances {
                play_money: row.play_balance,
                real_money: row.real_balance,
            },
            deposit_address: row.deposit_address,
            derivation_index,
            last_bonus_at: row.last_bonus_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

pub async fn create_account(pool: &PgPool, new: NewAccount) -> Result<Account, StoreError> {
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query_as::<_, AccountRow>(&format!(
        "INSERT INTO accounts (id, external_ref, play_balance)
         VALUES ($1, $2, $3)
         ON CONFLICT (external_ref) DO NOTHING
         RETURNING {ACCOUNT_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(&new.external_ref)
    .bind(new.play_money_grant)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = inserted else {
        // 已开户
        tx.rollback().await?;
        return find_account_by_ref(pool, &new.external_ref)
            .await?
            .ok_or_else(|| StoreError::Conflict("account vanished after insert conflict".into()));
    };

    if new.play_money_grant > 0 {
        let grant = NewLedgerEntry::new(
            row.id,
            LedgerKind::SignupGrant,
            BalanceType::PlayMoney,
            new.play_money_grant,
        );
        super::pg_ledger::insert_entry(&mut tx, grant).await?;
    }

    tx.commit().await?;
    row.try_into()
}

pub async fn find_account(pool: &PgPool, id: Uuid) -> Result<Option<Account>, StoreError> {
    let row = sqlx::query_as::<_, AccountRow>(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(Account::try_from).transpose()
}

pub async fn find_account_by_ref(
    pool: &PgPool,
    external_ref: &str,
) -> Result<Option<Account>, StoreError> {
    let row = sqlx::query_as::<_, AccountRow>(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE external_ref = $1"
    ))
    .bind(external_ref)
    .fetch_optional(pool)
    .await?;

    row.map(Account::try_from).transpose()
}

pub async fn assign_deposit_address(
    pool: &PgPool,
    id: Uuid,
    index: u32,
    address: &str,
) -> Result<Account, StoreError> {
    let updated = sqlx::query_as::<_, AccountRow>(&format!(
        "UPDATE accounts
         SET deposit_address = $2, derivation_index = $3, updated_at = NOW()
         WHERE id = $1 AND deposit_address IS NULL
         RETURNING {ACCOUNT_COLUMNS}"
    ))
    .bind(id)
    .bind(address)
    .bind(index as i64)
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::AddressTaken(address.to_string())
        } else {
            e.into()
        }
    })?;

    match updated {
        Some(row) => row.try_into(),
        // 地址已存在（或账户不存在）
        None => find_account(pool, id)
            .await?
            .ok_or(StoreError::AccountNotFound(id)),
    }
}

pub async fn list_deposit_targets(pool: &PgPool) -> Result<Vec<DepositTarget>, StoreError> {
    let rows = sqlx::query_as::<_, (Uuid, String)>(
        "SELECT id, deposit_address FROM accounts
         WHERE deposit_address IS NOT NULL
         ORDER BY deposit_address",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(account_id, address)| DepositTarget {
            account_id,
            address,
        })
        .collect())
}

/// 按 id 升序锁定账户行，返回实际存在的 id
pub(crate) async fn lock_accounts(
    conn: &mut PgConnection,
    ids: &[Uuid],
) -> Result<HashSet<Uuid>, StoreError> {
    if ids.is_empty() {
        return Ok(HashSet::new());
    }

    let rows = sqlx::query_scalar::<_, Uuid>(
        "SELECT id FROM accounts WHERE id = ANY($1) ORDER BY id FOR UPDATE",
    )
    .bind(ids)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().collect())
}

/// 条件更新余额：结果为负时不生效并返回 false
pub(crate) async fn apply_delta(
    conn: &mut PgConnection,
    id: Uuid,
    balance_type: BalanceType,
    delta: i64,
) -> Result<bool, StoreError> {
    // 列名来自封闭枚举
    let column = balance_type.balance_column();
    let result = sqlx::query(&format!(
        "UPDATE accounts SET {column} = {column} + $2, updated_at = NOW()
         WHERE id = $1 AND {column} + $2 >= 0"
    ))
    .bind(id)
    .bind(delta)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        // 22003 numeric_value_out_of_range
        let overflow = matches!(
            &e,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("22003")
        );
        if overflow {
            StoreError::AmountOverflow {
                account_id: id,
                balance_type,
            }
        } else {
            StoreError::from(e)
        }
    })?;

    Ok(result.rows_affected() == 1)
}

pub(crate) async fn claim_bonus(
    conn: &mut PgConnection,
    claim: &BonusClaim,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE accounts SET last_bonus_at = $2, updated_at = NOW()
         WHERE id = $1 AND (last_bonus_at IS NULL OR last_bonus_at <= $3)",
    )
    .bind(claim.account_id)
    .bind(claim.claimed_at)
    .bind(claim.latest_allowed_previous())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    let last =
        sqlx::query_scalar::<_, Option<DateTime<Utc>>>("SELECT last_bonus_at FROM accounts WHERE id = $1")
            .bind(claim.account_id)
            .fetch_optional(&mut *conn)
            .await?
            .flatten();

    match last {
        Some(last) => Err(StoreError::BonusCooldown {
            next_claim_at: last + claim.cooldown,
        }),
        None => Err(StoreError::AccountNotFound(claim.account_id)),
    }
}
