//! 账本并发性质测试
//!
//! 多线程运行时下并发扣款、并发托管，检查余额守恒

mod common;

use std::sync::Arc;

use common::harness;
use oxledger::{
    domain::{BalanceType, LedgerKind, MatchOutcome},
    error::EngineError,
    service::{EscrowRequest, LedgerService},
};
use uuid::Uuid;

async fn funded(ledger: &LedgerService, name: &str, real: i64) -> Uuid {
    let id = ledger.open_account(name).await.unwrap().id;
    if real > 0 {
        ledger
            .adjust_balance(id, BalanceType::RealMoney, real, "test funding")
            .await
            .unwrap();
    }
    id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_debits_never_overdraw() {
    let h = harness();
    let ledger = h.ledger().clone();
    let id = funded(&ledger, "alice", 1_000).await;

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let ledger = Arc::clone(&ledger);
            let amount = 30 + (i % 5) * 10;
            tokio::spawn(async move {
                ledger
                    .debit(id, BalanceType::RealMoney, amount, LedgerKind::AdminAdjustment)
                    .await
                    .map(|_| amount)
            })
        })
        .collect();

    let mut debited = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(amount) => debited += amount,
            Err(EngineError::InsufficientFunds { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    let balance = h.real_balance(id).await;
    assert!(balance >= 0);
    assert_eq!(balance, 1_000 - debited);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_escrows_are_all_or_nothing() {
    let h = harness();
    let ledger = h.ledger().clone();
    let a = funded(&ledger, "a", 100).await;
    let b = funded(&ledger, "b", 100).await;
    let c = funded(&ledger, "c", 100).await;

    // a 同时参加多场对局，与其他扣款交错
    let handles: Vec<_> = (0..12)
        .map(|i| {
            let ledger = Arc::clone(&ledger);
            let opponent = if i % 2 == 0 { b } else { c };
            tokio::spawn(async move {
                ledger
                    .escrow_stake(EscrowRequest {
                        match_id: Uuid::new_v4(),
                        account_a: a,
                        account_b: opponent,
                        balance_type: BalanceType::RealMoney,
                        stake: 15,
                    })
                    .await
                    .map(|_| opponent)
            })
        })
        .collect();

    let mut escrows_with_b = 0;
    let mut escrows_with_c = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(opponent) if opponent == b => escrows_with_b += 1,
            Ok(_) => escrows_with_c += 1,
            Err(EngineError::InsufficientFunds { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    let total = escrows_with_b + escrows_with_c;
    assert_eq!(h.real_balance(a).await, 100 - 15 * total);
    assert_eq!(h.real_balance(b).await, 100 - 15 * escrows_with_b);
    assert_eq!(h.real_balance(c).await, 100 - 15 * escrows_with_c);
    // a 最多能押 6 场
    assert_eq!(total, 6);
}

#[tokio::test]
async fn test_win_example_with_five_percent_fee() {
    let h = harness();
    let ledger = h.ledger();
    let a = funded(ledger, "a", 20).await;
    let b = funded(ledger, "b", 20).await;
    let match_id = Uuid::new_v4();

    ledger
        .escrow_stake(EscrowRequest {
            match_id,
            account_a: a,
            account_b: b,
            balance_type: BalanceType::RealMoney,
            stake: 10,
        })
        .await
        .unwrap();
    assert_eq!(h.real_balance(a).await, 10);
    assert_eq!(h.real_balance(b).await, 10);

    let settlement = ledger.settle_match(match_id, MatchOutcome::AWins).await.unwrap();
    assert_eq!(settlement.platform_fee, 1);
    assert_eq!(h.real_balance(a).await, 29);
    assert_eq!(h.real_balance(b).await, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_settlement_pays_once() {
    let h = harness();
    let ledger = h.ledger().clone();
    let a = funded(&ledger, "a", 50).await;
    let b = funded(&ledger, "b", 50).await;
    let match_id = Uuid::new_v4();

    ledger
        .escrow_stake(EscrowRequest {
            match_id,
            account_a: a,
            account_b: b,
            balance_type: BalanceType::RealMoney,
            stake: 20,
        })
        .await
        .unwrap();

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.settle_match(match_id, MatchOutcome::Draw).await })
        })
        .collect();

    let mut settled = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => settled += 1,
            Err(EngineError::EscrowAlreadySettled(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(settled, 1);
    assert_eq!(h.real_balance(a).await, 50);
    assert_eq!(h.real_balance(b).await, 50);
}
