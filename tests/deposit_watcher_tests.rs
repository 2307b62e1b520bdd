//! 充值监听集成测试
//!
//! 运行方式：
//! ```bash
//! cargo test --test deposit_watcher_tests
//! ```

mod common;

use std::sync::Arc;

use common::harness;
use oxledger::{
    domain::{LedgerKind, PageRequest},
    repository::LedgerRepository,
};
use tokio::sync::Barrier;
use tokio_test::assert_ok;

#[tokio::test]
async fn test_deposit_credited_once_across_rescans() {
    let h = harness();
    let alice = h.open("alice").await;
    let address = h
        .real_money()
        .deposit_addresses
        .get_deposit_address(alice)
        .await
        .unwrap();

    let txid = h.chain.deposit(&address, 100_000);
    let watcher = &h.real_money().deposit_watcher;

    let first = watcher.scan_once().await.unwrap();
    assert_eq!(first.deposits_credited, 1);
    assert_eq!(first.sats_credited, 100_000);
    assert_eq!(h.real_balance(alice).await, 5_000);

    // 链上状态不变，第二次扫描不入账
    let second = assert_ok!(watcher.scan_once().await);
    assert_eq!(second.deposits_credited, 0);
    assert_eq!(h.real_balance(alice).await, 5_000);

    let history = h
        .ledger()
        .list_transactions(alice, PageRequest::default())
        .await
        .unwrap();
    let deposit = history
        .data
        .iter()
        .find(|t| t.kind == LedgerKind::Deposit)
        .unwrap();
    assert_eq!(deposit.chain_reference.as_deref(), Some(txid.as_str()));
    assert_eq!(deposit.chain_amount_sats, Some(100_000));
    assert_eq!(h.store.credited_deposit_total(&address).await.unwrap(), 100_000);
}

#[tokio::test]
async fn test_each_inflow_credited_separately() {
    let h = harness();
    let bob = h.open("bob").await;
    let address = h
        .real_money()
        .deposit_addresses
        .get_deposit_address(bob)
        .await
        .unwrap();

    let first_tx = h.chain.deposit(&address, 40_000);
    let second_tx = h.chain.deposit(&address, 60_000);

    let report = h.real_money().deposit_watcher.scan_once().await.unwrap();
    assert_eq!(report.deposits_credited, 2);
    assert_eq!(h.real_balance(bob).await, 2_000 + 3_000);

    let refs: Vec<_> = h
        .ledger()
        .list_transactions(bob, PageRequest::default())
        .await
        .unwrap()
        .data
        .into_iter()
        .filter_map(|t| t.chain_reference)
        .collect();
    assert!(refs.contains(&first_tx));
    assert!(refs.contains(&second_tx));
}

#[tokio::test]
async fn test_aggregate_delta_without_inflow_listing() {
    let h = harness();
    h.chain.hide_inflows();
    let carol = h.open("carol").await;
    let address = h
        .real_money()
        .deposit_addresses
        .get_deposit_address(carol)
        .await
        .unwrap();
    let watcher = &h.real_money().deposit_watcher;

    h.chain.deposit(&address, 30_000);
    h.chain.deposit(&address, 20_000);
    assert_eq!(watcher.scan_once().await.unwrap().deposits_credited, 1);
    assert_eq!(h.real_balance(carol).await, 2_500);

    // 之后的新充值按新的差额入账
    h.chain.deposit(&address, 10_000);
    assert_eq!(watcher.scan_once().await.unwrap().sats_credited, 10_000);
    assert_eq!(h.real_balance(carol).await, 3_000);
    assert_eq!(watcher.scan_once().await.unwrap().deposits_credited, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_scans_credit_exactly_once() {
    let h = harness();
    let dave = h.open("dave").await;
    let address = h
        .real_money()
        .deposit_addresses
        .get_deposit_address(dave)
        .await
        .unwrap();
    h.chain.deposit(&address, 250_000);

    let watcher = h.real_money().deposit_watcher.clone();
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let watcher = Arc::clone(&watcher);
            tokio::spawn(async move { watcher.scan_once().await.unwrap() })
        })
        .collect();

    let mut credited = 0;
    for handle in handles {
        credited += handle.await.unwrap().deposits_credited;
    }

    assert_eq!(credited, 1);
    assert_eq!(h.real_balance(dave).await, 12_500);
}

#[tokio::test]
async fn test_failing_address_does_not_block_others() {
    let h = harness();
    let erin = h.open("erin").await;
    let frank = h.open("frank").await;
    let addresses = &h.real_money().deposit_addresses;
    let erin_address = addresses.get_deposit_address(erin).await.unwrap();
    let frank_address = addresses.get_deposit_address(frank).await.unwrap();

    h.chain.deposit(&erin_address, 100_000);
    h.chain.deposit(&frank_address, 100_000);
    h.chain.fail_address(&erin_address);

    let report = h.real_money().deposit_watcher.scan_once().await.unwrap();
    assert_eq!(report.addresses_scanned, 2);
    assert_eq!(report.failures, 1);
    assert_eq!(report.deposits_credited, 1);
    assert_eq!(h.real_balance(erin).await, 0);
    assert_eq!(h.real_balance(frank).await, 5_000);
}

#[tokio::test]
async fn test_dust_deposit_below_one_cent_is_recorded() {
    let h = harness();
    let gina = h.open("gina").await;
    let address = h
        .real_money()
        .deposit_addresses
        .get_deposit_address(gina)
        .await
        .unwrap();

    // 10 sats = 0.5 分，向下取整为 0，但链上金额仍计入已入账总额
    h.chain.deposit(&address, 10);
    let report = h.real_money().deposit_watcher.scan_once().await.unwrap();
    assert_eq!(report.deposits_credited, 1);
    assert_eq!(h.real_balance(gina).await, 0);
    assert_eq!(h.store.credited_deposit_total(&address).await.unwrap(), 10);
}

#[tokio::test]
async fn test_instances_with_disagreeing_listings_credit_once() {
    let h = harness();
    let peer = h.peer();
    let hana = h.open("hana").await;
    let address = h
        .real_money()
        .deposit_addresses
        .get_deposit_address(hana)
        .await
        .unwrap();

    // 两个实例看到同一笔充值：一个能逐笔列出，另一个只能按余额差额
    h.chain.deposit(&address, 100_000);
    peer.chain.deposit(&address, 100_000);
    peer.chain.hide_inflows();

    // 双方都读到已入账总额 0 之后才继续
    let barrier = Arc::new(Barrier::new(2));
    h.chain.gate_inflows(barrier.clone());
    peer.chain.gate_inflows(barrier);

    let (ours, theirs) = tokio::join!(
        h.real_money().deposit_watcher.scan_once(),
        peer.real_money().deposit_watcher.scan_once()
    );
    let (ours, theirs) = (ours.unwrap(), theirs.unwrap());

    assert_eq!(ours.deposits_credited + theirs.deposits_credited, 1);
    assert_eq!(ours.duplicates_skipped + theirs.duplicates_skipped, 1);
    assert_eq!(h.real_balance(hana).await, 5_000);
    assert_eq!(h.store.credited_deposit_total(&address).await.unwrap(), 100_000);

    // 之后双方的扫描都不再入账
    assert_eq!(assert_ok!(peer.real_money().deposit_watcher.scan_once().await).deposits_credited, 0);
    assert_eq!(assert_ok!(h.real_money().deposit_watcher.scan_once().await).deposits_credited, 0);
    assert_eq!(h.real_balance(hana).await, 5_000);
}
