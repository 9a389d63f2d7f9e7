//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Non-negativity: available ≥ 0 and locked ≥ 0 without allow_negative
//! - Conservation: Σ(entry amounts) == available + locked == credited − debited
//! - Idempotency: a replayed key has one effect and an equal result
//! - Journal replay: reopening the store yields the same wallet

use ledger_core::{
    AccountId, Config, Currency, Error, HoldId, IdempotencyKey, Reference, WalletId, WalletLedger,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::thread;
use uuid::Uuid;

/// Strategy for generating valid amounts (two decimal places)
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..50_000i64).prop_map(|cents| Decimal::new(cents, 2))
}

#[derive(Debug, Clone)]
enum Op {
    Topup(Decimal),
    Debit(Decimal),
    Hold(Decimal),
    Capture(usize),
    Release(usize),
    Refund(usize, Decimal),
    Adjust(Decimal),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        amount_strategy().prop_map(Op::Topup),
        amount_strategy().prop_map(Op::Debit),
        amount_strategy().prop_map(Op::Hold),
        any::<usize>().prop_map(Op::Capture),
        any::<usize>().prop_map(Op::Release),
        (any::<usize>(), amount_strategy()).prop_map(|(i, a)| Op::Refund(i, a)),
        (-20_000i64..20_000i64)
            .prop_filter("non-zero", |c| *c != 0)
            .prop_map(|c| Op::Adjust(Decimal::new(c, 2))),
    ]
}

/// A mutation that succeeded, with its concrete arguments
#[derive(Debug, Clone)]
enum Call {
    Topup(Decimal, Reference, IdempotencyKey),
    Debit(Decimal, Reference, IdempotencyKey),
    Hold(Decimal, Reference, IdempotencyKey),
    Capture(HoldId, IdempotencyKey),
    Release(HoldId, IdempotencyKey),
    Refund(Decimal, Reference, Uuid, IdempotencyKey),
    Adjust(Decimal, IdempotencyKey),
}

/// Apply a sequence of operations; rejections are expected and skipped
fn run_ops(ledger: &WalletLedger, wallet_id: WalletId, ops: &[Op]) -> Vec<Call> {
    let mut holds: Vec<HoldId> = Vec::new();
    let mut debits: Vec<Uuid> = Vec::new();
    let mut applied = Vec::new();

    for (i, op) in ops.iter().enumerate() {
        let call = match op {
            Op::Topup(amount) => Call::Topup(
                *amount,
                Reference::gateway(i.to_string()),
                IdempotencyKey::new(format!("op-{}", i)),
            ),
            Op::Debit(amount) => Call::Debit(
                *amount,
                Reference::shipment(i.to_string()),
                IdempotencyKey::new(format!("op-{}", i)),
            ),
            Op::Hold(amount) => Call::Hold(
                *amount,
                Reference::shipment(i.to_string()),
                IdempotencyKey::new(format!("op-{}", i)),
            ),
            Op::Capture(idx) if !holds.is_empty() => Call::Capture(
                holds[idx % holds.len()],
                IdempotencyKey::new(format!("op-{}", i)),
            ),
            Op::Release(idx) if !holds.is_empty() => Call::Release(
                holds[idx % holds.len()],
                IdempotencyKey::new(format!("op-{}", i)),
            ),
            Op::Refund(idx, amount) if !debits.is_empty() => Call::Refund(
                *amount,
                Reference::shipment(i.to_string()),
                debits[idx % debits.len()],
                IdempotencyKey::new(format!("op-{}", i)),
            ),
            Op::Adjust(amount) => Call::Adjust(*amount, IdempotencyKey::new(format!("op-{}", i))),
            _ => continue,
        };

        match apply(ledger, wallet_id, &call) {
            Ok(Applied::Hold(hold_id)) => holds.push(hold_id),
            Ok(Applied::Entry(entry_id, true)) => debits.push(entry_id),
            Ok(Applied::Entry(_, false)) => {}
            Err(_) => continue,
        }
        applied.push(call);
    }

    applied
}

enum Applied {
    Hold(HoldId),
    /// Entry ID and whether it can be refunded
    Entry(Uuid, bool),
}

fn apply(ledger: &WalletLedger, wallet_id: WalletId, call: &Call) -> ledger_core::Result<Applied> {
    let applied = match call.clone() {
        Call::Topup(amount, reference, key) => {
            Applied::Entry(ledger.topup(wallet_id, amount, reference, key)?.entry_id, false)
        }
        Call::Debit(amount, reference, key) => {
            Applied::Entry(ledger.debit(wallet_id, amount, reference, key)?.entry_id, true)
        }
        Call::Hold(amount, reference, key) => {
            Applied::Hold(ledger.hold(wallet_id, amount, reference, key)?.hold_id)
        }
        Call::Capture(hold_id, key) => Applied::Entry(ledger.capture_hold(hold_id, key)?.entry_id, true),
        Call::Release(hold_id, key) => Applied::Entry(ledger.release_hold(hold_id, key)?.entry_id, false),
        Call::Refund(amount, reference, original, key) => Applied::Entry(
            ledger.refund(wallet_id, amount, reference, original, key)?.entry_id,
            false,
        ),
        Call::Adjust(amount, key) => {
            Applied::Entry(ledger.adjust(wallet_id, amount, "property", key)?.entry_id, false)
        }
    };
    Ok(applied)
}

fn new_wallet(ledger: &WalletLedger) -> WalletId {
    ledger
        .open_wallet(AccountId::new(Uuid::new_v4().to_string()), Currency::SAR, false)
        .unwrap()
        .wallet_id
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: balances never go negative without allow_negative
    #[test]
    fn prop_balances_non_negative(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let ledger = WalletLedger::in_memory().unwrap();
        let wallet_id = new_wallet(&ledger);
        run_ops(&ledger, wallet_id, &ops);

        let wallet = ledger.wallet(wallet_id).unwrap();
        prop_assert!(wallet.available_balance >= Decimal::ZERO);
        prop_assert!(wallet.locked_balance >= Decimal::ZERO);
        for entry in ledger.entries(wallet_id).unwrap() {
            prop_assert!(entry.available_after >= Decimal::ZERO);
            prop_assert!(entry.locked_after >= Decimal::ZERO);
        }
    }

    /// Property: Σ(entries) == available + locked == credited − debited
    #[test]
    fn prop_entries_sum_to_balances(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let ledger = WalletLedger::in_memory().unwrap();
        let wallet_id = new_wallet(&ledger);
        run_ops(&ledger, wallet_id, &ops);

        let wallet = ledger.wallet(wallet_id).unwrap();
        let entries = ledger.entries(wallet_id).unwrap();
        let sum: Decimal = entries.iter().map(|e| e.amount).sum();

        prop_assert_eq!(sum, wallet.available_balance + wallet.locked_balance);
        prop_assert_eq!(sum, wallet.total_credited - wallet.total_debited);
        if let Some(last) = entries.last() {
            prop_assert_eq!(last.running_balance, wallet.book_balance());
            prop_assert_eq!(last.sequence, wallet.last_sequence);
        }

        let audit = ledger.verify_wallet(wallet_id).unwrap();
        prop_assert!(audit.is_consistent(), "audit: {:?}", audit);
    }

    /// Property: sequences start at 1 and increase by exactly 1
    #[test]
    fn prop_sequences_contiguous(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let ledger = WalletLedger::in_memory().unwrap();
        let wallet_id = new_wallet(&ledger);
        run_ops(&ledger, wallet_id, &ops);

        for (i, entry) in ledger.entries(wallet_id).unwrap().iter().enumerate() {
            prop_assert_eq!(entry.sequence, i as u64 + 1);
        }
    }

    /// Property: replaying every key has no further effect
    #[test]
    fn prop_replay_is_noop(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let ledger = WalletLedger::in_memory().unwrap();
        let wallet_id = new_wallet(&ledger);
        let applied = run_ops(&ledger, wallet_id, &ops);

        let wallet = ledger.wallet(wallet_id).unwrap();
        let entries = ledger.entries(wallet_id).unwrap();

        for call in &applied {
            prop_assert!(apply(&ledger, wallet_id, call).is_ok(), "replay failed: {:?}", call);
        }

        prop_assert_eq!(ledger.entries(wallet_id).unwrap(), entries);
        let after = ledger.wallet(wallet_id).unwrap();
        prop_assert_eq!(after.available_balance, wallet.available_balance);
        prop_assert_eq!(after.locked_balance, wallet.locked_balance);
    }

    /// Property: refunds never exceed the original debit
    #[test]
    fn prop_refunds_bounded(debit in amount_strategy(), refunds in prop::collection::vec(amount_strategy(), 1..10)) {
        let ledger = WalletLedger::in_memory().unwrap();
        let wallet_id = new_wallet(&ledger);
        ledger.topup(wallet_id, Decimal::new(1_000_000, 2), Reference::gateway("seed"), "seed".into()).unwrap();
        let original = ledger.debit(wallet_id, debit, Reference::shipment("1"), "debit".into()).unwrap();

        let mut refunded = Decimal::ZERO;
        for (i, amount) in refunds.iter().enumerate() {
            let result = ledger.refund(
                wallet_id,
                *amount,
                Reference::shipment("1"),
                original.entry_id,
                IdempotencyKey::new(format!("refund-{}", i)),
            );
            match result {
                Ok(_) => refunded += *amount,
                Err(Error::RefundExceedsOriginal { .. }) => {
                    prop_assert!(refunded + *amount > debit);
                }
                Err(e) => prop_assert!(false, "unexpected error: {}", e),
            }
        }
        prop_assert!(refunded <= debit);
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_idempotent_operations_return_equal_results() {
        let ledger = WalletLedger::in_memory().unwrap();
        let wallet_id = new_wallet(&ledger);

        let t1 = ledger.topup(wallet_id, dec!(100), Reference::gateway("g"), "t".into()).unwrap();
        let t2 = ledger.topup(wallet_id, dec!(100), Reference::gateway("g"), "t".into()).unwrap();
        assert_eq!(t1, t2);

        let h1 = ledger.hold(wallet_id, dec!(40), Reference::shipment("s"), "h".into()).unwrap();
        let h2 = ledger.hold(wallet_id, dec!(40), Reference::shipment("s"), "h".into()).unwrap();
        assert_eq!(h1, h2);

        let c1 = ledger.capture_hold(h1.hold_id, "c".into()).unwrap();
        let c2 = ledger.capture_hold(h1.hold_id, "c".into()).unwrap();
        assert_eq!(c1, c2);

        let r1 = ledger
            .refund(wallet_id, dec!(40), Reference::shipment("s"), c1.entry_id, "r".into())
            .unwrap();
        let r2 = ledger
            .refund(wallet_id, dec!(40), Reference::shipment("s"), c1.entry_id, "r".into())
            .unwrap();
        assert_eq!(r1, r2);

        let h3 = ledger.hold(wallet_id, dec!(10), Reference::shipment("t"), "h3".into()).unwrap();
        let rel1 = ledger.release_hold(h3.hold_id, "rel".into()).unwrap();
        let rel2 = ledger.release_hold(h3.hold_id, "rel".into()).unwrap();
        assert_eq!(rel1, rel2);

        let wallet = ledger.wallet(wallet_id).unwrap();
        assert_eq!(wallet.available_balance, dec!(100));
        assert_eq!(wallet.locked_balance, dec!(0));
        assert_eq!(ledger.entries(wallet_id).unwrap().len(), 4);
    }

    #[test]
    fn test_unrelated_wallets_do_not_block() {
        let ledger = Arc::new(WalletLedger::in_memory().unwrap());
        let wallets: Vec<WalletId> = (0..8).map(|_| new_wallet(&ledger)).collect();

        let handles: Vec<_> = wallets
            .iter()
            .map(|wallet_id| {
                let ledger = Arc::clone(&ledger);
                let wallet_id = *wallet_id;
                thread::spawn(move || {
                    for i in 0..50 {
                        ledger
                            .topup(
                                wallet_id,
                                dec!(1),
                                Reference::gateway(format!("{}-{}", wallet_id, i)),
                                IdempotencyKey::new(format!("t{}", i)),
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for wallet_id in wallets {
            let wallet = ledger.wallet(wallet_id).unwrap();
            assert_eq!(wallet.available_balance, dec!(50));
            assert_eq!(wallet.last_sequence, 50);
        }
    }

    #[test]
    fn test_journal_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: Some(temp_dir.path().to_path_buf()),
            ..Config::default()
        };

        let (wallet_id, before) = {
            let ledger = WalletLedger::open(config.clone()).unwrap();
            let wallet_id = new_wallet(&ledger);
            ledger.topup(wallet_id, dec!(100), Reference::gateway("g"), "t".into()).unwrap();
            let debit = ledger.debit(wallet_id, dec!(30), Reference::shipment("s"), "d".into()).unwrap();
            ledger
                .refund(wallet_id, dec!(10), Reference::shipment("s"), debit.entry_id, "r".into())
                .unwrap();
            (wallet_id, ledger.entries(wallet_id).unwrap())
        };

        let ledger = WalletLedger::open(config).unwrap();
        assert_eq!(ledger.entries(wallet_id).unwrap(), before);

        // Refund tally is rebuilt from entries
        let err = ledger
            .refund(wallet_id, dec!(25), Reference::shipment("s"), before[1].entry_id, "r2".into())
            .unwrap_err();
        assert!(matches!(err, Error::RefundExceedsOriginal { .. }));
    }

    #[test]
    fn test_reversed_debit_cannot_be_refunded() {
        let ledger = WalletLedger::in_memory().unwrap();
        let wallet_id = new_wallet(&ledger);
        ledger.topup(wallet_id, dec!(100), Reference::gateway("g"), "t".into()).unwrap();
        let debit = ledger.debit(wallet_id, dec!(40), Reference::shipment("s"), "d".into()).unwrap();

        ledger.reverse(wallet_id, debit.entry_id, "rv".into()).unwrap();
        let err = ledger
            .refund(wallet_id, dec!(40), Reference::shipment("s"), debit.entry_id, "r".into())
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyReversed(_)));

        let wallet = ledger.wallet(wallet_id).unwrap();
        assert_eq!(wallet.available_balance, dec!(100));
        assert_eq!(wallet.total_credited - wallet.total_debited, dec!(100));
    }

    #[test]
    fn test_refunded_debit_cannot_be_reversed() {
        let ledger = WalletLedger::in_memory().unwrap();
        let wallet_id = new_wallet(&ledger);
        ledger.topup(wallet_id, dec!(100), Reference::gateway("g"), "t".into()).unwrap();
        let debit = ledger.debit(wallet_id, dec!(40), Reference::shipment("s"), "d".into()).unwrap();

        // Even a partial refund blocks the reversal
        ledger
            .refund(wallet_id, dec!(15), Reference::shipment("s"), debit.entry_id, "r".into())
            .unwrap();
        let err = ledger.reverse(wallet_id, debit.entry_id, "rv".into()).unwrap_err();
        assert!(matches!(err, Error::AlreadyRefunded(_)));

        // The rest is still refundable, and nothing beyond it
        ledger
            .refund(wallet_id, dec!(25), Reference::shipment("s"), debit.entry_id, "r2".into())
            .unwrap();
        assert_eq!(ledger.wallet(wallet_id).unwrap().available_balance, dec!(100));
    }

    #[test]
    fn test_negative_adjustment_needs_funds_and_active_wallet() {
        let ledger = WalletLedger::in_memory().unwrap();
        let wallet_id = new_wallet(&ledger);
        ledger.topup(wallet_id, dec!(20), Reference::gateway("g"), "t".into()).unwrap();

        let err = ledger.adjust(wallet_id, dec!(-25), "write-off", "a1".into()).unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));

        let entry = ledger.adjust(wallet_id, dec!(-5), "write-off", "a2".into()).unwrap();
        assert_eq!(entry.amount, dec!(-5));
        assert_eq!(ledger.wallet(wallet_id).unwrap().available_balance, dec!(15));

        ledger.freeze(wallet_id).unwrap();
        let err = ledger.adjust(wallet_id, dec!(-5), "write-off", "a3".into()).unwrap_err();
        assert!(matches!(err, Error::WalletFrozen(_)));
        let err = ledger.adjust(wallet_id, dec!(5), "goodwill", "a4".into()).unwrap_err();
        assert!(matches!(err, Error::WalletFrozen(_)));
        assert_eq!(ledger.wallet(wallet_id).unwrap().available_balance, dec!(15));
    }

    #[test]
    fn test_frozen_wallet_rejects_reversals() {
        let ledger = WalletLedger::in_memory().unwrap();
        let wallet_id = new_wallet(&ledger);
        let topup = ledger.topup(wallet_id, dec!(50), Reference::gateway("g"), "t".into()).unwrap();
        let debit = ledger.debit(wallet_id, dec!(10), Reference::shipment("s"), "d".into()).unwrap();
        ledger.freeze(wallet_id).unwrap();

        let err = ledger.reverse(wallet_id, topup.entry_id, "rv1".into()).unwrap_err();
        assert!(matches!(err, Error::WalletFrozen(_)));
        let err = ledger.reverse(wallet_id, debit.entry_id, "rv2".into()).unwrap_err();
        assert!(matches!(err, Error::WalletFrozen(_)));

        ledger.unfreeze(wallet_id).unwrap();
        let reversal = ledger.reverse(wallet_id, debit.entry_id, "rv2".into()).unwrap();
        assert_eq!(reversal.amount, dec!(10));
        assert_eq!(ledger.wallet(wallet_id).unwrap().available_balance, dec!(50));
    }

    #[test]
    fn test_reconciliation_flags_currency_mismatch() {
        use ledger_core::{DiscrepancyKind, GatewayTopupRecord, ReconciliationJob};

        let ledger = Arc::new(WalletLedger::in_memory().unwrap());
        let wallet = ledger
            .open_wallet(AccountId::new("acct-fx"), Currency::SAR, false)
            .unwrap();
        ledger
            .topup(wallet.wallet_id, dec!(100), Reference::gateway("txn-usd"), "t".into())
            .unwrap();

        let record = GatewayTopupRecord {
            gateway_txn_id: "txn-usd".to_string(),
            account_id: AccountId::new("acct-fx"),
            amount: dec!(100),
            currency: Currency::USD,
            settled_at: chrono::Utc::now(),
        };
        let report = ReconciliationJob::new(Arc::clone(&ledger)).run(&[record]).unwrap();

        assert!(!report.is_clean());
        assert_eq!(report.matched, 0);
        assert_eq!(report.count(DiscrepancyKind::CurrencyMismatch), 1);
        assert_eq!(report.count(DiscrepancyKind::AmountMismatch), 0);
    }
}
