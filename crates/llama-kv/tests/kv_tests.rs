//! Integration tests for llama-kv.
//!
//! Validates:
//! - Capacity invariant across arbitrary occupy/clear sequences
//! - Decode-loop style accounting (prompt batch, then one cell per token)
//! - Error payloads carry the numbers callers log

use llama_kv::*;

// ===========================================================================
// Capacity invariant
// ===========================================================================

#[test]
fn used_never_exceeds_capacity_for_any_batch_sequence() {
    let mut ledger = CellLedger::new(16).unwrap();
    let batches = [5usize, 0, 7, 3, 2, 9, 1, 1, 4, 16];

    for &n in &batches {
        let before = ledger.used();
        let result = ledger.occupy(n);
        let after = ledger.used();

        assert!(after <= ledger.capacity(), "{after} > capacity");
        match result {
            Ok(()) => assert_eq!(after, before + n),
            Err(KVError::CapacityExceeded { .. }) => assert_eq!(after, before),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}

#[test]
fn decode_loop_accounting_exhausts_exactly_at_capacity() {
    let capacity = 10;
    let mut ledger = CellLedger::new(capacity).unwrap();

    // Prompt batch.
    ledger.state().check_fits(4).unwrap();
    ledger.occupy(4).unwrap();

    // One cell per generated token until the check refuses.
    let mut generated = 0;
    while ledger.state().check_fits(1).is_ok() {
        ledger.occupy(1).unwrap();
        generated += 1;
    }

    assert_eq!(generated, capacity - 4);
    assert_eq!(ledger.used(), capacity);
    assert_eq!(ledger.state().remaining(), 0);
}

#[test]
fn clear_then_reuse() {
    let mut ledger = CellLedger::new(8).unwrap();
    ledger.occupy(8).unwrap();
    assert!(ledger.occupy(1).is_err());

    ledger.clear();
    assert!(ledger.state().is_empty());
    ledger.occupy(8).unwrap();
}

// ===========================================================================
// Error payloads
// ===========================================================================

#[test]
fn capacity_error_reports_numbers() {
    let state = ContextState::new(8190, 8192).unwrap();
    let err = state.check_fits(5).unwrap_err();
    assert_eq!(
        err,
        KVError::CapacityExceeded {
            requested: 5,
            used: 8190,
            capacity: 8192
        }
    );
    let msg = err.to_string();
    assert!(msg.contains("8190"));
    assert!(msg.contains("8192"));
}

#[test]
fn zero_capacity_ledger_rejected() {
    assert_eq!(CellLedger::new(0).unwrap_err(), KVError::ZeroCapacity);
}

#[test]
fn empty_batch_always_fits_full_cache() {
    let state = ContextState::new(4, 4).unwrap();
    assert!(state.check_fits(0).is_ok());
}
