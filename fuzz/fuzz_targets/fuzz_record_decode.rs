//! Fuzz target for outbox record decoding.
//!
//! Rows come back from SQLite as raw text; decoding must reject garbage
//! with `MalformedRecord`, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use outbox_mirror::{MirrorError, OperationRecord};

fuzz_target!(|data: (&str, &str)| {
    let (op, payload) = data;
    let record = OperationRecord {
        id: 1,
        operation_id: "fuzz".to_string(),
        model_name: "Wallet".to_string(),
        op: op.to_string(),
        payload: payload.to_string(),
        attempts: 0,
        created_at: 0,
        next_attempt_at: 0,
        last_error: None,
    };

    match record.operation() {
        Ok((kind, decoded)) => {
            assert_eq!(kind.as_str(), op);
            // Anything that decoded must encode again
            assert!(decoded.to_json().is_ok());
        }
        Err(MirrorError::MalformedRecord { id, .. }) => assert_eq!(id, 1),
        Err(other) => panic!("unexpected error kind: {other}"),
    }
});
