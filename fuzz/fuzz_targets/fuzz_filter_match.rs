//! Fuzz target for `where` matching.
//!
//! Row and filter are arbitrary JSON objects; matching must not panic and
//! an empty filter matches everything.

#![no_main]

use libfuzzer_sys::fuzz_target;
use outbox_mirror::store::matches_filter;
use outbox_mirror::Fields;

fuzz_target!(|data: (&str, &str)| {
    let (row, filter) = data;
    let Ok(row) = serde_json::from_str::<Fields>(row) else {
        return;
    };

    assert!(matches_filter(&row, &Fields::new()));
    assert!(matches_filter(&row, &row));

    if let Ok(filter) = serde_json::from_str::<Fields>(filter) {
        let _ = matches_filter(&row, &filter);
    }
});
