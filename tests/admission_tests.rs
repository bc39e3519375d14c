//! Combined connection-limit and rate-limit admission scenarios (§4.4),
//! exercising both tables together the way the listener's accept loop in
//! `src/worker.rs` actually calls them back-to-back.

use std::time::Instant;

use xserver::admission::{AdmissionError, ConnectionTable, RateTable};

#[test]
fn a_connection_limited_ip_is_rejected_before_rate_limiting_is_even_checked() {
    let conn_table = ConnectionTable::new(1);
    let rate_table = RateTable::new(1000, 1000);

    conn_table.acquire("10.0.0.1").unwrap();
    assert_eq!(conn_table.acquire("10.0.0.1"), Err(AdmissionError::ConnectionLimitExceeded));

    // the rate table is untouched by a connection-limit rejection
    assert!(rate_table.check("10.0.0.1", Instant::now()).is_ok());
}

#[test]
fn releasing_a_connection_frees_the_slot_for_a_new_accept() {
    let conn_table = ConnectionTable::new(1);
    conn_table.acquire("10.0.0.2").unwrap();
    assert_eq!(conn_table.acquire("10.0.0.2"), Err(AdmissionError::ConnectionLimitExceeded));
    conn_table.release("10.0.0.2");
    assert!(conn_table.acquire("10.0.0.2").is_ok());
}

#[test]
fn separate_ips_are_tracked_independently() {
    let conn_table = ConnectionTable::new(1);
    conn_table.acquire("10.0.0.3").unwrap();
    assert!(conn_table.acquire("10.0.0.4").is_ok());
}

#[test]
fn burst_tokens_are_consumed_only_after_the_steady_rate_is_exhausted() {
    let rate_table = RateTable::new(2, 1);
    let now = Instant::now();
    assert!(rate_table.check("10.0.0.5", now).is_ok()); // steady slot 1
    assert!(rate_table.check("10.0.0.5", now).is_ok()); // steady slot 2
    assert!(rate_table.check("10.0.0.5", now).is_ok()); // burst slot
    assert!(rate_table.check("10.0.0.5", now).is_err()); // exhausted
}
