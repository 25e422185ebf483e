//! Engine metrics.
//!
//! # Metrics
//! - `transit_connect_jobs_total` (counter): finished connect jobs by pool, result
//! - `transit_sockets_reused_total` (counter): idle sockets handed out again
//! - `transit_idle_sockets_closed_total` (counter): idle sockets closed by reason
//! - `transit_pending_requests` (gauge): queued socket requests per pool
//! - `transit_transactions_total` (counter): finished transactions by result
//! - `transit_transaction_restarts_total` (counter): transparent restarts by reason

use metrics::{counter, gauge};

use crate::error::NetError;

pub fn record_connect_job(pool: &'static str, result: Result<(), &NetError>) {
    let result = match result {
        Ok(()) => "ok",
        Err(e) => e.label(),
    };
    counter!("transit_connect_jobs_total", "pool" => pool, "result" => result).increment(1);
}

pub fn record_socket_reused(pool: &'static str) {
    counter!("transit_sockets_reused_total", "pool" => pool).increment(1);
}

pub fn record_idle_closed(pool: &'static str, reason: &'static str, count: usize) {
    if count == 0 {
        return;
    }
    counter!("transit_idle_sockets_closed_total", "pool" => pool, "reason" => reason)
        .increment(count as u64);
}

pub fn set_pending_requests(pool: &'static str, pending: usize) {
    gauge!("transit_pending_requests", "pool" => pool).set(pending as f64);
}

pub fn record_transaction(result: Result<u16, &NetError>) {
    let result = match result {
        Ok(status) if status < 400 => "ok",
        Ok(_) => "http_error",
        Err(e) => e.label(),
    };
    counter!("transit_transactions_total", "result" => result).increment(1);
}

pub fn record_restart(reason: &'static str) {
    counter!("transit_transaction_restarts_total", "reason" => reason).increment(1);
}
