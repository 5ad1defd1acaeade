use tracing::trace;

// Trace-based counters; the Prometheus recorder in `main` exposes process
// metrics, these mark request and saga activity in the log stream.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "adstudio.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn dispatch_elapsed(flow: &'static str, elapsed_ms: u128, ok: bool) {
    trace!(
        target = "adstudio.metrics",
        flow = flow,
        elapsed_ms = elapsed_ms as u64,
        ok = ok,
        "dispatch_elapsed"
    );
}

pub fn ledger_movement(kind: &'static str, amount: i64) {
    trace!(
        target = "adstudio.metrics",
        kind = kind,
        amount = amount,
        "ledger_movement"
    );
}
