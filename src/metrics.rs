use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounterVec, IntGaugeVec,
    TextEncoder,
};

lazy_static::lazy_static! {
    // Raft counters, labelled by group
    pub static ref ELECTIONS: IntCounterVec = register_int_counter_vec!(
        "lightning_eventstore_elections_total",
        "Elections started, won and lost",
        &["group", "outcome"]
    ).expect("metric can be registered");

    pub static ref LOG_ENTRIES: IntCounterVec = register_int_counter_vec!(
        "lightning_eventstore_log_entries_total",
        "Log entries appended, replicated and applied",
        &["group", "stage"]
    ).expect("metric can be registered");

    pub static ref SNAPSHOT_CHUNKS: IntCounterVec = register_int_counter_vec!(
        "lightning_eventstore_snapshot_chunks_total",
        "Install snapshot chunks sent",
        &["group"]
    ).expect("metric can be registered");

    pub static ref CURRENT_TERM: IntGaugeVec = register_int_gauge_vec!(
        "lightning_eventstore_current_term",
        "Current raft term",
        &["group"]
    ).expect("metric can be registered");

    // Event store counters, labelled by context
    pub static ref EVENTS_STORED: IntCounterVec = register_int_counter_vec!(
        "lightning_eventstore_events_stored_total",
        "Events written to the primary tier",
        &["context"]
    ).expect("metric can be registered");

    pub static ref SEGMENTS: IntCounterVec = register_int_counter_vec!(
        "lightning_eventstore_segments_total",
        "Segment lifecycle transitions",
        &["context", "transition"]
    ).expect("metric can be registered");

    pub static ref RESERVATION_CONFLICTS: IntCounterVec = register_int_counter_vec!(
        "lightning_eventstore_reservation_conflicts_total",
        "Rejected aggregate sequence reservations",
        &["context"]
    ).expect("metric can be registered");
}

pub fn election_started(group: &str) {
    ELECTIONS.with_label_values(&[group, "started"]).inc();
}

pub fn election_finished(group: &str, won: bool) {
    let outcome = if won { "won" } else { "lost" };
    ELECTIONS.with_label_values(&[group, outcome]).inc();
}

pub fn log_entries(group: &str, stage: &str, count: u64) {
    LOG_ENTRIES.with_label_values(&[group, stage]).inc_by(count);
}

pub fn snapshot_chunk_sent(group: &str) {
    SNAPSHOT_CHUNKS.with_label_values(&[group]).inc();
}

pub fn term_changed(group: &str, term: u64) {
    CURRENT_TERM.with_label_values(&[group]).set(term as i64);
}

pub fn events_stored(context: &str, count: u64) {
    EVENTS_STORED.with_label_values(&[context]).inc_by(count);
}

pub fn segment_transition(context: &str, transition: &str) {
    SEGMENTS.with_label_values(&[context, transition]).inc();
}

pub fn reservation_conflict(context: &str) {
    RESERVATION_CONFLICTS.with_label_values(&[context]).inc();
}

/// Render all registered metrics in the prometheus text format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
