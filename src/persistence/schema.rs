//! SQL schema (spec §6 "Persisted state layout").

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS managed_containers (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL UNIQUE,
    registry        TEXT NOT NULL,
    repository      TEXT NOT NULL,
    tag             TEXT NOT NULL,
    runtime_id      TEXT,
    current_digest  TEXT,
    desired_config  TEXT NOT NULL,
    update_policy   TEXT NOT NULL,
    status          TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS available_updates (
    container_id    INTEGER NOT NULL,
    from_digest     TEXT NOT NULL,
    to_digest       TEXT NOT NULL,
    to_size_bytes   INTEGER NOT NULL,
    published_at    TEXT,
    observed_at     TEXT NOT NULL,
    risk_level      TEXT NOT NULL,
    security_flag   INTEGER NOT NULL,
    active          INTEGER NOT NULL,
    PRIMARY KEY (container_id, observed_at)
);
CREATE INDEX IF NOT EXISTS idx_available_updates_container_observed
    ON available_updates (container_id, observed_at DESC);

CREATE TABLE IF NOT EXISTS update_jobs (
    id              TEXT PRIMARY KEY,
    container_id    INTEGER NOT NULL,
    from_digest     TEXT NOT NULL,
    to_digest       TEXT NOT NULL,
    strategy        TEXT NOT NULL,
    state           TEXT NOT NULL,
    attempt         INTEGER NOT NULL,
    max_retries     INTEGER NOT NULL,
    scheduled_at    TEXT NOT NULL,
    started_at      TEXT,
    finished_at     TEXT,
    triggered_by    TEXT NOT NULL,
    parent_bulk_id  TEXT,
    cancel_requested INTEGER NOT NULL,
    error_kind      TEXT,
    error_message   TEXT,
    lease_owner     TEXT,
    lease_deadline  TEXT
);
CREATE INDEX IF NOT EXISTS idx_update_jobs_container_state
    ON update_jobs (container_id, state);
CREATE INDEX IF NOT EXISTS idx_update_jobs_nonterminal
    ON update_jobs (container_id)
    WHERE state NOT IN ('succeeded', 'rolled_back', 'failed', 'cancelled');
CREATE INDEX IF NOT EXISTS idx_update_jobs_parent_bulk
    ON update_jobs (parent_bulk_id);

CREATE TABLE IF NOT EXISTS update_step_records (
    job_id          TEXT NOT NULL,
    sequence        INTEGER NOT NULL,
    name            TEXT NOT NULL,
    started_at      TEXT NOT NULL,
    finished_at     TEXT,
    outcome         TEXT,
    detail          TEXT NOT NULL,
    log_tail        TEXT NOT NULL,
    PRIMARY KEY (job_id, sequence)
);
CREATE INDEX IF NOT EXISTS idx_update_step_records_started
    ON update_step_records (started_at DESC);

CREATE TABLE IF NOT EXISTS bulk_updates (
    id                  TEXT PRIMARY KEY,
    targets             TEXT NOT NULL,
    strategy            TEXT NOT NULL,
    max_concurrency     INTEGER NOT NULL,
    respect_dependencies INTEGER NOT NULL,
    continue_on_error   INTEGER NOT NULL,
    state               TEXT NOT NULL,
    progress            TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    cancel_requested    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_records (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   TEXT NOT NULL,
    actor       TEXT NOT NULL,
    subject     TEXT NOT NULL,
    action      TEXT NOT NULL,
    outcome     TEXT NOT NULL,
    details     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_records_timestamp ON audit_records (timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_audit_records_subject ON audit_records (subject);
"#;

// Note: DigestCacheEntry (spec §3) lives only in the in-memory
// `registry::cache::DigestCache` (a many-reader/single-writer map per the
// §5 concurrency model), not in this schema — it is rebuilt from cold on
// restart by the watcher's next tick, so there is nothing durable to persist.
