//! SQL schema for the catalog store and §6.
//!
//! Foreign keys cascade on delete from Job -> JobExecution -> BackupSet ->
//! CatalogEntry and from SpanningSet -> SpanningMember/TapeChangeRequest, as
//! required.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pools (
    id                 INTEGER PRIMARY KEY,
    name               TEXT NOT NULL UNIQUE,
    retention_days     INTEGER NOT NULL,
    allow_reuse        INTEGER NOT NULL,
    allocation_policy  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tapes (
    id                          INTEGER PRIMARY KEY,
    uuid                        TEXT NOT NULL UNIQUE,
    label                       TEXT NOT NULL UNIQUE,
    barcode                     TEXT,
    pool_id                     INTEGER NOT NULL REFERENCES pools(id),
    status                      TEXT NOT NULL,
    capacity_bytes              INTEGER NOT NULL,
    used_bytes                  INTEGER NOT NULL DEFAULT 0,
    write_count                 INTEGER NOT NULL DEFAULT 0,
    created_at                  INTEGER NOT NULL,
    updated_at                  INTEGER NOT NULL,
    offsite_location            TEXT,
    encryption_key_fingerprint  TEXT
);

CREATE TABLE IF NOT EXISTS drives (
    id               INTEGER PRIMARY KEY,
    device_path      TEXT NOT NULL UNIQUE,
    display_name     TEXT NOT NULL,
    model            TEXT,
    serial           TEXT,
    status           TEXT NOT NULL,
    enabled          INTEGER NOT NULL,
    current_tape_id  INTEGER REFERENCES tapes(id)
);

CREATE TABLE IF NOT EXISTS sources (
    id                INTEGER PRIMARY KEY,
    name              TEXT NOT NULL UNIQUE,
    source_type       TEXT NOT NULL,
    path              TEXT NOT NULL,
    include_patterns  TEXT NOT NULL, -- JSON array
    exclude_patterns  TEXT NOT NULL, -- JSON array
    enabled           INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS jobs (
    id                  INTEGER PRIMARY KEY,
    name                TEXT NOT NULL UNIQUE,
    source_id           INTEGER NOT NULL REFERENCES sources(id),
    pool_id             INTEGER NOT NULL REFERENCES pools(id),
    backup_type         TEXT NOT NULL,
    schedule_cron       TEXT NOT NULL,
    retention_days      INTEGER NOT NULL,
    compression         TEXT NOT NULL,
    encryption_enabled  INTEGER NOT NULL,
    encryption_key_id   TEXT,
    enabled             INTEGER NOT NULL,
    last_run_at         INTEGER,
    next_run_at         INTEGER
);

CREATE TABLE IF NOT EXISTS backup_sets (
    id                 INTEGER PRIMARY KEY,
    job_id             INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    tape_id            INTEGER NOT NULL REFERENCES tapes(id),
    backup_type        TEXT NOT NULL,
    start_time         INTEGER NOT NULL,
    end_time           INTEGER,
    status             TEXT NOT NULL,
    file_count         INTEGER NOT NULL DEFAULT 0,
    total_bytes        INTEGER NOT NULL DEFAULT 0,
    start_block        INTEGER,
    end_block          INTEGER,
    checksum           TEXT,
    encrypted          INTEGER NOT NULL,
    encryption_key_id  TEXT,
    compressed         INTEGER NOT NULL,
    compression_type   TEXT NOT NULL,
    parent_set_id      INTEGER REFERENCES backup_sets(id)
);

CREATE TABLE IF NOT EXISTS catalog_entries (
    id             INTEGER PRIMARY KEY,
    backup_set_id  INTEGER NOT NULL REFERENCES backup_sets(id) ON DELETE CASCADE,
    file_path      TEXT NOT NULL,
    file_size      INTEGER NOT NULL,
    file_mode      INTEGER NOT NULL,
    mod_time       INTEGER NOT NULL,
    checksum       TEXT NOT NULL,
    block_offset   INTEGER,
    UNIQUE(backup_set_id, file_path)
);

CREATE INDEX IF NOT EXISTS idx_catalog_entries_path
    ON catalog_entries(backup_set_id, file_path);

CREATE TABLE IF NOT EXISTS snapshots (
    source_id       INTEGER NOT NULL REFERENCES sources(id),
    backup_set_id   INTEGER NOT NULL REFERENCES backup_sets(id),
    file_count      INTEGER NOT NULL,
    total_bytes     INTEGER NOT NULL,
    snapshot_data   TEXT NOT NULL, -- JSON array of SnapshotFile
    created_at      INTEGER NOT NULL,
    PRIMARY KEY (source_id, backup_set_id)
);

CREATE TABLE IF NOT EXISTS job_executions (
    id              INTEGER PRIMARY KEY,
    job_id          INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    backup_set_id   INTEGER REFERENCES backup_sets(id),
    status          TEXT NOT NULL,
    files_processed INTEGER NOT NULL DEFAULT 0,
    bytes_processed INTEGER NOT NULL DEFAULT 0,
    error_message   TEXT,
    can_resume      INTEGER NOT NULL DEFAULT 0,
    resume_state    TEXT, -- JSON ResumeState
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS spanning_sets (
    id                 INTEGER PRIMARY KEY,
    job_execution_id   INTEGER NOT NULL REFERENCES job_executions(id) ON DELETE CASCADE,
    status             TEXT NOT NULL,
    total_bytes        INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS spanning_members (
    id                 INTEGER PRIMARY KEY,
    spanning_set_id    INTEGER NOT NULL REFERENCES spanning_sets(id) ON DELETE CASCADE,
    sequence_number    INTEGER NOT NULL,
    tape_id            INTEGER NOT NULL REFERENCES tapes(id),
    backup_set_id      INTEGER NOT NULL REFERENCES backup_sets(id),
    files_start_index  INTEGER NOT NULL,
    files_end_index    INTEGER NOT NULL,
    bytes_written      INTEGER NOT NULL,
    UNIQUE(spanning_set_id, sequence_number)
);

CREATE TABLE IF NOT EXISTS tape_change_requests (
    id                INTEGER PRIMARY KEY,
    spanning_set_id   INTEGER NOT NULL REFERENCES spanning_sets(id) ON DELETE CASCADE,
    current_tape_id   INTEGER NOT NULL REFERENCES tapes(id),
    new_tape_id       INTEGER REFERENCES tapes(id),
    reason            TEXT NOT NULL,
    status            TEXT NOT NULL,
    requested_at      INTEGER NOT NULL,
    completed_at      INTEGER
);

CREATE TABLE IF NOT EXISTS audit_log (
    id         INTEGER PRIMARY KEY,
    at         INTEGER NOT NULL,
    category   TEXT NOT NULL,
    message    TEXT NOT NULL
);
"#;
