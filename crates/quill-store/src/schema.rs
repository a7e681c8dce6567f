//! Session record store DDL.
//!
//! `MIGRATIONS[i]` upgrades a database from `user_version = i` to `i + 1`.

pub const MIGRATIONS: &[&str] = &[
    // 1: sessions and the append-only action log
    r#"
CREATE TABLE sessions (
    id TEXT PRIMARY KEY,
    topic TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE action_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    worker TEXT NOT NULL,
    action TEXT NOT NULL,
    input TEXT,
    output TEXT,
    duration_ms INTEGER,
    success INTEGER NOT NULL,
    error TEXT,
    timestamp TEXT NOT NULL
);

CREATE INDEX idx_sessions_created ON sessions(created_at);
CREATE INDEX idx_action_log_session ON action_log(session_id, seq);
"#,
    // 2: status filter for listings
    "CREATE INDEX idx_sessions_status ON sessions(status);",
];

/// Version a fully migrated database reports.
pub fn current_version() -> u32 {
    MIGRATIONS.len() as u32
}

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
