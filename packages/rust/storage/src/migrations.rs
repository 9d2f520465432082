//! SQL migration definitions for the compliance database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: master_records ledger, knowledge documents + FTS5, notification_log",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Append-only master ledger
CREATE TABLE IF NOT EXISTS master_records (
    id                TEXT PRIMARY KEY,
    identity          TEXT,
    title             TEXT NOT NULL,
    description       TEXT NOT NULL,
    responsible_email TEXT NOT NULL,
    due_date          TEXT NOT NULL,
    category_json     TEXT,
    submitted_at      TEXT NOT NULL,
    summary_json      TEXT,
    status            TEXT NOT NULL
        CHECK (status IN ('processed', 'processed_no_prerequisites', 'failed')),
    failure           TEXT,
    recorded_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_master_identity ON master_records(identity);

-- At most one processed entry per derived identity
CREATE UNIQUE INDEX IF NOT EXISTS idx_master_processed_identity
    ON master_records(identity)
    WHERE status IN ('processed', 'processed_no_prerequisites');

CREATE TRIGGER IF NOT EXISTS master_records_no_update BEFORE UPDATE ON master_records BEGIN
    SELECT RAISE(ABORT, 'master_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS master_records_no_delete BEFORE DELETE ON master_records BEGIN
    SELECT RAISE(ABORT, 'master_records is append-only');
END;

-- Enriched items for retrieval
CREATE TABLE IF NOT EXISTS knowledge_documents (
    id                 TEXT PRIMARY KEY,
    identity           TEXT NOT NULL,
    title              TEXT NOT NULL,
    description        TEXT NOT NULL,
    responsible_email  TEXT NOT NULL,
    due_date           TEXT NOT NULL,
    prerequisites_text TEXT NOT NULL,
    summary_json       TEXT NOT NULL,
    stored_at          TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS knowledge_fts USING fts5(
    title,
    description,
    prerequisites_text,
    content=knowledge_documents,
    content_rowid=rowid
);

-- Triggers to keep FTS in sync with knowledge_documents
CREATE TRIGGER IF NOT EXISTS knowledge_fts_insert AFTER INSERT ON knowledge_documents BEGIN
    INSERT INTO knowledge_fts(rowid, title, description, prerequisites_text)
    VALUES (new.rowid, new.title, new.description, new.prerequisites_text);
END;

CREATE TRIGGER IF NOT EXISTS knowledge_fts_delete AFTER DELETE ON knowledge_documents BEGIN
    INSERT INTO knowledge_fts(knowledge_fts, rowid, title, description, prerequisites_text)
    VALUES ('delete', old.rowid, old.title, old.description, old.prerequisites_text);
END;

CREATE TRIGGER IF NOT EXISTS knowledge_fts_update AFTER UPDATE ON knowledge_documents BEGIN
    INSERT INTO knowledge_fts(knowledge_fts, rowid, title, description, prerequisites_text)
    VALUES ('delete', old.rowid, old.title, old.description, old.prerequisites_text);
    INSERT INTO knowledge_fts(rowid, title, description, prerequisites_text)
    VALUES (new.rowid, new.title, new.description, new.prerequisites_text);
END;

-- Notification delivery attempts (append-only)
CREATE TABLE IF NOT EXISTS notification_log (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id    TEXT NOT NULL,
    contact      TEXT NOT NULL,
    subject      TEXT NOT NULL,
    body         TEXT NOT NULL,
    delivered    INTEGER NOT NULL,
    error        TEXT,
    attempted_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notification_record ON notification_log(record_id);

CREATE TRIGGER IF NOT EXISTS notification_log_no_update BEFORE UPDATE ON notification_log BEGIN
    SELECT RAISE(ABORT, 'notification_log is append-only');
END;

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Embedded knowledge chunks (item summaries and research sources) + vector index",
            sql: r#"
-- One row per embedded text: the item summary and each research source
CREATE TABLE IF NOT EXISTS knowledge_chunks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id TEXT NOT NULL REFERENCES knowledge_documents(id),
    identity    TEXT NOT NULL,
    kind        TEXT NOT NULL CHECK (kind IN ('item_summary', 'source_document')),
    source_url  TEXT,
    title       TEXT NOT NULL,
    content     TEXT NOT NULL,
    model       TEXT NOT NULL,
    embedding   F32_BLOB(384) NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chunks_document ON knowledge_chunks(document_id);
CREATE INDEX IF NOT EXISTS idx_chunks_identity ON knowledge_chunks(identity);
CREATE INDEX IF NOT EXISTS knowledge_chunks_vec
    ON knowledge_chunks(libsql_vector_idx(embedding, 'metric=cosine'));

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
