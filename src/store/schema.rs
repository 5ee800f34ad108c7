//! Cache database schema.
//!
//! Entity tables are typed (not JSON blobs) so that status, priority,
//! assignee, project and cycle lookups hit indexes. Soft deletes are
//! `deleted_at` tombstones, excluded from default queries. `sync_runs` is an
//! append-only log; rows are never updated.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS teams (
    id TEXT PRIMARY KEY,
    key TEXT NOT NULL,
    name TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS members (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    capacity INTEGER NOT NULL DEFAULT 10,
    team_id TEXT,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    target_date TEXT,
    team_id TEXT,
    issues_count INTEGER NOT NULL DEFAULT 0,
    in_progress_count INTEGER NOT NULL DEFAULT 0,
    blocked_count INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS cycles (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    starts_at TEXT NOT NULL,
    ends_at TEXT NOT NULL,
    team_id TEXT,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

-- id/identifier/status are compared case-insensitively by the query engine;
-- the collation lives on the columns so their indexes stay usable
CREATE TABLE IF NOT EXISTS issues (
    id TEXT PRIMARY KEY COLLATE NOCASE,
    identifier TEXT NOT NULL COLLATE NOCASE,
    title TEXT NOT NULL,
    description TEXT,
    status TEXT NOT NULL COLLATE NOCASE,
    priority INTEGER NOT NULL DEFAULT 0,
    estimate INTEGER NOT NULL DEFAULT 0 CHECK (estimate >= 0),
    assignee_id TEXT,
    project_id TEXT,
    cycle_id TEXT,
    team_id TEXT,
    blocked_by TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_issues_status ON issues(status);
CREATE INDEX IF NOT EXISTS idx_issues_identifier ON issues(identifier);
CREATE INDEX IF NOT EXISTS idx_issues_priority ON issues(priority);
CREATE INDEX IF NOT EXISTS idx_issues_assignee ON issues(assignee_id);
CREATE INDEX IF NOT EXISTS idx_issues_project ON issues(project_id);
CREATE INDEX IF NOT EXISTS idx_issues_cycle ON issues(cycle_id);

-- Optimistic local edits, overlaid on reads until the reconciler resolves them
CREATE TABLE IF NOT EXISTS pending_edits (
    issue_id TEXT NOT NULL,
    field TEXT NOT NULL,
    value TEXT,
    edited_at TEXT NOT NULL,
    PRIMARY KEY (issue_id, field)
);

-- Issue references whose target entity is not cached yet
CREATE TABLE IF NOT EXISTS dangling_refs (
    issue_id TEXT NOT NULL,
    field TEXT NOT NULL,
    target_kind TEXT NOT NULL,
    target_id TEXT NOT NULL,
    PRIMARY KEY (issue_id, field)
);

CREATE INDEX IF NOT EXISTS idx_dangling_target ON dangling_refs(target_kind, target_id);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    outcome TEXT NOT NULL,
    error TEXT,
    counts TEXT NOT NULL,
    diagnostics TEXT NOT NULL
);
"#;
