#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_queue_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS work_items (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    parent_id TEXT REFERENCES work_items (id),
    type_or_agent TEXT NOT NULL,
    iteration INTEGER NOT NULL DEFAULT 1,
    input TEXT NOT NULL,
    output TEXT,
    error TEXT,
    status TEXT NOT NULL,
    try_count INTEGER NOT NULL DEFAULT 0,
    max_tries INTEGER NOT NULL,
    locked_by TEXT,
    lease_timeout_ms INTEGER,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_work_items_claim
    ON work_items (status, kind, created_at_ms);

CREATE INDEX IF NOT EXISTS idx_work_items_parent
    ON work_items (parent_id, created_at_ms);

CREATE TABLE IF NOT EXISTS workflow_state (
    parent_task_id TEXT PRIMARY KEY REFERENCES work_items (id),
    workflow_type TEXT NOT NULL,
    current_state TEXT NOT NULL,
    current_iteration INTEGER NOT NULL,
    max_iterations INTEGER NOT NULL,
    state_data TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    item_id TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_log_item
    ON audit_log (item_id, id);
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "work_item_usage",
    up_sql: r#"
ALTER TABLE work_items ADD COLUMN model_used TEXT;
ALTER TABLE work_items ADD COLUMN input_tokens INTEGER NOT NULL DEFAULT 0;
ALTER TABLE work_items ADD COLUMN output_tokens INTEGER NOT NULL DEFAULT 0;
ALTER TABLE work_items ADD COLUMN total_cost REAL NOT NULL DEFAULT 0;
ALTER TABLE work_items ADD COLUMN generation_id TEXT;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_contiguous() {
        for (index, entry) in migrations().iter().enumerate() {
            assert_eq!(entry.version, index as i64 + 1);
        }
        assert_eq!(current_schema_version(), migrations().len() as i64);
    }

    #[test]
    fn lookup_by_version() {
        assert_eq!(migration(2).map(|m| m.name), Some("work_item_usage"));
        assert!(migration(99).is_none());
    }
}
