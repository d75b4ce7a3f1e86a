//! SurrealDB schema migrations and initialization
//!
//! This module provides initialization functions to set up all tables
//! with proper constraints and indexes.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all toolvault tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing toolvault SurrealDB schema");

    init_manifests_table(db).await?;
    init_permissions_table(db).await?;
    init_volumes_table(db).await?;
    init_state_table(db).await?;
    init_executions_table(db).await?;
    init_discovery_table(db).await?;
    init_audit_table(db).await?;

    info!("toolvault schema initialization complete");
    Ok(())
}

/// Initialize `tool_manifests`
///
/// Schema:
/// ```text
/// TABLE tool_manifests {
///   tool_id:               STRING (unique)
///   name:                  STRING (unique, never reused)
///   version:               STRING
///   status:                STRING (pending_approval | approved | active | disabled | revoked)
///   capabilities:          ARRAY<OBJECT>
///   parameters_schema:     OBJECT
///   execution:             OBJECT
///   created_at:            DATETIME
///   ...
/// }
/// ```
///
/// Manifests are never deleted; revocation is a status.
async fn init_manifests_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing tool_manifests table");

    let sql = r#"
        DEFINE TABLE tool_manifests AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX idx_tool_id ON TABLE tool_manifests COLUMNS tool_id UNIQUE;
        DEFINE INDEX idx_tool_name ON TABLE tool_manifests COLUMNS name UNIQUE;
        DEFINE INDEX idx_tool_status ON TABLE tool_manifests COLUMNS status;
    "#;

    db.query(sql).await?;
    info!("✓ tool_manifests table initialized");
    Ok(())
}

/// Initialize `tool_permissions`
///
/// `(tool_id, kind)` is unique; `seq` is assigned by the store and only ever
/// grows.
async fn init_permissions_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing tool_permissions table");

    let sql = r#"
        DEFINE TABLE tool_permissions AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX idx_tool_kind ON TABLE tool_permissions COLUMNS tool_id, kind UNIQUE;
        DEFINE INDEX idx_perm_seq ON TABLE tool_permissions COLUMNS seq;
    "#;

    db.query(sql).await?;
    info!("✓ tool_permissions table initialized");
    Ok(())
}

/// Initialize `tool_volumes`: one row per tool, unique volume names.
async fn init_volumes_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing tool_volumes table");

    let sql = r#"
        DEFINE TABLE tool_volumes AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete FULL;

        DEFINE INDEX idx_volume_tool ON TABLE tool_volumes COLUMNS tool_id UNIQUE;
        DEFINE INDEX idx_volume_name ON TABLE tool_volumes COLUMNS volume_name UNIQUE;
    "#;

    db.query(sql).await?;
    info!("✓ tool_volumes table initialized");
    Ok(())
}

/// Initialize `tool_state`: `(tool_id, state_key)` is unique.
async fn init_state_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing tool_state table");

    let sql = r#"
        DEFINE TABLE tool_state AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete FULL;

        DEFINE INDEX idx_state_tool_key ON TABLE tool_state COLUMNS tool_id, state_key UNIQUE;
        DEFINE INDEX idx_state_tool ON TABLE tool_state COLUMNS tool_id;
    "#;

    db.query(sql).await?;
    info!("✓ tool_state table initialized");
    Ok(())
}

/// Initialize `tool_executions`
///
/// Schema:
/// ```text
/// TABLE tool_executions {
///   execution_id:  STRING (unique)
///   tool_id:       STRING (indexed)
///   status:        STRING (running | success | failure | timeout | cancelled)
///   error_kind:    STRING?
///   started_at:    DATETIME (indexed)
///   completed_at:  DATETIME?
///   ...
/// }
/// ```
///
/// Constraints:
/// - `status` transitions: running → terminal exactly once (enforced via app logic)
/// - Terminal rows are immutable (enforced via app logic)
async fn init_executions_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing tool_executions table");

    let sql = r#"
        DEFINE TABLE tool_executions AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX idx_execution_id ON TABLE tool_executions COLUMNS execution_id UNIQUE;
        DEFINE INDEX idx_exec_tool ON TABLE tool_executions COLUMNS tool_id;
        DEFINE INDEX idx_exec_status ON TABLE tool_executions COLUMNS status;
        DEFINE INDEX idx_exec_started_at ON TABLE tool_executions COLUMNS started_at;
        DEFINE INDEX idx_exec_tool_started_at ON TABLE tool_executions COLUMNS tool_id, started_at;
    "#;

    db.query(sql).await?;
    info!("✓ tool_executions table initialized");
    Ok(())
}

/// Initialize `discovery_requests`
async fn init_discovery_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing discovery_requests table");

    let sql = r#"
        DEFINE TABLE discovery_requests AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX idx_request_id ON TABLE discovery_requests COLUMNS request_id UNIQUE;
        DEFINE INDEX idx_dedup_key ON TABLE discovery_requests COLUMNS dedup_key;
        DEFINE INDEX idx_discovery_status ON TABLE discovery_requests COLUMNS status;
    "#;

    db.query(sql).await?;
    info!("✓ discovery_requests table initialized");
    Ok(())
}

/// Initialize `lifecycle_audit` (append-only)
async fn init_audit_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing lifecycle_audit table");

    let sql = r#"
        DEFINE TABLE lifecycle_audit AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX idx_audit_tool ON TABLE lifecycle_audit COLUMNS tool_id;
        DEFINE INDEX idx_audit_at ON TABLE lifecycle_audit COLUMNS at;
    "#;

    db.query(sql).await?;
    info!("✓ lifecycle_audit table initialized");
    Ok(())
}
