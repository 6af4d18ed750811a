//! SurrealDB schema migrations and initialization
//!
//! Defines every table with its lookup indexes. Safe to call on every
//! connection: all definitions use `IF NOT EXISTS`.

use crate::error::StateError;
use crate::schema::OUTBOX_TABLE;
use crate::storage_traits::Table;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

const DOCUMENT_TABLES: [Table; 5] = [
    Table::ExamCycles,
    Table::Assessments,
    Table::Grades,
    Table::GradeModerations,
    Table::PostLockChanges,
];

/// Initialize all GradeGuard tables.
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing GradeGuard SurrealDB schema");

    for table in DOCUMENT_TABLES {
        init_document_table(db, table.as_str()).await?;
    }
    init_outbox_table(db).await?;

    info!("GradeGuard schema initialization complete");
    Ok(())
}

/// Document tables share one layout:
///
/// ```text
/// TABLE <name> {
///   doc_key:     STRING (unique)
///   tenant_key:  STRING (indexed)
///   links:       ARRAY<STRING> (foreign keys, indexed)
///   created_seq: INT (insertion order)
///   rev:         INT (optimistic concurrency version)
///   body:        STRING (JSON record)
/// }
/// ```
///
/// Records are never deleted; `FOR delete NONE` keeps the evidentiary trail
/// intact even for direct database clients.
async fn init_document_table(db: &Surreal<Any>, name: &str) -> Result<()> {
    debug!(table = name, "Initializing document table");

    let sql = format!(
        r#"
        DEFINE TABLE IF NOT EXISTS {name} SCHEMALESS
            PERMISSIONS
                FOR select FULL
                FOR create FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_{name}_doc_key ON TABLE {name} COLUMNS doc_key UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_{name}_tenant ON TABLE {name} COLUMNS tenant_key;
        DEFINE INDEX IF NOT EXISTS idx_{name}_links ON TABLE {name} COLUMNS links;
        "#
    );

    db.query(sql)
        .await?
        .check()
        .map_err(|e| StateError::SchemaSetup(format!("{name}: {e}")))?;
    Ok(())
}

/// Outbox of committed audit events:
///
/// ```text
/// TABLE audit_outbox {
///   event_id:  STRING (unique)
///   seq:       INT (unique, commit order)
///   delivered: BOOL
///   body:      STRING (JSON AuditEvent)
/// }
/// ```
async fn init_outbox_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing audit outbox table");

    let sql = format!(
        r#"
        DEFINE TABLE IF NOT EXISTS {OUTBOX_TABLE} SCHEMALESS
            PERMISSIONS
                FOR select FULL
                FOR create FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_outbox_event_id ON TABLE {OUTBOX_TABLE} COLUMNS event_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_outbox_seq ON TABLE {OUTBOX_TABLE} COLUMNS seq UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_outbox_delivered ON TABLE {OUTBOX_TABLE} COLUMNS delivered;
        "#
    );

    db.query(sql)
        .await?
        .check()
        .map_err(|e| StateError::SchemaSetup(format!("{OUTBOX_TABLE}: {e}")))?;
    Ok(())
}
