//! Idempotent DDL for the durable tables
//!
//! Applied once at connect time against the system database (and, for the
//! `transaction_outputs` table, the application database). Every statement
//! is `IF NOT EXISTS` so repeated boot against an already-migrated database
//! is a no-op. This intentionally does not pull in a migration framework —
//! the set of tables is small and fixed, and ordering is expressed by
//! plain statement order.

use sqlx::PgPool;

use crate::error::SysDbError;

const SYSDB_SCHEMA: &[&str] = &[
    r#"CREATE SCHEMA IF NOT EXISTS dbos"#,
    r#"CREATE TABLE IF NOT EXISTS dbos.workflow_status (
        workflow_uuid TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        name TEXT NOT NULL,
        class_name TEXT,
        config_name TEXT,
        output TEXT,
        error TEXT,
        executor_id TEXT,
        application_version TEXT,
        application_id TEXT,
        request TEXT,
        recovery_attempts BIGINT NOT NULL DEFAULT 0,
        authenticated_user TEXT,
        authenticated_roles TEXT,
        assumed_role TEXT,
        queue_name TEXT,
        created_at BIGINT NOT NULL DEFAULT (EXTRACT(EPOCH FROM now()) * 1000)::BIGINT,
        updated_at BIGINT NOT NULL DEFAULT (EXTRACT(EPOCH FROM now()) * 1000)::BIGINT
    )"#,
    r#"CREATE INDEX IF NOT EXISTS workflow_status_executor_id_status_idx
        ON dbos.workflow_status (executor_id, status)"#,
    r#"CREATE INDEX IF NOT EXISTS workflow_status_queue_name_idx
        ON dbos.workflow_status (queue_name) WHERE queue_name IS NOT NULL"#,
    r#"CREATE INDEX IF NOT EXISTS workflow_status_created_at_idx
        ON dbos.workflow_status (created_at)"#,
    r#"CREATE TABLE IF NOT EXISTS dbos.workflow_inputs (
        workflow_uuid TEXT PRIMARY KEY REFERENCES dbos.workflow_status (workflow_uuid),
        inputs TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS dbos.operation_outputs (
        workflow_uuid TEXT NOT NULL REFERENCES dbos.workflow_status (workflow_uuid),
        function_id BIGINT NOT NULL,
        output TEXT,
        error TEXT,
        PRIMARY KEY (workflow_uuid, function_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS dbos.notifications (
        destination_uuid TEXT NOT NULL REFERENCES dbos.workflow_status (workflow_uuid),
        topic TEXT NOT NULL,
        message TEXT NOT NULL,
        created_at_epoch_ms BIGINT NOT NULL DEFAULT (EXTRACT(EPOCH FROM now()) * 1000)::BIGINT
    )"#,
    r#"CREATE INDEX IF NOT EXISTS notifications_dest_topic_idx
        ON dbos.notifications (destination_uuid, topic, created_at_epoch_ms)"#,
    r#"CREATE TABLE IF NOT EXISTS dbos.workflow_events (
        workflow_uuid TEXT NOT NULL REFERENCES dbos.workflow_status (workflow_uuid),
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (workflow_uuid, key)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS dbos.job_queue (
        workflow_uuid TEXT PRIMARY KEY REFERENCES dbos.workflow_status (workflow_uuid),
        queue_name TEXT NOT NULL,
        created_at_epoch_ms BIGINT NOT NULL DEFAULT (EXTRACT(EPOCH FROM now()) * 1000)::BIGINT
    )"#,
    r#"CREATE INDEX IF NOT EXISTS job_queue_queue_name_idx
        ON dbos.job_queue (queue_name, created_at_epoch_ms)"#,
    r#"CREATE OR REPLACE FUNCTION dbos.notify_notifications() RETURNS trigger AS $$
    BEGIN
        PERFORM pg_notify('dbos_notifications_channel', NEW.destination_uuid || '::' || NEW.topic);
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql"#,
    r#"DROP TRIGGER IF EXISTS dbos_notifications_trigger ON dbos.notifications"#,
    r#"CREATE TRIGGER dbos_notifications_trigger
        AFTER INSERT ON dbos.notifications
        FOR EACH ROW EXECUTE FUNCTION dbos.notify_notifications()"#,
    r#"CREATE OR REPLACE FUNCTION dbos.notify_workflow_events() RETURNS trigger AS $$
    BEGIN
        PERFORM pg_notify('dbos_workflow_events_channel', NEW.workflow_uuid || '::' || NEW.key);
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql"#,
    r#"DROP TRIGGER IF EXISTS dbos_workflow_events_trigger ON dbos.workflow_events"#,
    r#"CREATE TRIGGER dbos_workflow_events_trigger
        AFTER INSERT OR UPDATE ON dbos.workflow_events
        FOR EACH ROW EXECUTE FUNCTION dbos.notify_workflow_events()"#,
];

const APPDB_SCHEMA: &[&str] = &[
    r#"CREATE SCHEMA IF NOT EXISTS dbos"#,
    r#"CREATE TABLE IF NOT EXISTS dbos.transaction_outputs (
        workflow_uuid TEXT NOT NULL,
        function_id BIGINT NOT NULL,
        output TEXT,
        error TEXT,
        txn_id TEXT,
        txn_snapshot TEXT NOT NULL,
        executor_id TEXT,
        created_at BIGINT NOT NULL DEFAULT (EXTRACT(EPOCH FROM now()) * 1000)::BIGINT,
        PRIMARY KEY (workflow_uuid, function_id)
    )"#,
];

/// Apply the system database schema. Safe to call on every boot.
pub async fn migrate_sysdb(pool: &PgPool) -> Result<(), SysDbError> {
    for statement in SYSDB_SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Apply the application database adjunct schema (`dbos.transaction_outputs`
/// only — the rest of the app database belongs to the user).
pub async fn migrate_appdb(pool: &PgPool) -> Result<(), SysDbError> {
    for statement in APPDB_SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
