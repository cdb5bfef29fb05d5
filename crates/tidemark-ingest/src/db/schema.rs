//! SQLite schema for the index database.
//!
//! This module defines the database schema for the subscription state,
//! leader lease and record index tables, tracked by a version row.

use rusqlite::{Connection, Result};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
///
/// Creates all tables on a fresh database; an initialized one is left as is.
pub fn init_schema(conn: &Connection) -> Result<()> {
    if get_schema_version(conn)? == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    }
    Ok(())
}

/// Get the current schema version (0 if not initialized).
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Create all tables for a fresh database.
fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Durable cursor per (service, method)
        CREATE TABLE IF NOT EXISTS subscription (
            service TEXT NOT NULL,
            method TEXT NOT NULL,
            state TEXT NOT NULL,
            PRIMARY KEY (service, method)
        );

        -- Named leases; at most one holder per id. `token` is unique per
        -- elector instance, `holder` is only a display name.
        CREATE TABLE IF NOT EXISTS subscription_lease (
            id INTEGER PRIMARY KEY,
            holder TEXT NOT NULL,
            token TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        );

        -- Every indexed record, canonical or duplicate, with its DAG-CBOR bytes
        CREATE TABLE IF NOT EXISTS record (
            uri TEXT PRIMARY KEY,
            cid TEXT NOT NULL,
            did TEXT NOT NULL,
            collection TEXT NOT NULL,
            data BLOB NOT NULL,
            indexed_at TEXT NOT NULL
        );

        -- Records shadowed by a semantically equivalent canonical record
        CREATE TABLE IF NOT EXISTS duplicate_record (
            uri TEXT PRIMARY KEY,
            cid TEXT NOT NULL,
            duplicate_of TEXT NOT NULL,
            indexed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS feed_like (
            uri TEXT PRIMARY KEY,
            cid TEXT NOT NULL,
            creator TEXT NOT NULL,
            subject TEXT NOT NULL,
            subject_cid TEXT NOT NULL,
            created_at TEXT NOT NULL,
            indexed_at TEXT NOT NULL,
            UNIQUE (creator, subject)
        );

        CREATE TABLE IF NOT EXISTS graph_follow (
            uri TEXT PRIMARY KEY,
            cid TEXT NOT NULL,
            creator TEXT NOT NULL,
            subject_did TEXT NOT NULL,
            created_at TEXT NOT NULL,
            indexed_at TEXT NOT NULL,
            UNIQUE (creator, subject_did)
        );

        CREATE INDEX IF NOT EXISTS idx_record_did ON record(did);
        CREATE INDEX IF NOT EXISTS idx_duplicate_record_of ON duplicate_record(duplicate_of, indexed_at);
        CREATE INDEX IF NOT EXISTS idx_feed_like_subject ON feed_like(subject);
        CREATE INDEX IF NOT EXISTS idx_graph_follow_subject ON graph_follow(subject_did);
        "#,
    )
}
