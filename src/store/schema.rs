use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::job::{FieldKind, Job};

/// Name of the job table, shared by queries and dumps.
pub(crate) const TABLE: &str = "PeerJobs";

/// Column order used by every SELECT and by dumps.
pub(crate) const COLUMNS: [&str; 10] = [
    "JobID",
    "Configuration",
    "Peer",
    "Field",
    "FieldKind",
    "Operator",
    "Value",
    "CreationDate",
    "ExpireDate",
    "Action",
];

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS PeerJobs (
    JobID TEXT NOT NULL PRIMARY KEY,
    Configuration TEXT NOT NULL,
    Peer TEXT NOT NULL,
    Field TEXT NOT NULL,
    FieldKind TEXT,
    Operator TEXT NOT NULL,
    Value TEXT NOT NULL,
    CreationDate TEXT NOT NULL,
    ExpireDate TEXT,
    Action TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS PeerJobs_Configuration ON PeerJobs (Configuration);";

/// Creates the table and index if missing and migrates older tables.
pub(crate) fn install_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)?;

    // Tables created before FieldKind existed get the column added; rows
    // without a kind resolve it from Field when read.
    let has_field_kind = conn
        .prepare("SELECT 1 FROM pragma_table_info('PeerJobs') WHERE name = 'FieldKind'")?
        .exists([])?;
    if !has_field_kind {
        conn.execute_batch("ALTER TABLE PeerJobs ADD COLUMN FieldKind TEXT;")?;
    }
    Ok(())
}

/// `SELECT` of every column in [`COLUMNS`] order, followed by `filter`.
pub(crate) fn select_sql(filter: &str) -> String {
    format!("SELECT {} FROM {TABLE} {filter}", COLUMNS.join(", "))
}

/// Maps a row selected with [`select_sql`]. Unknown operators or actions
/// surface as conversion errors on their column.
pub(crate) fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let field: String = row.get(3)?;
    let field_kind: Option<String> = row.get(4)?;
    let operator: String = row.get(5)?;
    let action: String = row.get(9)?;

    Ok(Job {
        job_id: row.get(0)?,
        configuration: row.get(1)?,
        peer: row.get(2)?,
        field_kind: FieldKind::from_column(field_kind.as_deref(), &field),
        field,
        operator: operator
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        value: row.get(6)?,
        creation_date: row.get(7)?,
        expire_date: row.get(8)?,
        action: action
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?,
    })
}

pub(crate) fn select_job(conn: &Connection, job_id: &str) -> rusqlite::Result<Option<Job>> {
    conn.query_row(
        &select_sql("WHERE JobID = ?1"),
        params![job_id],
        row_to_job,
    )
    .optional()
}

/// Every job matching `filter`, which may also carry an `ORDER BY`.
pub(crate) fn select_jobs(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> rusqlite::Result<Vec<Job>> {
    let mut stmt = conn.prepare(&select_sql(filter))?;
    let rows = stmt.query_map(params, row_to_job)?;
    rows.collect()
}

/// Inserts `job` as is; the caller decides about conflicts.
pub(crate) fn insert_job(conn: &Connection, job: &Job) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO PeerJobs (JobID, Configuration, Peer, Field, FieldKind, Operator, Value, \
         CreationDate, ExpireDate, Action) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            job.job_id,
            job.configuration,
            job.peer,
            job.field,
            job.field_kind.as_str(),
            job.operator.as_str(),
            job.value,
            job.creation_date,
            job.expire_date,
            job.action.as_str(),
        ],
    )?;
    Ok(())
}

/// True for any row with this id, active or expired.
pub(crate) fn job_exists(conn: &Connection, job_id: &str) -> rusqlite::Result<bool> {
    conn.prepare("SELECT 1 FROM PeerJobs WHERE JobID = ?1")?
        .exists(params![job_id])
}
