//! Portable, line-oriented export of jobs.
//!
//! A dump is one fully literal `INSERT` statement per line. Restoring parses
//! each statement back into a [`Job`] and inserts it through a bound
//! statement, one transaction per line.

use std::io::{BufRead, Write};

use chrono::NaiveDateTime;
use rusqlite::params;
use tracing::{info, instrument, warn};

use super::JobStore;
use super::schema::{self, COLUMNS, TABLE};
use crate::error::{JobError, Result};
use crate::job::{self, FieldKind, Job};

const MAX_ERROR_LINE: usize = 120;

/// Counts of a finished restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub inserted: usize,
    /// Lines skipped because a job with the same id already existed.
    pub skipped: usize,
}

impl JobStore {
    /// One literal statement per active job of `configuration`.
    pub fn dump(&self, configuration: &str) -> Result<Vec<String>> {
        let jobs = schema::select_jobs(
            &self.conn,
            "WHERE Configuration = ?1 AND ExpireDate IS NULL ORDER BY CreationDate, JobID",
            params![configuration],
        )?;
        Ok(jobs.iter().map(insert_statement).collect())
    }

    /// Writes [`JobStore::dump`] newline-separated. Returns the number of jobs.
    pub fn write_dump(&self, configuration: &str, mut writer: impl Write) -> Result<usize> {
        let lines = self.dump(configuration)?;
        for line in &lines {
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
        Ok(lines.len())
    }

    /// Replays a dump. With `merge`, statements whose job id already exists
    /// are skipped.
    ///
    /// The first failing line aborts the restore; lines before it stay
    /// committed.
    #[instrument(skip_all, fields(merge = merge))]
    pub fn restore(&mut self, mut reader: impl BufRead, merge: bool) -> Result<RestoreSummary> {
        let mut summary = RestoreSummary::default();
        let mut buf = Vec::new();
        let mut line_number = 0;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => line_number += 1,
                Err(err) => return Err(self.abort_restore(line_number + 1, "", err)),
            }

            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line,
                Err(err) => {
                    let lossy = String::from_utf8_lossy(&buf);
                    return Err(self.abort_restore(
                        line_number,
                        lossy.trim(),
                        format!("line is not valid UTF-8: {err}"),
                    ));
                }
            };
            let statement = line.trim();
            if statement.is_empty() || statement.starts_with("--") {
                continue;
            }

            match self.restore_statement(statement, merge) {
                Ok(true) => summary.inserted += 1,
                Ok(false) => summary.skipped += 1,
                Err(err) => return Err(self.abort_restore(line_number, statement, err)),
            }
        }

        self.reload()?;
        info!(
            inserted = summary.inserted,
            skipped = summary.skipped,
            "restore finished"
        );
        Ok(summary)
    }

    /// Reloads the snapshot so lines committed before the failure are
    /// visible, then describes the failing line.
    fn abort_restore(
        &mut self,
        line_number: usize,
        statement: &str,
        reason: impl std::fmt::Display,
    ) -> JobError {
        if let Err(reload_err) = self.reload() {
            warn!(error = %reload_err, "failed to reload jobs after aborted restore");
        }
        JobError::Restore {
            line_number,
            line: truncate(statement, MAX_ERROR_LINE),
            reason: reason.to_string(),
        }
    }

    /// Returns whether the statement was applied (`false` when skipped).
    fn restore_statement(&mut self, statement: &str, merge: bool) -> Result<bool> {
        let job = parse_insert(statement)?;
        let tx = self.conn.transaction()?;
        if merge && schema::job_exists(&tx, &job.job_id)? {
            return Ok(false);
        }
        schema::insert_job(&tx, &job)?;
        tx.commit()?;
        Ok(true)
    }
}

fn truncate(line: &str, max: usize) -> String {
    if line.chars().count() <= max {
        line.to_string()
    } else {
        let mut out: String = line.chars().take(max).collect();
        out.push_str("...");
        out
    }
}

/// Single-quotes `text`, doubling embedded quotes. Control characters are
/// spliced in as `char(N)` so every statement stays on one line.
fn quote(text: &str) -> String {
    let mut parts = Vec::new();
    let mut run = String::new();
    for c in text.chars() {
        if c.is_control() {
            if !run.is_empty() {
                parts.push(format!("'{}'", run.replace('\'', "''")));
                run.clear();
            }
            parts.push(format!("char({})", u32::from(c)));
        } else {
            run.push(c);
        }
    }
    if !run.is_empty() || parts.is_empty() {
        parts.push(format!("'{}'", run.replace('\'', "''")));
    }
    parts.join(" || ")
}

fn timestamp_literal(ts: &NaiveDateTime) -> String {
    quote(&ts.format("%Y-%m-%d %H:%M:%S%.f").to_string())
}

/// Renders a job as a self-contained `INSERT` statement.
pub(crate) fn insert_statement(job: &Job) -> String {
    let values = [
        quote(&job.job_id),
        quote(&job.configuration),
        quote(&job.peer),
        quote(&job.field),
        quote(job.field_kind.as_str()),
        quote(job.operator.as_str()),
        quote(&job.value),
        timestamp_literal(&job.creation_date),
        job.expire_date
            .as_ref()
            .map(timestamp_literal)
            .unwrap_or_else(|| "NULL".to_string()),
        quote(job.action.as_str()),
    ];
    format!(
        "INSERT INTO {TABLE} ({}) VALUES ({});",
        COLUMNS.join(", "),
        values.join(", ")
    )
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Keyword, bare identifier, number or `NULL`.
    Word(String),
    /// `'single quoted'` text.
    Text(String),
    /// `"double"` or `` `back` `` quoted identifier.
    Ident(String),
    Open,
    Close,
    Comma,
    Semicolon,
    /// `||` string concatenation.
    Concat,
}

fn tokenize(statement: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = statement.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            ';' => {
                chars.next();
                tokens.push(Token::Semicolon);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(JobError::InvalidStatement("expected ||".into()));
                }
                tokens.push(Token::Concat);
            }
            '\'' | '"' | '`' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        // A doubled quote is an escaped quote.
                        Some(q) if q == c && chars.peek() == Some(&c) => {
                            chars.next();
                            text.push(c);
                        }
                        Some(q) if q == c => break,
                        Some(other) => text.push(other),
                        None => {
                            return Err(JobError::InvalidStatement(
                                "unterminated quoted literal".into(),
                            ));
                        }
                    }
                }
                tokens.push(if c == '\'' {
                    Token::Text(text)
                } else {
                    Token::Ident(text)
                });
            }
            c if c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | '+') => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | '+') {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
            other => {
                return Err(JobError::InvalidStatement(format!(
                    "unexpected character {other:?}"
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: std::iter::Peekable<std::vec::IntoIter<Token>>,
}

impl Parser {
    fn next(&mut self) -> Result<Token> {
        self.tokens
            .next()
            .ok_or_else(|| JobError::InvalidStatement("unexpected end of statement".into()))
    }

    fn keyword(&mut self, expected: &str) -> Result<()> {
        match self.next()? {
            Token::Word(w) if w.eq_ignore_ascii_case(expected) => Ok(()),
            other => Err(JobError::InvalidStatement(format!(
                "expected {expected}, found {other:?}"
            ))),
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        let token = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(JobError::InvalidStatement(format!(
                "expected {expected:?}, found {token:?}"
            )))
        }
    }

    fn identifier(&mut self) -> Result<String> {
        match self.next()? {
            Token::Word(w) | Token::Ident(w) => Ok(w),
            other => Err(JobError::InvalidStatement(format!(
                "expected identifier, found {other:?}"
            ))),
        }
    }

    /// `NULL` becomes `None`; quoted text and bare words are taken literally
    /// and may be joined with `||`.
    fn literal(&mut self) -> Result<Option<String>> {
        let Some(mut text) = self.term()? else {
            if self.tokens.peek() == Some(&Token::Concat) {
                return Err(JobError::InvalidStatement("NULL cannot be concatenated".into()));
            }
            return Ok(None);
        };
        while self.tokens.next_if_eq(&Token::Concat).is_some() {
            let part = self.term()?.ok_or_else(|| {
                JobError::InvalidStatement("NULL cannot be concatenated".into())
            })?;
            text.push_str(&part);
        }
        Ok(Some(text))
    }

    /// One operand of a literal: `NULL`, text, a bare word or `char(N, ...)`.
    fn term(&mut self) -> Result<Option<String>> {
        match self.next()? {
            Token::Word(w) if w.eq_ignore_ascii_case("NULL") => Ok(None),
            Token::Word(w)
                if w.eq_ignore_ascii_case("char") && self.tokens.peek() == Some(&Token::Open) =>
            {
                let codes = self.list(Parser::code_point)?;
                Ok(Some(codes.into_iter().collect()))
            }
            Token::Word(w) | Token::Text(w) => Ok(Some(w)),
            other => Err(JobError::InvalidStatement(format!(
                "expected literal, found {other:?}"
            ))),
        }
    }

    fn code_point(&mut self) -> Result<char> {
        match self.next()? {
            Token::Word(w) => w
                .parse::<u32>()
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| JobError::InvalidStatement(format!("invalid character code {w}"))),
            other => Err(JobError::InvalidStatement(format!(
                "expected character code, found {other:?}"
            ))),
        }
    }

    /// Parses `( item, item, ... )`.
    fn list<T>(&mut self, mut item: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        self.expect(Token::Open)?;
        let mut items = vec![item(self)?];
        loop {
            match self.next()? {
                Token::Comma => items.push(item(self)?),
                Token::Close => return Ok(items),
                other => {
                    return Err(JobError::InvalidStatement(format!(
                        "expected , or ), found {other:?}"
                    )));
                }
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        match self.tokens.next() {
            None | Some(Token::Semicolon) => {}
            Some(other) => {
                return Err(JobError::InvalidStatement(format!(
                    "unexpected {other:?} after VALUES"
                )));
            }
        }
        match self.tokens.next() {
            None => Ok(()),
            Some(other) => Err(JobError::InvalidStatement(format!(
                "unexpected {other:?} after statement end"
            ))),
        }
    }
}

/// Parses one literal `INSERT INTO PeerJobs (...) VALUES (...);` statement.
pub(crate) fn parse_insert(statement: &str) -> Result<Job> {
    let mut parser = Parser {
        tokens: tokenize(statement)?.into_iter().peekable(),
    };

    parser.keyword("INSERT")?;
    parser.keyword("INTO")?;
    let table = parser.identifier()?;
    if !table.eq_ignore_ascii_case(TABLE) {
        return Err(JobError::InvalidStatement(format!(
            "unexpected table {table}"
        )));
    }
    let columns = parser.list(Parser::identifier)?;
    parser.keyword("VALUES")?;
    let values = parser.list(Parser::literal)?;
    parser.finish()?;

    if columns.len() != values.len() {
        return Err(JobError::InvalidStatement(format!(
            "{} columns but {} values",
            columns.len(),
            values.len()
        )));
    }

    let mut row: [Option<String>; COLUMNS.len()] = Default::default();
    for (column, value) in columns.iter().zip(values) {
        let index = COLUMNS
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .ok_or_else(|| JobError::InvalidStatement(format!("unknown column {column}")))?;
        row[index] = value;
    }

    let required = |index: usize| -> Result<String> {
        row[index]
            .clone()
            .ok_or_else(|| JobError::InvalidStatement(format!("missing {}", COLUMNS[index])))
    };

    let field = required(3)?;
    let field_kind = FieldKind::from_column(row[4].as_deref(), &field);
    if field_kind != FieldKind::resolve(&field) {
        return Err(JobError::InvalidStatement(format!(
            "FieldKind {} does not match Field {field}",
            field_kind.as_str()
        )));
    }

    let creation_date = parse_timestamp(&required(7)?)?;
    if creation_date > job::now() {
        return Err(JobError::InvalidStatement(format!(
            "CreationDate {creation_date} is in the future"
        )));
    }
    let expire_date = row[8].as_deref().map(parse_timestamp).transpose()?;
    if let Some(expire_date) = expire_date
        && expire_date < creation_date
    {
        return Err(JobError::InvalidStatement(format!(
            "ExpireDate {expire_date} is before CreationDate {creation_date}"
        )));
    }

    Ok(Job {
        job_id: required(0)?,
        configuration: required(1)?,
        peer: required(2)?,
        field,
        field_kind,
        operator: required(5)?.parse()?,
        value: required(6)?,
        creation_date,
        expire_date,
        action: required(9)?.parse()?,
    })
}

fn parse_timestamp(text: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|e| JobError::InvalidStatement(format!("invalid timestamp {text:?}: {e}")))
}
