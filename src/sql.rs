use std::collections::HashMap;

use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::catalog::SlotKey;
use crate::config::parse_date;
use crate::engine::{BookingRequest, CancelRequest};
use crate::limits::MAX_SQL_LEN;
use crate::model::ReservationFilter;
use crate::notify::Channel;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertReservation(BookingRequest),
    DeleteReservation(CancelRequest),
    SelectReservations(ReservationFilter),
    SelectSlots {
        date: NaiveDate,
        lab_id: String,
        student_id: Option<String>,
    },
    SelectStations,
    Listen {
        channel: Channel,
    },
    Unlisten {
        channel: Channel,
    },
    UnlistenAll,
}

/// Tables a SELECT can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Reservations,
    Slots,
    Stations,
}

impl Table {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "reservations" => Some(Table::Reservations),
            "slots" => Some(Table::Slots),
            "stations" => Some(Table::Stations),
            _ => None,
        }
    }
}

const INSERT_COLUMNS: [&str; 6] = ["student_id", "student_name", "auth_number", "date", "lab_id", "time_slot"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong(sql.len()));
    }
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(rest) = strip_keyword(trimmed, "LISTEN") {
        return Ok(Command::Listen {
            channel: parse_channel(rest)?,
        });
    }
    if let Some(rest) = strip_keyword(trimmed, "UNLISTEN") {
        if rest == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten {
            channel: parse_channel(rest)?,
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// The table a SELECT reads from, if `sql` is one. Placeholders are allowed.
pub fn select_target(sql: &str) -> Option<Table> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    match stmts.first()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(select) => {
                let table = table_factor_name(&select.from.first()?.relation).ok()?;
                Table::from_name(&table)
            }
            _ => None,
        },
        _ => None,
    }
}

fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    let rest = &sql[keyword.len()..];
    (head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace)).then(|| rest.trim())
}

fn parse_channel(name: &str) -> Result<Channel, SqlError> {
    Channel::parse(name).ok_or_else(|| SqlError::BadChannel(name.to_string()))
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }
    let values = extract_insert_values(insert)?;

    let columns: Vec<String> = if insert.columns.is_empty() {
        INSERT_COLUMNS.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity("reservations", columns.len(), values.len()));
    }

    let mut fields: HashMap<String, Option<String>> = HashMap::new();
    for (column, expr) in columns.into_iter().zip(values) {
        if !INSERT_COLUMNS.contains(&column.as_str()) {
            return Err(SqlError::UnknownColumn(column));
        }
        fields.insert(column, parse_literal(expr)?);
    }

    let mut take = |column: &'static str| -> Result<String, SqlError> {
        fields
            .remove(column)
            .flatten()
            .ok_or(SqlError::MissingColumn(column))
    };
    let student_id = take("student_id")?;
    let auth_number = take("auth_number")?;
    let date = parse_date_value(&take("date")?)?;
    let lab_id = take("lab_id")?;
    let time_slot = take("time_slot")?;
    let student_name = fields.remove("student_name").flatten();

    Ok(Command::InsertReservation(BookingRequest {
        student_id,
        student_name,
        auth_number,
        slot: SlotKey::new(date, lab_id, time_slot),
    }))
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "reservations" {
        return Err(SqlError::UnknownTable(table));
    }
    let mut conditions = Conditions::from_where(delete.selection.as_ref())?;
    conditions.only(&["student_id", "auth_number", "date", "lab_id", "time_slot"])?;

    Ok(Command::DeleteReservation(CancelRequest {
        student_id: conditions.required("student_id")?,
        auth_number: conditions.required("auth_number")?,
        slot: SlotKey::new(
            parse_date_value(&conditions.required("date")?)?,
            conditions.required("lab_id")?,
            conditions.required("time_slot")?,
        ),
    }))
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let name = table_factor_name(&select.from[0].relation)?;
    let table = Table::from_name(&name).ok_or(SqlError::UnknownTable(name))?;
    let mut conditions = Conditions::from_where(select.selection.as_ref())?;

    match table {
        Table::Reservations => {
            conditions.only(&["date", "lab_id", "student_id", "time_slot"])?;
            let dates = conditions
                .all("date")
                .iter()
                .map(|d| parse_date_value(d))
                .collect::<Result<Vec<_>, _>>()?;
            let mut filter = ReservationFilter::dates(dates);
            if let Some(lab) = conditions.optional("lab_id")? {
                filter = filter.with_lab(lab);
            }
            if let Some(student) = conditions.optional("student_id")? {
                filter = filter.with_student(student);
            }
            if let Some(slot) = conditions.optional("time_slot")? {
                filter = filter.with_time_slot(slot);
            }
            Ok(Command::SelectReservations(filter))
        }
        Table::Slots => {
            conditions.only(&["date", "lab_id", "student_id"])?;
            Ok(Command::SelectSlots {
                date: parse_date_value(&conditions.required("date")?)?,
                lab_id: conditions.required("lab_id")?,
                student_id: conditions.optional("student_id")?,
            })
        }
        Table::Stations => {
            conditions.only(&[])?;
            Ok(Command::SelectStations)
        }
    }
}

/// Equality and `IN` filters from a WHERE clause joined by AND.
#[derive(Debug, Default)]
struct Conditions(HashMap<String, Vec<String>>);

impl Conditions {
    fn from_where(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut conditions = Conditions::default();
        if let Some(expr) = selection {
            conditions.collect(expr)?;
        }
        Ok(conditions)
    }

    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                self.collect(left)?;
                self.collect(right)
            }
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("condition on {left}")))?;
                let value = parse_literal(right)?.ok_or(SqlError::NullFilter(column.clone()))?;
                self.0.entry(column).or_default().push(value);
                Ok(())
            }
            Expr::InList {
                expr: inner,
                list,
                negated: false,
            } => {
                let column = expr_column_name(inner)
                    .ok_or_else(|| SqlError::Unsupported(format!("condition on {inner}")))?;
                let entry = self.0.entry(column.clone()).or_default();
                for item in list {
                    entry.push(parse_literal(item)?.ok_or(SqlError::NullFilter(column.clone()))?);
                }
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
        }
    }

    fn only(&mut self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.0.keys().find(|k| !allowed.contains(&k.as_str())) {
            Some(column) => Err(SqlError::UnknownColumn(column.clone())),
            None => Ok(()),
        }
    }

    fn all(&self, column: &str) -> &[String] {
        self.0.get(column).map_or(&[], Vec::as_slice)
    }

    fn optional(&mut self, column: &'static str) -> Result<Option<String>, SqlError> {
        match self.0.remove(column) {
            None => Ok(None),
            Some(mut values) if values.len() == 1 => Ok(values.pop()),
            Some(_) => Err(SqlError::Unsupported(format!("multiple values for {column}"))),
        }
    }

    fn required(&mut self, column: &'static str) -> Result<String, SqlError> {
        self.optional(column)?.ok_or(SqlError::MissingFilter(column))
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

/// A literal as text. `None` for NULL. Numbers are kept verbatim so that
/// unquoted ids and codes keep their leading zeros as written.
fn parse_literal(expr: &Expr) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            _ => Err(SqlError::Parse(format!("expected string, got {value}"))),
        },
        _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_date_value(raw: &str) -> Result<NaiveDate, SqlError> {
    parse_date(raw).map_err(|reason| SqlError::BadValue { column: "date", reason })
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    TooLong(usize),
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    NullFilter(String),
    BadValue { column: &'static str, reason: String },
    BadChannel(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::TooLong(n) => write!(f, "query too long: {n} bytes (max {MAX_SQL_LEN})"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::NullFilter(col) => write!(f, "NULL is not a valid filter for {col}"),
            SqlError::BadValue { column, reason } => write!(f, "bad {column}: {reason}"),
            SqlError::BadChannel(ch) => write!(
                f,
                "invalid channel: {ch} (expected reservations or reservations_YYYYMMDD)"
            ),
        }
    }
}

impl std::error::Error for SqlError {}
