use std::collections::HashMap;

use chrono::{DateTime, NaiveDate};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;
use crate::schedule::{parse_hhmm, parse_intervals};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SetScheduleDay {
        weekday: u8,
        enabled: bool,
        intervals: Vec<DayInterval>,
    },
    InsertAssignment(NewAssignment),
    DisableAssignment {
        id: Ulid,
    },
    RequestReservation {
        id: Ulid,
        context: Context,
        start: Ms,
        duration: u32,
        client_ref: String,
    },
    Confirm {
        id: Ulid,
    },
    MarkAttendance {
        id: Ulid,
        attended: bool,
    },
    CancelReservation {
        id: Ulid,
    },
    PushExternalBusy {
        start: Ms,
        end: Ms,
        label: Option<String>,
    },
    RemoveExternalBusy {
        start: Ms,
        end: Ms,
    },
    SelectSchedule,
    SelectSlots {
        date: NaiveDate,
        duration: u32,
        context: Context,
    },
    SelectBusy {
        date: NaiveDate,
        context: Context,
    },
    SelectAssignments {
        date: NaiveDate,
        service_key: Option<String>,
    },
    SelectReservations {
        date: NaiveDate,
        context: Option<Context>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = insert_row(insert)?;

    match table.as_str() {
        "schedule" => Ok(Command::SetScheduleDay {
            weekday: parse_u8(row.required("weekday", 0)?)?,
            enabled: parse_bool(row.required("enabled", 1)?)?,
            intervals: match row.optional("intervals", 2) {
                Some(expr) if !is_null(expr) => {
                    parse_intervals(&parse_string(expr)?).map_err(SqlError::Parse)?
                }
                _ => Vec::new(),
            },
        }),
        "assignments" => Ok(Command::InsertAssignment(NewAssignment {
            id: parse_ulid(row.required("id", 0)?)?,
            date: parse_date(row.required("date", 1)?)?,
            start: parse_minute(row.required("start", 2)?)?,
            end: parse_minute(row.required("end", 3)?)?,
            staff_id: parse_u64(row.required("staff_id", 4)?)?,
            service_area_id: parse_u64(row.required("service_area_id", 5)?)?,
            service_keys: parse_string(row.required("service_keys", 6)?)?
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect(),
            capacity: match row.optional("capacity", 7) {
                Some(expr) => parse_u32(expr)?,
                None => 1,
            },
        })),
        "reservations" => Ok(Command::RequestReservation {
            id: parse_ulid(row.required("id", 0)?)?,
            context: match row.optional("assignment_id", 1) {
                Some(expr) => parse_context(expr)?,
                None => Context::Fixed,
            },
            start: parse_instant(row.required("start", 2)?)?,
            duration: parse_u32(row.required("duration", 3)?)?,
            client_ref: parse_string(row.required("client_ref", 4)?)?,
        }),
        "confirmations" => Ok(Command::Confirm {
            id: parse_ulid(row.required("reservation_id", 0)?)?,
        }),
        "attendance" => Ok(Command::MarkAttendance {
            id: parse_ulid(row.required("reservation_id", 0)?)?,
            attended: parse_bool(row.required("attended", 1)?)?,
        }),
        "external_busy" => Ok(Command::PushExternalBusy {
            start: parse_instant(row.required("start", 0)?)?,
            end: parse_instant(row.required("end", 1)?)?,
            label: match row.optional("label", 2) {
                Some(expr) if !is_null(expr) => Some(parse_string(expr)?),
                _ => None,
            },
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "assignments" => Ok(Command::DisableAssignment {
            id: extract_where_id(&delete.selection)?,
        }),
        "reservations" => Ok(Command::CancelReservation {
            id: extract_where_id(&delete.selection)?,
        }),
        // Upstream calendar events are addressed by their exact span.
        "external_busy" => {
            let mut filters = Filters::default();
            match &delete.selection {
                Some(selection) => collect_filters(selection, &mut filters)?,
                None => return Err(SqlError::MissingFilter("start")),
            }
            Ok(Command::RemoveExternalBusy {
                start: parse_instant(filters.required("start")?)?,
                end: parse_instant(filters.required("end")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "schedule" => Ok(Command::SelectSchedule),
        "slots" => Ok(Command::SelectSlots {
            date: parse_date(filters.required("date")?)?,
            duration: parse_u32(filters.required("duration")?)?,
            context: filters.context()?.unwrap_or(Context::Fixed),
        }),
        "busy" => Ok(Command::SelectBusy {
            date: parse_date(filters.required("date")?)?,
            context: filters.context()?.unwrap_or(Context::Fixed),
        }),
        "assignments" => Ok(Command::SelectAssignments {
            date: parse_date(filters.required("date")?)?,
            service_key: filters.eq.get("service_key").map(|e| parse_string(e)).transpose()?,
        }),
        "reservations" => Ok(Command::SelectReservations {
            date: parse_date(filters.required("date")?)?,
            context: filters.context()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE filters ─────────────────────────────────────────────

/// Conjunction of `column = value` and `column IS NULL` predicates.
#[derive(Default)]
struct Filters {
    eq: HashMap<String, Expr>,
    null: Vec<String>,
}

impl Filters {
    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.eq.get(column).ok_or(SqlError::MissingFilter(column))
    }

    /// `assignment_id = '...'` selects that assignment, `assignment_id IS NULL`
    /// the fixed schedule, and no predicate leaves the context open.
    fn context(&self) -> Result<Option<Context>, SqlError> {
        if let Some(expr) = self.eq.get("assignment_id") {
            return parse_context(expr).map(Some);
        }
        if self.null.iter().any(|c| c == "assignment_id") {
            return Ok(Some(Context::Fixed));
        }
        Ok(None)
    }
}

fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, filters)?;
                collect_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                filters.eq.insert(col, right.as_ref().clone());
            }
            other => return Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        Expr::IsNull(inner) => {
            if let Some(col) = expr_column_name(inner) {
                filters.null.push(col);
            }
        }
        Expr::Nested(inner) => collect_filters(inner, filters)?,
        other => return Err(SqlError::Unsupported(format!("filter {other}"))),
    }
    Ok(())
}

// ── INSERT rows ───────────────────────────────────────────────

/// First VALUES row, addressable by column name when a column list is given
/// and by position otherwise.
struct Row {
    columns: Vec<String>,
    values: Vec<Expr>,
}

impl Row {
    fn optional(&self, column: &str, position: usize) -> Option<&Expr> {
        if self.columns.is_empty() {
            self.values.get(position)
        } else {
            self.columns
                .iter()
                .position(|c| c == column)
                .and_then(|i| self.values.get(i))
        }
    }

    fn required(&self, column: &'static str, position: usize) -> Result<&Expr, SqlError> {
        self.optional(column, position).ok_or(SqlError::MissingColumn(column))
    }
}

fn insert_row(insert: &ast::Insert) -> Result<Row, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    match values.rows.as_slice() {
        [] => Err(SqlError::Parse("empty VALUES".into())),
        [row] => {
            let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
            if !columns.is_empty() && columns.len() != row.len() {
                return Err(SqlError::WrongArity(columns.len(), row.len()));
            }
            Ok(Row {
                columns,
                values: row.clone(),
            })
        }
        _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection.as_ref().ok_or(SqlError::MissingFilter("id"))? {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

/// NULL → fixed schedule, ULID → that assignment.
fn parse_context(expr: &Expr) -> Result<Context, SqlError> {
    if is_null(expr) {
        Ok(Context::Fixed)
    } else {
        parse_ulid(expr).map(Context::Assignment)
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// `'YYYY-MM-DD'`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

/// Minute-of-day as `'HH:MM'` or a plain minute count.
fn parse_minute(expr: &Expr) -> Result<u32, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) if s.contains(':') => parse_hhmm(s).map_err(SqlError::Parse),
        _ => parse_u32(expr),
    }
}

/// Absolute instant as unix milliseconds or an RFC 3339 string with offset.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) if s.contains('T') => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}"))),
        _ => parse_i64(expr),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0} columns but {1} values")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
