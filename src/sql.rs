use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;
use crate::waitlist::WaitTarget;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        kind: ResourceKind,
        name: Option<String>,
        capacity: u32,
        buffer_after: Option<Ms>,
    },
    DeactivateResource {
        id: Ulid,
    },
    InsertOperatingHours {
        resource_id: Ulid,
        windows: Vec<OperatingWindow>,
    },
    ClearOperatingHours {
        resource_id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        requester: String,
        priority: Priority,
        waitlist: bool,
    },
    InsertHold {
        id: Ulid,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        requester: String,
        priority: Priority,
        expires_at: Ms,
    },
    ConfirmBooking {
        id: Ulid,
    },
    CompleteBooking {
        id: Ulid,
    },
    CancelBooking {
        id: Ulid,
        reason: Option<String>,
    },
    InsertWaitlist {
        id: Ulid,
        target: WaitTarget,
        start: Ms,
        end: Ms,
        duration: Option<Ms>,
        requester: String,
        priority: Priority,
    },
    WithdrawWaitlist {
        id: Ulid,
    },
    SelectAvailability {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectBookings {
        resource_id: Ulid,
    },
    SelectHistory {
        resource_id: Ulid,
    },
    SelectResources,
    SelectWaitlist,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Column order assumed when an INSERT names no columns.
fn default_columns(table: &str) -> &'static [&'static str] {
    match table {
        "resources" => &["id", "kind", "name", "capacity", "buffer_after"],
        "operating_hours" => &["resource_id", "weekday", "open", "close"],
        "bookings" => &["id", "resource_id", "start", "end", "requester", "priority"],
        "holds" => &["id", "resource_id", "start", "end", "requester", "priority", "expires_at"],
        "confirmations" | "completions" => &["booking_id"],
        "waitlist" => &["id", "resource_id", "start", "end", "duration", "requester", "priority"],
        _ => &[],
    }
}

/// One VALUES row, addressable by column name.
struct Row<'a> {
    table: &'static str,
    columns: &'a [String],
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, col: &str) -> Option<&'a Expr> {
        let i = self.columns.iter().position(|c| c == col)?;
        self.values.get(i).filter(|e| !is_null(e))
    }

    fn require(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let table: &'static str = match table.as_str() {
        "resources" => "resources",
        "operating_hours" => "operating_hours",
        "bookings" => "bookings",
        "holds" => "holds",
        "confirmations" => "confirmations",
        "completions" => "completions",
        "waitlist" => "waitlist",
        other => return Err(SqlError::UnknownTable(other.to_string())),
    };
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns(table).iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    let rows = extract_all_insert_rows(insert)?;
    if table != "operating_hours" && rows.len() > 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    let row = Row {
        table,
        columns: &columns,
        values: &rows[0],
    };

    match table {
        "resources" => Ok(Command::InsertResource {
            id: parse_ulid(row.require("id")?)?,
            kind: parse_kind(row.require("kind")?)?,
            name: row.get("name").map(parse_string).transpose()?,
            capacity: row.get("capacity").map(parse_u32).transpose()?.unwrap_or(1),
            buffer_after: row.get("buffer_after").map(parse_i64).transpose()?,
        }),
        "operating_hours" => {
            let resource_id = parse_ulid(row.require("resource_id")?)?;
            let mut windows = Vec::with_capacity(rows.len());
            for (i, values) in rows.iter().enumerate() {
                let row = Row {
                    table,
                    columns: &columns,
                    values,
                };
                if parse_ulid(row.require("resource_id")?)? != resource_id {
                    return Err(SqlError::Parse(format!("row {i}: all rows must name the same resource")));
                }
                let weekday = parse_i64(row.require("weekday")?)?;
                let weekday = u8::try_from(weekday).map_err(|_| SqlError::Parse(format!("row {i}: bad weekday {weekday}")))?;
                windows.push(OperatingWindow::new(
                    weekday,
                    parse_i64(row.require("open")?)?,
                    parse_i64(row.require("close")?)?,
                ));
            }
            Ok(Command::InsertOperatingHours { resource_id, windows })
        }
        "bookings" => Ok(Command::InsertBooking {
            id: parse_ulid(row.require("id")?)?,
            resource_id: parse_ulid(row.require("resource_id")?)?,
            start: parse_i64(row.require("start")?)?,
            end: parse_i64(row.require("end")?)?,
            requester: parse_string(row.require("requester")?)?,
            priority: parse_priority_or_routine(row.get("priority"))?,
            waitlist: row.get("waitlist").map(parse_bool).transpose()?.unwrap_or(false),
        }),
        "holds" => Ok(Command::InsertHold {
            id: parse_ulid(row.require("id")?)?,
            resource_id: parse_ulid(row.require("resource_id")?)?,
            start: parse_i64(row.require("start")?)?,
            end: parse_i64(row.require("end")?)?,
            requester: parse_string(row.require("requester")?)?,
            priority: parse_priority_or_routine(row.get("priority"))?,
            expires_at: parse_i64(row.require("expires_at")?)?,
        }),
        "confirmations" => Ok(Command::ConfirmBooking {
            id: parse_ulid(row.require("booking_id")?)?,
        }),
        "completions" => Ok(Command::CompleteBooking {
            id: parse_ulid(row.require("booking_id")?)?,
        }),
        "waitlist" => {
            let target = match (row.get("resource_id"), row.get("kind")) {
                (Some(rid), _) => WaitTarget::Resource(parse_ulid(rid)?),
                (None, Some(kind)) => WaitTarget::Kind(parse_kind(kind)?),
                (None, None) => return Err(SqlError::MissingColumn(table, "resource_id")),
            };
            Ok(Command::InsertWaitlist {
                id: parse_ulid(row.require("id")?)?,
                target,
                start: parse_i64(row.require("start")?)?,
                end: parse_i64(row.require("end")?)?,
                duration: row.get("duration").map(parse_i64).transpose()?,
                requester: parse_string(row.require("requester")?)?,
                priority: parse_priority_or_routine(row.get("priority"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let mut filters = Filters::default();
    if let Some(selection) = &delete.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "resources" => Ok(Command::DeactivateResource {
            id: filters.id.ok_or(SqlError::MissingFilter("id"))?,
        }),
        "operating_hours" => Ok(Command::ClearOperatingHours {
            resource_id: filters.resource_id.ok_or(SqlError::MissingFilter("resource_id"))?,
        }),
        "bookings" => Ok(Command::CancelBooking {
            id: filters.id.ok_or(SqlError::MissingFilter("id"))?,
            reason: filters.reason,
        }),
        "waitlist" => Ok(Command::WithdrawWaitlist {
            id: filters.id.ok_or(SqlError::MissingFilter("id"))?,
        }),
        other => Err(SqlError::UnknownTable(other.to_string())),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }
    let resource_id = || filters.resource_id.ok_or(SqlError::MissingFilter("resource_id"));

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            resource_id: resource_id()?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
            min_duration: filters.min_duration,
        }),
        "bookings" => Ok(Command::SelectBookings {
            resource_id: resource_id()?,
        }),
        "booking_history" => Ok(Command::SelectHistory {
            resource_id: resource_id()?,
        }),
        "resources" => Ok(Command::SelectResources),
        "waitlist" => Ok(Command::SelectWaitlist),
        other => Err(SqlError::UnknownTable(other.to_string())),
    }
}

/// Conditions recognised in a WHERE clause. Anything else is ignored.
#[derive(Debug, Default)]
struct Filters {
    id: Option<Ulid>,
    resource_id: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
    min_duration: Option<Ms>,
    reason: Option<String>,
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters)?,
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("id") => filters.id = Some(parse_ulid(right)?),
                Some("resource_id") => filters.resource_id = Some(parse_ulid(right)?),
                Some("min_duration") => filters.min_duration = Some(parse_i64(right)?),
                Some("reason") => filters.reason = Some(parse_string(right)?),
                _ => {}
            },
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    filters.start = Some(parse_i64(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    filters.end = Some(parse_i64(right)?);
                }
            }
            _ => {}
        },
        _ => {}
    }
    Ok(())
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
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

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_kind(expr: &Expr) -> Result<ResourceKind, SqlError> {
    parse_string(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_priority_or_routine(expr: Option<&Expr>) -> Result<Priority, SqlError> {
    match expr {
        None => Ok(Priority::Routine),
        Some(e) => parse_string(e)?.parse().map_err(SqlError::Parse),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing value for {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
