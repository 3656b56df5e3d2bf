use chrono::{DateTime, Utc};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertFacility {
        organization_id: OrganizationId,
        name: String,
        latitude: f64,
        longitude: f64,
        description: String,
    },
    InsertOperatingHours {
        facility_id: Ulid,
        hours: Vec<OperatingHour>,
    },
    InsertRequest {
        event_id: EventId,
        facility_id: Ulid,
        start: Instant,
        finish: Instant,
    },
    ApproveRequest {
        id: Ulid,
    },
    RejectRequest {
        id: Ulid,
        reason: String,
    },
    SelectRequest {
        id: Ulid,
    },
    SelectRequestDetails {
        id: Ulid,
    },
    SelectFacility {
        id: Ulid,
    },
    SelectAvailability {
        facility_id: Ulid,
        start: Instant,
        finish: Instant,
    },
}

const FACILITY_COLUMNS: &[&str] = &["organization_id", "name", "latitude", "longitude", "description"];
const HOURS_COLUMNS: &[&str] = &["facility_id", "day", "start_hour", "finish_hour"];
const REQUEST_COLUMNS: &[&str] = &["event_id", "facility_id", "start", "finish"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update { table, assignments, selection, .. } => {
            parse_update(&table.relation, assignments, selection)
        }
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;

    match table.as_str() {
        "facilities" => {
            let v = named_values(insert, single_row(&rows, "facilities")?, "facilities", FACILITY_COLUMNS)?;
            Ok(Command::InsertFacility {
                organization_id: parse_i64(v[0])?,
                name: parse_string(v[1])?,
                latitude: parse_f64(v[2])?,
                longitude: parse_f64(v[3])?,
                description: parse_string_or_null(v[4])?.unwrap_or_default(),
            })
        }
        "operating_hours" => {
            let mut facility_id = None;
            let mut hours = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let v = named_values(insert, row, "operating_hours", HOURS_COLUMNS)
                    .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                let fid = parse_ulid(v[0])?;
                if facility_id.is_some_and(|prev| prev != fid) {
                    return Err(SqlError::Parse("operating_hours rows must share one facility_id".into()));
                }
                facility_id = Some(fid);
                hours.push(OperatingHour::new(parse_day(v[1])?, parse_u32(v[2])?, parse_u32(v[3])?));
            }
            Ok(Command::InsertOperatingHours {
                facility_id: facility_id.ok_or(SqlError::Parse("empty VALUES".into()))?,
                hours,
            })
        }
        "facility_requests" => {
            let v = named_values(
                insert,
                single_row(&rows, "facility_requests")?,
                "facility_requests",
                REQUEST_COLUMNS,
            )?;
            Ok(Command::InsertRequest {
                event_id: parse_i64(v[0])?,
                facility_id: parse_ulid(v[1])?,
                start: parse_instant(v[2])?,
                finish: parse_instant(v[3])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "facility_requests" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let (mut status, mut reason) = (None, None);
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        };
        match column.as_deref() {
            Some("status") => {
                let s = parse_string(&assignment.value)?;
                status = Some(Status::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))?);
            }
            Some("reject_reason") => reason = parse_string_or_null(&assignment.value)?,
            _ => return Err(SqlError::Unsupported("only status and reject_reason can be set".into())),
        }
    }

    match (status, reason) {
        (Some(Status::Approved), None) => Ok(Command::ApproveRequest { id }),
        (Some(Status::Approved), Some(_)) => {
            Err(SqlError::Unsupported("reject_reason only goes with REJECTED".into()))
        }
        (Some(Status::Rejected), reason) => Ok(Command::RejectRequest {
            id,
            reason: reason.unwrap_or_default(),
        }),
        (Some(Status::Pending), _) => Err(SqlError::Unsupported("requests cannot return to PENDING".into())),
        (None, _) => Err(SqlError::Unsupported("UPDATE must set status".into())),
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

    match table.as_str() {
        "facility_requests" => Ok(Command::SelectRequest { id: extract_where_id(&select.selection)? }),
        "facility_request_details" => Ok(Command::SelectRequestDetails {
            id: extract_where_id(&select.selection)?,
        }),
        "facilities" => Ok(Command::SelectFacility { id: extract_where_id(&select.selection)? }),
        "availability" => {
            let mut filters = AvailabilityFilters::default();
            if let Some(selection) = &select.selection {
                filters.extract(selection)?;
            }
            Ok(Command::SelectAvailability {
                facility_id: filters.facility_id.ok_or(SqlError::MissingFilter("facility_id"))?,
                start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
                finish: filters.finish.ok_or(SqlError::MissingFilter("finish"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct AvailabilityFilters {
    facility_id: Option<Ulid>,
    start: Option<Instant>,
    finish: Option<Instant>,
}

impl AvailabilityFilters {
    fn extract(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.extract(inner),
            Expr::BinaryOp { left, op, right } => {
                let col = expr_column_name(left);
                match (op, col.as_deref()) {
                    (ast::BinaryOperator::And, _) => {
                        self.extract(left)?;
                        self.extract(right)
                    }
                    (ast::BinaryOperator::Eq, Some("facility_id")) => {
                        self.facility_id = Some(parse_ulid(right)?);
                        Ok(())
                    }
                    (ast::BinaryOperator::GtEq, Some("start")) => {
                        self.start = Some(parse_instant(right)?);
                        Ok(())
                    }
                    (ast::BinaryOperator::LtEq, Some("finish")) => {
                        self.finish = Some(parse_instant(right)?);
                        Ok(())
                    }
                    _ => Err(SqlError::Unsupported(format!("availability filter: {expr}"))),
                }
            }
            _ => Err(SqlError::Unsupported(format!("availability filter: {expr}"))),
        }
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

fn single_row<'a>(rows: &'a [Vec<Expr>], table: &'static str) -> Result<&'a [Expr], SqlError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SqlError::Unsupported(format!("{table}: one row per INSERT"))),
    }
}

/// Values of `row` in the order of `expected`. With a column list the values
/// are matched by name, otherwise positionally.
fn named_values<'a>(
    insert: &ast::Insert,
    row: &'a [Expr],
    table: &'static str,
    expected: &[&str],
) -> Result<Vec<&'a Expr>, SqlError> {
    if insert.columns.is_empty() {
        if row.len() != expected.len() {
            return Err(SqlError::WrongArity(table, expected.len(), row.len()));
        }
        return Ok(row.iter().collect());
    }
    if insert.columns.len() != row.len() {
        return Err(SqlError::WrongArity(table, insert.columns.len(), row.len()));
    }
    let names: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    if let Some(unknown) = names.iter().find(|n| !expected.contains(&n.as_str())) {
        return Err(SqlError::Parse(format!("{table}: unknown column {unknown}")));
    }
    expected
        .iter()
        .map(|col| {
            names
                .iter()
                .position(|n| n == col)
                .map(|i| &row[i])
                .ok_or_else(|| SqlError::Parse(format!("{table}: missing column {col}")))
        })
        .collect()
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
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

/// Text of a literal: quoted strings and bare numbers alike.
fn literal_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected literal, got {value:?}"))),
        None => match expr {
            Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } => Ok(format!("-{}", literal_text(expr)?)),
            _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    let s = literal_text(expr)?;
    s.trim().parse().map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    let s = literal_text(expr)?;
    s.trim().parse().map_err(|e| SqlError::Parse(format!("bad number {s}: {e}")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_day(expr: &Expr) -> Result<DayOfWeek, SqlError> {
    let s = parse_string(expr)?;
    DayOfWeek::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad weekday: {s}")))
}

/// RFC 3339 text, or Unix milliseconds as a number or numeric string.
fn parse_instant(expr: &Expr) -> Result<Instant, SqlError> {
    let s = literal_text(expr)?;
    if let Ok(t) = DateTime::parse_from_rfc3339(s.trim()) {
        return Ok(t.with_timezone(&Utc));
    }
    let ms: i64 = s
        .trim()
        .parse()
        .map_err(|_| SqlError::Parse(format!("bad timestamp: {s}")))?;
    DateTime::from_timestamp_millis(ms).ok_or_else(|| SqlError::Parse(format!("timestamp out of range: {ms}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
