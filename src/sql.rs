use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::BookingRequest;
use crate::model::*;
use crate::time::{parse_time_of_day, Minutes, TimeOfDay};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertBusiness(BusinessSettings),
    UpsertStaff(StaffMember),
    UpsertService(ServiceSpec),
    UpsertWorkingHours(WorkingInterval),
    GrantQualification {
        staff_id: Ulid,
        service_id: Ulid,
    },
    RevokeQualification {
        staff_id: Ulid,
        service_id: Ulid,
    },
    InsertReservation(BookingRequest),
    UpdateReservationStatus {
        id: Ulid,
        status: ReservationStatus,
    },
    SelectSlots {
        business_id: Ulid,
        service_id: Ulid,
        staff_id: Option<Ulid>,
        date: NaiveDate,
    },
    SelectReservations(ReservationFilter),
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

/// Split a simple-query string on `;` outside single-quoted literals.
/// Blank statements are dropped.
pub fn split_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut in_quote = false;
    let mut start = 0;
    for (i, ch) in sql.char_indices() {
        match ch {
            '\'' => in_quote = !in_quote,
            ';' if !in_quote => {
                statements.push(&sql[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    statements.push(&sql[start..]);
    statements.retain(|s| !s.trim().is_empty());
    statements
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().to_string();
        return Ok(Command::Listen { channel });
    }
    if upper == "UNLISTEN *" {
        return Ok(Command::UnlistenAll);
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().to_string();
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let arity = |min: usize, max: usize| {
        if values.len() < min || values.len() > max {
            Err(SqlError::WrongArity(table_label(&table), min, values.len()))
        } else {
            Ok(())
        }
    };
    let opt = |i: usize| values.get(i).filter(|e| !is_null(e));

    match table.as_str() {
        "businesses" => {
            arity(1, 5)?;
            let mut settings = BusinessSettings::new(parse_ulid(&values[0])?);
            settings.name = opt(1).map(parse_string).transpose()?;
            if let Some(e) = opt(2) {
                settings.buffer_minutes = parse_u32(e)?;
            }
            if let Some(e) = opt(3) {
                settings.max_advance_days = parse_u32(e)?;
            }
            if let Some(e) = opt(4) {
                settings.granularity_minutes = parse_u32(e)?;
            }
            Ok(Command::UpsertBusiness(settings))
        }
        "staff" => {
            arity(3, 4)?;
            Ok(Command::UpsertStaff(StaffMember {
                id: parse_ulid(&values[0])?,
                business_id: parse_ulid(&values[1])?,
                name: parse_string(&values[2])?,
                active: opt(3).map(parse_bool).transpose()?.unwrap_or(true),
            }))
        }
        "services" => {
            arity(4, 4)?;
            Ok(Command::UpsertService(ServiceSpec {
                id: parse_ulid(&values[0])?,
                business_id: parse_ulid(&values[1])?,
                name: parse_string(&values[2])?,
                duration_minutes: parse_u32(&values[3])?,
            }))
        }
        "working_hours" => {
            arity(4, 5)?;
            let weekday = parse_u32(&values[1])?;
            if weekday > 6 {
                return Err(SqlError::InvalidValue(format!(
                    "weekday {weekday} (0 = Sunday … 6 = Saturday)"
                )));
            }
            Ok(Command::UpsertWorkingHours(WorkingInterval {
                staff_id: parse_ulid(&values[0])?,
                weekday: weekday as u8,
                start_time: parse_time(&values[2])?,
                end_time: parse_time(&values[3])?,
                active: opt(4).map(parse_bool).transpose()?.unwrap_or(true),
            }))
        }
        "qualifications" => {
            arity(2, 2)?;
            Ok(Command::GrantQualification {
                staff_id: parse_ulid(&values[0])?,
                service_id: parse_ulid(&values[1])?,
            })
        }
        "reservations" => {
            arity(7, 8)?;
            Ok(Command::InsertReservation(BookingRequest {
                business_id: parse_ulid(&values[0])?,
                staff_id: parse_ulid(&values[1])?,
                service_id: parse_ulid(&values[2])?,
                date: parse_date(&values[3])?,
                time: parse_time(&values[4])?,
                customer: CustomerInfo {
                    name: parse_string(&values[5])?,
                    contact: parse_string(&values[6])?,
                    notes: opt(7).map(parse_string).transpose()?,
                },
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "qualifications" {
        return Err(SqlError::Unsupported(format!("DELETE FROM {table}")));
    }
    let mut filters = Filters::collect(delete.selection.as_ref(), &["staff_id", "service_id"])?;
    Ok(Command::RevokeQualification {
        staff_id: filters.required("staff_id", parse_ulid)?,
        service_id: filters.required("service_id", parse_ulid)?,
    })
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "reservations" {
        return Err(SqlError::Unsupported(format!("UPDATE {table}")));
    }
    let [assignment] = assignments else {
        return Err(SqlError::Unsupported("UPDATE must set exactly status".into()));
    };
    let column = match &assignment.target {
        AssignmentTarget::ColumnName(name) => object_name_last(name),
        AssignmentTarget::Tuple(_) => None,
    };
    if column.as_deref() != Some("status") {
        return Err(SqlError::UnknownColumn(column.unwrap_or_default()));
    }

    let mut filters = Filters::collect(selection, &["id"])?;
    Ok(Command::UpdateReservationStatus {
        id: filters.required("id", parse_ulid)?,
        status: parse_status(&assignment.value)?,
    })
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
        "slots" => {
            let mut filters = Filters::collect(
                select.selection.as_ref(),
                &["business_id", "service_id", "date", "staff_id"],
            )?;
            Ok(Command::SelectSlots {
                business_id: filters.required("business_id", parse_ulid)?,
                service_id: filters.required("service_id", parse_ulid)?,
                date: filters.required("date", parse_date)?,
                staff_id: filters.optional("staff_id", parse_ulid)?,
            })
        }
        "reservations" => {
            let mut filters = Filters::collect(
                select.selection.as_ref(),
                &["business_id", "staff_id", "date", "status"],
            )?;
            Ok(Command::SelectReservations(ReservationFilter {
                business_id: filters.required("business_id", parse_ulid)?,
                staff_id: filters.optional("staff_id", parse_ulid)?,
                date: filters.optional("date", parse_date)?,
                status: filters.optional("status", parse_status)?,
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE filters ─────────────────────────────────────────────

/// `col = value [AND col = value …]` over a fixed set of columns. Any other
/// shape, an unknown column or a repeated one is an error.
struct Filters<'a> {
    found: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>, allowed: &[&str]) -> Result<Self, SqlError> {
        let mut filters = Filters { found: Vec::new() };
        if let Some(expr) = selection {
            filters.walk(expr, allowed)?;
        }
        Ok(filters)
    }

    fn walk(&mut self, expr: &'a Expr, allowed: &[&str]) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.walk(inner, allowed),
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                self.walk(left, allowed)?;
                self.walk(right, allowed)
            }
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                if !allowed.contains(&column.as_str()) {
                    return Err(SqlError::UnknownColumn(column));
                }
                if self.found.iter().any(|(c, _)| *c == column) {
                    return Err(SqlError::Parse(format!("{column} filtered twice")));
                }
                self.found.push((column, right));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    fn optional<T>(
        &mut self,
        column: &'static str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        match self.found.iter().position(|(c, _)| c == column) {
            Some(i) => {
                let (_, expr) = self.found.swap_remove(i);
                parse(expr).map(Some)
            }
            None => Ok(None),
        }
    }

    fn required<T>(
        &mut self,
        column: &'static str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<T, SqlError> {
        self.optional(column, parse)?
            .ok_or(SqlError::MissingFilter(column))
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn table_label(table: &str) -> &'static str {
    match table {
        "businesses" => "businesses",
        "staff" => "staff",
        "services" => "services",
        "working_hours" => "working_hours",
        "qualifications" => "qualifications",
        "reservations" => "reservations",
        _ => "table",
    }
}

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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
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

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Text of a quoted string or bare number literal.
fn literal_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = literal_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::InvalidValue(format!("bad id {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<Minutes, SqlError> {
    let s = literal_text(expr)?;
    s.trim()
        .parse()
        .map_err(|_| SqlError::InvalidValue(format!("expected non-negative integer, got {s:?}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::InvalidValue(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// `YYYY-MM-DD`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = literal_text(expr)?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| SqlError::InvalidValue(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

fn parse_time(expr: &Expr) -> Result<TimeOfDay, SqlError> {
    let s = literal_text(expr)?;
    parse_time_of_day(s).map_err(|e| SqlError::InvalidValue(e.to_string()))
}

fn parse_status(expr: &Expr) -> Result<ReservationStatus, SqlError> {
    literal_text(expr)?
        .parse()
        .map_err(SqlError::InvalidValue)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value the domain rejects.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
