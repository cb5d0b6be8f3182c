use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::timezone::{parse_instant, parse_time_of_day};
use crate::engine::{EngineError, SuggestRequest, TierPreference};
use crate::limits::MAX_SQL_LEN;
use crate::model::*;

/// How a booking is addressed in single-row lookups.
#[derive(Debug, Clone, PartialEq)]
pub enum BookingKey {
    Id(Ulid),
    RequestNumber(String),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBooking(NewBooking),
    SelectDay { date: String, caller: Option<Ulid> },
    SelectBooking { key: BookingKey, caller: Option<Ulid> },
    SelectSuggestion(SuggestRequest),
    SelectRateTier { at: Ms },
    UpdateStatus { id: Ulid, status: BookingStatus },
    DeleteBooking { id: Ulid },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong(sql.len()));
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        Statement::Update { table, assignments, selection, .. } => {
            let name = table_factor_name(&table.relation)?;
            if name != "bookings" {
                return Err(SqlError::UnknownTable(name));
            }
            parse_update(assignments, selection)
        }
        Statement::Delete(delete) => {
            let name = delete_table_name(delete)?;
            if name != "bookings" {
                return Err(SqlError::UnknownTable(name));
            }
            let filters = equality_filters(delete.selection.as_ref())?;
            Ok(Command::DeleteBooking { id: filters.ulid("id")?.ok_or(SqlError::MissingFilter("id"))? })
        }
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let row = single_values_row(insert)?;
    if insert.columns.len() != row.len() {
        return Err(SqlError::WrongArity("bookings", insert.columns.len(), row.len()));
    }

    let mut fields = Fields::default();
    for (column, expr) in insert.columns.iter().zip(row) {
        let name = column.value.to_lowercase();
        match name.as_str() {
            "owner_id" | "resource_id" | "start" | "end" | "duration_minutes" | "date"
            | "start_time" | "end_time" | "title" | "notes" | "priority" | "urgency" => {
                fields.0.push((name, scalar(expr)?));
            }
            _ => return Err(SqlError::UnknownColumn(name)),
        }
    }

    let owner_id = fields.ulid("owner_id")?.ok_or(SqlError::MissingColumn("owner_id"))?;
    let window = match fields.text("date")? {
        Some(date) => {
            if fields.has("start") {
                return Err(SqlError::Conflicting("start", "date"));
            }
            let start = fields.text("start_time")?.ok_or(SqlError::MissingColumn("start_time"))?;
            let end = fields.text("end_time")?;
            WindowInput::Local {
                date,
                start_minute: parse_time_of_day(&start, false).map_err(SqlError::Value)?,
                end_minute: end
                    .map(|e| parse_time_of_day(&e, true))
                    .transpose()
                    .map_err(SqlError::Value)?,
            }
        }
        None => WindowInput::Absolute {
            start: fields.instant("start")?.ok_or(SqlError::MissingColumn("start"))?,
            end: fields.instant("end")?,
            duration_minutes: fields.u32("duration_minutes")?,
        },
    };

    let metadata = BookingMetadata {
        title: fields.text("title")?,
        notes: fields.text("notes")?,
        priority: fields
            .text("priority")?
            .map(|p| Priority::parse(&p).ok_or(SqlError::BadValue("priority", p)))
            .transpose()?,
        urgency: fields
            .text("urgency")?
            .map(|u| Urgency::parse(&u).ok_or(SqlError::BadValue("urgency", u)))
            .transpose()?,
    };

    Ok(Command::InsertBooking(NewBooking {
        owner_id,
        resource_id: fields.ulid("resource_id")?,
        window,
        metadata,
    }))
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = equality_filters(select.selection.as_ref())?;

    match table.as_str() {
        "bookings" => {
            filters.only(&["id", "request_number", "date", "caller_id"])?;
            let caller = filters.ulid("caller_id")?;
            if let Some(id) = filters.ulid("id")? {
                return Ok(Command::SelectBooking { key: BookingKey::Id(id), caller });
            }
            if let Some(number) = filters.text("request_number")? {
                return Ok(Command::SelectBooking { key: BookingKey::RequestNumber(number), caller });
            }
            let date = filters.text("date")?.ok_or(SqlError::MissingFilter("date"))?;
            Ok(Command::SelectDay { date, caller })
        }
        "suggestions" => {
            filters.only(&["date", "duration_hours", "tier", "caller_id"])?;
            let tier = match filters.text("tier")? {
                Some(t) => TierPreference::parse(&t).ok_or(SqlError::BadValue("tier", t))?,
                None => TierPreference::Any,
            };
            Ok(Command::SelectSuggestion(SuggestRequest {
                date: filters.text("date")?.ok_or(SqlError::MissingFilter("date"))?,
                duration_hours: filters.f64("duration_hours")?,
                tier,
                requester: filters.ulid("caller_id")?,
            }))
        }
        "rate_tiers" => {
            filters.only(&["at"])?;
            Ok(Command::SelectRateTier {
                at: filters.instant("at")?.ok_or(SqlError::MissingFilter("at"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(assignments: &[ast::Assignment], selection: &Option<Expr>) -> Result<Command, SqlError> {
    let mut status = None;
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        if column != "status" {
            return Err(SqlError::UnknownColumn(column));
        }
        let text = match scalar(&assignment.value)? {
            Scalar::Text(s) => s,
            other => return Err(SqlError::Parse(format!("expected status string, got {other:?}"))),
        };
        status = Some(BookingStatus::parse(&text).ok_or(SqlError::BadValue("status", text))?);
    }
    let filters = equality_filters(selection.as_ref())?;
    Ok(Command::UpdateStatus {
        id: filters.ulid("id")?.ok_or(SqlError::MissingFilter("id"))?,
        status: status.ok_or(SqlError::MissingColumn("status"))?,
    })
}

// ── Scalars and filters ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Scalar {
    Null,
    Text(String),
    Number(String),
    Bool(bool),
}

fn scalar(expr: &Expr) -> Result<Scalar, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(Scalar::Null),
            Value::SingleQuotedString(s) => Ok(Scalar::Text(s.clone())),
            Value::Number(n, _) => Ok(Scalar::Number(n.clone())),
            Value::Boolean(b) => Ok(Scalar::Bool(*b)),
            other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } => match scalar(expr)? {
            Scalar::Number(n) => Ok(Scalar::Number(format!("-{n}"))),
            other => Err(SqlError::Parse(format!("cannot negate {other:?}"))),
        },
        Expr::Nested(inner) => scalar(inner),
        _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Column → literal pairs from an INSERT row or an AND-chain of equalities.
#[derive(Debug, Default)]
struct Fields(Vec<(String, Scalar)>);

impl Fields {
    fn get(&self, column: &str) -> Option<&Scalar> {
        self.0
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
            .filter(|v| **v != Scalar::Null)
    }

    fn has(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    fn only(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.0.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
            Some((c, _)) => Err(SqlError::UnknownColumn(c.clone())),
            None => Ok(()),
        }
    }

    fn text(&self, column: &'static str) -> Result<Option<String>, SqlError> {
        Ok(match self.get(column) {
            None => None,
            Some(Scalar::Text(s) | Scalar::Number(s)) => Some(s.clone()),
            Some(Scalar::Bool(b)) => Some(b.to_string()),
            Some(Scalar::Null) => None,
        })
    }

    fn ulid(&self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.text(column)?
            .map(|s| Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("{column}: bad ULID: {e}"))))
            .transpose()
    }

    /// Integer milliseconds or an RFC3339 string.
    fn instant(&self, column: &'static str) -> Result<Option<Ms>, SqlError> {
        self.text(column)?.map(|s| parse_instant(&s).map_err(SqlError::Value)).transpose()
    }

    fn u32(&self, column: &'static str) -> Result<Option<u32>, SqlError> {
        self.text(column)?
            .map(|s| s.trim().parse().map_err(|_| SqlError::BadValue(column, s)))
            .transpose()
    }

    fn f64(&self, column: &'static str) -> Result<Option<f64>, SqlError> {
        self.text(column)?
            .map(|s| s.trim().parse().map_err(|_| SqlError::BadValue(column, s)))
            .transpose()
    }
}

fn equality_filters(selection: Option<&Expr>) -> Result<Fields, SqlError> {
    fn walk(expr: &Expr, out: &mut Fields) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
                walk(left, out)?;
                walk(right, out)
            }
            Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                out.0.push((column, scalar(right)?));
                Ok(())
            }
            Expr::Nested(inner) => walk(inner, out),
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    let mut fields = Fields::default();
    if let Some(expr) = selection {
        walk(expr, &mut fields)?;
    }
    Ok(fields)
}

// ── AST helpers ───────────────────────────────────────────────

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
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables.first() {
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

fn single_values_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("one booking per INSERT".into())),
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

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
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
    Conflicting(&'static str, &'static str),
    BadValue(&'static str, String),
    /// A literal the engine's date/time parsers rejected.
    Value(EngineError),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::TooLong(n) => write!(f, "statement of {n} bytes exceeds {MAX_SQL_LEN}"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: {expected} columns but {got} values")
            }
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::Conflicting(a, b) => write!(f, "{a} and {b} cannot be combined"),
            SqlError::BadValue(col, v) => write!(f, "invalid {col}: {v}"),
            SqlError::Value(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn insert_with_absolute_window() {
        let sql = format!(
            r#"INSERT INTO bookings (owner_id, start, "end", title) VALUES ('{OWNER}', '2025-11-03T15:00:00Z', 1762185600000, 'No heat')"#
        );
        let Command::InsertBooking(req) = parse_sql(&sql).unwrap() else { panic!() };
        assert_eq!(req.owner_id.to_string(), OWNER);
        assert_eq!(req.resource_id, None);
        assert_eq!(
            req.window,
            WindowInput::Absolute { start: 1_762_182_000_000, end: Some(1_762_185_600_000), duration_minutes: None }
        );
        assert_eq!(req.metadata.title.as_deref(), Some("No heat"));
    }

    #[test]
    fn insert_with_duration_and_metadata() {
        let sql = format!(
            "INSERT INTO bookings (owner_id, resource_id, start, duration_minutes, priority, urgency) \
             VALUES ('{OWNER}', NULL, 1000, 90, 'high', 'urgent')"
        );
        let Command::InsertBooking(req) = parse_sql(&sql).unwrap() else { panic!() };
        assert_eq!(req.window, WindowInput::Absolute { start: 1000, end: None, duration_minutes: Some(90) });
        assert_eq!(req.metadata.priority, Some(Priority::High));
        assert_eq!(req.metadata.urgency, Some(Urgency::Urgent));
    }

    #[test]
    fn insert_with_local_window() {
        let sql = format!(
            "INSERT INTO bookings (owner_id, date, start_time, end_time) VALUES ('{OWNER}', '2025-11-03', '09:30', '24:00')"
        );
        let Command::InsertBooking(req) = parse_sql(&sql).unwrap() else { panic!() };
        assert_eq!(
            req.window,
            WindowInput::Local { date: "2025-11-03".into(), start_minute: 570, end_minute: Some(1440) }
        );
    }

    #[test]
    fn insert_rejects_bad_shapes() {
        let mixed = format!("INSERT INTO bookings (owner_id, date, start, start_time) VALUES ('{OWNER}', '2025-11-03', 1000, '09:00')");
        assert!(matches!(parse_sql(&mixed), Err(SqlError::Conflicting(..))));
        let no_owner = "INSERT INTO bookings (start) VALUES (1000)";
        assert!(matches!(parse_sql(no_owner), Err(SqlError::MissingColumn("owner_id"))));
        let unknown = format!("INSERT INTO bookings (owner_id, start, colour) VALUES ('{OWNER}', 1000, 'red')");
        assert!(matches!(parse_sql(&unknown), Err(SqlError::UnknownColumn(_))));
        let arity = format!("INSERT INTO bookings (owner_id, start) VALUES ('{OWNER}')");
        assert!(matches!(parse_sql(&arity), Err(SqlError::WrongArity(..))));
        let bad_priority = format!("INSERT INTO bookings (owner_id, start, priority) VALUES ('{OWNER}', 1000, 'asap')");
        assert!(matches!(parse_sql(&bad_priority), Err(SqlError::BadValue("priority", _))));
    }

    #[test]
    fn select_day_and_lookups() {
        let day = format!("SELECT * FROM bookings WHERE date = '2025-03-09' AND caller_id = '{OWNER}'");
        match parse_sql(&day).unwrap() {
            Command::SelectDay { date, caller } => {
                assert_eq!(date, "2025-03-09");
                assert_eq!(caller.map(|c| c.to_string()).as_deref(), Some(OWNER));
            }
            other => panic!("expected SelectDay, got {other:?}"),
        }

        let by_id = format!("SELECT * FROM bookings WHERE id = '{OWNER}'");
        assert!(matches!(parse_sql(&by_id).unwrap(), Command::SelectBooking { key: BookingKey::Id(_), caller: None }));

        let by_number = "SELECT * FROM bookings WHERE request_number = 'SR-2025-000042'";
        assert_eq!(
            parse_sql(by_number).unwrap(),
            Command::SelectBooking { key: BookingKey::RequestNumber("SR-2025-000042".into()), caller: None }
        );

        assert!(matches!(parse_sql("SELECT * FROM bookings"), Err(SqlError::MissingFilter("date"))));
        assert!(matches!(
            parse_sql("SELECT * FROM bookings WHERE date > '2025-03-09'"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn select_suggestions() {
        let sql = "SELECT * FROM suggestions WHERE date = '2025-11-01' AND duration_hours = 2.5 AND tier = 'premium'";
        let Command::SelectSuggestion(req) = parse_sql(sql).unwrap() else { panic!() };
        assert_eq!(req.date, "2025-11-01");
        assert_eq!(req.duration_hours, Some(2.5));
        assert_eq!(req.tier, TierPreference::Premium);
        assert_eq!(req.requester, None);

        let Command::SelectSuggestion(req) = parse_sql("SELECT * FROM suggestions WHERE date = '2025-11-01'").unwrap()
        else {
            panic!()
        };
        assert_eq!(req.duration_hours, None);
        assert_eq!(req.tier, TierPreference::Any);

        let bad = "SELECT * FROM suggestions WHERE date = '2025-11-01' AND tier = 'gold'";
        assert!(matches!(parse_sql(bad), Err(SqlError::BadValue("tier", _))));
    }

    #[test]
    fn select_rate_tier() {
        let sql = "SELECT * FROM rate_tiers WHERE at = '2025-11-01T21:00:00Z'";
        assert_eq!(parse_sql(sql).unwrap(), Command::SelectRateTier { at: 1_762_030_800_000 });
    }

    #[test]
    fn update_status_and_delete() {
        let sql = format!("UPDATE bookings SET status = 'cancelled' WHERE id = '{OWNER}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateStatus { id, status } => {
                assert_eq!(id.to_string(), OWNER);
                assert_eq!(status, BookingStatus::Cancelled);
            }
            other => panic!("expected UpdateStatus, got {other:?}"),
        }
        let bad = format!("UPDATE bookings SET status = 'archived' WHERE id = '{OWNER}'");
        assert!(matches!(parse_sql(&bad), Err(SqlError::BadValue("status", _))));
        let wrong_col = format!("UPDATE bookings SET start = 0 WHERE id = '{OWNER}'");
        assert!(matches!(parse_sql(&wrong_col), Err(SqlError::UnknownColumn(_))));

        let del = format!("DELETE FROM bookings WHERE id = '{OWNER}'");
        assert!(matches!(parse_sql(&del).unwrap(), Command::DeleteBooking { .. }));
        assert!(matches!(parse_sql("DELETE FROM bookings"), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn unknown_tables_and_empty_input() {
        assert!(matches!(parse_sql("SELECT * FROM resources WHERE id = '1'"), Err(SqlError::UnknownTable(_))));
        assert!(matches!(parse_sql(&format!("DELETE FROM holds WHERE id = '{OWNER}'")), Err(SqlError::UnknownTable(_))));
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(parse_sql(&"x".repeat(MAX_SQL_LEN + 1)), Err(SqlError::TooLong(_))));
    }
}
