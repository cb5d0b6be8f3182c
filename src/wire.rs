use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::FieldbookAuthSource;
use crate::engine::timezone::format_utc;
use crate::engine::{Engine, EngineError, RuleId, Suggestion, TierInfo};
use crate::model::*;
use crate::observability;
use crate::sql::{self, BookingKey, Command, SqlError};

pub struct FieldbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<FieldbookQueryParser>,
}

impl FieldbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(FieldbookQueryParser),
        }
    }

    async fn execute(&self, sql_text: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        debug!("{label}: {status}");
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertBooking(req) => {
                let booking = engine.create_booking(req).await.map_err(engine_err)?;
                let row = DayBooking { start: booking.start, end: booking.end(), is_own: true, booking };
                booking_rows(vec![row])
            }
            Command::SelectDay { date, caller } => {
                let rows = engine.list_day(&date, caller).await.map_err(engine_err)?;
                booking_rows(rows)
            }
            Command::SelectBooking { key, caller } => {
                let found = match key {
                    BookingKey::Id(id) => match engine.get_booking(id).await {
                        Ok(b) => Some(b),
                        Err(EngineError::NotFound(_)) => None,
                        Err(e) => return Err(engine_err(e)),
                    },
                    BookingKey::RequestNumber(n) => engine.find_by_request_number(&n).await,
                };
                // Soft-deleted records stay in the store but not on the wire.
                booking_rows(
                    found
                        .into_iter()
                        .filter(|b| !b.deleted)
                        .map(|b| DayBooking {
                            start: b.start,
                            end: b.end(),
                            is_own: caller == Some(b.owner_id),
                            booking: b,
                        })
                        .collect(),
                )
            }
            Command::SelectSuggestion(req) => {
                let suggestion = engine.suggest(&req).await.map_err(engine_err)?;
                suggestion_row(&suggestion)
            }
            Command::SelectRateTier { at } => {
                let tier = engine.resolve_tier(at).map_err(engine_err)?;
                tier_row(at, &tier)
            }
            Command::UpdateStatus { id, status } => {
                engine.set_status(id, status).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("request_number", Type::VARCHAR),
        field("owner_id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("duration_minutes", Type::INT8),
        field("status", Type::VARCHAR),
        field("priority", Type::VARCHAR),
        field("urgency", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("is_own", Type::BOOL),
    ]
}

fn suggestion_schema() -> Vec<FieldInfo> {
    vec![
        field("found", Type::BOOL),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("tier", Type::VARCHAR),
        field("level", Type::INT8),
        field("multiplier", Type::FLOAT8),
        field("message", Type::VARCHAR),
    ]
}

fn tier_schema() -> Vec<FieldInfo> {
    vec![
        field("at", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("level", Type::INT8),
        field("multiplier", Type::FLOAT8),
        field("color", Type::VARCHAR),
    ]
}

/// Result columns, decided from the statement text alone so Describe works
/// before parameters are bound.
fn schema_for(sql_text: &str) -> Vec<FieldInfo> {
    let upper = sql_text.trim_start().to_uppercase();
    if upper.starts_with("SELECT") && upper.contains("SUGGESTIONS") {
        suggestion_schema()
    } else if upper.starts_with("SELECT") && upper.contains("RATE_TIERS") {
        tier_schema()
    } else if (upper.starts_with("SELECT") || upper.starts_with("INSERT")) && upper.contains("BOOKINGS") {
        booking_schema()
    } else {
        vec![]
    }
}

fn booking_rows(rows: Vec<DayBooking>) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let encoded: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|row| {
            let b = &row.booking;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.request_number)?;
            encoder.encode_field(&b.owner_id.to_string())?;
            encoder.encode_field(&b.resource_id.map(|r| r.to_string()))?;
            encoder.encode_field(&format_utc(row.start))?;
            encoder.encode_field(&format_utc(row.end))?;
            encoder.encode_field(&(b.duration_minutes as i64))?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.priority.as_str())?;
            encoder.encode_field(&b.urgency.as_str())?;
            encoder.encode_field(&b.title)?;
            encoder.encode_field(&b.notes)?;
            encoder.encode_field(&row.is_own)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(encoded))))
}

fn suggestion_row(suggestion: &Suggestion) -> PgWireResult<Response> {
    let schema = Arc::new(suggestion_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    match suggestion {
        Suggestion::Found(slot) => {
            encoder.encode_field(&true)?;
            encoder.encode_field(&format_utc(slot.span.start))?;
            encoder.encode_field(&format_utc(slot.span.end))?;
            encoder.encode_field(&slot.tier.name)?;
            encoder.encode_field(&(slot.tier.level as i64))?;
            encoder.encode_field(&slot.tier.multiplier)?;
            encoder.encode_field(&None::<String>)?;
        }
        Suggestion::NotFound(reason) => {
            encoder.encode_field(&false)?;
            encoder.encode_field(&None::<String>)?;
            encoder.encode_field(&None::<String>)?;
            encoder.encode_field(&None::<String>)?;
            encoder.encode_field(&None::<i64>)?;
            encoder.encode_field(&None::<f64>)?;
            encoder.encode_field(&reason.to_string())?;
        }
    }
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn tier_row(at: Ms, tier: &TierInfo) -> PgWireResult<Response> {
    let schema = Arc::new(tier_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&format_utc(at))?;
    encoder.encode_field(&tier.name)?;
    encoder.encode_field(&(tier.level as i64))?;
    encoder.encode_field(&tier.multiplier)?;
    encoder.encode_field(&tier.color)?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for FieldbookHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.execute(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FieldbookQueryParser;

#[async_trait]
impl QueryParser for FieldbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FieldbookHandler {
    type Statement = String;
    type QueryParser = FieldbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.execute(&substitute_params(portal)).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if let Ok(n) = sql[start..end].parse::<usize>() {
            max = max.max(n);
        }
        i = end.max(i + 1);
    }
    max
}

/// Inline bound text parameters as quoted literals.
fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass over the statement: each `$N` outside a quoted
/// literal is replaced once, and inlined values are never rescanned.
fn inline_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let mut end = i + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let param = sql[i + 1..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| params.get(idx));
                if let Some(param) = param {
                    out.push_str(&sql[copied..i]);
                    match param {
                        Some(value) => {
                            out.push('\'');
                            out.push_str(&String::from_utf8_lossy(value.as_ref()).replace('\'', "''"));
                            out.push('\'');
                        }
                        None => out.push_str("NULL"),
                    }
                    copied = end;
                }
                i = end;
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FieldbookFactory {
    handler: Arc<FieldbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<FieldbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FieldbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(FieldbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                FieldbookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FieldbookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = FieldbookFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine error class.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidDateFormat(_) => "22007",
        EngineError::InvalidTime(_) => "22008",
        EngineError::Validation { .. } => "22023",
        EngineError::Rejected(r) => match r.rule {
            RuleId::Overlap | RuleId::BufferAfter | RuleId::BufferBefore => "23P01",
            RuleId::MinimumAdvance | RuleId::DurationTooShort | RuleId::DurationTooLong => "22023",
        },
        EngineError::ConfigurationUnavailable(_) => "55000",
        EngineError::NotFound(_) => "P0002",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::Value(inner) => sqlstate(inner),
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        SqlError::TooLong(_) => "54000",
        SqlError::BadValue(..) => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Rejection, RejectionDetail};
    use ulid::Ulid;

    #[test]
    fn placeholder_counting() {
        assert_eq!(count_params("SELECT * FROM bookings WHERE date = $1 AND caller_id = $2"), 2);
        assert_eq!(count_params("SELECT * FROM bookings WHERE id = $10"), 10);
        assert_eq!(count_params("SELECT 1"), 0);
        assert_eq!(count_params("SELECT '$' FROM x"), 0);
    }

    #[test]
    fn parameters_are_inlined_once() {
        let params = [Some("Pay $2 deposit"), Some("O'Brien"), None];
        assert_eq!(
            inline_params("VALUES ($1, $2, $3)", &params),
            "VALUES ('Pay $2 deposit', 'O''Brien', NULL)"
        );
    }

    #[test]
    fn placeholders_inside_literals_and_out_of_range_are_kept() {
        let params = [Some("x")];
        assert_eq!(inline_params("SELECT '$1', $1, $2", &params), "SELECT '$1', 'x', $2");
        assert_eq!(inline_params("SELECT $10", &params), "SELECT $10");
    }

    #[test]
    fn schema_follows_statement_target() {
        assert_eq!(schema_for("SELECT * FROM suggestions WHERE date = $1").len(), 7);
        assert_eq!(schema_for("select * from rate_tiers where at = $1").len(), 5);
        assert_eq!(schema_for("INSERT INTO bookings (owner_id, start) VALUES ($1, $2)").len(), 13);
        assert!(schema_for("DELETE FROM bookings WHERE id = $1").is_empty());
        assert!(schema_for("UPDATE bookings SET status = $1 WHERE id = $2").is_empty());
    }

    #[test]
    fn bad_literals_keep_their_data_exception_class() {
        let insert = "INSERT INTO bookings (owner_id, date, start_time) \
                      VALUES ('01ARZ3NDEKTSV4RRFFQ69G5FAV', '2099-06-01', '25:00')";
        let err = sql::parse_sql(insert).err().unwrap();
        let SqlError::Value(inner) = &err else { panic!("{err:?}") };
        assert_eq!(sqlstate(inner), "22008");
        assert!(matches!(sql::parse_sql("SELECT * FROM rate_tiers WHERE at = 'noon'"), Err(SqlError::Value(_))));
    }

    #[test]
    fn rejections_map_to_constraint_classes() {
        let reject = |rule| {
            EngineError::Rejected(Rejection { rule, detail: RejectionDetail::EarliestStart(0) })
        };
        assert_eq!(sqlstate(&reject(RuleId::Overlap)), "23P01");
        assert_eq!(sqlstate(&reject(RuleId::BufferBefore)), "23P01");
        assert_eq!(sqlstate(&reject(RuleId::MinimumAdvance)), "22023");
        assert_eq!(sqlstate(&reject(RuleId::DurationTooLong)), "22023");
        assert_eq!(sqlstate(&EngineError::NotFound(Ulid::nil())), "P0002");
        assert_eq!(sqlstate(&EngineError::ConfigurationUnavailable("no tz".into())), "55000");
    }
}
