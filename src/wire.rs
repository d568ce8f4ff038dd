use std::fmt::Debug;
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
use tracing::{debug, error};

use crate::auth::{RoleResolver, SlotbookAuthSource};
use crate::clock::{format_date, format_time, parse_date};
use crate::engine::{BookingError, Engine, LocalBooking};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct SlotbookHandler {
    engine: Arc<Engine>,
    roles: RoleResolver,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<Engine>, roles: RoleResolver) -> Self {
        Self {
            engine,
            roles,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    fn identify<C: ClientInfo>(&self, client: &C) -> PgWireResult<Identity> {
        let user = client.metadata().get("user").map(String::as_str);
        self.roles.identify(user).map_err(|e| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            booking_err(e)
        })
    }

    /// Parse, run and meter one statement.
    async fn handle<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let started = Instant::now();
        let who = self.identify(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        debug!("{} runs {label}", who.user_id);

        let result = self.execute_command(&who, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, who: &Identity, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::SelectServices => {
                let services = engine.list_services().await.map_err(booking_err)?;
                services_response(services)
            }
            Command::InsertServices { services } => {
                let count = services.len();
                for service in services {
                    engine.create_service(who, service).await.map_err(booking_err)?;
                }
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::DeleteService { id } => {
                engine.delete_service(who, id).await.map_err(booking_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertWindows { windows } => {
                let count = windows.len();
                engine.add_windows(who, windows).await.map_err(booking_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::DeleteWindow { id } => {
                engine.remove_window(who, id).await.map_err(booking_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAvailability { service_id, date } => {
                let date = parse_date(&date)
                    .map_err(BookingError::from)
                    .map_err(booking_err)?;
                let starts = engine
                    .compute_available_starts(service_id, date)
                    .await
                    .map_err(booking_err)?;

                let schema = Arc::new(availability_schema());
                let rows: Vec<PgWireResult<_>> = starts
                    .into_iter()
                    .map(|t| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&format_time(t))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::InsertBooking { request } => {
                let created = engine
                    .commit_booking(who, request)
                    .await
                    .map_err(booking_err)?;
                bookings_response(engine, created)
            }
            Command::SelectBookings { service_id } => {
                let bookings = engine
                    .list_bookings(who, service_id)
                    .await
                    .map_err(booking_err)?;
                bookings_response(engine, bookings)
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(who, id).await.map_err(booking_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        FieldInfo::new("session_minutes".into(), None, None, Type::INT4, FieldFormat::Text),
        FieldInfo::new("active".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text_field("start_time")]
}

fn bookings_schema() -> Vec<FieldInfo> {
    ["id", "service_id", "user_id", "date", "start_time", "end_time", "status", "note"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn services_response(services: Vec<Service>) -> PgWireResult<Response> {
    let schema = Arc::new(services_schema());
    let rows: Vec<PgWireResult<_>> = services
        .into_iter()
        .map(|s| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&s.id.to_string())?;
            encoder.encode_field(&s.name)?;
            encoder.encode_field(&i32::try_from(s.session_minutes).unwrap_or(i32::MAX))?;
            encoder.encode_field(&s.active)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn bookings_response(engine: &Engine, bookings: Vec<Booking>) -> PgWireResult<Response> {
    let local: Vec<LocalBooking> = bookings
        .into_iter()
        .map(|b| engine.localize(b))
        .collect::<Result<_, _>>()
        .map_err(booking_err)?;

    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = local
        .into_iter()
        .map(|lb| {
            let b = &lb.booking;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.service_id.to_string())?;
            encoder.encode_field(&b.user_id.0)?;
            encoder.encode_field(&format_date(lb.date))?;
            encoder.encode_field(&format_time(lb.start_time))?;
            encoder.encode_field(&format_time(lb.end_time))?;
            encoder.encode_field(&b.status.as_str().to_string())?;
            encoder.encode_field(&b.note)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Row shape a statement will produce, judged from its verb and table.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';' || c == '"')
        .filter(|w| !w.is_empty())
        .collect();
    let verb = words.first().copied().unwrap_or_default();
    let table = words
        .iter()
        .position(|w| *w == "FROM" || *w == "INTO")
        .and_then(|i| words.get(i + 1))
        .copied()
        .unwrap_or_default();

    match (verb, table) {
        ("SELECT", "SERVICES") => services_schema(),
        ("SELECT", "AVAILABILITY") => availability_schema(),
        ("SELECT" | "INSERT", "BOOKINGS") => bookings_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.handle(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let params: Vec<Option<String>> = portal
            .parameters
            .iter()
            .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
            .collect();
        let sql = substitute_params(&portal.statement.statement, &params);
        self.handle(client, &sql).await
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
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder outside quoted literals.
fn count_params(sql: &str) -> usize {
    let mut max = 0;
    scan_placeholders(sql, |n| {
        max = max.max(n);
        None
    });
    max
}

/// Replace `$N` placeholders with bound values as quoted text literals.
/// Placeholders inside quoted literals are left alone.
fn substitute_params(sql: &str, params: &[Option<String>]) -> String {
    scan_placeholders(sql, |n| {
        let value = params.get(n.checked_sub(1)?)?;
        Some(match value {
            Some(text) => format!("'{}'", text.replace('\'', "''")),
            None => "NULL".to_string(),
        })
    })
}

/// Walk `sql`, calling `f` with each placeholder number. When `f` returns a
/// replacement it is spliced in place of the placeholder.
fn scan_placeholders(sql: &str, mut f: impl FnMut(usize) -> Option<String>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_quote = false;
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_quote = !in_quote;
            out.push(c);
            continue;
        }
        if c != '$' || in_quote {
            out.push(c);
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            end = j + 1;
            chars.next();
        }
        match sql[start..end].parse::<usize>().ok().and_then(&mut f) {
            Some(replacement) => out.push_str(&replacement),
            None => out.push_str(&sql[i..end]),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(engine: Arc<Engine>, roles: RoleResolver, password: String) -> Self {
        let auth_source = SlotbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(engine, roles)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<SlotbookFactory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each booking outcome.
fn sqlstate(e: &BookingError) -> &'static str {
    match e {
        BookingError::InvalidInput(_) => "22007",
        BookingError::NotOnGrid(_) => "22023",
        BookingError::OutsideBusinessHours(_) => "22008",
        BookingError::InThePast => "23514",
        BookingError::ServiceUnavailable { .. } => "55000",
        BookingError::NotWithinAvailability(_) => "23P01",
        BookingError::Conflict(_) => "23505",
        BookingError::Unauthenticated => "28000",
        BookingError::Forbidden(_) => "42501",
        BookingError::NotFound(_) => "42704",
        BookingError::AlreadyExists(_) => "42710",
        BookingError::LimitExceeded(_) => "54000",
        BookingError::Internal(_) => "XX000",
    }
}

fn booking_err(e: BookingError) -> PgWireError {
    if let BookingError::Internal(detail) = &e {
        error!("internal error: {detail}");
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e.root() {
        SqlError::InvalidValue(..) => "22007",
        SqlError::TooManyRows(_) => "54000",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(..) => "42703",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn names(schema: &[FieldInfo]) -> Vec<String> {
        schema.iter().map(|f| f.name().to_string()).collect()
    }

    #[test]
    fn result_schema_follows_verb_and_table() {
        assert_eq!(
            names(&result_schema("SELECT * FROM availability WHERE service_id = $1 AND date = $2")),
            vec!["start_time"]
        );
        assert_eq!(names(&result_schema("select * from services")).len(), 4);
        assert_eq!(
            names(&result_schema("INSERT INTO bookings (service_id, date, start_time, sessions) VALUES ($1, $2, $3, $4)")).len(),
            8
        );
        assert!(result_schema("INSERT INTO windows VALUES ($1, $2, $3, $4, $5)").is_empty());
        assert!(result_schema("DELETE FROM bookings WHERE id = $1").is_empty());
    }

    #[test]
    fn counts_placeholders() {
        assert_eq!(count_params("SELECT * FROM bookings"), 0);
        assert_eq!(count_params("VALUES ($1, $2, $10)"), 10);
        assert_eq!(count_params("VALUES ('$5', $1)"), 1);
    }

    #[test]
    fn substitutes_quoted_text() {
        let params = vec![Some("O'Brien".to_string()), None, Some("2".to_string())];
        assert_eq!(
            substitute_params("VALUES ($1, $2, $3)", &params),
            "VALUES ('O''Brien', NULL, '2')"
        );
    }

    #[test]
    fn substitution_does_not_confuse_ten_with_one() {
        let params: Vec<Option<String>> = (1..=10).map(|i| Some(i.to_string())).collect();
        assert_eq!(substitute_params("($1, $10)", &params), "('1', '10')");
    }

    #[test]
    fn substitution_leaves_literals_and_unbound_alone() {
        let params = vec![Some("x".to_string())];
        assert_eq!(substitute_params("('$1', $1, $2, $)", &params), "('$1', 'x', $2, $)");
    }

    #[test]
    fn error_codes() {
        assert_eq!(sqlstate(&BookingError::Conflict(vec![NaiveTime::MIN])), "23505");
        assert_eq!(sqlstate(&BookingError::InThePast), "23514");
        assert_eq!(sqlstate(&BookingError::Forbidden("x")), "42501");
        assert_eq!(sqlstate(&BookingError::Internal("disk".into())), "XX000");
    }

    #[test]
    fn internal_detail_is_not_sent() {
        let e = BookingError::Internal("fsync failed on /data".into());
        assert_eq!(sqlstate(&e), "XX000");
        assert!(!e.to_string().contains("fsync"));
    }

    #[test]
    fn shape_errors_are_data_exceptions() {
        let err = sql::parse_sql(
            "INSERT INTO bookings (service_id, date, start_time, sessions) \
             VALUES ('01BX5ZZKBKACTAV9WEVGEMMVRZ', 'tomorrow', '09:00', 1)",
        )
        .unwrap_err();
        assert!(matches!(err.root(), SqlError::InvalidValue("date", _)));
    }
}
