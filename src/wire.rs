use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError};
use crate::waitlist::{WaitTarget, WaitlistEntry};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = WardFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

#[derive(Debug)]
pub struct WardAuthSource {
    password: String,
}

impl WardAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for WardAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

pub struct WardHandler {
    engine: Arc<Engine>,
    query_parser: Arc<WardQueryParser>,
}

impl WardHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(WardQueryParser),
        }
    }

    /// Parse, run and record metrics for one statement. The command runs on
    /// its own task so a client hanging up mid-commit cannot abort it.
    async fn run(&self, sql_text: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();

        let engine = self.engine.clone();
        let result = tokio::spawn(async move { execute_command(&engine, cmd).await })
            .await
            .map_err(|e| {
                PgWireError::UserError(Box::new(ErrorInfo::new(
                    "ERROR".into(),
                    "XX000".into(),
                    format!("command task failed: {e}"),
                )))
            })?;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }
}

fn executed(tag: &str, rows: usize) -> Vec<Response> {
    vec![Response::Execution(Tag::new(tag).with_rows(rows))]
}

async fn execute_command(engine: &Arc<Engine>, cmd: Command) -> Result<Vec<Response>, EngineError> {
    match cmd {
        Command::InsertResource {
            id,
            kind,
            name,
            capacity,
            buffer_after,
        } => {
            let mut spec = ResourceSpec::new(kind).capacity(capacity);
            if let Some(name) = name {
                spec = spec.named(name);
            }
            if let Some(buffer) = buffer_after {
                spec = spec.buffer_after(buffer);
            }
            engine.register_resource(id, spec).await?;
            Ok(executed("INSERT", 1))
        }
        Command::DeactivateResource { id } => {
            engine.deactivate_resource(id).await?;
            Ok(executed("DELETE", 1))
        }
        Command::InsertOperatingHours { resource_id, windows } => {
            let count = windows.len();
            engine.add_operating_hours(resource_id, windows).await?;
            Ok(executed("INSERT", count))
        }
        Command::ClearOperatingHours { resource_id } => {
            engine.clear_operating_hours(resource_id).await?;
            Ok(executed("DELETE", 1))
        }
        Command::InsertBooking {
            id,
            resource_id,
            start,
            end,
            requester,
            priority,
            waitlist,
        } => {
            let mut req = BookingRequest::new(resource_id, start, end, requester, priority).with_id(id);
            if waitlist {
                req = req.or_waitlist();
            }
            engine.request_booking(req).await?;
            Ok(executed("INSERT", 1))
        }
        Command::InsertHold {
            id,
            resource_id,
            start,
            end,
            requester,
            priority,
            expires_at,
        } => {
            let req = BookingRequest::new(resource_id, start, end, requester, priority)
                .with_id(id)
                .held_until(expires_at);
            engine.request_booking(req).await?;
            Ok(executed("INSERT", 1))
        }
        Command::ConfirmBooking { id } => {
            engine.confirm_booking(id).await?;
            Ok(executed("INSERT", 1))
        }
        Command::CompleteBooking { id } => {
            engine.complete_booking(id).await?;
            Ok(executed("INSERT", 1))
        }
        Command::CancelBooking { id, reason } => {
            engine
                .cancel_booking(id, reason.unwrap_or_else(|| "cancelled".into()))
                .await?;
            Ok(executed("DELETE", 1))
        }
        Command::InsertWaitlist {
            id,
            target,
            start,
            end,
            duration,
            requester,
            priority,
        } => {
            let window = Span::try_new(start, end).ok_or(EngineError::InvalidInterval("end must be after start"))?;
            engine
                .enqueue_waitlist(WaitlistEntry {
                    id,
                    requester,
                    target,
                    window,
                    duration: duration.unwrap_or(window.duration_ms()),
                    priority,
                    enqueued_at: 0,
                    ticket: 0,
                    displaced: None,
                })
                .await?;
            Ok(executed("INSERT", 1))
        }
        Command::WithdrawWaitlist { id } => {
            engine.withdraw_waitlist(id)?;
            Ok(executed("DELETE", 1))
        }
        Command::SelectAvailability {
            resource_id,
            start,
            end,
            min_duration,
        } => {
            let slots = engine
                .query_availability(resource_id, start, end, min_duration.unwrap_or(0))
                .await?;
            let schema = Arc::new(availability_schema());
            let rid = resource_id.to_string();
            let rows: Vec<PgWireResult<_>> = slots
                .into_iter()
                .map(|slot| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&rid)?;
                    encoder.encode_field(&slot.start)?;
                    encoder.encode_field(&slot.end)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
        }
        Command::SelectBookings { resource_id } => {
            let bookings = engine.bookings(resource_id).await?;
            let schema = Arc::new(bookings_schema());
            let rows: Vec<PgWireResult<_>> = bookings
                .iter()
                .map(|b| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&b.id.to_string())?;
                    encoder.encode_field(&b.resource_id.to_string())?;
                    encoder.encode_field(&b.requester)?;
                    encoder.encode_field(&b.span.start)?;
                    encoder.encode_field(&b.span.end)?;
                    encoder.encode_field(&b.priority.as_str().to_string())?;
                    encoder.encode_field(&b.status.as_str().to_string())?;
                    encoder.encode_field(&b.hold_expires_at)?;
                    encoder.encode_field(&b.superseded_by.map(|id| id.to_string()))?;
                    encoder.encode_field(&b.cancel_reason)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
        }
        Command::SelectHistory { resource_id } => {
            let records = engine.booking_history(resource_id).await?;
            let schema = Arc::new(history_schema());
            let rows: Vec<PgWireResult<_>> = records
                .iter()
                .map(|r| {
                    let detail = serde_json::to_string(&r.event).unwrap_or_default();
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&(r.seq as i64))?;
                    encoder.encode_field(&r.at)?;
                    encoder.encode_field(&r.event.label().to_string())?;
                    encoder.encode_field(&r.event.booking_id().map(|id| id.to_string()))?;
                    encoder.encode_field(&detail)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
        }
        Command::SelectResources => {
            let resources = engine.list_resources().await?;
            let schema = Arc::new(resources_schema());
            let rows: Vec<PgWireResult<_>> = resources
                .iter()
                .map(|r| {
                    let hours = serde_json::to_string(&r.hours).unwrap_or_default();
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&r.id.to_string())?;
                    encoder.encode_field(&r.kind.as_str().to_string())?;
                    encoder.encode_field(&r.name)?;
                    encoder.encode_field(&(r.capacity as i64))?;
                    encoder.encode_field(&r.buffer_after)?;
                    encoder.encode_field(&r.active)?;
                    encoder.encode_field(&hours)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
        }
        Command::SelectWaitlist => {
            let entries = engine.waitlist_entries();
            let schema = Arc::new(waitlist_schema());
            let rows: Vec<PgWireResult<_>> = entries
                .iter()
                .map(|e| {
                    let target = match e.target {
                        WaitTarget::Resource(id) => id.to_string(),
                        WaitTarget::Kind(kind) => format!("kind:{}", kind.as_str()),
                    };
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&e.id.to_string())?;
                    encoder.encode_field(&e.requester)?;
                    encoder.encode_field(&target)?;
                    encoder.encode_field(&e.window.start)?;
                    encoder.encode_field(&e.window.end)?;
                    encoder.encode_field(&e.duration)?;
                    encoder.encode_field(&e.priority.as_str().to_string())?;
                    encoder.encode_field(&(e.ticket as i64))?;
                    encoder.encode_field(&e.displaced.map(|id| id.to_string()))?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text("resource_id"), int8("start"), int8("end")]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("resource_id"),
        text("requester"),
        int8("start"),
        int8("end"),
        text("priority"),
        text("status"),
        int8("hold_expires_at"),
        text("superseded_by"),
        text("cancel_reason"),
    ]
}

fn history_schema() -> Vec<FieldInfo> {
    vec![int8("seq"), int8("at"), text("event"), text("booking_id"), text("detail")]
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("kind"),
        text("name"),
        int8("capacity"),
        int8("buffer_after"),
        FieldInfo::new("active".into(), None, None, Type::BOOL, FieldFormat::Text),
        text("hours"),
    ]
}

fn waitlist_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("requester"),
        text("target"),
        int8("start"),
        int8("end"),
        int8("duration"),
        text("priority"),
        int8("ticket"),
        text("displaced"),
    ]
}

/// Row shape of a statement, judged from its text so that statements with
/// unbound `$N` placeholders can be described too.
fn schema_for(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("BOOKING_HISTORY") {
        history_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else if upper.contains("RESOURCES") {
        resources_schema()
    } else if upper.contains("WAITLIST") {
        waitlist_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for WardHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct WardQueryParser;

#[async_trait]
impl QueryParser for WardQueryParser {
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
impl ExtendedQueryHandler for WardHandler {
    type Statement = String;
    type QueryParser = WardQueryParser;

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
        let sql = substitute_params(portal);
        let mut responses = self.run(&sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
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
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals. Numeric columns accept
/// quoted numbers, so every parameter can be sent as text.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.clone();
    // Highest index first so `$1` does not eat the prefix of `$10`.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct WardFactory {
    handler: Arc<WardHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<WardAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl WardFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(WardHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                WardAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for WardFactory {
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

// ── Error mapping ────────────────────────────────────────────────

/// SQLSTATE for an engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Busy(_) => "55P03",
        EngineError::Conflict { .. } | EngineError::IntervalConflict(_) => "23P01",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
