use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use ulid::Ulid;

use crate::auth::SlotdAuthSource;
use crate::engine::{BookingOutcome, Engine, EngineError, RejectReason};
use crate::model::*;
use crate::notify::Notice;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::repo::RepoError;
use crate::sql::{self, Command, SqlError};
use crate::store::Store;

/// Everything a connection needs, shared across connections.
pub struct ServerContext {
    pub engine: Arc<Engine>,
    pub store: Arc<Store>,
    pub auth: SlotdAuthSource,
}

/// Per-connection query handler. Owns the connection's LISTEN subscriptions.
pub struct SlotdHandler {
    ctx: Arc<ServerContext>,
    query_parser: Arc<SlotdQueryParser>,
    listening: Mutex<HashMap<String, broadcast::Receiver<Notice>>>,
}

impl SlotdHandler {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            query_parser: Arc::new(SlotdQueryParser),
            listening: Mutex::new(HashMap::new()),
        }
    }

    /// Parse, execute, then flush any notices queued for this connection.
    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Response>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let started = Instant::now();
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let result = self.execute_command(cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        self.deliver_notifications(client).await?;
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let store = &self.ctx.store;
        let engine = &self.ctx.engine;
        match cmd {
            Command::UpsertBusiness(settings) => {
                store.save_business(settings).await.map_err(repo_err)?;
                Ok(inserted())
            }
            Command::UpsertStaff(member) => {
                store.save_staff(member).await.map_err(repo_err)?;
                Ok(inserted())
            }
            Command::UpsertService(spec) => {
                store.save_service(spec).await.map_err(repo_err)?;
                Ok(inserted())
            }
            Command::UpsertWorkingHours(interval) => {
                store
                    .save_working_interval(interval)
                    .await
                    .map_err(repo_err)?;
                Ok(inserted())
            }
            Command::GrantQualification {
                staff_id,
                service_id,
            } => {
                store
                    .grant_qualification(staff_id, service_id)
                    .await
                    .map_err(repo_err)?;
                Ok(inserted())
            }
            Command::RevokeQualification {
                staff_id,
                service_id,
            } => {
                store
                    .revoke_qualification(staff_id, service_id)
                    .await
                    .map_err(repo_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertReservation(request) => {
                match engine.request_booking(request).await.map_err(engine_err)? {
                    BookingOutcome::Committed(r) => {
                        let schema = Arc::new(booking_schema());
                        let row = encode_booking(&schema, &r);
                        Ok(Response::Query(QueryResponse::new(
                            schema,
                            stream::iter(vec![row]),
                        )))
                    }
                    BookingOutcome::Rejected(reason) => Err(reject_err(reason)),
                }
            }
            Command::UpdateReservationStatus { id, status } => {
                engine.transition(id, status).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectSlots {
                business_id,
                service_id,
                staff_id,
                date,
            } => {
                let slots = engine
                    .list_available_slots(business_id, service_id, staff_id, date)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.time.to_string())?;
                        encoder.encode_field(&slot.staff_id.to_string())?;
                        encoder.encode_field(&slot.staff_name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                )))
            }
            Command::SelectReservations(filter) => {
                let reservations = engine
                    .list_reservations(&filter)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(reservations_schema());
                let rows: Vec<PgWireResult<_>> = reservations
                    .iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.business_id.to_string())?;
                        encoder.encode_field(&r.staff_id.to_string())?;
                        encoder.encode_field(&r.service_id.to_string())?;
                        encoder.encode_field(&r.date.to_string())?;
                        encoder.encode_field(&r.start_time.to_string())?;
                        encoder.encode_field(&r.end_time.to_string())?;
                        encoder.encode_field(&r.status.as_str())?;
                        encoder.encode_field(&r.customer.name)?;
                        encoder.encode_field(&r.customer.contact)?;
                        encoder.encode_field(&r.customer.notes)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                )))
            }
            Command::Listen { channel } => {
                let business_id = channel_business(&channel)?;
                let rx = engine.notify().subscribe(business_id);
                self.listening.lock().await.insert(channel, rx);
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                self.listening.lock().await.remove(&channel);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.listening.lock().await.clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }

    /// Forward every notice received since the last query as a
    /// `NotificationResponse`.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut listening = self.listening.lock().await;
            for (channel, rx) in listening.iter_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(notice) => pending.push((channel.clone(), notice.payload())),
                        Err(broadcast::error::TryRecvError::Lagged(n)) => {
                            tracing::warn!("listener on {channel} lagged, {n} notices dropped");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        let pid = std::process::id() as i32;
        for (channel, payload) in pending {
            client
                .send(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(pid, channel, payload),
                ))
                .await?;
        }
        Ok(())
    }
}

/// `business_<id>` names the notice channel of one business.
fn channel_business(channel: &str) -> PgWireResult<Ulid> {
    let id = channel.strip_prefix("business_").ok_or_else(|| {
        user_error(
            "42000",
            format!("invalid channel: {channel} (expected business_{{id}})"),
        )
    })?;
    Ulid::from_string(id).map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    ["time", "staff_id", "staff_name"]
        .into_iter()
        .map(text_field)
        .collect()
}

/// Row returned by a committed `INSERT INTO reservations`.
fn booking_schema() -> Vec<FieldInfo> {
    ["id", "staff_id", "date", "start_time", "end_time", "status"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn reservations_schema() -> Vec<FieldInfo> {
    [
        "id",
        "business_id",
        "staff_id",
        "service_id",
        "date",
        "start_time",
        "end_time",
        "status",
        "customer_name",
        "customer_contact",
        "notes",
    ]
    .into_iter()
    .map(text_field)
    .collect()
}

fn encode_booking(
    schema: &Arc<Vec<FieldInfo>>,
    r: &Reservation,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.staff_id.to_string())?;
    encoder.encode_field(&r.date.to_string())?;
    encoder.encode_field(&r.start_time.to_string())?;
    encoder.encode_field(&r.end_time.to_string())?;
    encoder.encode_field(&r.status.as_str())?;
    Ok(encoder.take_row())
}

/// Result columns a statement will produce, judged from its text so it works
/// before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let normalized = sql
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();
    if normalized.starts_with("SELECT") && normalized.contains(" FROM SLOTS") {
        slots_schema()
    } else if normalized.starts_with("SELECT") && normalized.contains(" FROM RESERVATIONS") {
        reservations_schema()
    } else if normalized.starts_with("INSERT INTO RESERVATIONS") {
        booking_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
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
        let mut responses = Vec::new();
        for statement in sql::split_statements(query) {
            responses.push(self.run(client, statement).await?);
        }
        if responses.is_empty() {
            responses.push(Response::EmptyQuery);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
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
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

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
        let sql = substitute_params(portal);
        self.run(client, &sql).await
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

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    // Highest index first so `$1` never clobbers the prefix of `$10`.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        let auth_source = ctx.auth.clone();
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotdHandler::new(ctx)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
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

/// Serve one client connection to completion. Each connection gets its own
/// handler so LISTEN state stays per session.
pub async fn process_connection(
    socket: TcpStream,
    ctx: Arc<ServerContext>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotdFactory::new(ctx);
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

fn reject_err(reason: RejectReason) -> PgWireError {
    match reason {
        RejectReason::InvalidInput(msg) => user_error("22023", msg),
        // Not-qualified surfaces the same way as a taken slot.
        RejectReason::NotQualified | RejectReason::SlotUnavailable => {
            user_error("23P01", "slot unavailable".into())
        }
    }
}

fn repo_err(e: RepoError) -> PgWireError {
    match e {
        RepoError::Storage(_) => user_error("58030", e.to_string()),
        RepoError::Invalid(_) | RepoError::LimitExceeded(_) => user_error("22023", e.to_string()),
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    match e {
        EngineError::Repository(inner) => repo_err(inner),
        other => user_error("P0001", other.to_string()),
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    match e {
        SqlError::InvalidValue(_) => user_error("22023", e.to_string()),
        _ => user_error("42601", e.to_string()),
    }
}
