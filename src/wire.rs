use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::auth::LabslotAuthSource;
use crate::engine::{slot_board, ReservationEngine, ReservationError, Seat, SlotView, ValidationError};
use crate::limits::MAX_LISTEN_CHANNELS;
use crate::model::*;
use crate::notify::{Channel, Notice, Subscription};
use crate::observability;
use crate::sql::{self, Command, SqlError, Table};
use crate::store::{ReservationStore, ReservationTable};

pub type Engine = ReservationEngine<ReservationTable>;

static NEXT_BACKEND_PID: AtomicI32 = AtomicI32::new(1);

/// Channels one connection is listening on.
struct Listener {
    pid: i32,
    channels: HashMap<Channel, Subscription>,
}

/// Statement handler for one client connection.
pub struct LabslotHandler {
    engine: Arc<Engine>,
    query_parser: Arc<LabslotQueryParser>,
    listener: Mutex<Listener>,
    op_timeout: Duration,
}

impl LabslotHandler {
    pub fn new(engine: Arc<Engine>, op_timeout: Duration) -> Self {
        Self {
            engine,
            op_timeout,
            query_parser: Arc::new(LabslotQueryParser),
            listener: Mutex::new(Listener {
                pid: NEXT_BACKEND_PID.fetch_add(1, Ordering::Relaxed),
                channels: HashMap::new(),
            }),
        }
    }

    async fn run(&self, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = match tokio::time::timeout(self.op_timeout, self.execute_command(cmd, format)).await {
            Ok(result) => result,
            Err(_) => Err(reservation_err(ReservationError::Store("timed out".into()))),
        };
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertReservation(req) => {
                engine.create(&req).await.map_err(reservation_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteReservation(req) => {
                engine.cancel(&req).await.map_err(reservation_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectReservations(filter) => {
                let rows = engine.store().query(&filter).await.map_err(|e| {
                    reservation_err(ReservationError::Store(e.to_string()))
                })?;
                let schema = Arc::new(reservations_schema(format));
                let config = engine.config();
                let rows: Vec<PgWireResult<_>> = rows
                    .into_iter()
                    .map(|r| {
                        let day = config.day_of(r.date).map(|d| d.index() as i32 + 1);
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.student_id)?;
                        encoder.encode_field(&r.student_name)?;
                        encoder.encode_field(&r.date.to_string())?;
                        encoder.encode_field(&day)?;
                        encoder.encode_field(&r.lab_id)?;
                        encoder.encode_field(&r.time_slot)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectSlots {
                date,
                lab_id,
                student_id,
            } => {
                let config = engine.config();
                if config.day_of(date).is_none() {
                    return Err(reservation_err(ValidationError::UnknownDate(date).into()));
                }
                if !config.has_station(&lab_id) {
                    return Err(reservation_err(ValidationError::UnknownStation(lab_id).into()));
                }
                let snapshot = engine.snapshot().await.map_err(reservation_err)?;
                let board = slot_board(config, date, &lab_id, student_id.as_deref(), &snapshot);

                let schema = Arc::new(slots_schema(format));
                let rows: Vec<PgWireResult<_>> = board
                    .into_iter()
                    .map(|view| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&view.time_slot)?;
                        encoder.encode_field(&(view.booked as i32))?;
                        encoder.encode_field(&(view.capacity as i32))?;
                        encoder.encode_field(&view.status.as_str().to_string())?;
                        encoder.encode_field(&seat_string(&view))?;
                        encoder.encode_field(&view.selectable)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectStations => {
                let schema = Arc::new(stations_schema(format));
                let rows: Vec<PgWireResult<_>> = engine
                    .config()
                    .stations
                    .iter()
                    .enumerate()
                    .map(|(i, lab)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&(i as i32 + 1))?;
                        encoder.encode_field(lab)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::Listen { channel } => {
                if let Channel::Day(date) = channel
                    && engine.config().day_of(date).is_none()
                {
                    return Err(user_error(
                        "42000",
                        format!("invalid channel: {} is not an event day", channel.name()),
                    ));
                }
                let mut listener = self.listener.lock().await;
                if !listener.channels.contains_key(&channel) {
                    if listener.channels.len() >= MAX_LISTEN_CHANNELS {
                        return Err(user_error(
                            "53400",
                            format!("too many channels (max {MAX_LISTEN_CHANNELS})"),
                        ));
                    }
                    let subscription = engine.store().notify().subscribe(channel);
                    listener.channels.insert(channel, subscription);
                    debug!(pid = listener.pid, channel = %channel.name(), "listen");
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                self.listener.lock().await.channels.remove(&channel);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.listener.lock().await.channels.clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }

    /// Write every queued change to the client as `NotificationResponse`s.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let messages = {
            let mut listener = self.listener.lock().await;
            let pid = listener.pid;
            let mut messages = Vec::new();
            for (channel, subscription) in listener.channels.iter_mut() {
                while let Some(notice) = subscription.try_next() {
                    messages.push(NotificationResponse::new(
                        pid,
                        channel.name(),
                        notice_payload(&notice),
                    ));
                }
            }
            messages
        };
        if messages.is_empty() {
            return Ok(());
        }
        let count = messages.len();
        for message in messages {
            client
                .send(PgWireBackendMessage::NotificationResponse(message))
                .await?;
        }
        metrics::counter!(observability::NOTIFICATIONS_DELIVERED_TOTAL).increment(count as u64);
        Ok(())
    }
}

/// JSON payload of a notification. Never carries the student id or code.
fn notice_payload(notice: &Notice) -> String {
    match notice {
        Notice::Changed(change) => serde_json::to_string(change)
            .unwrap_or_else(|_| r#"{"op":"changed"}"#.to_string()),
        Notice::Missed(n) => serde_json::json!({ "op": "lagged", "missed": n }).to_string(),
    }
}

fn seat_string(view: &SlotView) -> String {
    view.seats
        .iter()
        .map(|seat| match seat {
            Seat::Mine => "mine",
            Seat::Taken => "taken",
            Seat::Open => "open",
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn field(name: &str, ty: Type, format: &Format, idx: usize) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, format.format_for(idx))
}

fn reservations_schema(format: &Format) -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR, format, 0),
        field("student_id", Type::VARCHAR, format, 1),
        field("student_name", Type::VARCHAR, format, 2),
        field("date", Type::VARCHAR, format, 3),
        field("day", Type::INT4, format, 4),
        field("lab_id", Type::VARCHAR, format, 5),
        field("time_slot", Type::VARCHAR, format, 6),
    ]
}

fn slots_schema(format: &Format) -> Vec<FieldInfo> {
    vec![
        field("time_slot", Type::VARCHAR, format, 0),
        field("booked", Type::INT4, format, 1),
        field("capacity", Type::INT4, format, 2),
        field("status", Type::VARCHAR, format, 3),
        field("seats", Type::VARCHAR, format, 4),
        field("selectable", Type::BOOL, format, 5),
    ]
}

fn stations_schema(format: &Format) -> Vec<FieldInfo> {
    vec![
        field("position", Type::INT4, format, 0),
        field("lab_id", Type::VARCHAR, format, 1),
    ]
}

fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    match sql::select_target(sql) {
        Some(Table::Reservations) => reservations_schema(format),
        Some(Table::Slots) => slots_schema(format),
        Some(Table::Stations) => stations_schema(format),
        None => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for LabslotHandler {
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
        self.deliver_notifications(client).await?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let response = self.run(cmd, &Format::UnifiedText).await;
        self.deliver_notifications(client).await?;
        Ok(vec![response?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LabslotQueryParser;

#[async_trait]
impl QueryParser for LabslotQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LabslotHandler {
    type Statement = String;
    type QueryParser = LabslotQueryParser;

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
        self.deliver_notifications(client).await?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let response = self.run(cmd, &portal.result_column_format).await;
        self.deliver_notifications(client).await?;
        response
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
            result_schema(&target.statement, &Format::UnifiedText),
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
            &target.result_column_format,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass; substituted values are never rescanned.
/// Placeholders without a bound value are left as written.
fn substitute<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let bytes = sql.as_bytes();
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
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
        let param = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        if let Some(param) = param {
            result.push_str(&sql[copied..i]);
            match param {
                Some(value) => {
                    let text = String::from_utf8_lossy(value.as_ref());
                    result.push('\'');
                    result.push_str(&text.replace('\'', "''"));
                    result.push('\'');
                }
                None => result.push_str("NULL"),
            }
            copied = end;
        }
        i = end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LabslotFactory {
    handler: Arc<LabslotHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<LabslotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LabslotFactory {
    pub fn new(engine: Arc<Engine>, password: String, op_timeout: Duration) -> Self {
        let auth_source = LabslotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(LabslotHandler::new(engine, op_timeout)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LabslotFactory {
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

/// Serve one client. Each connection gets its own handler, so LISTEN state
/// lives and dies with the socket.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    op_timeout: Duration,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(LabslotFactory::new(engine, password, op_timeout));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn reservation_err(e: ReservationError) -> PgWireError {
    let code = match &e {
        ReservationError::Validation(_) => "22023",
        ReservationError::DuplicateBooking => "23505",
        ReservationError::Store(_) => "58000",
        ReservationError::QuotaExceeded { .. }
        | ReservationError::SlotFull { .. }
        | ReservationError::NotFound
        | ReservationError::AuthMismatch => "P0001",
    };
    user_error(code, e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::BadChannel(_) => "42000",
        SqlError::BadValue { .. } => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
