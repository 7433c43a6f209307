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

use crate::auth::TimetableAuthSource;
use crate::directory::InMemoryDirectory;
use crate::engine::{AvailabilityQuery, Engine, EngineError};
use crate::limits::MAX_NAME_LEN;
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SlotFilter, SqlError};

pub struct TimetableHandler {
    engine: Arc<Engine>,
    directory: Arc<InMemoryDirectory>,
    query_parser: Arc<TimetableQueryParser>,
}

impl TimetableHandler {
    pub fn new(engine: Arc<Engine>, directory: Arc<InMemoryDirectory>) -> Self {
        Self {
            engine,
            directory,
            query_parser: Arc::new(TimetableQueryParser),
        }
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let started = Instant::now();
        let cmd = match sql::parse_sql(sql) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error").increment(1);
                return Err(sql_err(e));
            }
        };
        let label = command_label(&cmd);
        let result = self.execute_command(cmd).await;

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => {
                tracing::debug!("{label} failed: {e}");
                e.kind()
            }
        };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }

    async fn execute_command(&self, cmd: Command) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::RegisterEntity { kind, id, name } => {
                if name.trim().is_empty() {
                    return Err(EngineError::Validation(format!("{kind} name is required")));
                }
                if name.len() > MAX_NAME_LEN {
                    return Err(EngineError::LimitExceeded("display name too long"));
                }
                self.directory.register(kind, id, name);
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertBooking { booking } => {
                let created = engine.create_booking(booking).await?;
                Ok(inserted_response(&[created]))
            }
            Command::BatchInsertBookings { bookings } => {
                let created = engine.create_bookings(bookings).await?;
                Ok(inserted_response(&created))
            }
            Command::UpdateBooking { id, patch } => {
                engine.update_booking(id, patch).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeactivateBooking { id } => {
                engine.deactivate_booking(id).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(id)?;
                Ok(bookings_response(&[booking]))
            }
            Command::SelectTimetable {
                kind,
                resource_id,
                academic_year,
            } => {
                let timetable = match kind {
                    ResourceKind::Class => engine.class_timetable(resource_id, &academic_year).await?,
                    ResourceKind::Teacher => engine.teacher_timetable(resource_id, &academic_year).await?,
                };
                Ok(timetable_response(&timetable))
            }
            Command::SelectAvailability {
                kind,
                resource_id,
                day,
                academic_year,
                window,
            } => {
                let query = slot_query(engine, window)?;
                let slots = engine
                    .available_slots_with(kind, resource_id, day, &academic_year, query)
                    .await?;
                Ok(slots_response(day, &slots))
            }
            Command::SelectCommonAvailability {
                resources,
                day,
                academic_year,
                window,
            } => {
                let query = slot_query(engine, window)?;
                let slots = engine
                    .common_slots(&resources, day, &academic_year, Some(query))
                    .await?;
                Ok(slots_response(day, &slots))
            }
        }
    }
}

/// Fill unset filters from the configured school day.
fn slot_query(engine: &Engine, filter: SlotFilter) -> Result<AvailabilityQuery, EngineError> {
    let defaults = engine.config();
    let start = filter.start.unwrap_or(defaults.window.start);
    let end = filter.end.unwrap_or(defaults.window.end);
    let window = TimeRange::try_new(start, end).ok_or_else(|| {
        EngineError::Validation(format!("empty window {}-{}", format_time(start), format_time(end)))
    })?;
    Ok(AvailabilityQuery {
        window,
        min_duration: filter.min_duration.unwrap_or(defaults.granularity),
    })
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn inserted_schema() -> Vec<FieldInfo> {
    vec![text("id")]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("class_id"),
        text("teacher_id"),
        text("subject_id"),
        text("day"),
        text("start_time"),
        text("end_time"),
        text("room"),
        text("academic_year"),
        text("semester"),
        FieldInfo::new("is_active".into(), None, None, Type::BOOL, FieldFormat::Text),
        text("created_by"),
        FieldInfo::new("created_at".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("updated_at".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn timetable_schema() -> Vec<FieldInfo> {
    vec![
        text("day"),
        text("start_time"),
        text("end_time"),
        text("booking_id"),
        text("class_id"),
        text("class_name"),
        text("teacher_id"),
        text("teacher_name"),
        text("subject_id"),
        text("subject_name"),
        text("room"),
        text("semester"),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text("day"),
        text("start_time"),
        text("end_time"),
        FieldInfo::new("duration".into(), None, None, Type::INT4, FieldFormat::Text),
    ]
}

/// Pick the row shape a statement returns, without binding its parameters.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.trim_start().to_lowercase();
    if lower.starts_with("select") {
        if lower.contains("availability") {
            slots_schema()
        } else if lower.contains("timetable") {
            timetable_schema()
        } else if lower.contains("bookings") {
            bookings_schema()
        } else {
            vec![]
        }
    } else if lower.starts_with("insert") && lower.contains("bookings") {
        inserted_schema()
    } else {
        vec![]
    }
}

fn query_response(schema: Vec<FieldInfo>, rows: Vec<PgWireResult<pgwire::messages::data::DataRow>>) -> Response {
    Response::Query(QueryResponse::new(Arc::new(schema), stream::iter(rows)))
}

fn inserted_response(created: &[Booking]) -> Response {
    let schema = Arc::new(inserted_schema());
    let rows = created
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(inserted_schema(), rows)
}

fn bookings_response(bookings: &[Booking]) -> Response {
    let schema = Arc::new(bookings_schema());
    let rows = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.class_id.to_string())?;
            encoder.encode_field(&b.teacher_id.to_string())?;
            encoder.encode_field(&b.subject_id.to_string())?;
            encoder.encode_field(&b.day.as_str())?;
            encoder.encode_field(&format_time(b.range.start))?;
            encoder.encode_field(&format_time(b.range.end))?;
            encoder.encode_field(&b.room)?;
            encoder.encode_field(&b.academic_year)?;
            encoder.encode_field(&b.semester)?;
            encoder.encode_field(&b.is_active)?;
            encoder.encode_field(&b.created_by.to_string())?;
            encoder.encode_field(&b.created_at)?;
            encoder.encode_field(&b.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(bookings_schema(), rows)
}

fn timetable_response(timetable: &Timetable) -> Response {
    let schema = Arc::new(timetable_schema());
    let rows = timetable
        .days
        .values()
        .flatten()
        .map(|entry| {
            let b = &entry.booking;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.day.as_str())?;
            encoder.encode_field(&format_time(b.range.start))?;
            encoder.encode_field(&format_time(b.range.end))?;
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.class_id.to_string())?;
            encoder.encode_field(&entry.class_name)?;
            encoder.encode_field(&b.teacher_id.to_string())?;
            encoder.encode_field(&entry.teacher_name)?;
            encoder.encode_field(&b.subject_id.to_string())?;
            encoder.encode_field(&entry.subject_name)?;
            encoder.encode_field(&b.room)?;
            encoder.encode_field(&b.semester)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(timetable_schema(), rows)
}

fn slots_response(day: DayOfWeek, slots: &[TimeRange]) -> Response {
    let schema = Arc::new(slots_schema());
    let rows = slots
        .iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&day.as_str())?;
            encoder.encode_field(&format_time(slot.start))?;
            encoder.encode_field(&format_time(slot.end))?;
            encoder.encode_field(&(slot.duration() as i32))?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(slots_schema(), rows)
}

#[async_trait]
impl SimpleQueryHandler for TimetableHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TimetableQueryParser;

#[async_trait]
impl QueryParser for TimetableQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TimetableHandler {
    type Statement = String;
    type QueryParser = TimetableQueryParser;

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
        self.run(&sql).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
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
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Single left-to-right pass: each `$N` outside a string literal is replaced
/// once, so bound text containing `$` is never rescanned.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;

    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let digits_start = i + 1;
        let mut digits_end = digits_start;
        while let Some(&(j, d)) = chars.peek()
            && d.is_ascii_digit()
        {
            digits_end = j + 1;
            chars.next();
        }
        let param = sql[digits_start..digits_end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        match param {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[i..digits_end]),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct TimetableFactory {
    handler: Arc<TimetableHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<TimetableAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl TimetableFactory {
    pub fn new(engine: Arc<Engine>, directory: Arc<InMemoryDirectory>, password: String) -> Self {
        let auth_source = TimetableAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TimetableHandler::new(engine, directory)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TimetableFactory {
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
    factory: Arc<TimetableFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::StoreUnavailable(_) => "58030",
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
    let code = match e {
        SqlError::InvalidValue(_) => "22023",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), e.to_string())))
}
