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

use crate::auth::SlotbookAuthSource;
use crate::engine::{EngineError, now_ms};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};
use crate::tenant::{Tenant, TenantManager};

pub struct SlotbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    fn resolve_tenant<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Tenant>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Parse, execute, and record RED metrics for one statement.
    async fn run(&self, tenant: &Tenant, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(tenant, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, tenant: &Tenant, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &tenant.engine;
        match cmd {
            Command::SetScheduleDay {
                weekday,
                enabled,
                intervals,
            } => {
                engine
                    .set_schedule_day(weekday, enabled, intervals)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::InsertAssignment(data) => {
                engine.create_assignment(data).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::DisableAssignment { id } => {
                engine.disable_assignment(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::RequestReservation {
                id,
                context,
                start,
                duration,
                client_ref,
            } => {
                engine
                    .request_reservation(id, context, start, duration, client_ref)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::Confirm { id } => {
                engine.confirm(id).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::MarkAttendance { id, attended } => {
                engine
                    .mark_attendance(id, attended)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::CancelReservation { id } => {
                engine.cancel(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::PushExternalBusy { start, end, label } => {
                tenant
                    .push_external_busy(start, end, label)
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::RemoveExternalBusy { start, end } => {
                let removed = tenant
                    .remove_external_busy(start, end)
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(removed))])
            }
            Command::SelectSchedule => {
                let schema = Arc::new(schedule_schema());
                let mut rows = Vec::with_capacity(7);
                for weekday in 0..7u8 {
                    let day = engine.schedule_day(weekday).await.unwrap_or_default();
                    let intervals: Vec<String> = day.intervals.iter().map(ToString::to_string).collect();
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&(weekday as i32))?;
                    encoder.encode_field(&day.enabled)?;
                    encoder.encode_field(&intervals.join(","))?;
                    rows.push(Ok(encoder.take_row()));
                }
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectSlots {
                date,
                duration,
                context,
            } => {
                let slots = engine
                    .get_available_slots_at(date, duration, context, now_ms())
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&hhmm(slot.minute))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectBusy { date, context } => {
                let ranges = engine
                    .busy_ranges(date, context)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(busy_schema());
                let rows: Vec<PgWireResult<_>> = ranges
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.span.start)?;
                        encoder.encode_field(&b.span.end)?;
                        encoder.encode_field(&b.source.as_str())?;
                        encoder.encode_field(&b.scope_id.map(|id| id.to_string()))?;
                        encoder.encode_field(&b.label)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectAssignments { date, service_key } => {
                let assignments = engine
                    .list_assignments(date, service_key.as_deref())
                    .await;
                let schema = Arc::new(assignments_schema());
                let rows: Vec<PgWireResult<_>> = assignments
                    .into_iter()
                    .map(|a| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.id.to_string())?;
                        encoder.encode_field(&a.date.to_string())?;
                        encoder.encode_field(&hhmm(a.window.start))?;
                        encoder.encode_field(&hhmm(a.window.end))?;
                        encoder.encode_field(&(a.staff_id as i64))?;
                        encoder.encode_field(&(a.service_area_id as i64))?;
                        encoder.encode_field(&a.service_keys.join(","))?;
                        encoder.encode_field(&(a.capacity as i32))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectReservations { date, context } => {
                let agenda = engine.agenda(date, context).await;
                let schema = Arc::new(reservations_schema());
                let rows: Vec<PgWireResult<_>> = agenda
                    .into_iter()
                    .map(|entry| {
                        let r = &entry.reservation;
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.context.assignment_id().map(|id| id.to_string()))?;
                        encoder.encode_field(&r.start)?;
                        encoder.encode_field(&(r.duration_minutes as i32))?;
                        encoder.encode_field(&r.client_ref)?;
                        encoder.encode_field(&r.state.as_str())?;
                        encoder.encode_field(&r.cancelled_by.map(|id| id.to_string()))?;
                        encoder.encode_field(&(entry.placement.index as i32))?;
                        encoder.encode_field(&(entry.placement.count as i32))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
        }
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn query_response(
    schema: Arc<Vec<FieldInfo>>,
    rows: Vec<PgWireResult<pgwire::messages::data::DataRow>>,
) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn schedule_schema() -> Vec<FieldInfo> {
    vec![
        field("weekday", Type::INT4),
        field("enabled", Type::BOOL),
        field("intervals", Type::VARCHAR),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![field("start", Type::INT8), field("local_time", Type::VARCHAR)]
}

fn busy_schema() -> Vec<FieldInfo> {
    vec![
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("source", Type::VARCHAR),
        field("scope_id", Type::VARCHAR),
        field("label", Type::VARCHAR),
    ]
}

fn assignments_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("staff_id", Type::INT8),
        field("service_area_id", Type::INT8),
        field("service_keys", Type::VARCHAR),
        field("capacity", Type::INT4),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("assignment_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("duration", Type::INT4),
        field("client_ref", Type::VARCHAR),
        field("state", Type::VARCHAR),
        field("cancelled_by", Type::VARCHAR),
        field("overlap_index", Type::INT4),
        field("overlap_count", Type::INT4),
    ]
}

/// Result columns for a statement, decided from its FROM table before
/// parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_matches(|c| c == '"' || c == ';'));
    match table {
        Some("schedule") => schedule_schema(),
        Some("slots") => slots_schema(),
        Some("busy") => busy_schema(),
        Some("assignments") => assignments_schema(),
        Some("reservations") => reservations_schema(),
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
        let tenant = self.resolve_tenant(client)?;
        self.run(&tenant, query).await
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
        let tenant = self.resolve_tenant(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&tenant, &sql).await?;
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
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... with bound text parameters, quoted as literals.
/// Runs highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.clone();
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

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotbookAuthSource::new(&password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(tenant_manager)),
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotbookFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine error. Collisions and lost races share the
/// exclusion-violation code so clients can offer another time.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::StaffCollision { .. } | EngineError::AreaCollision { .. } | EngineError::Conflict(_) => "23P01",
        EngineError::InvalidState { .. } => "55000",
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::UpstreamUnavailable(_) => "58000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if matches!(e, EngineError::WalError(_)) {
        tracing::error!(error = %e, "storage failure");
    }
    user_error(sqlstate(&e), format!("{}: {e}", e.code()))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn sqlstates_follow_error_class() {
        let id = Ulid::new();
        assert_eq!(sqlstate(&EngineError::Conflict(id)), "23P01");
        assert_eq!(sqlstate(&EngineError::StaffCollision { existing: id }), "23P01");
        assert_eq!(
            sqlstate(&EngineError::InvalidState {
                id,
                state: ReservationState::Cancelled
            }),
            "55000"
        );
        assert_eq!(sqlstate(&EngineError::Validation("x".into())), "22023");
        assert_eq!(sqlstate(&EngineError::NotFound(id)), "P0002");
        assert_eq!(sqlstate(&EngineError::UpstreamUnavailable("x".into())), "58000");
        assert_eq!(sqlstate(&EngineError::WalError("x".into())), "58030");
    }

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM slots WHERE date = $1 AND duration = $2"), 2);
        assert_eq!(count_params("INSERT INTO x VALUES ($10, $2)"), 10);
        assert_eq!(count_params("SELECT * FROM schedule"), 0);
    }

    #[test]
    fn result_schema_by_table() {
        assert_eq!(result_schema("SELECT * FROM slots WHERE date = $1").len(), 2);
        assert_eq!(result_schema("select * from reservations where date = $1").len(), 9);
        assert!(result_schema("INSERT INTO reservations VALUES ($1)").is_empty());
    }
}
