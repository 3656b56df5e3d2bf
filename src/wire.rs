use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use futures::Sink;
use futures::stream;
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
use pgwire::api::{ClientInfo, ClientPortalStore, METADATA_USER, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{FacilityAuthSource, parse_actor};
use crate::engine::{Engine, EngineError, NewFacility};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError};

pub struct FacilityHandler {
    engine: Arc<Engine>,
    query_parser: Arc<FacilityQueryParser>,
}

impl FacilityHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(FacilityQueryParser),
        }
    }

    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<ActorId> {
        parse_actor(client.metadata().get(METADATA_USER).map(String::as_str)).ok_or_else(|| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "28000".into(),
                "session user is not an actor id".into(),
            )))
        })
    }

    /// Run one command, counting it and timing it.
    async fn execute(&self, actor: ActorId, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = std::time::Instant::now();
        let result = self.execute_command(actor, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result.map_err(engine_err)
    }

    async fn execute_command(&self, actor: ActorId, cmd: Command) -> Result<Response, EngineError> {
        let engine = &self.engine;
        match cmd {
            Command::InsertFacility {
                organization_id,
                name,
                latitude,
                longitude,
                description,
            } => {
                let new = NewFacility {
                    organization_id,
                    name,
                    latitude,
                    longitude,
                    description,
                    operating_hours: Vec::new(),
                };
                let facility = engine.register_facility(actor, new).await?;
                facility_response(&facility)
            }
            Command::InsertOperatingHours { facility_id, hours } => {
                let facility = engine.set_operating_hours(actor, facility_id, hours).await?;
                facility_response(&facility)
            }
            Command::InsertRequest {
                event_id,
                facility_id,
                start,
                finish,
            } => {
                let request = engine
                    .create_request(actor, event_id, facility_id, Window::new(start, finish))
                    .await?;
                request_response(&request)
            }
            Command::ApproveRequest { id } => {
                engine.approve_request(actor, id).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::RejectRequest { id, reason } => {
                engine.reject_request(actor, id, reason).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectRequest { id } => {
                let request = engine.view_request(actor, id).await?;
                request_response(&request)
            }
            Command::SelectRequestDetails { id } => {
                let joined = engine.view_request_with_facility(actor, id).await?;
                details_response(&joined)
            }
            Command::SelectFacility { id } => {
                let facility = engine.facility_info(id).await?;
                facility_response(&facility)
            }
            Command::SelectAvailability {
                facility_id,
                start,
                finish,
            } => {
                let grid = engine
                    .compute_availability(facility_id, Window::new(start, finish))
                    .await?;
                availability_response(&grid)
            }
        }
    }
}

// ── Row shapes ───────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn request_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("event_id", Type::INT8),
        field("facility_id", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("reject_reason", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("finish", Type::VARCHAR),
    ]
}

fn facility_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("organization_id", Type::INT8),
        field("name", Type::VARCHAR),
        field("latitude", Type::FLOAT8),
        field("longitude", Type::FLOAT8),
        field("description", Type::VARCHAR),
        field("operating_hours", Type::VARCHAR),
    ]
}

fn details_schema() -> Vec<FieldInfo> {
    let mut schema = request_schema();
    schema.extend([
        field("facility_name", Type::VARCHAR),
        field("organization_id", Type::INT8),
        field("operating_hours", Type::VARCHAR),
    ]);
    schema
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("date", Type::VARCHAR),
        field("hour", Type::INT4),
        field("free", Type::BOOL),
    ]
}

/// Result columns for a statement, judged from the table it names.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.trim_start().starts_with("UPDATE") {
        vec![]
    } else if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("FACILITY_REQUEST_DETAILS") {
        details_schema()
    } else if upper.contains("FACILITY_REQUESTS") {
        request_schema()
    } else if upper.contains("FACILITIES") || upper.contains("OPERATING_HOURS") {
        facility_schema()
    } else {
        vec![]
    }
}

fn timestamp(t: Instant) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn hours_text(hours: &OperatingHours) -> String {
    hours
        .iter()
        .map(|h| format!("{} {}-{}", h.day.as_str(), h.start_hour, h.finish_hour))
        .collect::<Vec<_>>()
        .join(", ")
}

fn encode_request(encoder: &mut DataRowEncoder, r: &FacilityRequest) -> PgWireResult<()> {
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.event_id)?;
    encoder.encode_field(&r.facility_id.to_string())?;
    encoder.encode_field(&r.status.as_str().to_string())?;
    encoder.encode_field(&r.reject_reason)?;
    encoder.encode_field(&timestamp(r.start))?;
    encoder.encode_field(&timestamp(r.finish))?;
    Ok(())
}

fn single_row(schema: Vec<FieldInfo>, encode: impl FnOnce(&mut DataRowEncoder) -> PgWireResult<()>) -> Response {
    let schema = Arc::new(schema);
    let mut encoder = DataRowEncoder::new(schema.clone());
    let row = encode(&mut encoder).map(|()| encoder.take_row());
    Response::Query(QueryResponse::new(schema, stream::iter(vec![row])))
}

fn request_response(r: &FacilityRequest) -> Result<Response, EngineError> {
    Ok(single_row(request_schema(), |encoder| encode_request(encoder, r)))
}

fn facility_response(f: &Facility) -> Result<Response, EngineError> {
    Ok(single_row(facility_schema(), |encoder| {
        encoder.encode_field(&f.id.to_string())?;
        encoder.encode_field(&f.organization_id)?;
        encoder.encode_field(&f.name)?;
        encoder.encode_field(&f.latitude)?;
        encoder.encode_field(&f.longitude)?;
        encoder.encode_field(&f.description)?;
        encoder.encode_field(&hours_text(&f.operating_hours))?;
        Ok(())
    }))
}

fn details_response(joined: &FacilityRequestWithFacility) -> Result<Response, EngineError> {
    Ok(single_row(details_schema(), |encoder| {
        encode_request(encoder, &joined.request)?;
        encoder.encode_field(&joined.facility.name)?;
        encoder.encode_field(&joined.facility.organization_id)?;
        encoder.encode_field(&hours_text(&joined.facility.operating_hours))?;
        Ok(())
    }))
}

fn availability_row(
    schema: &Arc<Vec<FieldInfo>>,
    date: &String,
    hour: Option<i32>,
    free: Option<bool>,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(date)?;
    encoder.encode_field(&hour)?;
    encoder.encode_field(&free)?;
    Ok(encoder.take_row())
}

/// One row per hour slot; a closed day is one row with NULL hour and free.
fn availability_response(grid: &AvailabilityGrid) -> Result<Response, EngineError> {
    let schema = Arc::new(availability_schema());
    let mut rows = Vec::new();
    for day in &grid.days {
        let date = day.date.to_string();
        match &day.slots {
            None => rows.push(availability_row(&schema, &date, None, None)),
            Some(slots) => {
                for (offset, free) in slots.free.iter().enumerate() {
                    let hour = (slots.first_hour as usize + offset) as i32;
                    rows.push(availability_row(&schema, &date, Some(hour), Some(*free)));
                }
            }
        }
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for FacilityHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.execute(actor, cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FacilityQueryParser;

#[async_trait]
impl QueryParser for FacilityQueryParser {
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
impl ExtendedQueryHandler for FacilityHandler {
    type Statement = String;
    type QueryParser = FacilityQueryParser;

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
        let actor = self.resolve_actor(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute(actor, cmd).await
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
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

pub struct FacilityFactory {
    handler: Arc<FacilityHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<FacilityAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FacilityFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = FacilityAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FacilityHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FacilityFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, FacilityFactory::new(engine, password)).await
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::Internal(cause) = &e {
        tracing::error!("store failure: {cause}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM facilities WHERE id = $1"), 1);
        assert_eq!(count_params("INSERT INTO facility_requests VALUES ($1, $2, $3, $4)"), 4);
        assert_eq!(count_params("SELECT * FROM facilities WHERE id = 'x'"), 0);
        assert_eq!(count_params("VALUES ($2, $10)"), 10);
    }

    #[test]
    fn result_schema_follows_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(
            names("SELECT * FROM availability WHERE facility_id = $1 AND start >= $2 AND finish <= $3"),
            vec!["date", "hour", "free"]
        );
        assert_eq!(names("SELECT * FROM facility_requests WHERE id = $1")[3], "status");
        assert_eq!(names("SELECT * FROM facility_request_details WHERE id = $1").len(), 10);
        assert_eq!(names("INSERT INTO operating_hours VALUES ($1, 'MON', 9, 17)")[2], "name");
        assert!(names("UPDATE facility_requests SET status = 'APPROVED' WHERE id = $1").is_empty());
    }

    #[test]
    fn hours_render_as_text() {
        let hours: OperatingHours = [
            OperatingHour::new(DayOfWeek::Mon, 9, 17),
        ]
        .into_iter()
        .collect();
        assert_eq!(hours_text(&hours), "MON 9-17");
    }
}
