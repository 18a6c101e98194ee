use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
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
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::CapLedgerAuthSource;
use crate::engine::{Engine, EngineError, now_ms, validate_span};
use crate::model::*;
use crate::observability;
use crate::sql::{self, AssignmentRow, Command, SqlError};
use crate::tenant::TenantManager;

pub struct CapLedgerHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<CapLedgerQueryParser>,
}

impl CapLedgerHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(CapLedgerQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, engine: &Engine, sql_text: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            debug!("{label} failed: {e}");
        }
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertEngineer {
                id,
                name,
                max_capacity,
            } => {
                engine
                    .create_engineer(id, name, max_capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateEngineer {
                id,
                name,
                max_capacity,
            } => {
                engine
                    .update_engineer(id, name, max_capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteEngineer { id } => {
                engine.delete_engineer(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertAssignment(row) => {
                let new = new_assignment(row).map_err(engine_err)?;
                engine.create_assignment(new).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::BatchInsertAssignments(rows) => {
                let count = rows.len();
                let batch = rows
                    .into_iter()
                    .map(new_assignment)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(engine_err)?;
                engine
                    .batch_create_assignments(batch)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::UpdateAssignment { id, patch } => {
                engine
                    .update_assignment(id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteAssignment { id } => {
                engine.remove_assignment(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectEngineers => {
                let engineers = engine.list_engineers().await;
                let schema = Arc::new(engineers_schema());
                let rows: Vec<PgWireResult<DataRow>> = engineers
                    .iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.id.to_string())?;
                        encoder.encode_field(&e.name)?;
                        encoder.encode_field(&(e.max_capacity as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectAssignments { engineer_id } => {
                let assignments = engine
                    .get_assignments(engineer_id)
                    .await
                    .map_err(engine_err)?;
                Ok(assignments_response(&assignments))
            }
            Command::SelectConflicts {
                engineer_id,
                start,
                end,
                exclude_id,
            } => {
                let conflicts = engine
                    .find_conflicts(engineer_id, start, end, exclude_id)
                    .await
                    .map_err(engine_err)?;
                Ok(assignments_response(&conflicts))
            }
            Command::SelectCapacityCheck {
                engineer_id,
                start,
                end,
                allocation,
                exclude_id,
            } => {
                let check = engine
                    .check_allocation(engineer_id, start, end, allocation, exclude_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(capacity_check_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&engineer_id.to_string())?;
                encoder.encode_field(&start)?;
                encoder.encode_field(&end)?;
                encoder.encode_field(&check.fits)?;
                encoder.encode_field(&(check.current as i64))?;
                encoder.encode_field(&(check.requested as i64))?;
                encoder.encode_field(&(check.max as i64))?;
                Ok(query_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::SelectUtilization { engineer_id, as_of } => {
                let as_of = as_of.unwrap_or_else(now_ms);
                let rows = match engineer_id {
                    Some(id) => {
                        let info = engine.get_engineer_info(id).await.map_err(engine_err)?;
                        let u = engine.utilization(id, as_of).await.map_err(engine_err)?;
                        vec![(info, u)]
                    }
                    None => engine.list_utilization(as_of).await.map_err(engine_err)?,
                };
                let schema = Arc::new(utilization_schema());
                let rows: Vec<PgWireResult<DataRow>> = rows
                    .iter()
                    .map(|(info, u)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&info.id.to_string())?;
                        encoder.encode_field(&as_of)?;
                        encoder.encode_field(&(u.total_allocation as i64))?;
                        encoder.encode_field(&(u.available_capacity as i64))?;
                        encoder.encode_field(&u.utilization_rate)?;
                        encoder.encode_field(&(info.max_capacity as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectAllocation {
                engineer_id,
                start,
                end,
            } => {
                let segments = engine
                    .allocation_profile(engineer_id, start, end)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(allocation_schema());
                let eid = engineer_id.to_string();
                let rows: Vec<PgWireResult<DataRow>> = segments
                    .iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&eid)?;
                        encoder.encode_field(&s.start)?;
                        encoder.encode_field(&s.end)?;
                        encoder.encode_field(&(s.allocation as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectAvailableEngineers {
                start,
                end,
                allocation,
            } => {
                let candidates = engine
                    .available_engineers(start, end, allocation)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(available_engineers_schema());
                let rows: Vec<PgWireResult<DataRow>> = candidates
                    .iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.engineer.id.to_string())?;
                        encoder.encode_field(&c.engineer.name)?;
                        encoder.encode_field(&(c.engineer.max_capacity as i64))?;
                        encoder.encode_field(&(c.headroom as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
        }
    }
}

fn new_assignment(row: AssignmentRow) -> Result<NewAssignment, EngineError> {
    Ok(NewAssignment {
        id: row.id,
        engineer_id: row.engineer_id,
        project_id: row.project_id,
        span: validate_span(row.start, row.end)?,
        allocation: row.allocation,
        status: row.status,
    })
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn assignments_response(assignments: &[Assignment]) -> Response {
    let schema = Arc::new(assignments_schema());
    let rows: Vec<PgWireResult<DataRow>> = assignments
        .iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.engineer_id.to_string())?;
            encoder.encode_field(&a.project_id.to_string())?;
            encoder.encode_field(&a.span.start)?;
            encoder.encode_field(&a.span.end)?;
            encoder.encode_field(&(a.allocation as i64))?;
            encoder.encode_field(&a.status.to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn engineers_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("name"), int8("max_capacity")]
}

fn assignments_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("engineer_id"),
        text("project_id"),
        int8("start"),
        int8("end"),
        int8("allocation"),
        text("status"),
    ]
}

fn capacity_check_schema() -> Vec<FieldInfo> {
    vec![
        text("engineer_id"),
        int8("start"),
        int8("end"),
        FieldInfo::new("fits".into(), None, None, Type::BOOL, FieldFormat::Text),
        int8("current"),
        int8("requested"),
        int8("max_capacity"),
    ]
}

fn utilization_schema() -> Vec<FieldInfo> {
    vec![
        text("engineer_id"),
        int8("as_of"),
        int8("total_allocation"),
        int8("available_capacity"),
        FieldInfo::new(
            "utilization_rate".into(),
            None,
            None,
            Type::FLOAT8,
            FieldFormat::Text,
        ),
        int8("max_capacity"),
    ]
}

fn allocation_schema() -> Vec<FieldInfo> {
    vec![text("engineer_id"), int8("start"), int8("end"), int8("allocation")]
}

fn available_engineers_schema() -> Vec<FieldInfo> {
    vec![
        text("engineer_id"),
        text("name"),
        int8("max_capacity"),
        int8("headroom"),
    ]
}

/// Table named after `FROM` in a `SELECT`, without parsing the whole
/// statement (placeholders are still unbound at describe time).
fn select_table(sql_text: &str) -> Option<String> {
    let lower = sql_text.to_lowercase();
    let mut words = lower.split_whitespace();
    if words.next()? != "select" {
        return None;
    }
    words.by_ref().find(|w| *w == "from")?;
    words
        .next()
        .map(|t| t.trim_end_matches(';').trim_matches('"').to_string())
}

fn result_schema(sql_text: &str) -> Vec<FieldInfo> {
    match select_table(sql_text).as_deref() {
        Some("engineers") => engineers_schema(),
        Some("assignments") | Some("conflicts") => assignments_schema(),
        Some("capacity_check") => capacity_check_schema(),
        Some("utilization") => utilization_schema(),
        Some("allocation") => allocation_schema(),
        Some("available_engineers") => available_engineers_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for CapLedgerHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CapLedgerQueryParser;

#[async_trait]
impl QueryParser for CapLedgerQueryParser {
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
impl ExtendedQueryHandler for CapLedgerHandler {
    type Statement = String;
    type QueryParser = CapLedgerQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql).await
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
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
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

pub struct CapLedgerFactory {
    handler: Arc<CapLedgerHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<CapLedgerAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl CapLedgerFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = CapLedgerAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CapLedgerHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CapLedgerFactory {
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
    tls_acceptor: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(CapLedgerFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls_acceptor, factory).await
}

/// SQLSTATE for an engine failure.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        // exclusion_violation: the request collides with existing allocations
        EngineError::CapacityExceeded { .. } => "23P01",
        e if e.is_validation() => "22023",
        EngineError::NotFound(_) | EngineError::UnknownEngineer(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::HasAssignments(_) => "23503",
        EngineError::AssignmentClosed(_) => "55000",
        EngineError::WalError(_) => "58030",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        engine_sqlstate(&e).into(),
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
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM engineers"), 0);
        assert_eq!(
            count_params("SELECT * FROM conflicts WHERE engineer_id = $1 AND start >= $3"),
            3
        );
        assert_eq!(count_params("DELETE FROM assignments WHERE id = $12"), 12);
    }

    #[test]
    fn select_table_detection() {
        assert_eq!(
            select_table("  SELECT * FROM capacity_check WHERE engineer_id = $1").as_deref(),
            Some("capacity_check")
        );
        assert_eq!(select_table("select * from utilization;").as_deref(), Some("utilization"));
        assert_eq!(select_table("DELETE FROM assignments WHERE id = $1"), None);
        assert_eq!(result_schema("SELECT * FROM conflicts").len(), 7);
        assert!(result_schema("INSERT INTO engineers (id) VALUES ($1)").is_empty());
    }

    #[test]
    fn capacity_errors_map_to_exclusion_violation() {
        let e = EngineError::CapacityExceeded {
            current: 80,
            requested: 30,
            max: 100,
        };
        assert_eq!(engine_sqlstate(&e), "23P01");
        assert_eq!(
            engine_sqlstate(&EngineError::InvalidInterval { start: 5, end: 5 }),
            "22023"
        );
        assert_eq!(engine_sqlstate(&EngineError::UnknownEngineer(Ulid::new())), "P0002");
        assert_eq!(engine_sqlstate(&EngineError::HasAssignments(Ulid::new())), "23503");
    }

    #[test]
    fn new_assignment_rejects_inverted_span() {
        let row = AssignmentRow {
            id: Ulid::new(),
            engineer_id: Ulid::new(),
            project_id: Ulid::new(),
            start: 2000,
            end: 1000,
            allocation: 50,
            status: AssignmentStatus::Planned,
        };
        assert_eq!(
            new_assignment(row),
            Err(EngineError::InvalidInterval {
                start: 2000,
                end: 1000,
            })
        );
    }
}
