//! The gRPC API surface: streaming SQL execution and protobuf descriptor
//! registration.
//!
//! Results stream as a `Columns` message followed by row pages; the stream
//! ends when a page is shorter than the requested page size. User-visible
//! errors travel verbatim; anything else is redacted to an error reference
//! number that keys the full error in the server log.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{Request, Response, Status};
use tracing::{error, info};

use sluice_core::types::{ColumnType, Datum, Row};
use sluice_core::{SluiceError, SluiceResult};

use sluice_sql::parplan::ParsedStatement;

use crate::ddl;
use crate::metrics;
use crate::ServerState;

pub mod service {
    tonic::include_proto!("sluice.service");
}

use service::sluice_service_server::{SluiceService, SluiceServiceServer};
use service::{
    execute_sql_statement_response, col_value, ColValue, Column, Columns, DecimalParams,
    ExecuteSqlStatementRequest, ExecuteSqlStatementResponse, Page, RegisterProtobufsRequest,
    RegisterProtobufsResponse,
};

/// Default page size when a client passes zero.
const DEFAULT_PAGE_SIZE: u32 = 1000;

pub struct ApiService {
    state: Arc<ServerState>,
}

impl ApiService {
    pub fn new(state: Arc<ServerState>) -> ApiService {
        ApiService { state }
    }
}

/// Map an error for the wire. User-visible kinds keep their message;
/// internal ones get a fresh reference number and a server-side log line,
/// so implementation details never leak.
fn status_from(state: &ServerState, err: SluiceError) -> Status {
    match err {
        SluiceError::Unavailable => Status::unavailable(err.to_string()),
        SluiceError::TableNotExists { .. } => Status::not_found(err.to_string()),
        SluiceError::SourceAlreadyExists { .. }
        | SluiceError::MaterializedViewAlreadyExists { .. } => {
            Status::already_exists(err.to_string())
        }
        SluiceError::InvalidStatement(_)
        | SluiceError::UnknownTopicEncoding(_)
        | SluiceError::InvalidSelector(_)
        | SluiceError::WrongNumberColumnSelectors { .. } => {
            Status::invalid_argument(err.to_string())
        }
        SluiceError::Internal(_) => {
            let seq = state.error_sequence.fetch_add(1, Ordering::SeqCst) + 1;
            metrics::INTERNAL_ERRORS.inc();
            error!(reference = seq, "internal error surfaced to client");
            Status::internal(SluiceError::Internal(seq).to_string())
        }
    }
}

fn columns_message(names: &[String], types: &[ColumnType]) -> Columns {
    let columns = names
        .iter()
        .zip(types)
        .map(|(name, col_type)| Column {
            name: name.clone(),
            r#type: col_type.type_id(),
            decimal_params: match col_type {
                ColumnType::Decimal { precision, scale } => Some(DecimalParams {
                    decimal_precision: u32::from(*precision),
                    decimal_scale: u32::from(*scale),
                }),
                _ => None,
            },
        })
        .collect();
    Columns { columns }
}

fn proto_row(row: &Row) -> service::Row {
    let values = row
        .values()
        .iter()
        .map(|value| {
            let value = match value {
                None => col_value::Value::IsNull(true),
                Some(Datum::Int(v)) => col_value::Value::IntValue(*v),
                Some(Datum::Double(v)) => col_value::Value::FloatValue(*v),
                Some(Datum::Varchar(v)) => col_value::Value::StringValue(v.clone()),
                // Decimals travel as their canonical base-10 string.
                Some(Datum::Decimal(v)) => col_value::Value::StringValue(v.to_string()),
                // Timestamps travel as microseconds past the epoch, UTC.
                Some(Datum::Timestamp(micros)) => col_value::Value::IntValue(*micros),
            };
            ColValue { value: Some(value) }
        })
        .collect();
    service::Row { values }
}

type PageSender = tokio::sync::mpsc::Sender<Result<ExecuteSqlStatementResponse, Status>>;

fn send_columns(tx: &PageSender, columns: Columns) -> Result<(), Status> {
    tx.blocking_send(Ok(ExecuteSqlStatementResponse {
        result: Some(execute_sql_statement_response::Result::Columns(columns)),
    }))
    .map_err(|_| Status::cancelled("client went away"))
}

fn send_page(tx: &PageSender, page: Page) -> Result<(), Status> {
    metrics::PAGES_SERVED.inc();
    metrics::ROWS_RETURNED.inc_by(page.count);
    tx.blocking_send(Ok(ExecuteSqlStatementResponse {
        result: Some(execute_sql_statement_response::Result::Page(page)),
    }))
    .map_err(|_| Status::cancelled("client went away"))
}

fn run_statement(
    state: &ServerState,
    req: &ExecuteSqlStatementRequest,
    tx: &PageSender,
) -> Result<(), Status> {
    if req.schema.is_empty() {
        return Err(Status::invalid_argument("schema is required"));
    }
    let page_size = if req.page_size == 0 {
        DEFAULT_PAGE_SIZE as usize
    } else {
        req.page_size as usize
    };
    let to_status = |err: SluiceError| status_from(state, err);

    match ddl::classify(&req.statement).map_err(to_status)? {
        ParsedStatement::Ddl(statement) => {
            metrics::STATEMENTS_EXECUTED.with_label_values(&["ddl"]).inc();
            state
                .ddl
                .execute(&req.schema, statement.clone())
                .map_err(to_status)?;
            ddl::log_executed(&req.schema, &statement);
            send_columns(tx, Columns { columns: vec![] })?;
            send_page(
                tx,
                Page {
                    count: 0,
                    rows: vec![],
                },
            )
        }
        ParsedStatement::Query(sql) => {
            metrics::STATEMENTS_EXECUTED
                .with_label_values(&["query"])
                .inc();
            let planned = state
                .pull
                .plan_output(&req.schema, &sql)
                .map_err(to_status)?;
            send_columns(tx, columns_message(&planned.col_names, &planned.col_types))?;
            let mut executor = state
                .pull
                .build_pull_query(&req.schema, &sql, false)
                .map_err(to_status)?;
            loop {
                let rows = executor.get_rows(page_size).map_err(to_status)?;
                let count = rows.row_count();
                let page = Page {
                    count: count as u64,
                    rows: rows.iter().map(proto_row).collect(),
                };
                send_page(tx, page)?;
                if count < page_size {
                    return Ok(());
                }
            }
        }
    }
}

#[tonic::async_trait]
impl SluiceService for ApiService {
    type ExecuteSqlStatementStream =
        ReceiverStream<Result<ExecuteSqlStatementResponse, Status>>;

    async fn execute_sql_statement(
        &self,
        request: Request<ExecuteSqlStatementRequest>,
    ) -> Result<Response<Self::ExecuteSqlStatementStream>, Status> {
        let req = request.into_inner();
        let state = self.state.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        // Statement execution blocks on storage and scheduler waits; keep
        // it off the async runtime threads.
        tokio::task::spawn_blocking(move || {
            if let Err(status) = run_statement(&state, &req, &tx) {
                let _ = tx.blocking_send(Err(status));
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn register_protobufs(
        &self,
        request: Request<RegisterProtobufsRequest>,
    ) -> Result<Response<RegisterProtobufsResponse>, Status> {
        let req = request.into_inner();
        let result: SluiceResult<()> =
            self.state.registry.register_file_descriptor_set(&req.descriptors);
        result.map_err(|err| status_from(&self.state, err))?;
        Ok(Response::new(RegisterProtobufsResponse {}))
    }
}

/// Bind and serve the API. Returns the bound address and the server task.
pub async fn serve(
    state: Arc<ServerState>,
    addr: SocketAddr,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    metrics::init_metrics();
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    let incoming = TcpListenerStream::new(listener);
    let service = SluiceServiceServer::new(ApiService::new(state));
    let handle = tokio::spawn(async move {
        info!(addr = %bound, "api server listening");
        if let Err(err) = tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming(incoming)
            .await
        {
            error!(error = ?err, "api server failed");
        }
    });
    Ok((bound, handle))
}
