//! MySQL GTID 증분 CDC 실행 도구
//!
//! - `check`: 소스 서버가 증분 덤프 사전 조건을 만족하는지 확인
//! - `run`: 소스 서버에 복제 클라이언트로 붙어 핸들러 이벤트를 출력
//! - `replay`: JSON lines로 기록된 binlog 이벤트를 엔진에 흘려 핸들러 이벤트를 출력

use async_trait::async_trait;
use binlog_cdc::connection::{ConnectionConfig, MySqlConnection};
use binlog_cdc::gtid::GtidSet;
use binlog_cdc::handler::{Handler, HandlerError, HandlerEvent, NamedRow};
use binlog_cdc::source::JsonLinesSource;
use binlog_cdc::{incr_dump, incr_dump_from_server, CdcError};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "binlog-cdc", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the source server can feed an incremental dump, and print gtid_executed.
    Check(ConnectionArgs),

    /// Stream transactions from the source server as a replica and print handler events.
    Run {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// GTID set already applied. Transactions in it are not requested.
        #[arg(long, short, default_value = "")]
        gtid_set: String,
    },

    /// Replay recorded binlog events (one JSON object per line) and print handler events.
    Replay {
        /// Path to the recorded events.
        #[arg(long, short)]
        file: PathBuf,

        /// GTID set already applied, e.g. "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5".
        #[arg(long, short, default_value = "")]
        gtid_set: String,
    },
}

#[derive(Args, Debug)]
struct ConnectionArgs {
    #[arg(long, default_value = "localhost", env = "DB_HOST")]
    host: String,

    #[arg(long, default_value = "3306", env = "DB_PORT")]
    port: u16,

    #[arg(long, default_value = "root", env = "DB_USER")]
    user: String,

    #[arg(long, default_value = "", env = "DB_PASSWORD", hide_env_values = true)]
    password: String,

    #[arg(long, env = "DB_NAME")]
    database: Option<String>,

    /// Must be unique among the replicas of the source.
    #[arg(long, default_value = "1", env = "DB_SERVER_ID")]
    server_id: u32,

    #[arg(long, default_value = "utf8mb4", env = "DB_CHARSET")]
    charset: String,

    /// Connect timeout in seconds.
    #[arg(long, default_value = "30")]
    timeout: u64,
}

impl From<ConnectionArgs> for ConnectionConfig {
    fn from(args: ConnectionArgs) -> Self {
        ConnectionConfig {
            hostname: args.host,
            port: args.port,
            username: args.user,
            password: args.password,
            database: args.database,
            charset: args.charset,
            server_id: args.server_id,
            timeout: Duration::from_secs(args.timeout),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Check(args) => check(args.into()).await,
        Command::Run {
            connection,
            gtid_set,
        } => run(connection.into(), &gtid_set).await,
        Command::Replay { file, gtid_set } => replay(file, &gtid_set).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_fatal() => {
            error!("Unrecoverable error, aborting: {}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn check(config: ConnectionConfig) -> Result<(), CdcError> {
    info!("Connecting to {}:{}", config.hostname, config.port);
    let mut conn = MySqlConnection::connect(config).await?;

    let report = conn.check_prerequisites().await?;
    println!("MySQL {}", report.version);
    for check in &report.checks {
        println!("{}", check);
    }

    let executed = conn.get_executed_gtid_set().await?;
    println!("gtid_executed: {}", executed);

    conn.close().await?;
    report.ensure()
}

async fn run(config: ConnectionConfig, gtid_set: &str) -> Result<(), CdcError> {
    info!(
        "Streaming from {}:{} as server_id {}",
        config.hostname, config.port, config.server_id
    );
    let cancel = cancel_on_ctrl_c();
    let mut handler = JsonLinesHandler::new(tokio::io::stdout());
    incr_dump_from_server(config, gtid_set, &cancel, &mut handler).await?;
    handler.flush().await?;
    Ok(())
}

async fn replay(file: PathBuf, gtid_set: &str) -> Result<(), CdcError> {
    let source = JsonLinesSource::open(&file).await?;
    let cancel = cancel_on_ctrl_c();
    let mut handler = JsonLinesHandler::new(tokio::io::stdout());
    incr_dump(gtid_set, source, &cancel, &mut handler).await?;
    handler.flush().await?;
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, stopping");
                cancel.cancel();
            }
        }
    });
    cancel
}

/// 핸들러 이벤트를 한 줄에 하나씩 JSON으로 기록
struct JsonLinesHandler<W> {
    out: W,
}

impl<W> JsonLinesHandler<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn new(out: W) -> Self {
        JsonLinesHandler { out }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush().await
    }
}

#[async_trait]
impl<W> Handler for JsonLinesHandler<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn handle(
        &mut self,
        _cancel: &CancellationToken,
        event: HandlerEvent,
    ) -> Result<(), HandlerError> {
        let mut line = serde_json::to_vec(&OutputLine::from(&event))?;
        line.push(b'\n');
        self.out.write_all(&line).await?;

        if let HandlerEvent::TransactionEnd(txn) = &event {
            self.out.flush().await?;
            info!("Resumable GTID set: '{}'", txn.after_gtid_set());
        }
        Ok(())
    }
}

/// 출력 한 줄. 행 이미지는 테이블의 컬럼 순서대로 씁니다.
#[derive(Debug, Default, Serialize)]
struct OutputLine<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    gtid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    before_gtid_set: Option<&'a GtidSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    after_gtid_set: Option<&'a GtidSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    commit_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    table: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<NamedRow<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    after: Option<NamedRow<'a>>,
}

impl<'a> From<&'a HandlerEvent> for OutputLine<'a> {
    fn from(event: &'a HandlerEvent) -> Self {
        let line = OutputLine {
            kind: event.kind().as_str(),
            gtid: event.txn().gtid().to_string(),
            ..Default::default()
        };

        match event {
            HandlerEvent::TransactionBegin(txn) => OutputLine {
                before_gtid_set: Some(txn.before_gtid_set()),
                commit_time: txn.commit_time(),
                ..line
            },
            HandlerEvent::TransactionEnd(txn) => OutputLine {
                after_gtid_set: Some(txn.after_gtid_set()),
                ..line
            },
            HandlerEvent::RowInsertion(change)
            | HandlerEvent::RowUpdating(change)
            | HandlerEvent::RowDeletion(change) => OutputLine {
                schema: Some(change.schema_name()),
                table: Some(change.table_name()),
                before: change.before_named(),
                after: change.after_named(),
                ..line
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binlog_cdc::events::{ColumnType, TableMapData};
    use binlog_cdc::gtid::Gtid;
    use binlog_cdc::handler::{RowChange, TxnContext};
    use binlog_cdc::normalize::ColumnValue;
    use binlog_cdc::table_meta::TableMeta;
    use serde_json::Value;
    use std::sync::Arc;
    use uuid::Uuid;

    fn txn() -> Arc<TxnContext> {
        let sid = Uuid::parse_str("3e11fa47-71ca-11e1-9e33-c80aa9429562").unwrap();
        Arc::new(TxnContext::new(
            GtidSet::parse("3e11fa47-71ca-11e1-9e33-c80aa9429562:1-4").unwrap(),
            Gtid::new(sid, 5),
            300,
            0,
        )
        .unwrap())
    }

    fn to_json(event: &HandlerEvent) -> Value {
        serde_json::to_value(OutputLine::from(event)).unwrap()
    }

    #[test]
    fn test_cli_parses_replay() {
        let cli = Cli::try_parse_from([
            "binlog-cdc",
            "replay",
            "--file",
            "events.jsonl",
            "--gtid-set",
            "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-4",
        ])
        .unwrap();
        match cli.command {
            Command::Replay { file, gtid_set } => {
                assert_eq!(file, PathBuf::from("events.jsonl"));
                assert!(gtid_set.ends_with(":1-4"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "binlog-cdc",
            "run",
            "--host",
            "db1",
            "--server-id",
            "1001",
            "--gtid-set",
            "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-4",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                connection,
                gtid_set,
            } => {
                assert!(gtid_set.ends_with(":1-4"));
                let config = ConnectionConfig::from(connection);
                assert_eq!(config.hostname, "db1");
                assert_eq!(config.server_id, 1001);
                assert_eq!(config.timeout, Duration::from_secs(30));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_to_json_transaction_markers() {
        let begin = to_json(&HandlerEvent::TransactionBegin(txn()));
        assert_eq!(begin["type"], "BEGIN");
        assert_eq!(
            begin["before_gtid_set"],
            "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-4"
        );
        assert!(begin["commit_time"].is_null());

        let end = to_json(&HandlerEvent::TransactionEnd(txn()));
        assert_eq!(end["type"], "COMMIT");
        assert_eq!(end["after_gtid_set"], "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5");
    }

    #[test]
    fn test_row_line_keeps_column_order() {
        let table = TableMeta::new(Arc::new(TableMapData {
            table_id: 9,
            schema: "shop".to_string(),
            table: "orders".to_string(),
            column_count: 3,
            column_types: vec![ColumnType::VarChar, ColumnType::Long, ColumnType::Long],
            column_meta: vec![255, 0, 0],
            column_names: vec!["zone".to_string(), "amount".to_string(), "id".to_string()],
            signedness: None,
            enum_str_values: None,
            set_str_values: None,
        }))
        .unwrap();
        let change = RowChange::new(
            txn(),
            Arc::new(table),
            None,
            Some(vec![
                ColumnValue::String("kr".to_string()),
                ColumnValue::Int32(300),
                ColumnValue::Int32(7),
            ]),
        );

        let line = serde_json::to_string(&OutputLine::from(&HandlerEvent::RowInsertion(change)))
            .unwrap();
        assert!(line.contains(r#""after":{"zone":"kr","amount":300,"id":7}"#));
        assert!(!line.contains(r#""before""#));
        assert!(line.starts_with(r#"{"type":"INSERT","gtid":"#));
    }

    #[tokio::test]
    async fn test_handler_writes_one_line_per_event() {
        let mut handler = JsonLinesHandler::new(Vec::new());
        let cancel = CancellationToken::new();
        handler
            .handle(&cancel, HandlerEvent::TransactionBegin(txn()))
            .await
            .unwrap();
        handler
            .handle(&cancel, HandlerEvent::TransactionEnd(txn()))
            .await
            .unwrap();

        let output = String::from_utf8(handler.out).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        let end: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(end["gtid"], "3e11fa47-71ca-11e1-9e33-c80aa9429562:5");
    }
}
