//! MySQL 연결 설정 및 서버 사전 조건 확인
//!
//! 복제 소스로 쓸 서버가 GTID 기반 증분 덤프에 필요한 설정을 갖추고 있는지 확인하고,
//! 재시작 위치로 쓸 `gtid_executed`를 조회합니다. `server_id`로 복제 클라이언트를 등록해
//! GTID binlog 스트림을 여는 것도 여기서 합니다.

use crate::error::{CdcError, Result};
use crate::gtid::GtidSet;
use mysql_async::prelude::*;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, GnoInterval, Opts, OptsBuilder, Sid};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_CHARSET: &str = "utf8mb4";

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("identifier pattern"));

static VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\.(\d+)\.(\d+)").expect("version pattern"));

/// MySQL 연결 설정
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    /// 비어 있으면 utf8mb4
    pub charset: String,
    /// 복제 클라이언트로 등록할 server_id (0 불가)
    pub server_id: u32,
    #[serde(skip)]
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            charset: DEFAULT_CHARSET.to_string(),
            server_id: 1,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_id == 0 {
            return Err(CdcError::ConfigError("server_id must not be 0".to_string()));
        }
        if self.hostname.trim().is_empty() {
            return Err(CdcError::ConfigError("hostname is empty".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(CdcError::ConfigError("username is empty".to_string()));
        }
        if !IDENTIFIER.is_match(self.charset()) {
            return Err(CdcError::ConfigError(format!(
                "invalid charset '{}'",
                self.charset
            )));
        }
        Ok(())
    }

    pub fn charset(&self) -> &str {
        if self.charset.is_empty() {
            DEFAULT_CHARSET
        } else {
            &self.charset
        }
    }

    pub fn build_opts(&self) -> Result<Opts> {
        self.validate()?;

        let builder = OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone())
            .init(vec![format!("SET NAMES {}", self.charset())]);

        Ok(Opts::from(builder))
    }
}

/// MySQL 연결 래퍼
pub struct MySqlConnection {
    conn: Conn,
    config: ConnectionConfig,
}

impl MySqlConnection {
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let opts = config.build_opts()?;

        let conn = tokio::time::timeout(config.timeout, Conn::new(opts))
            .await
            .map_err(|_| {
                CdcError::ConnectionError(format!(
                    "Timed out connecting to {}:{}",
                    config.hostname, config.port
                ))
            })?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))?;

        info!("Connected to MySQL {}:{}", config.hostname, config.port);
        Ok(MySqlConnection { conn, config })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// 서버 버전 문자열 (예: 8.0.36-log)
    pub async fn server_version(&mut self) -> Result<String> {
        let version: Option<String> = self
            .conn
            .query_first("SELECT VERSION()")
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query version: {}", e)))?;

        version.ok_or_else(|| CdcError::QueryError("Server version not found".to_string()))
    }

    /// 전역 변수 조회
    pub async fn get_variable(&mut self, name: &str) -> Result<Option<String>> {
        if !IDENTIFIER.is_match(name) {
            return Err(CdcError::QueryError(format!(
                "invalid variable name '{}'",
                name
            )));
        }

        let query = format!("SHOW GLOBAL VARIABLES LIKE '{}'", name);
        let result: Vec<(String, String)> = self
            .conn
            .query(&query)
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query {}: {}", name, e)))?;

        Ok(result.into_iter().next().map(|(_, v)| v))
    }

    /// GTID 모드 활성 여부 확인
    pub async fn is_gtid_mode_enabled(&mut self) -> Result<bool> {
        Ok(self
            .get_variable("gtid_mode")
            .await?
            .map(|v| v.eq_ignore_ascii_case("ON"))
            .unwrap_or(false))
    }

    /// 현재 실행된 GTID 집합 조회
    pub async fn get_executed_gtid_set(&mut self) -> Result<GtidSet> {
        let result: Option<String> = self
            .conn
            .query_first("SELECT @@global.gtid_executed")
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query gtid_executed: {}", e)))?;

        match result {
            Some(text) => GtidSet::parse(&text),
            None => Ok(GtidSet::new()),
        }
    }

    /// 증분 덤프에 필요한 서버 설정을 조회합니다.
    pub async fn check_prerequisites(&mut self) -> Result<Prerequisites> {
        let version = self.server_version().await?;

        let mut variables = HashMap::new();
        for (name, _) in REQUIRED_VARIABLES {
            if let Some(value) = self.get_variable(name).await? {
                variables.insert(name.to_string(), value);
            }
        }
        debug!("Server variables: {:?}", variables);

        Ok(Prerequisites::evaluate(&version, &variables))
    }

    /// 복제 클라이언트로 등록하고 `gtid_set`에 없는 트랜잭션부터 binlog 스트림을 엽니다.
    ///
    /// 연결은 스트림으로 넘어가므로 이후에는 쿼리를 보낼 수 없습니다.
    pub async fn into_binlog_stream(self, gtid_set: &GtidSet) -> Result<BinlogStream> {
        let server_id = self.config.server_id;
        let sids: Vec<Sid<'static>> = requested_intervals(gtid_set)
            .into_iter()
            .map(|(uuid, intervals)| {
                intervals
                    .into_iter()
                    .fold(Sid::new(uuid), |sid, (start, end)| {
                        sid.with_interval(GnoInterval::new(start, end))
                    })
            })
            .collect();
        let request = BinlogStreamRequest::new(server_id)
            .with_gtid()
            .with_gtid_set(sids);

        info!(
            "Requesting binlog stream as server_id {} from GTID set '{}'",
            server_id, gtid_set
        );
        self.conn.get_binlog_stream(request).await.map_err(|e| {
            CdcError::ConnectionError(format!("Failed to start binlog stream: {}", e))
        })
    }

    pub async fn close(self) -> Result<()> {
        self.conn
            .disconnect()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to disconnect: {}", e)))
    }
}

/// 필요한 서버 변수와 기대값
const REQUIRED_VARIABLES: [(&str, &str); 6] = [
    ("gtid_mode", "ON"),
    ("enforce_gtid_consistency", "ON"),
    ("log_bin", "ON"),
    ("binlog_format", "ROW"),
    ("binlog_row_image", "FULL"),
    ("binlog_row_metadata", "FULL"),
];

/// transaction_length 가 GTID 이벤트에 기록되기 시작한 버전
const MIN_VERSION: (u32, u32, u32) = (8, 0, 2);

/// 사전 조건 항목 하나
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrerequisiteCheck {
    pub name: String,
    pub expected: String,
    pub actual: Option<String>,
    pub ok: bool,
}

impl fmt::Display for PrerequisiteCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} = {} (expected {})",
            if self.ok { "ok" } else { "FAIL" },
            self.name,
            self.actual.as_deref().unwrap_or("<unset>"),
            self.expected
        )
    }
}

/// 서버 사전 조건 점검 결과
#[derive(Debug, Clone)]
pub struct Prerequisites {
    pub version: String,
    pub checks: Vec<PrerequisiteCheck>,
}

impl Prerequisites {
    pub fn evaluate(version: &str, variables: &HashMap<String, String>) -> Self {
        let mut checks = Vec::with_capacity(REQUIRED_VARIABLES.len() + 1);

        let (major, minor, patch) = MIN_VERSION;
        checks.push(PrerequisiteCheck {
            name: "version".to_string(),
            expected: format!(">= {}.{}.{}", major, minor, patch),
            actual: Some(version.to_string()),
            ok: parse_version(version).is_some_and(|v| v >= MIN_VERSION),
        });

        for (name, expected) in REQUIRED_VARIABLES {
            let actual = variables.get(name).cloned();
            let ok = actual
                .as_deref()
                .is_some_and(|v| v.eq_ignore_ascii_case(expected));
            checks.push(PrerequisiteCheck {
                name: name.to_string(),
                expected: expected.to_string(),
                actual,
                ok,
            });
        }

        Prerequisites {
            version: version.to_string(),
            checks,
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }

    pub fn violations(&self) -> impl Iterator<Item = &PrerequisiteCheck> {
        self.checks.iter().filter(|c| !c.ok)
    }

    /// 하나라도 어긋나면 `CdcError::ConfigError`
    pub fn ensure(&self) -> Result<()> {
        let violations: Vec<String> = self.violations().map(|c| c.to_string()).collect();
        if violations.is_empty() {
            return Ok(());
        }
        for violation in &violations {
            warn!("Prerequisite not met: {}", violation);
        }
        Err(CdcError::ConfigError(format!(
            "server does not meet prerequisites: {}",
            violations.join("; ")
        )))
    }
}

/// 복제 요청에 실을 (uuid, [start, end) 구간들)
///
/// 복제 프로토콜의 구간은 끝을 포함하지 않습니다.
fn requested_intervals(gtid_set: &GtidSet) -> Vec<([u8; 16], Vec<(u64, u64)>)> {
    gtid_set
        .uuid_sets()
        .map(|set| {
            let intervals = set
                .ranges()
                .iter()
                .map(|range| (range.start, range.end + 1))
                .collect();
            (*set.sid.as_bytes(), intervals)
        })
        .collect()
}

fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let caps = VERSION.captures(version)?;
    Some((
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_variables() -> HashMap<String, String> {
        REQUIRED_VARIABLES
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 3306);
        assert_eq!(config.charset(), "utf8mb4");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_connection_config_new() {
        let config = ConnectionConfig::new("127.0.0.1", "repl");
        assert_eq!(config.hostname, "127.0.0.1");
        assert_eq!(config.username, "repl");
        assert_eq!(config.server_id, 1);
    }

    #[test]
    fn test_validate_rejects_zero_server_id() {
        let config = ConnectionConfig {
            server_id: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, CdcError::ConfigError(_)));
        assert!(config.build_opts().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_charset() {
        let config = ConnectionConfig {
            charset: "utf8; DROP".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let empty = ConnectionConfig {
            charset: String::new(),
            ..Default::default()
        };
        assert_eq!(empty.charset(), DEFAULT_CHARSET);
        assert!(empty.validate().is_ok());
    }

    #[test]
    fn test_config_from_json() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{"hostname": "db1", "serverId": 1001, "charset": "latin1"}"#)
                .unwrap();
        assert_eq!(config.hostname, "db1");
        assert_eq!(config.server_id, 1001);
        assert_eq!(config.charset(), "latin1");
        assert_eq!(config.port, 3306);
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("8.0.36-log"), Some((8, 0, 36)));
        assert_eq!(parse_version("5.7.44"), Some((5, 7, 44)));
        assert_eq!(parse_version("unknown"), None);
    }

    #[test]
    fn test_requested_intervals_are_half_open() {
        let set = GtidSet::parse(
            "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5:7,550e8400-e29b-41d4-a716-446655440000:3",
        )
        .unwrap();
        let intervals = requested_intervals(&set);
        assert_eq!(intervals.len(), 2);

        let sid = uuid::Uuid::parse_str("3e11fa47-71ca-11e1-9e33-c80aa9429562").unwrap();
        let (uuid, ranges) = intervals
            .iter()
            .find(|(uuid, _)| uuid == sid.as_bytes())
            .unwrap();
        assert_eq!(uuid, sid.as_bytes());
        assert_eq!(ranges, &vec![(1, 6), (7, 8)]);

        assert!(requested_intervals(&GtidSet::new()).is_empty());
    }

    #[test]
    fn test_prerequisites_satisfied() {
        let report = Prerequisites::evaluate("8.0.36", &good_variables());
        assert!(report.is_satisfied());
        assert!(report.ensure().is_ok());
    }

    #[test]
    fn test_prerequisites_violations() {
        let mut variables = good_variables();
        variables.insert("binlog_row_metadata".to_string(), "MINIMAL".to_string());
        variables.remove("gtid_mode");

        let report = Prerequisites::evaluate("8.0.1", &variables);
        let failed: Vec<&str> = report.violations().map(|c| c.name.as_str()).collect();
        assert_eq!(failed, vec!["version", "gtid_mode", "binlog_row_metadata"]);

        let err = report.ensure().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("binlog_row_metadata = MINIMAL"));
    }
}
