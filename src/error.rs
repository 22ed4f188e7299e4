//! CDC 관련 에러 타입
//!
//! 프로토콜 위반과 타입 불일치는 복구할 수 없는 에러입니다. 엔진은 이를 그대로
//! 반환하고, 프로세스 종료 여부는 최상위 호출자가 `is_fatal()`로 판단합니다.

use std::io;
use thiserror::Error;

/// 핸들러/이벤트 소스가 반환하는 에러
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("GTID 처리 에러: {0}")]
    GtidError(String),

    /// 엔진이 의존하는 서버 버전/설정 가정이 깨졌음
    #[error("프로토콜 위반: {0}")]
    ProtocolViolation(String),

    #[error("타입 불일치: column {column} 은(는) {expected} 타입이어야 하지만 {actual} 입니다")]
    TypeMismatch {
        column: usize,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("잘못된 컬럼 값: column {column} ({value}): {reason}")]
    MalformedValue {
        column: usize,
        value: String,
        reason: String,
    },

    #[error("스트림 에러 ({stage}): {source}")]
    Transport {
        stage: &'static str,
        #[source]
        source: BoxError,
    },

    /// 핸들러가 반환한 에러 (변경 없이 전달)
    #[error(transparent)]
    Handler(BoxError),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl CdcError {
    /// 재시도해도 의미가 없는 에러인지 여부
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CdcError::ConfigError(_)
                | CdcError::GtidError(_)
                | CdcError::ProtocolViolation(_)
                | CdcError::TypeMismatch { .. }
                | CdcError::MalformedValue { .. }
        )
    }

    /// 핸들러가 반환한 원본 에러를 꺼냅니다.
    pub fn into_handler_error(self) -> Option<BoxError> {
        match self {
            CdcError::Handler(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
