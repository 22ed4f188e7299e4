//! MySQL GTID 기반 증분 CDC (Change Data Capture) 엔진
//!
//! 복제 연결이나 기록된 파일에서 디코딩된 binlog 이벤트를 받아 트랜잭션 단위로 묶고,
//! 행 데이터를 정규화해 호출자의 핸들러에 순서대로 전달합니다.
//! 주요 기능:
//! - GTID 집합 파싱 및 트랜잭션 단위 전진
//! - 테이블 맵 기반 컬럼 메타데이터 해석
//! - 행 값 정규화 (unsigned, ENUM/SET, YEAR, DATE)
//! - 트랜잭션 길이 기반 트랜잭션 경계 추적
//! - 서버 사전 조건 확인
//! - GTID 기반 binlog 스트림 연결

pub mod binlog_stream;
pub mod cdc_engine;
pub mod connection;
pub mod error;
pub mod events;
pub mod gtid;
pub mod handler;
pub mod normalize;
pub mod source;
pub mod table_meta;

pub use binlog_stream::BinlogStreamSource;
pub use cdc_engine::{incr_dump, incr_dump_from_server, CdcEngine};
pub use connection::{ConnectionConfig, MySqlConnection};
pub use error::{CdcError, Result};
pub use events::{BinlogEvent, EventType};
pub use gtid::{Gtid, GtidSet};
pub use handler::{Handler, HandlerEvent, NamedRow, RowChange, TxnContext};
pub use normalize::ColumnValue;
pub use source::{EventSource, JsonLinesSource};
