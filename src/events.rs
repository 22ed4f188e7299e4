//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의
//!
//! 복제 프로토콜 디코딩은 외부 라이브러리의 몫입니다. 이 모듈은 디코더가 넘겨주는
//! 이미 파싱된 이벤트의 형태만 정의합니다.

use bigdecimal::BigDecimal;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트
    Unknown = 0,
    /// 쿼리 이벤트 (DDL, BEGIN)
    QueryEvent = 2,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent = 4,
    /// 포맷 설명 이벤트
    FormatDescriptionEvent = 15,
    /// XID 이벤트 (COMMIT)
    XidEvent = 16,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent = 19,
    WriteRowsEventV0 = 20,
    UpdateRowsEventV0 = 21,
    DeleteRowsEventV0 = 22,
    WriteRowsEventV1 = 23,
    UpdateRowsEventV1 = 24,
    DeleteRowsEventV1 = 25,
    /// 하트비트 이벤트
    HeartbeatEvent = 27,
    /// WRITE_ROWS 이벤트 v2 (INSERT)
    WriteRowsEventV2 = 30,
    /// UPDATE_ROWS 이벤트 v2 (UPDATE)
    UpdateRowsEventV2 = 31,
    /// DELETE_ROWS 이벤트 v2 (DELETE)
    DeleteRowsEventV2 = 32,
    /// GTID 이벤트 (Global Transaction ID)
    GtidEvent = 33,
    /// 익명 GTID 이벤트
    AnonymousGtidEvent = 34,
    /// 이전 GTID 집합 이벤트
    PreviousGtidsEvent = 35,
    /// Rows Query 이벤트 (원본 쿼리)
    RowsQueryEvent = 29,
    /// 트랜잭션 페이로드 이벤트
    TransactionPayloadEvent = 40,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            20 => EventType::WriteRowsEventV0,
            21 => EventType::UpdateRowsEventV0,
            22 => EventType::DeleteRowsEventV0,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatEvent,
            29 => EventType::RowsQueryEvent,
            30 => EventType::WriteRowsEventV2,
            31 => EventType::UpdateRowsEventV2,
            32 => EventType::DeleteRowsEventV2,
            33 => EventType::GtidEvent,
            34 => EventType::AnonymousGtidEvent,
            35 => EventType::PreviousGtidsEvent,
            40 => EventType::TransactionPayloadEvent,
            _ => EventType::Unknown,
        }
    }

    /// 모든 버전의 WRITE/UPDATE/DELETE_ROWS 이벤트
    pub fn is_rows_event(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEventV0
                | EventType::UpdateRowsEventV0
                | EventType::DeleteRowsEventV0
                | EventType::WriteRowsEventV1
                | EventType::UpdateRowsEventV1
                | EventType::DeleteRowsEventV1
                | EventType::WriteRowsEventV2
                | EventType::UpdateRowsEventV2
                | EventType::DeleteRowsEventV2
        )
    }

    pub fn is_v2_rows_event(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEventV2
                | EventType::UpdateRowsEventV2
                | EventType::DeleteRowsEventV2
        )
    }
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타입스탬프 (초 단위)
    #[serde(default)]
    pub timestamp: u32,
    /// 이벤트 타입
    pub event_type: EventType,
    /// MySQL 서버 ID
    #[serde(default)]
    pub server_id: u32,
    /// 인코딩된 이벤트 길이 (헤더 포함, 바이트)
    pub event_length: u32,
    /// 다음 이벤트 위치
    #[serde(default)]
    pub next_pos: u32,
    /// 이벤트 플래그
    #[serde(default)]
    pub flags: u16,
}

impl EventHeader {
    pub fn new(event_type: EventType, event_length: u32) -> Self {
        EventHeader {
            timestamp: 0,
            event_type,
            server_id: 0,
            event_length,
            next_pos: 0,
            flags: 0,
        }
    }
}

/// MySQL 컬럼 타입
///
/// type def ref: https://dev.mysql.com/doc/internals/en/table-map-event.html
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    VarChar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    TypedArray = 20,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(val: u8) -> Option<Self> {
        let ty = match val {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            14 => ColumnType::NewDate,
            15 => ColumnType::VarChar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            20 => ColumnType::TypedArray,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            _ => return None,
        };
        Some(ty)
    }

    /// SIGNEDNESS 메타데이터가 적용되는 숫자 타입
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnType::Tiny
                | ColumnType::Short
                | ColumnType::Int24
                | ColumnType::Long
                | ColumnType::LongLong
                | ColumnType::NewDecimal
                | ColumnType::Float
                | ColumnType::Double
        )
    }
}

/// 테이블 맵 정보 (컬럼 메타데이터)
///
/// 옵션 메타데이터는 binlog에 기록된 순서 그대로 보관합니다.
/// `signedness`는 숫자 컬럼 순서, `enum_str_values`/`set_str_values`는
/// 각각 ENUM/SET 컬럼 순서입니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapData {
    /// 테이블 ID
    pub table_id: u64,
    /// 데이터베이스명
    pub schema: String,
    /// 테이블명
    pub table: String,
    /// 컬럼 개수
    pub column_count: u64,
    /// 컬럼 타입들
    pub column_types: Vec<ColumnType>,
    /// 컬럼별 메타데이터
    #[serde(default)]
    pub column_meta: Vec<u16>,
    /// 컬럼명 (binlog_row_metadata=FULL 인 경우에만 존재)
    #[serde(default)]
    pub column_names: Vec<String>,
    /// 숫자 컬럼의 unsigned 여부
    #[serde(default)]
    pub signedness: Option<Vec<bool>>,
    /// ENUM 컬럼의 문자열 값들
    #[serde(default)]
    pub enum_str_values: Option<Vec<Vec<String>>>,
    /// SET 컬럼의 문자열 값들
    #[serde(default)]
    pub set_str_values: Option<Vec<Vec<String>>>,
}

impl TableMapData {
    /// 선언된 타입을 실제 타입으로 해석합니다.
    ///
    /// STRING으로 선언된 ENUM/SET은 메타데이터 상위 바이트에 실제 타입이 들어 있고,
    /// 구형 DATE는 NEWDATE로 통일합니다.
    pub fn real_type(&self, column: usize) -> Option<ColumnType> {
        let declared = *self.column_types.get(column)?;
        let real = match declared {
            ColumnType::String => {
                let meta = self.column_meta.get(column).copied().unwrap_or(0);
                match ColumnType::from_u8((meta >> 8) as u8) {
                    Some(sub @ (ColumnType::Enum | ColumnType::Set)) => sub,
                    _ => declared,
                }
            }
            ColumnType::Date => ColumnType::NewDate,
            _ => declared,
        };
        Some(real)
    }
}

/// WRITE/UPDATE/DELETE_ROWS 이벤트 데이터
///
/// UPDATE의 경우 `rows`에 변경 전/후 이미지가 번갈아 들어 있습니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsEventData {
    /// 테이블 ID
    pub table_id: u64,
    /// 플래그
    #[serde(default)]
    pub flags: u16,
    /// 행 데이터들
    pub rows: Vec<Vec<RawValue>>,
}

/// 디코더가 넘겨주는 셀 값
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawValue {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Decimal(BigDecimal),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<FixedOffset>),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }

    /// 정수 계열 값이면 i64로 반환
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            RawValue::Int8(v) => Some(v as i64),
            RawValue::Int16(v) => Some(v as i64),
            RawValue::Int32(v) => Some(v as i64),
            RawValue::Int64(v) => Some(v),
            _ => None,
        }
    }

    /// 에러 메시지용 값 종류 이름
    pub fn kind(&self) -> &'static str {
        match self {
            RawValue::Null => "null",
            RawValue::Int8(_) => "int8",
            RawValue::Int16(_) => "int16",
            RawValue::Int32(_) => "int32",
            RawValue::Int64(_) => "int64",
            RawValue::Float(_) => "float",
            RawValue::Double(_) => "double",
            RawValue::Decimal(_) => "decimal",
            RawValue::Text(_) => "text",
            RawValue::Bytes(_) => "bytes",
            RawValue::Timestamp(_) => "timestamp",
        }
    }
}

/// GTID 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GtidEventData {
    /// 소스 서버 UUID
    pub sid: Uuid,
    /// 소스 내 트랜잭션 번호
    pub gno: u64,
    /// GTID 이벤트를 포함한 트랜잭션 전체 길이 (MySQL 8.0.2+)
    #[serde(default)]
    pub transaction_length: u64,
    #[serde(default)]
    pub last_committed: i64,
    #[serde(default)]
    pub sequence_number: i64,
    /// 커밋 시각 (epoch 마이크로초)
    #[serde(default)]
    pub immediate_commit_timestamp: u64,
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventData {
    /// 스레드 ID
    pub thread_id: u32,
    /// 실행 시간 (초)
    pub exec_time: u32,
    /// 데이터베이스명
    pub database: String,
    /// 쿼리 문자열
    pub query: String,
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
}

/// 모든 Binlog 이벤트를 포함하는 열거형
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventData {
    Gtid(GtidEventData),
    TableMap(TableMapData),
    Rows(RowsEventData),
    Query(QueryEventData),
    Rotate(RotateEventData),
    Xid(u64),
    RowsQuery(String),
    Unknown,
}

/// 완성된 Binlog 이벤트
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlogEvent {
    /// 이벤트 헤더
    pub header: EventHeader,
    /// 이벤트 데이터
    pub data: EventData,
}

impl BinlogEvent {
    pub fn new(header: EventHeader, data: EventData) -> Self {
        BinlogEvent { header, data }
    }

    pub fn event_type(&self) -> EventType {
        self.header.event_type
    }

    pub fn event_length(&self) -> u64 {
        self.header.event_length as u64
    }
}
