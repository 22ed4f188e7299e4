//! 복제 연결에서 직접 읽는 binlog 이벤트 소스
//!
//! mysql_async의 GTID binlog 스트림이 디코딩한 이벤트를 엔진이 다루는 [`BinlogEvent`]로
//! 옮깁니다. 행 이미지는 binlog_row_image=FULL 이라고 가정합니다.

use crate::connection::{ConnectionConfig, MySqlConnection};
use crate::events::{
    BinlogEvent, ColumnType, EventData, EventHeader, EventType, GtidEventData, RawValue,
    RowsEventData, TableMapData,
};
use crate::gtid::GtidSet;
use crate::source::{EventSource, SourceError};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use futures_util::StreamExt;
use mysql_async::binlog::events::{
    Event, EventData as StreamEventData, GtidEvent, OptionalMetadataField,
    RowsEventData as StreamRowsEvent, TableMapEvent,
};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::{BinlogStream, Value};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// 라이브 binlog 스트림
pub struct BinlogStreamSource {
    stream: BinlogStream,
    /// 현재 트랜잭션에서 받은 테이블 맵 (GTID 이벤트마다 비움)
    tables: HashMap<u64, TableMapData>,
    received: u64,
}

impl BinlogStreamSource {
    /// 연결을 열고 `gtid_set`에 없는 트랜잭션부터 복제를 요청합니다.
    pub async fn connect(
        config: ConnectionConfig,
        gtid_set: &GtidSet,
    ) -> crate::error::Result<Self> {
        let conn = MySqlConnection::connect(config).await?;
        Self::start(conn, gtid_set).await
    }

    /// 이미 열린 연결을 복제 스트림으로 전환합니다.
    pub async fn start(conn: MySqlConnection, gtid_set: &GtidSet) -> crate::error::Result<Self> {
        let stream = conn.into_binlog_stream(gtid_set).await?;
        Ok(BinlogStreamSource {
            stream,
            tables: HashMap::new(),
            received: 0,
        })
    }

    /// 지금까지 받은 이벤트 수 (하트비트 포함)
    pub fn received(&self) -> u64 {
        self.received
    }

    /// 하트비트처럼 binlog에 기록되지 않는 이벤트는 `None`
    fn convert(&mut self, event: &Event) -> Result<Option<BinlogEvent>, SourceError> {
        let raw_header = event.header();
        let event_type = EventType::from_u8(raw_header.event_type_raw());
        let header = EventHeader {
            timestamp: raw_header.timestamp(),
            event_type,
            server_id: raw_header.server_id(),
            event_length: raw_header.event_size(),
            next_pos: raw_header.log_pos(),
            flags: raw_header.flags_raw(),
        };

        match event_type {
            EventType::HeartbeatEvent => return Ok(None),
            EventType::TransactionPayloadEvent => {
                return Err(
                    "compressed transaction payloads are not supported, disable binlog_transaction_compression"
                        .into(),
                );
            }
            _ => {}
        }

        let data = match event.read_data()? {
            Some(StreamEventData::GtidEvent(gtid)) => {
                self.tables.clear();
                EventData::Gtid(gtid_data(&gtid))
            }
            Some(StreamEventData::TableMapEvent(tme)) => {
                let table = table_map_data(&tme)?;
                self.tables.insert(table.table_id, table.clone());
                EventData::TableMap(table)
            }
            Some(StreamEventData::RowsEvent(rows)) => {
                let table_id = rows.table_id();
                let (Some(table), Some(tme)) =
                    (self.tables.get(&table_id), self.stream.get_tme(table_id))
                else {
                    return Err(
                        format!("rows event references unknown table_id {}", table_id).into(),
                    );
                };
                EventData::Rows(rows_data(&rows, tme, table)?)
            }
            Some(_) => EventData::Unknown,
            None => {
                trace!("Undecodable {:?} event, keeping its length only", event_type);
                EventData::Unknown
            }
        };

        Ok(Some(BinlogEvent::new(header, data)))
    }
}

#[async_trait]
impl EventSource for BinlogStreamSource {
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>, SourceError> {
        loop {
            let event = match self.stream.next().await {
                Some(event) => event?,
                None => {
                    info!("Binlog stream closed after {} events", self.received);
                    return Ok(None);
                }
            };
            self.received += 1;

            if let Some(event) = self.convert(&event)? {
                return Ok(Some(event));
            }
        }
    }
}

fn gtid_data(event: &GtidEvent) -> GtidEventData {
    GtidEventData {
        sid: Uuid::from_bytes(event.sid()),
        gno: event.gno(),
        transaction_length: event.tx_length(),
        last_committed: event.last_committed() as i64,
        sequence_number: event.sequence_number() as i64,
        immediate_commit_timestamp: event.immediate_commit_timestamp(),
    }
}

fn table_map_data(tme: &TableMapEvent<'_>) -> Result<TableMapData, SourceError> {
    let schema = tme.database_name().into_owned();
    let table = tme.table_name().into_owned();
    let column_count = tme.columns_count();

    let mut column_types = Vec::with_capacity(column_count as usize);
    let mut column_meta = Vec::with_capacity(column_count as usize);
    for column in 0..column_count as usize {
        let declared = match tme.get_column_type(column) {
            Ok(Some(ty)) => ty as u8,
            _ => {
                return Err(format!(
                    "table map of {}.{} has no type for column {}",
                    schema, table, column
                )
                .into())
            }
        };
        let column_type = ColumnType::from_u8(declared).ok_or_else(|| {
            format!(
                "table map of {}.{} has unknown type {} for column {}",
                schema, table, declared, column
            )
        })?;
        column_types.push(column_type);
        column_meta.push(column_meta_value(
            column_type,
            tme.get_column_metadata(column).unwrap_or(&[]),
        ));
    }

    let mut column_names = Vec::new();
    let mut signedness = None;
    let mut enum_str_values = None;
    let mut set_str_values = None;
    for field in tme.iter_optional_meta() {
        match field? {
            OptionalMetadataField::Signedness(bits) => {
                let numeric = column_types.iter().filter(|ty| ty.is_numeric()).count();
                signedness = Some(
                    (0..numeric)
                        .map(|i| bits.get(i).as_deref().copied().unwrap_or(false))
                        .collect(),
                );
            }
            OptionalMetadataField::ColumnName(names) => {
                for name in names.iter_names() {
                    let name = name?;
                    column_names.push(name.name().into_owned());
                }
            }
            OptionalMetadataField::EnumStrValue(columns) => {
                let mut labels = Vec::new();
                for values in columns.iter_values() {
                    let values = values?;
                    labels.push(
                        values
                            .values()
                            .iter()
                            .map(|v| v.value().into_owned())
                            .collect(),
                    );
                }
                enum_str_values = Some(labels);
            }
            OptionalMetadataField::SetStrValue(columns) => {
                let mut labels = Vec::new();
                for values in columns.iter_values() {
                    let values = values?;
                    labels.push(
                        values
                            .values()
                            .iter()
                            .map(|v| v.value().into_owned())
                            .collect(),
                    );
                }
                set_str_values = Some(labels);
            }
            _ => {}
        }
    }

    debug!(
        "Decoded table map {}.{} (table_id={}, columns={})",
        schema,
        table,
        tme.table_id(),
        column_count
    );

    Ok(TableMapData {
        table_id: tme.table_id(),
        schema,
        table,
        column_count,
        column_types,
        column_meta,
        column_names,
        signedness,
        enum_str_values,
        set_str_values,
    })
}

/// 컬럼 메타데이터 바이트를 u16 하나로 합칩니다.
///
/// VARCHAR 계열은 길이(리틀 엔디언), 나머지 2바이트 메타데이터는 상위 바이트가 먼저입니다.
/// STRING의 상위 바이트가 ENUM/SET 실제 타입이 됩니다.
fn column_meta_value(column_type: ColumnType, meta: &[u8]) -> u16 {
    match *meta {
        [] => 0,
        [only] => only as u16,
        [lo, hi] if matches!(column_type, ColumnType::VarChar | ColumnType::VarString) => {
            u16::from_le_bytes([lo, hi])
        }
        [first, second, ..] => u16::from_be_bytes([first, second]),
    }
}

fn rows_data(
    rows: &StreamRowsEvent<'_>,
    tme: &TableMapEvent<'_>,
    table: &TableMapData,
) -> Result<RowsEventData, SourceError> {
    let mut images = Vec::new();
    for pair in rows.rows(tme) {
        let (before, after) = pair?;
        // UPDATE는 before, after 순서로 이어 붙임
        for row in [before, after].into_iter().flatten() {
            images.push(row_values(table, row)?);
        }
    }

    Ok(RowsEventData {
        table_id: rows.table_id(),
        flags: 0,
        rows: images,
    })
}

fn row_values(table: &TableMapData, mut row: BinlogRow) -> Result<Vec<RawValue>, SourceError> {
    if row.len() != table.column_types.len() {
        return Err(format!(
            "row image of {}.{} has {} of {} columns, make sure binlog_row_image=FULL",
            table.schema,
            table.table,
            row.len(),
            table.column_types.len()
        )
        .into());
    }

    let mut values = Vec::with_capacity(row.len());
    for column in 0..row.len() {
        let value = row
            .take(column)
            .ok_or_else(|| format!("column {} missing from row image", column))?;
        values.push(raw_value(table.real_type(column), value)?);
    }
    Ok(values)
}

fn raw_value(column_type: Option<ColumnType>, value: BinlogValue<'_>) -> Result<RawValue, SourceError> {
    match value {
        BinlogValue::Value(value) => from_value(column_type, value),
        BinlogValue::Jsonb(jsonb) => {
            let json: serde_json::Value = jsonb.try_into()?;
            Ok(RawValue::Text(json.to_string()))
        }
        BinlogValue::JsonDiff(_) => {
            Err("partial JSON updates are not supported, set binlog_row_value_options=''".into())
        }
    }
}

/// 디코딩된 값을 컬럼 타입에 맞는 [`RawValue`]로 바꿉니다.
///
/// unsigned 정수는 같은 폭의 signed 값으로 비트 그대로 옮기고, 부호 해석은 정규화 단계에 맡깁니다.
fn from_value(column_type: Option<ColumnType>, value: Value) -> Result<RawValue, SourceError> {
    let raw = match value {
        Value::NULL => RawValue::Null,
        Value::Int(v) => integer(column_type, v)?,
        Value::UInt(v) => integer(column_type, v as i64)?,
        Value::Float(v) => RawValue::Float(v),
        Value::Double(v) => RawValue::Double(v),
        Value::Bytes(bytes) => match column_type {
            Some(ColumnType::NewDecimal | ColumnType::Decimal) => {
                RawValue::Decimal(BigDecimal::from_str(std::str::from_utf8(&bytes)?)?)
            }
            Some(ColumnType::Timestamp | ColumnType::Timestamp2) => {
                RawValue::Timestamp(epoch_timestamp(std::str::from_utf8(&bytes)?)?)
            }
            _ => RawValue::Bytes(bytes),
        },
        Value::Date(year, month, day, hour, minute, second, micros) => match column_type {
            Some(ColumnType::Date | ColumnType::NewDate) => {
                RawValue::Text(format!("{:04}-{:02}-{:02}", year, month, day))
            }
            Some(ColumnType::Timestamp | ColumnType::Timestamp2) => {
                let naive = NaiveDate::from_ymd_opt(year.into(), month.into(), day.into())
                    .and_then(|date| {
                        date.and_hms_micro_opt(hour.into(), minute.into(), second.into(), micros)
                    })
                    .ok_or_else(|| {
                        format!(
                            "invalid timestamp {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                            year, month, day, hour, minute, second
                        )
                    })?;
                RawValue::Timestamp(Utc.from_utc_datetime(&naive).into())
            }
            _ => {
                let mut text = format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    year, month, day, hour, minute, second
                );
                if micros > 0 {
                    text.push_str(&format!(".{:06}", micros));
                }
                RawValue::Text(text)
            }
        },
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let hours = u64::from(days) * 24 + u64::from(hours);
            let mut text = format!(
                "{}{:02}:{:02}:{:02}",
                if negative { "-" } else { "" },
                hours,
                minutes,
                seconds
            );
            if micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            RawValue::Text(text)
        }
    };
    Ok(raw)
}

fn integer(column_type: Option<ColumnType>, v: i64) -> Result<RawValue, SourceError> {
    let raw = match column_type {
        Some(ColumnType::Tiny) => RawValue::Int8(v as i8),
        Some(ColumnType::Short) => RawValue::Int16(v as i16),
        Some(ColumnType::Int24 | ColumnType::Long) => RawValue::Int32(v as i32),
        Some(ColumnType::Timestamp | ColumnType::Timestamp2) => {
            let at = DateTime::from_timestamp(v, 0)
                .ok_or_else(|| format!("timestamp {} out of range", v))?;
            RawValue::Timestamp(at.into())
        }
        _ => RawValue::Int64(v),
    };
    Ok(raw)
}

/// "초[.소수]" 형태의 epoch 문자열
fn epoch_timestamp(text: &str) -> Result<DateTime<FixedOffset>, SourceError> {
    let (secs, fraction) = text.split_once('.').unwrap_or((text, ""));
    if fraction.len() > 6 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid timestamp '{}'", text).into());
    }
    let secs: i64 = secs.parse()?;
    let micros: u32 = if fraction.is_empty() {
        0
    } else {
        format!("{:0<6}", fraction).parse()?
    };

    let at = DateTime::from_timestamp(secs, micros * 1_000)
        .ok_or_else(|| format!("timestamp '{}' out of range", text))?;
    Ok(at.into())
}
