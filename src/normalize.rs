//! 행 데이터 정규화
//!
//! 증분 캡처로 읽은 값이 전체 덤프(full dump)로 읽은 값과 같은 표현을 갖도록 변환합니다.
//! 다음 차이는 알려진 한계로 그대로 둡니다:
//!   - DECIMAL: 문자열로 반환되지만 끝자리 0 개수가 다를 수 있음
//!   - BINARY: 문자열로 반환되지만 끝의 '\0' 패딩이 다를 수 있음
//!   - JSON: 문자열로 반환되지만 내부 요소 순서가 다를 수 있음
//!   - 소수점 초가 있는 TIME, GEOMETRY는 검증되지 않음

use crate::error::{CdcError, Result};
use crate::events::{ColumnType, RawValue};
use crate::table_meta::TableMeta;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// MEDIUMINT UNSIGNED 최대값
const MEDIUMINT_UNSIGNED_MAX: i32 = 16_777_215;

static DATE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid date pattern"));

/// 정규화된 컬럼 값
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    /// UTF-8이 아닌 바이너리 값
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ColumnValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<RawValue> for ColumnValue {
    fn from(value: RawValue) -> Self {
        match value {
            RawValue::Null => ColumnValue::Null,
            RawValue::Int8(v) => ColumnValue::Int8(v),
            RawValue::Int16(v) => ColumnValue::Int16(v),
            RawValue::Int32(v) => ColumnValue::Int32(v),
            RawValue::Int64(v) => ColumnValue::Int64(v),
            RawValue::Float(v) => ColumnValue::Float(v),
            RawValue::Double(v) => ColumnValue::Double(v),
            RawValue::Decimal(v) => ColumnValue::String(v.to_string()),
            RawValue::Text(v) => ColumnValue::String(v),
            RawValue::Bytes(v) => match String::from_utf8(v) {
                Ok(text) => ColumnValue::String(text),
                Err(err) => ColumnValue::Bytes(err.into_bytes()),
            },
            RawValue::Timestamp(v) => ColumnValue::Timestamp(v.with_timezone(&Utc)),
        }
    }
}

/// 한 행의 모든 컬럼을 정규화합니다.
pub fn normalize_row(meta: &TableMeta, row: Vec<RawValue>) -> Result<Vec<ColumnValue>> {
    row.into_iter()
        .enumerate()
        .map(|(column, value)| normalize_value(meta, column, value))
        .collect()
}

fn normalize_value(meta: &TableMeta, column: usize, value: RawValue) -> Result<ColumnValue> {
    if value.is_null() {
        return Ok(ColumnValue::Null);
    }

    // binlog에는 부호 정보가 없어서 정수가 signed로 디코딩되어 옵니다.
    if meta.is_numeric_column(column) {
        if let RawValue::Decimal(v) = value {
            return Ok(ColumnValue::String(v.to_string()));
        }
        if !meta.is_unsigned(column) {
            return Ok(value.into());
        }
        return Ok(to_unsigned(value, meta.real_type(column)));
    }

    match meta.real_type(column) {
        Some(ColumnType::Enum) => {
            let index = expect_integer(column, "integer (enum)", &value)?;
            let labels = meta.enum_labels(column);
            let label = usize::try_from(index)
                .ok()
                .and_then(|i| i.checked_sub(1))
                .and_then(|i| labels.get(i))
                .ok_or_else(|| CdcError::MalformedValue {
                    column,
                    value: index.to_string(),
                    reason: format!("enum index out of {} labels", labels.len()),
                })?;
            Ok(ColumnValue::String(label.clone()))
        }
        Some(ColumnType::Set) => {
            let bits = expect_integer(column, "integer (set)", &value)?;
            let labels = meta.set_labels(column);
            let matched: Vec<&str> = (0..64)
                .filter(|bit| bits & (1i64 << bit) != 0)
                .filter_map(|bit| labels.get(bit as usize).map(String::as_str))
                .collect();
            Ok(ColumnValue::String(matched.join(",")))
        }
        Some(ColumnType::Year) => {
            // 전체 덤프와 같은 u16 표현
            let year = expect_integer(column, "integer (year)", &value)?;
            Ok(ColumnValue::UInt16(year as u16))
        }
        Some(ColumnType::NewDate) => {
            let RawValue::Text(text) = &value else {
                return Err(CdcError::TypeMismatch {
                    column,
                    expected: "text (date)",
                    actual: value.kind(),
                });
            };
            parse_date(column, text).map(ColumnValue::Timestamp)
        }
        _ => Ok(value.into()),
    }
}

/// signed로 디코딩된 정수를 같은 비트 패턴의 unsigned로 재해석합니다.
fn to_unsigned(value: RawValue, real_type: Option<ColumnType>) -> ColumnValue {
    match value {
        RawValue::Int8(v) => ColumnValue::UInt8(v as u8),
        RawValue::Int16(v) => ColumnValue::UInt16(v as u16),
        RawValue::Int32(v) if v < 0 && real_type == Some(ColumnType::Int24) => {
            ColumnValue::UInt32((MEDIUMINT_UNSIGNED_MAX + v + 1) as u32)
        }
        RawValue::Int32(v) => ColumnValue::UInt32(v as u32),
        RawValue::Int64(v) => ColumnValue::UInt64(v as u64),
        // float/double ...
        other => other.into(),
    }
}

fn expect_integer(column: usize, expected: &'static str, value: &RawValue) -> Result<i64> {
    value.as_i64().ok_or(CdcError::TypeMismatch {
        column,
        expected,
        actual: value.kind(),
    })
}

fn parse_date(column: usize, text: &str) -> Result<DateTime<Utc>> {
    let malformed = |reason: String| CdcError::MalformedValue {
        column,
        value: text.to_string(),
        reason,
    };

    if !DATE_PATTERN.is_match(text) {
        return Err(malformed("expected YYYY-MM-DD".to_string()));
    }
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|e| malformed(e.to_string()))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| malformed("invalid midnight".to_string()))?;
    Ok(midnight.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TableMapData;
    use bigdecimal::BigDecimal;
    use chrono::{FixedOffset, TimeZone};
    use std::str::FromStr;
    use std::sync::Arc;

    fn table(columns: &[(ColumnType, u16)], unsigned: Option<Vec<bool>>) -> TableMeta {
        TableMeta::new(Arc::new(TableMapData {
            table_id: 1,
            schema: "db".to_string(),
            table: "t".to_string(),
            column_count: columns.len() as u64,
            column_types: columns.iter().map(|(ty, _)| *ty).collect(),
            column_meta: columns.iter().map(|(_, meta)| *meta).collect(),
            column_names: (0..columns.len()).map(|i| format!("c{}", i)).collect(),
            signedness: unsigned,
            enum_str_values: Some(vec![vec![
                "small".to_string(),
                "medium".to_string(),
                "large".to_string(),
            ]]),
            set_str_values: Some(vec![vec![
                "read".to_string(),
                "write".to_string(),
                "exec".to_string(),
            ]]),
        }))
        .unwrap()
    }

    fn enum_meta() -> u16 {
        (ColumnType::Enum as u16) << 8 | 1
    }

    fn set_meta() -> u16 {
        (ColumnType::Set as u16) << 8 | 1
    }

    #[test]
    fn test_null_passes_through() {
        let meta = table(&[(ColumnType::Long, 0), (ColumnType::String, enum_meta())], None);
        let row = normalize_row(&meta, vec![RawValue::Null, RawValue::Null]).unwrap();
        assert_eq!(row, vec![ColumnValue::Null, ColumnValue::Null]);
    }

    #[test]
    fn test_unsigned_reinterpretation() {
        let meta = table(
            &[
                (ColumnType::Tiny, 0),
                (ColumnType::Short, 0),
                (ColumnType::Int24, 0),
                (ColumnType::Long, 0),
                (ColumnType::LongLong, 0),
                (ColumnType::Double, 0),
            ],
            Some(vec![true; 6]),
        );
        let row = normalize_row(
            &meta,
            vec![
                RawValue::Int8(-1),
                RawValue::Int16(-2),
                RawValue::Int32(-1),
                RawValue::Int32(-1),
                RawValue::Int64(-1),
                RawValue::Double(-1.5),
            ],
        )
        .unwrap();
        assert_eq!(
            row,
            vec![
                ColumnValue::UInt8(255),
                ColumnValue::UInt16(65534),
                ColumnValue::UInt32(16_777_215),
                ColumnValue::UInt32(u32::MAX),
                ColumnValue::UInt64(u64::MAX),
                ColumnValue::Double(-1.5),
            ]
        );
    }

    #[test]
    fn test_mediumint_lowest_negative() {
        let meta = table(&[(ColumnType::Int24, 0)], Some(vec![true]));
        let row = normalize_row(&meta, vec![RawValue::Int32(-8_388_608)]).unwrap();
        assert_eq!(row, vec![ColumnValue::UInt32(8_388_608)]);

        let row = normalize_row(&meta, vec![RawValue::Int32(100)]).unwrap();
        assert_eq!(row, vec![ColumnValue::UInt32(100)]);
    }

    #[test]
    fn test_signed_numeric_unchanged() {
        let meta = table(&[(ColumnType::Long, 0)], Some(vec![false]));
        let row = normalize_row(&meta, vec![RawValue::Int32(-7)]).unwrap();
        assert_eq!(row, vec![ColumnValue::Int32(-7)]);
    }

    #[test]
    fn test_decimal_to_string() {
        let meta = table(&[(ColumnType::NewDecimal, 0)], Some(vec![true]));
        let value = BigDecimal::from_str("12.50").unwrap();
        let row = normalize_row(&meta, vec![RawValue::Decimal(value)]).unwrap();
        assert_eq!(row, vec![ColumnValue::String("12.50".to_string())]);
    }

    #[test]
    fn test_enum_label() {
        let meta = table(&[(ColumnType::String, enum_meta())], None);
        let row = normalize_row(&meta, vec![RawValue::Int64(2)]).unwrap();
        assert_eq!(row, vec![ColumnValue::String("medium".to_string())]);
    }

    #[test]
    fn test_enum_rejects_non_integer() {
        let meta = table(&[(ColumnType::String, enum_meta())], None);
        let err = normalize_row(&meta, vec![RawValue::Text("medium".to_string())]).unwrap_err();
        match err {
            CdcError::TypeMismatch {
                column, actual, ..
            } => {
                assert_eq!(column, 0);
                assert_eq!(actual, "text");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_enum_index_out_of_range() {
        let meta = table(&[(ColumnType::String, enum_meta())], None);
        assert!(matches!(
            normalize_row(&meta, vec![RawValue::Int64(0)]),
            Err(CdcError::MalformedValue { .. })
        ));
        assert!(matches!(
            normalize_row(&meta, vec![RawValue::Int64(4)]),
            Err(CdcError::MalformedValue { .. })
        ));
    }

    #[test]
    fn test_set_labels_in_bit_order() {
        let meta = table(&[(ColumnType::String, set_meta())], None);
        let row = normalize_row(&meta, vec![RawValue::Int64(0b101)]).unwrap();
        assert_eq!(row, vec![ColumnValue::String("read,exec".to_string())]);

        // 라벨이 없는 비트는 무시
        let row = normalize_row(&meta, vec![RawValue::Int64(0b1010)]).unwrap();
        assert_eq!(row, vec![ColumnValue::String("write".to_string())]);

        let row = normalize_row(&meta, vec![RawValue::Int64(0)]).unwrap();
        assert_eq!(row, vec![ColumnValue::String(String::new())]);
    }

    #[test]
    fn test_set_rejects_non_integer() {
        let meta = table(&[(ColumnType::String, set_meta())], None);
        assert!(matches!(
            normalize_row(&meta, vec![RawValue::Bytes(b"read".to_vec())]),
            Err(CdcError::TypeMismatch { column: 0, .. })
        ));
    }

    #[test]
    fn test_year_as_u16() {
        let meta = table(&[(ColumnType::Year, 0)], None);
        let row = normalize_row(&meta, vec![RawValue::Int64(2024)]).unwrap();
        assert_eq!(row, vec![ColumnValue::UInt16(2024)]);

        assert!(normalize_row(&meta, vec![RawValue::Text("2024".to_string())]).is_err());
    }

    #[test]
    fn test_date_and_legacy_date() {
        let expected = ColumnValue::Timestamp(Utc.with_ymd_and_hms(2021, 3, 9, 0, 0, 0).unwrap());
        for ty in [ColumnType::Date, ColumnType::NewDate] {
            let meta = table(&[(ty, 0)], None);
            let row = normalize_row(&meta, vec![RawValue::Text("2021-03-09".to_string())]).unwrap();
            assert_eq!(row, vec![expected.clone()]);
        }
    }

    #[test]
    fn test_date_malformed() {
        let meta = table(&[(ColumnType::Date, 0)], None);
        for text in ["2021-3-9", "2021-02-30", "0000-00-00", "yesterday"] {
            let err = normalize_row(&meta, vec![RawValue::Text(text.to_string())]).unwrap_err();
            assert!(matches!(err, CdcError::MalformedValue { .. }), "{}", text);
            assert!(err.is_fatal());
        }
        assert!(matches!(
            normalize_row(&meta, vec![RawValue::Int64(20210309)]),
            Err(CdcError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_timestamp_to_utc() {
        let meta = table(&[(ColumnType::DateTime2, 0)], None);
        let local = FixedOffset::east_opt(9 * 3600)
            .unwrap()
            .with_ymd_and_hms(2023, 1, 1, 9, 30, 0)
            .unwrap();
        let row = normalize_row(&meta, vec![RawValue::Timestamp(local)]).unwrap();
        assert_eq!(
            row,
            vec![ColumnValue::Timestamp(
                Utc.with_ymd_and_hms(2023, 1, 1, 0, 30, 0).unwrap()
            )]
        );
    }

    #[test]
    fn test_bytes_to_text() {
        let meta = table(&[(ColumnType::Blob, 0), (ColumnType::String, 0)], None);
        let row = normalize_row(
            &meta,
            vec![
                RawValue::Bytes("héllo".as_bytes().to_vec()),
                RawValue::Bytes(vec![0xff, 0x00]),
            ],
        )
        .unwrap();
        assert_eq!(
            row,
            vec![
                ColumnValue::String("héllo".to_string()),
                ColumnValue::Bytes(vec![0xff, 0x00]),
            ]
        );
    }

    #[test]
    fn test_enum_and_set_output_is_string() {
        let meta = table(
            &[
                (ColumnType::String, enum_meta()),
                (ColumnType::String, set_meta()),
            ],
            None,
        );
        let row = normalize_row(&meta, vec![RawValue::Int64(3), RawValue::Int64(7)]).unwrap();
        assert!(row.iter().all(|v| v.as_str().is_some()));
    }

    #[test]
    fn test_column_value_json() {
        let values = vec![
            ColumnValue::Null,
            ColumnValue::UInt64(u64::MAX),
            ColumnValue::String("x".to_string()),
        ];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[null,18446744073709551615,"x"]"#);
    }
}
