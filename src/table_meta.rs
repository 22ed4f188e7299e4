//! 테이블 맵 이벤트 기반 컬럼 메타데이터 해석 및 캐시

use crate::error::{CdcError, Result};
use crate::events::{ColumnType, TableMapData};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// 테이블 맵 하나에 대한 메타데이터 해석기
///
/// unsigned 여부와 ENUM/SET 문자열 목록은 처음 요청될 때 한 번만 계산됩니다.
#[derive(Debug)]
pub struct TableMeta {
    table: Arc<TableMapData>,
    unsigned_flags: OnceCell<Vec<bool>>,
    enum_values: OnceCell<HashMap<usize, Vec<String>>>,
    set_values: OnceCell<HashMap<usize, Vec<String>>>,
}

impl TableMeta {
    /// 컬럼명이 없으면 binlog_row_metadata=FULL 이 아닌 것이므로 스트림 전체를 중단해야 합니다.
    pub fn new(table: Arc<TableMapData>) -> Result<Self> {
        if table.column_names.len() as u64 != table.column_count
            || table.column_types.len() as u64 != table.column_count
        {
            return Err(CdcError::ProtocolViolation(format!(
                "table map of {}.{} has {} column names for {} columns, make sure the source runs MySQL >= 8.0.1 with --binlog-row-metadata=FULL",
                table.schema,
                table.table,
                table.column_names.len(),
                table.column_count
            )));
        }

        Ok(TableMeta {
            table,
            unsigned_flags: OnceCell::new(),
            enum_values: OnceCell::new(),
            set_values: OnceCell::new(),
        })
    }

    pub fn table_id(&self) -> u64 {
        self.table.table_id
    }

    pub fn schema_name(&self) -> &str {
        &self.table.schema
    }

    pub fn table_name(&self) -> &str {
        &self.table.table
    }

    pub fn column_count(&self) -> usize {
        self.table.column_types.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.table.column_names
    }

    pub fn table_map(&self) -> &TableMapData {
        &self.table
    }

    /// 선언된 타입을 실제 타입으로 해석합니다. [`TableMapData::real_type`] 참고
    pub fn real_type(&self, column: usize) -> Option<ColumnType> {
        self.table.real_type(column)
    }

    pub fn is_numeric_column(&self, column: usize) -> bool {
        self.table
            .column_types
            .get(column)
            .map(ColumnType::is_numeric)
            .unwrap_or(false)
    }

    pub fn is_enum_column(&self, column: usize) -> bool {
        self.real_type(column) == Some(ColumnType::Enum)
    }

    pub fn is_set_column(&self, column: usize) -> bool {
        self.real_type(column) == Some(ColumnType::Set)
    }

    /// 메타데이터가 없으면 signed로 간주
    pub fn is_unsigned(&self, column: usize) -> bool {
        self.unsigned_flags()
            .get(column)
            .copied()
            .unwrap_or(false)
    }

    /// ENUM 컬럼의 문자열 목록 (없으면 빈 목록)
    pub fn enum_labels(&self, column: usize) -> &[String] {
        self.enum_values
            .get_or_init(|| {
                self.spread_by_column(self.table.enum_str_values.as_deref(), ColumnType::Enum)
            })
            .get(&column)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// SET 컬럼의 문자열 목록 (없으면 빈 목록)
    pub fn set_labels(&self, column: usize) -> &[String] {
        self.set_values
            .get_or_init(|| {
                self.spread_by_column(self.table.set_str_values.as_deref(), ColumnType::Set)
            })
            .get(&column)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn unsigned_flags(&self) -> &[bool] {
        self.unsigned_flags.get_or_init(|| {
            let mut flags = vec![false; self.column_count()];
            let Some(signedness) = self.table.signedness.as_deref() else {
                return flags;
            };

            let mut numeric_idx = 0;
            for (column, ty) in self.table.column_types.iter().enumerate() {
                if !ty.is_numeric() {
                    continue;
                }
                flags[column] = signedness.get(numeric_idx).copied().unwrap_or(false);
                numeric_idx += 1;
            }
            flags
        })
    }

    /// 특정 실제 타입 컬럼 순서로 기록된 목록을 컬럼 인덱스 기준으로 펼칩니다.
    fn spread_by_column(
        &self,
        values: Option<&[Vec<String>]>,
        kind: ColumnType,
    ) -> HashMap<usize, Vec<String>> {
        let Some(values) = values else {
            return HashMap::new();
        };

        let mut values = values.iter();
        (0..self.column_count())
            .filter(|&column| self.real_type(column) == Some(kind))
            .map_while(|column| values.next().map(|labels| (column, labels.clone())))
            .collect()
    }
}

/// table_id → 해석된 메타데이터
///
/// 같은 table_id로 새 테이블 맵이 오면 이전 항목을 교체합니다.
/// 테이블 맵은 트랜잭션마다 다시 기록되므로 엔진은 트랜잭션이 닫힐 때마다 비웁니다.
#[derive(Debug, Default)]
pub struct TableCache {
    tables: HashMap<u64, Arc<TableMeta>>,
}

impl TableCache {
    pub fn new() -> Self {
        TableCache {
            tables: HashMap::new(),
        }
    }

    pub fn register(&mut self, table: TableMapData) -> Result<Arc<TableMeta>> {
        let meta = Arc::new(TableMeta::new(Arc::new(table))?);
        debug!(
            "Table map: {}.{} (table_id={}, columns={})",
            meta.schema_name(),
            meta.table_name(),
            meta.table_id(),
            meta.column_count()
        );
        self.tables.insert(meta.table_id(), Arc::clone(&meta));
        Ok(meta)
    }

    pub fn get(&self, table_id: u64) -> Option<Arc<TableMeta>> {
        self.tables.get(&table_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }
}
