//! 호출자에게 전달되는 트랜잭션/행 변경 이벤트와 핸들러 인터페이스

use crate::error::BoxError;
use crate::gtid::{Gtid, GtidSet};
use crate::normalize::ColumnValue;
use crate::table_meta::TableMeta;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 핸들러가 반환하는 에러. 엔진은 이를 `CdcError::Handler`로 감싸 그대로 돌려줍니다.
pub type HandlerError = BoxError;

/// 트랜잭션 컨텍스트
///
/// GTID 이벤트에서 만들어지고 트랜잭션이 끝나면 버려집니다.
#[derive(Debug, Clone)]
pub struct TxnContext {
    before_gtid_set: GtidSet,
    after_gtid_set: GtidSet,
    gtid: Gtid,
    transaction_length: u64,
    immediate_commit_timestamp: u64,
}

impl TxnContext {
    /// gno가 0인 GTID는 집합에 넣을 수 없으므로 `CdcError::GtidError`를 반환합니다.
    pub fn new(
        before_gtid_set: GtidSet,
        gtid: Gtid,
        transaction_length: u64,
        immediate_commit_timestamp: u64,
    ) -> crate::error::Result<Self> {
        let mut after_gtid_set = before_gtid_set.clone();
        after_gtid_set.merge_one(&gtid)?;

        Ok(TxnContext {
            before_gtid_set,
            after_gtid_set,
            gtid,
            transaction_length,
            immediate_commit_timestamp,
        })
    }

    /// 이 트랜잭션 직전의 GTID 집합
    pub fn before_gtid_set(&self) -> &GtidSet {
        &self.before_gtid_set
    }

    /// 이 트랜잭션까지 반영한 GTID 집합. 재시작 위치로 저장할 값입니다.
    pub fn after_gtid_set(&self) -> &GtidSet {
        &self.after_gtid_set
    }

    pub fn gtid(&self) -> &Gtid {
        &self.gtid
    }

    /// GTID 이벤트에 선언된 트랜잭션 전체 길이 (바이트)
    pub fn transaction_length(&self) -> u64 {
        self.transaction_length
    }

    pub fn commit_time(&self) -> Option<DateTime<Utc>> {
        if self.immediate_commit_timestamp == 0 {
            return None;
        }
        let micros = i64::try_from(self.immediate_commit_timestamp).ok()?;
        DateTime::from_timestamp_micros(micros)
    }
}

/// 행 변경 (INSERT: after만, DELETE: before만, UPDATE: 둘 다)
#[derive(Debug, Clone)]
pub struct RowChange {
    txn: Arc<TxnContext>,
    table: Arc<TableMeta>,
    before: Option<Vec<ColumnValue>>,
    after: Option<Vec<ColumnValue>>,
}

impl RowChange {
    pub fn new(
        txn: Arc<TxnContext>,
        table: Arc<TableMeta>,
        before: Option<Vec<ColumnValue>>,
        after: Option<Vec<ColumnValue>>,
    ) -> Self {
        RowChange {
            txn,
            table,
            before,
            after,
        }
    }

    pub fn txn(&self) -> &TxnContext {
        &self.txn
    }

    pub fn table(&self) -> &TableMeta {
        &self.table
    }

    pub fn schema_name(&self) -> &str {
        self.table.schema_name()
    }

    pub fn table_name(&self) -> &str {
        self.table.table_name()
    }

    pub fn before(&self) -> Option<&[ColumnValue]> {
        self.before.as_deref()
    }

    pub fn after(&self) -> Option<&[ColumnValue]> {
        self.after.as_deref()
    }

    /// 컬럼명 → 값 (변경 전)
    pub fn before_named(&self) -> Option<NamedRow<'_>> {
        self.before.as_deref().map(|row| self.named(row))
    }

    /// 컬럼명 → 값 (변경 후)
    pub fn after_named(&self) -> Option<NamedRow<'_>> {
        self.after.as_deref().map(|row| self.named(row))
    }

    fn named<'a>(&'a self, values: &'a [ColumnValue]) -> NamedRow<'a> {
        NamedRow {
            columns: self.table.column_names(),
            values,
        }
    }
}

/// 컬럼명이 붙은 행 이미지
///
/// 테이블 정의의 컬럼 순서를 유지하며, JSON 객체로 직렬화할 때도 같은 순서로 씁니다.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NamedRow<'a> {
    columns: &'a [String],
    values: &'a [ColumnValue],
}

impl<'a> NamedRow<'a> {
    pub fn get(&self, column: &str) -> Option<&'a ColumnValue> {
        let index = self.columns.iter().position(|name| name == column)?;
        self.values.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a ColumnValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    pub fn len(&self) -> usize {
        self.columns.len().min(self.values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Serialize for NamedRow<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// 핸들러 이벤트 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerEventKind {
    TransactionBegin,
    RowInsertion,
    RowUpdating,
    RowDeletion,
    TransactionEnd,
}

impl HandlerEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerEventKind::TransactionBegin => "BEGIN",
            HandlerEventKind::RowInsertion => "INSERT",
            HandlerEventKind::RowUpdating => "UPDATE",
            HandlerEventKind::RowDeletion => "DELETE",
            HandlerEventKind::TransactionEnd => "COMMIT",
        }
    }
}

/// 핸들러에 전달되는 이벤트
#[derive(Debug, Clone)]
pub enum HandlerEvent {
    TransactionBegin(Arc<TxnContext>),
    RowInsertion(RowChange),
    RowUpdating(RowChange),
    RowDeletion(RowChange),
    TransactionEnd(Arc<TxnContext>),
}

impl HandlerEvent {
    pub fn kind(&self) -> HandlerEventKind {
        match self {
            HandlerEvent::TransactionBegin(_) => HandlerEventKind::TransactionBegin,
            HandlerEvent::RowInsertion(_) => HandlerEventKind::RowInsertion,
            HandlerEvent::RowUpdating(_) => HandlerEventKind::RowUpdating,
            HandlerEvent::RowDeletion(_) => HandlerEventKind::RowDeletion,
            HandlerEvent::TransactionEnd(_) => HandlerEventKind::TransactionEnd,
        }
    }

    pub fn txn(&self) -> &TxnContext {
        match self {
            HandlerEvent::TransactionBegin(txn) | HandlerEvent::TransactionEnd(txn) => txn,
            HandlerEvent::RowInsertion(change)
            | HandlerEvent::RowUpdating(change)
            | HandlerEvent::RowDeletion(change) => change.txn(),
        }
    }

    pub fn row_change(&self) -> Option<&RowChange> {
        match self {
            HandlerEvent::RowInsertion(change)
            | HandlerEvent::RowUpdating(change)
            | HandlerEvent::RowDeletion(change) => Some(change),
            _ => None,
        }
    }
}

/// 이벤트 핸들러
///
/// 엔진은 핸들러를 순차적으로 호출하고, 반환될 때까지 다음 이벤트를 읽지 않습니다.
/// 에러를 반환하면 스트림이 즉시 중단됩니다.
#[async_trait]
pub trait Handler: Send {
    async fn handle(
        &mut self,
        cancel: &CancellationToken,
        event: HandlerEvent,
    ) -> Result<(), HandlerError>;
}

#[async_trait]
impl Handler for mpsc::Sender<HandlerEvent> {
    async fn handle(
        &mut self,
        _cancel: &CancellationToken,
        event: HandlerEvent,
    ) -> Result<(), HandlerError> {
        // 취소되어도 이미 넘겨받은 이벤트는 끝까지 전달
        self.send(event)
            .await
            .map_err(|_| HandlerError::from("handler channel closed"))
    }
}

#[async_trait]
impl Handler for mpsc::UnboundedSender<HandlerEvent> {
    async fn handle(
        &mut self,
        _cancel: &CancellationToken,
        event: HandlerEvent,
    ) -> Result<(), HandlerError> {
        self.send(event)
            .map_err(|_| HandlerError::from("handler channel closed"))
    }
}
