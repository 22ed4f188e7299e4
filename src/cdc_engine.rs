//! GTID 기반 증분 CDC 엔진
//!
//! GTID 이벤트가 트랜잭션을 열고, 선언된 트랜잭션 길이만큼 이벤트를 소비하면
//! 트랜잭션이 닫힙니다. XID/QUERY(COMMIT) 이벤트는 트랜잭션 경계로 쓰지 않습니다.
//!
//! 상태는 두 가지뿐입니다:
//! 1. Idle: 열린 트랜잭션 없음. GTID 이외의 이벤트는 버립니다.
//! 2. Open: 트랜잭션 진행 중. 남은 길이가 0이 되면 Idle로 돌아갑니다.

use crate::binlog_stream::BinlogStreamSource;
use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::events::{BinlogEvent, EventData, EventType, GtidEventData, RowsEventData};
use crate::gtid::{Gtid, GtidSet};
use crate::handler::{Handler, HandlerEvent, RowChange, TxnContext};
use crate::normalize::normalize_row;
use crate::source::EventSource;
use crate::table_meta::{TableCache, TableMeta};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// 진행 중인 트랜잭션
#[derive(Debug)]
struct OpenTransaction {
    ctx: Arc<TxnContext>,
    /// 아직 소비하지 않은 트랜잭션 바이트 수
    remaining: u64,
}

/// 증분 CDC 엔진
///
/// 소스, 실행 중인 GTID 집합, 테이블 캐시, 열린 트랜잭션을 혼자 소유합니다.
pub struct CdcEngine<S> {
    source: S,
    gtid_set: GtidSet,
    tables: TableCache,
    txn: Option<OpenTransaction>,
}

impl<S: EventSource> CdcEngine<S> {
    /// `start`는 이미 적용된 트랜잭션 집합입니다.
    pub fn new(source: S, start: GtidSet) -> Self {
        CdcEngine {
            source,
            gtid_set: start,
            tables: TableCache::new(),
            txn: None,
        }
    }

    /// 마지막으로 끝난 트랜잭션까지 반영한 GTID 집합
    pub fn gtid_set(&self) -> &GtidSet {
        &self.gtid_set
    }

    pub fn is_idle(&self) -> bool {
        self.txn.is_none()
    }

    pub fn tables(&self) -> &TableCache {
        &self.tables
    }

    /// 취소되거나 소스가 끝날 때까지 이벤트를 처리합니다.
    ///
    /// 취소/소스 종료는 에러가 아닙니다. 이때 열려 있던 트랜잭션은 그냥 버려지므로
    /// 재시작은 항상 마지막 `TransactionEnd`의 after GTID 집합에서 해야 합니다.
    pub async fn run<H>(&mut self, cancel: &CancellationToken, handler: &mut H) -> Result<()>
    where
        H: Handler + ?Sized,
    {
        info!("Starting incremental dump from GTID set '{}'", self.gtid_set);

        loop {
            if cancel.is_cancelled() {
                info!("Incremental dump cancelled");
                return Ok(());
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Incremental dump cancelled");
                    return Ok(());
                }
                next = self.source.next_event() => next,
            };

            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => {
                    info!(
                        "Event source exhausted, GTID set: '{}'",
                        self.gtid_set
                    );
                    return Ok(());
                }
                Err(source) => {
                    return Err(CdcError::Transport {
                        stage: "get event",
                        source,
                    })
                }
            };

            self.process_event(cancel, handler, event).await?;
        }
    }

    async fn process_event<H>(
        &mut self,
        cancel: &CancellationToken,
        handler: &mut H,
        event: BinlogEvent,
    ) -> Result<()>
    where
        H: Handler + ?Sized,
    {
        let event_type = event.event_type();
        let event_length = event.event_length();

        // 모든 트랜잭션은 GTID 이벤트로 시작
        let data = match event.data {
            EventData::Gtid(gtid_event) => {
                return self
                    .begin_transaction(cancel, handler, gtid_event, event_length)
                    .await;
            }
            data => data,
        };

        let Some(ctx) = self.txn.as_ref().map(|txn| Arc::clone(&txn.ctx)) else {
            trace!("Skipping {:?} event outside of a transaction", event_type);
            return Ok(());
        };

        match data {
            EventData::TableMap(table) => {
                self.tables.register(table)?;
            }
            EventData::Rows(rows) => {
                self.dispatch_rows(cancel, handler, &ctx, event_type, rows)
                    .await?;
            }
            _ if event_type.is_rows_event() => {
                return Err(CdcError::ProtocolViolation(format!(
                    "{:?} event carries no rows",
                    event_type
                )));
            }
            _ => {}
        }

        self.consume(cancel, handler, event_length).await
    }

    async fn begin_transaction<H>(
        &mut self,
        cancel: &CancellationToken,
        handler: &mut H,
        event: GtidEventData,
        event_length: u64,
    ) -> Result<()>
    where
        H: Handler + ?Sized,
    {
        let gtid = Gtid::new(event.sid, event.gno);

        if let Some(open) = &self.txn {
            return Err(CdcError::ProtocolViolation(format!(
                "previous transaction {} not finished and new transaction {} starts",
                open.ctx.gtid(),
                gtid
            )));
        }
        if event.gno == 0 {
            return Err(CdcError::ProtocolViolation(format!(
                "GTID event of {} has transaction number 0",
                event.sid
            )));
        }
        // MySQL 8.0.2 부터 기록됨
        if event.transaction_length == 0 {
            return Err(CdcError::ProtocolViolation(format!(
                "GTID event {} has no transaction length, make sure the source runs MySQL >= 8.0.2",
                gtid
            )));
        }

        let remaining = event
            .transaction_length
            .checked_sub(event_length)
            .ok_or_else(|| {
                CdcError::ProtocolViolation(format!(
                    "transaction {} declares {} bytes but its GTID event alone is {} bytes",
                    gtid, event.transaction_length, event_length
                ))
            })?;

        let ctx = Arc::new(TxnContext::new(
            self.gtid_set.clone(),
            gtid,
            event.transaction_length,
            event.immediate_commit_timestamp,
        )?);
        self.txn = Some(OpenTransaction {
            ctx: Arc::clone(&ctx),
            remaining,
        });

        debug!(
            "Transaction {} begins (length={})",
            gtid, event.transaction_length
        );
        emit(cancel, handler, HandlerEvent::TransactionBegin(ctx)).await
    }

    async fn dispatch_rows<H>(
        &mut self,
        cancel: &CancellationToken,
        handler: &mut H,
        ctx: &Arc<TxnContext>,
        event_type: EventType,
        rows: RowsEventData,
    ) -> Result<()>
    where
        H: Handler + ?Sized,
    {
        // v2 rows 이벤트만 컬럼 메타데이터와 함께 기록됨
        if !event_type.is_v2_rows_event() {
            return Err(CdcError::ProtocolViolation(format!(
                "expect v2 rows event but got {:?} event",
                event_type
            )));
        }

        let table = self.tables.get(rows.table_id).ok_or_else(|| {
            CdcError::ProtocolViolation(format!(
                "rows event references unknown table_id {}",
                rows.table_id
            ))
        })?;

        let row_change = |before: Option<_>, after: Option<_>| {
            RowChange::new(Arc::clone(ctx), Arc::clone(&table), before, after)
        };

        match event_type {
            EventType::WriteRowsEventV2 => {
                for row in rows.rows {
                    let after = normalize_row(&table, row)?;
                    let event = HandlerEvent::RowInsertion(row_change(None, Some(after)));
                    emit(cancel, handler, event).await?;
                }
            }
            EventType::UpdateRowsEventV2 => {
                // before, after 이미지가 번갈아 기록됨
                if rows.rows.len() % 2 != 0 {
                    return Err(CdcError::ProtocolViolation(format!(
                        "update rows event on {} has {} images, expected before/after pairs",
                        qualified_name(&table),
                        rows.rows.len()
                    )));
                }
                let mut images = rows.rows.into_iter();
                while let (Some(before), Some(after)) = (images.next(), images.next()) {
                    let before = normalize_row(&table, before)?;
                    let after = normalize_row(&table, after)?;
                    let event = HandlerEvent::RowUpdating(row_change(Some(before), Some(after)));
                    emit(cancel, handler, event).await?;
                }
            }
            _ => {
                for row in rows.rows {
                    let before = normalize_row(&table, row)?;
                    let event = HandlerEvent::RowDeletion(row_change(Some(before), None));
                    emit(cancel, handler, event).await?;
                }
            }
        }

        Ok(())
    }

    /// 처리한 이벤트 길이만큼 남은 길이를 줄이고, 0이 되면 트랜잭션을 닫습니다.
    async fn consume<H>(
        &mut self,
        cancel: &CancellationToken,
        handler: &mut H,
        event_length: u64,
    ) -> Result<()>
    where
        H: Handler + ?Sized,
    {
        let Some(txn) = self.txn.as_mut() else {
            return Ok(());
        };

        let remaining = txn.remaining.checked_sub(event_length).ok_or_else(|| {
            CdcError::ProtocolViolation(format!(
                "transaction {} has {} bytes left but the next event is {} bytes",
                txn.ctx.gtid(),
                txn.remaining,
                event_length
            ))
        })?;
        txn.remaining = remaining;
        if remaining > 0 {
            return Ok(());
        }

        let ctx = Arc::clone(&txn.ctx);
        emit(cancel, handler, HandlerEvent::TransactionEnd(Arc::clone(&ctx))).await?;

        self.gtid_set = ctx.after_gtid_set().clone();
        self.txn = None;
        // table_id는 트랜잭션마다 다시 매핑됨
        self.tables.clear();
        debug!(
            "Transaction {} committed, GTID set: '{}'",
            ctx.gtid(),
            self.gtid_set
        );
        Ok(())
    }
}

async fn emit<H>(cancel: &CancellationToken, handler: &mut H, event: HandlerEvent) -> Result<()>
where
    H: Handler + ?Sized,
{
    handler.handle(cancel, event).await.map_err(CdcError::Handler)
}

fn qualified_name(table: &TableMeta) -> String {
    format!("{}.{}", table.schema_name(), table.table_name())
}

/// GTID 집합 문자열에서 시작해 증분 이벤트를 처리합니다.
///
/// GTID 집합 문자열이 잘못되면 `CdcError::GtidError`를 반환합니다.
pub async fn incr_dump<S, H>(
    gtid_set: &str,
    source: S,
    cancel: &CancellationToken,
    handler: &mut H,
) -> Result<()>
where
    S: EventSource,
    H: Handler + ?Sized,
{
    let start = GtidSet::parse(gtid_set)?;
    let mut engine = CdcEngine::new(source, start);
    engine.run(cancel, handler).await
}

/// `config`의 서버에 복제 클라이언트로 붙어 `gtid_set`에 없는 트랜잭션부터 처리합니다.
///
/// 연결 전에 취소되면 연결하지 않고 `Ok(())`를 반환합니다.
pub async fn incr_dump_from_server<H>(
    config: ConnectionConfig,
    gtid_set: &str,
    cancel: &CancellationToken,
    handler: &mut H,
) -> Result<()>
where
    H: Handler + ?Sized,
{
    let start = GtidSet::parse(gtid_set)?;
    config.validate()?;

    let source = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            info!("Incremental dump cancelled before connecting");
            return Ok(());
        }
        source = BinlogStreamSource::connect(config, &start) => source?,
    };

    let mut engine = CdcEngine::new(source, start);
    engine.run(cancel, handler).await
}
