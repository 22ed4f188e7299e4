//! 엔진이 이벤트를 읽어오는 이벤트 소스
//!
//! 엔진은 디코딩된 [`BinlogEvent`]만 다룹니다. 복제 연결에서 읽든, 기록해 둔 파일을
//! 재생하든, 채널로 주입하든 이 트레이트만 구현하면 됩니다.

use crate::error::BoxError;
use crate::events::BinlogEvent;
use async_trait::async_trait;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

/// 이벤트 소스가 반환하는 에러. 엔진은 이를 `CdcError::Transport`로 감쌉니다.
pub type SourceError = BoxError;

#[async_trait]
pub trait EventSource: Send {
    /// 다음 이벤트. `Ok(None)`이면 소스가 끝난 것입니다.
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>, SourceError>;
}

#[async_trait]
impl EventSource for mpsc::Receiver<BinlogEvent> {
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>, SourceError> {
        Ok(self.recv().await)
    }
}

#[async_trait]
impl EventSource for mpsc::UnboundedReceiver<BinlogEvent> {
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>, SourceError> {
        Ok(self.recv().await)
    }
}

/// 한 줄에 이벤트 하나씩 JSON으로 기록된 스트림
pub struct JsonLinesSource<R> {
    reader: R,
    line: String,
    line_no: u64,
}

impl JsonLinesSource<BufReader<File>> {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).await?;
        debug!("Replaying binlog events from {}", path.display());
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R> JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        JsonLinesSource {
            reader,
            line: String::new(),
            line_no: 0,
        }
    }

    /// 지금까지 읽은 줄 수
    pub fn line_no(&self) -> u64 {
        self.line_no
    }
}

#[async_trait]
impl<R> EventSource for JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_event(&mut self) -> Result<Option<BinlogEvent>, SourceError> {
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line).await?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }

            return serde_json::from_str(trimmed)
                .map(Some)
                .map_err(|e| format!("line {}: {}", self.line_no, e).into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventData, EventHeader, EventType};

    #[tokio::test]
    async fn test_json_lines_skip_blank_lines() {
        let input = concat!(
            r#"{"header": {"event_type": "XidEvent", "event_length": 31}, "data": {"Xid": 9}}"#,
            "\n\n   \n",
            r#"{"header": {"event_type": "RotateEvent", "event_length": 44}, "data": "Unknown"}"#,
            "\n",
        );
        let mut source = JsonLinesSource::new(input.as_bytes());

        let first = source.next_event().await.unwrap().unwrap();
        assert_eq!(first.event_type(), EventType::XidEvent);
        assert!(matches!(first.data, EventData::Xid(9)));

        let second = source.next_event().await.unwrap().unwrap();
        assert_eq!(second.event_length(), 44);

        assert!(source.next_event().await.unwrap().is_none());
        assert_eq!(source.line_no(), 4);
    }

    #[tokio::test]
    async fn test_json_lines_reports_bad_line() {
        let input = "\n{not json}\n";
        let mut source = JsonLinesSource::new(input.as_bytes());
        let err = source.next_event().await.unwrap_err();
        assert!(err.to_string().starts_with("line 2:"));
    }

    #[tokio::test]
    async fn test_channel_source_ends_when_sender_dropped() {
        let (tx, mut rx) = mpsc::channel(2);
        tx.send(BinlogEvent::new(
            EventHeader::new(EventType::XidEvent, 31),
            EventData::Xid(1),
        ))
        .await
        .unwrap();
        drop(tx);

        assert!(rx.next_event().await.unwrap().is_some());
        assert!(rx.next_event().await.unwrap().is_none());
    }
}
