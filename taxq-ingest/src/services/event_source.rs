//! Event transports
//!
//! The consumer only depends on the consume/acknowledge contract of
//! [`EventSource`]. Connecting to a real message broker is the job of an
//! implementation of that trait; two are shipped here.

use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;
use tracing::debug;

/// One message as delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Transport position, used for acknowledgement and logging
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// Consume/acknowledge contract of an at-least-once transport
///
/// Unacknowledged messages may be delivered again.
#[async_trait]
pub trait EventSource: Send {
    /// Wait up to `timeout` for the next message; `Ok(None)` when none arrived
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError>;

    /// Mark `message` as fully processed
    async fn ack(&mut self, message: &InboundMessage) -> Result<(), TransportError>;
}

/// In-process source fed through a tokio channel
///
/// Keeps the list of acknowledged offsets so callers can see which messages
/// were settled. Messages are never delivered twice; an unacknowledged
/// offset is simply missing from [`ChannelSource::acked_offsets`].
pub struct ChannelSource {
    rx: mpsc::Receiver<Vec<u8>>,
    next_offset: u64,
    acked: Arc<Mutex<Vec<u64>>>,
}

impl ChannelSource {
    /// Create a source and the sender that feeds it
    pub fn channel(capacity: usize) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        let source = Self {
            rx,
            next_offset: 0,
            acked: Arc::new(Mutex::new(Vec::new())),
        };
        (tx, source)
    }

    /// Offsets acknowledged so far, in acknowledgement order
    pub fn acked_offsets(&self) -> Vec<u64> {
        match self.acked.lock() {
            Ok(acked) => acked.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_elapsed) => Ok(None),
            Ok(None) => Err(TransportError::Closed),
            Ok(Some(payload)) => {
                let offset = self.next_offset;
                self.next_offset += 1;
                Ok(Some(InboundMessage { offset, payload }))
            }
        }
    }

    async fn ack(&mut self, message: &InboundMessage) -> Result<(), TransportError> {
        let mut acked = self
            .acked
            .lock()
            .map_err(|_| TransportError::Fatal("acknowledgement log poisoned".to_string()))?;
        acked.push(message.offset);
        Ok(())
    }
}

/// Deliveries of one line before [`JsonLinesSource`] gives up on it
pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// Pause before a line is delivered again, capped by the poll timeout
const REDELIVERY_PAUSE: Duration = Duration::from_millis(200);

/// Newline-delimited JSON read from a file or stdin
///
/// The offset is the 1-based line number. End of input closes the stream.
/// Blank lines are skipped. A line that was polled but not acknowledged is
/// delivered again on the next poll; once it has been delivered
/// `max_deliveries` times the source fails with [`TransportError::Fatal`]
/// instead of moving past it.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    line: u64,
    last_acked: Option<u64>,
    unsettled: Option<Unsettled>,
    max_deliveries: u32,
}

/// Last delivered line, kept until acknowledged
struct Unsettled {
    message: InboundMessage,
    deliveries: u32,
}

impl<R> JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
            last_acked: None,
            unsettled: None,
            max_deliveries: DEFAULT_MAX_DELIVERIES,
        }
    }

    /// Override [`DEFAULT_MAX_DELIVERIES`]; values below 1 are treated as 1
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    /// Line number of the most recent acknowledged message
    pub fn last_acked(&self) -> Option<u64> {
        self.last_acked
    }
}

#[async_trait]
impl<R> EventSource for JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError> {
        if let Some(unsettled) = self.unsettled.as_mut() {
            let offset = unsettled.message.offset;
            if unsettled.deliveries >= self.max_deliveries {
                return Err(TransportError::Fatal(format!(
                    "line {} still unacknowledged after {} deliveries",
                    offset, unsettled.deliveries
                )));
            }

            tokio::time::sleep(REDELIVERY_PAUSE.min(timeout)).await;
            unsettled.deliveries += 1;
            debug!(offset, delivery = unsettled.deliveries, "Redelivering unacknowledged line");
            return Ok(Some(unsettled.message.clone()));
        }

        // next_line is cancel safe, so a timeout never loses a partial line
        match tokio::time::timeout(timeout, self.lines.next_line()).await {
            Err(_elapsed) => Ok(None),
            Ok(Err(err)) => Err(TransportError::Fatal(format!("read failed: {}", err))),
            Ok(Ok(None)) => Err(TransportError::Closed),
            Ok(Ok(Some(text))) => {
                self.line += 1;
                if text.trim().is_empty() {
                    return Ok(None);
                }
                let message = InboundMessage {
                    offset: self.line,
                    payload: text.into_bytes(),
                };
                self.unsettled = Some(Unsettled {
                    message: message.clone(),
                    deliveries: 1,
                });
                Ok(Some(message))
            }
        }
    }

    async fn ack(&mut self, message: &InboundMessage) -> Result<(), TransportError> {
        if self
            .unsettled
            .as_ref()
            .is_some_and(|unsettled| unsettled.message.offset == message.offset)
        {
            self.unsettled = None;
        }
        self.last_acked = Some(message.offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_source_offsets_and_close() {
        let (tx, mut source) = ChannelSource::channel(4);
        tx.send(b"one".to_vec()).await.unwrap();
        tx.send(b"two".to_vec()).await.unwrap();
        drop(tx);

        let first = source.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        let second = source.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!((first.offset, second.offset), (0, 1));

        source.ack(&second).await.unwrap();
        assert_eq!(source.acked_offsets(), vec![1]);

        assert!(matches!(
            source.poll(Duration::from_millis(50)).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_channel_source_times_out_empty() {
        let (_tx, mut source) = ChannelSource::channel(1);
        let polled = source.poll(Duration::from_millis(10)).await.unwrap();
        assert!(polled.is_none());
    }

    #[tokio::test]
    async fn test_json_lines_source_skips_blank_lines() {
        let input: &[u8] = b"{\"a\":1}\n\n{\"b\":2}\n";
        let mut source = JsonLinesSource::new(input);
        let timeout = Duration::from_millis(50);

        let first = source.poll(timeout).await.unwrap().unwrap();
        assert_eq!(first.offset, 1);
        assert_eq!(first.payload, b"{\"a\":1}".to_vec());
        source.ack(&first).await.unwrap();

        assert!(source.poll(timeout).await.unwrap().is_none());

        let third = source.poll(timeout).await.unwrap().unwrap();
        assert_eq!(third.offset, 3);
        source.ack(&third).await.unwrap();
        assert_eq!(source.last_acked(), Some(3));

        assert!(matches!(source.poll(timeout).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_json_lines_source_redelivers_until_acked() {
        let input: &[u8] = b"{\"a\":1}\n{\"b\":2}\n";
        let mut source = JsonLinesSource::new(input);
        let timeout = Duration::from_millis(20);

        let first = source.poll(timeout).await.unwrap().unwrap();
        let again = source.poll(timeout).await.unwrap().unwrap();
        assert_eq!(again, first);

        source.ack(&again).await.unwrap();
        assert_eq!(source.last_acked(), Some(1));

        let second = source.poll(timeout).await.unwrap().unwrap();
        assert_eq!(second.offset, 2);
        source.ack(&second).await.unwrap();
        assert!(matches!(source.poll(timeout).await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_json_lines_source_gives_up_on_unacked_line() {
        let input: &[u8] = b"{\"a\":1}\n{\"b\":2}\n";
        let mut source = JsonLinesSource::new(input).with_max_deliveries(2);
        let timeout = Duration::from_millis(20);

        assert_eq!(source.poll(timeout).await.unwrap().unwrap().offset, 1);
        assert_eq!(source.poll(timeout).await.unwrap().unwrap().offset, 1);

        match source.poll(timeout).await {
            Err(TransportError::Fatal(reason)) => assert!(reason.contains("line 1"), "{}", reason),
            other => panic!("unexpected poll result: {:?}", other),
        }
        assert_eq!(source.last_acked(), None);
    }
}
