//! Forwarding of a backend's stderr into the operational log.

use async_trait::async_trait;
use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, info};

/// Destination for backend diagnostic lines.
///
/// Implementations may be shared by many sessions at once and must emit each
/// line as a single unit.
#[async_trait]
pub trait DiagnosticSink: Send + Sync {
    async fn line(&self, line: &str);
}

/// Emits every diagnostic line as a `tracing` event.
#[derive(Debug, Clone)]
pub struct TracingSink {
    session: u64,
}

impl TracingSink {
    pub fn new(session: u64) -> Self {
        Self { session }
    }
}

#[async_trait]
impl DiagnosticSink for TracingSink {
    async fn line(&self, line: &str) {
        info!(target: "backend", session = self.session, "{line}");
    }
}

/// Writes diagnostic lines to a shared writer, one locked write per line.
pub struct WriterSink(Arc<Mutex<Box<dyn AsyncWrite + Unpin + Sync + Send>>>);

impl Clone for WriterSink {
    fn clone(&self) -> Self {
        WriterSink(self.0.clone())
    }
}

impl WriterSink {
    pub fn new(t: Box<dyn AsyncWrite + Unpin + Sync + Send>) -> WriterSink {
        WriterSink(Arc::new(Mutex::new(t)))
    }

    pub fn stderr() -> WriterSink {
        Self::new(Box::new(tokio::io::stderr()))
    }
}

#[async_trait]
impl DiagnosticSink for WriterSink {
    async fn line(&self, line: &str) {
        let mut record = String::with_capacity(line.len() + 1);
        record.push_str(line);
        record.push('\n');

        let mut lock = self.0.lock().await;
        if lock.write_all(record.as_bytes()).await.is_ok() {
            let _ = lock.flush().await;
        }
    }
}

/// Splits a diagnostic stream into lines.
///
/// A line longer than `max_length` is emitted in pieces of at most
/// `max_length` bytes, cut between characters, so a backend that never
/// prints a newline cannot grow the buffer without bound.
/// Invalid UTF-8 is replaced rather than rejected.
#[derive(Debug, Clone)]
pub struct DiagnosticCodec {
    max_length: usize,
}

impl DiagnosticCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length: max_length.max(1),
        }
    }

    fn render(bytes: &[u8]) -> String {
        let text = String::from_utf8_lossy(bytes);
        let text: &str = &text;
        text.strip_suffix('\r').unwrap_or(text).to_owned()
    }
}

/// The largest cut at or below `limit` that does not split a UTF-8 sequence.
/// Falls back to `limit` when the bytes there are not UTF-8 at all.
fn char_boundary(bytes: &[u8], limit: usize) -> usize {
    let is_continuation = |b: u8| b & 0b1100_0000 == 0b1000_0000;
    (limit.saturating_sub(3)..=limit)
        .rev()
        .find(|&cut| cut > 0 && !is_continuation(bytes[cut]))
        .unwrap_or(limit)
}

impl Decoder for DiagnosticCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(pos) = src.iter().position(|b| *b == b'\n') {
            let line = src.split_to(pos + 1);
            return Ok(Some(Self::render(&line[..pos])));
        }

        if src.len() > self.max_length {
            let cut = char_boundary(src, self.max_length);
            let chunk = src.split_to(cut);
            return Ok(Some(Self::render(&chunk)));
        }

        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        if src.is_empty() {
            Ok(None)
        } else {
            let rest = src.split();
            Ok(Some(Self::render(&rest)))
        }
    }
}

/// Forward `stream` line by line to `sink` until end-of-stream.
///
/// A read error ends the drain quietly. Returns the number of lines forwarded.
pub async fn drain<R>(stream: R, sink: &dyn DiagnosticSink, max_line: usize) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::with_capacity(stream, DiagnosticCodec::new(max_line), 1024);
    let mut forwarded = 0;

    while let Some(frame) = lines.next().await {
        match frame {
            Ok(line) => {
                sink.line(&line).await;
                forwarded += 1;
            }
            Err(e) => {
                debug!(error = %e, "Diagnostic stream closed with error");
                break;
            }
        }
    }

    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct CollectingSink(StdMutex<Vec<String>>);

    #[async_trait]
    impl DiagnosticSink for CollectingSink {
        async fn line(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    #[tokio::test]
    async fn test_drain_splits_lines_and_flushes_tail() {
        let sink = CollectingSink::default();
        let input = &b"starting server\r\nlistening on stdio\npartial tail"[..];

        let forwarded = drain(input, &sink, 1024).await;

        assert_eq!(forwarded, 3);
        assert_eq!(
            *sink.0.lock().unwrap(),
            vec!["starting server", "listening on stdio", "partial tail"]
        );
    }

    #[tokio::test]
    async fn test_drain_bounds_long_lines() {
        let sink = CollectingSink::default();
        let input = vec![b'x'; 10];

        drain(&input[..], &sink, 4).await;

        assert_eq!(*sink.0.lock().unwrap(), vec!["xxxx", "xxxx", "xx"]);
    }

    #[tokio::test]
    async fn test_drain_keeps_multibyte_chars_whole() {
        let sink = CollectingSink::default();
        let input = "abéd".as_bytes();

        drain(input, &sink, 3).await;

        assert_eq!(*sink.0.lock().unwrap(), vec!["ab", "éd"]);
    }

    #[tokio::test]
    async fn test_drain_replaces_invalid_utf8() {
        let sink = CollectingSink::default();
        let input = &b"bad \xff byte\n"[..];

        drain(input, &sink, 64).await;

        assert_eq!(*sink.0.lock().unwrap(), vec!["bad \u{fffd} byte"]);
    }

    #[tokio::test]
    async fn test_stderr_sink_forwards_lines() {
        let sink = WriterSink::stderr();
        let input = &b"backend warming up\n"[..];

        assert_eq!(drain(input, &sink, 64).await, 1);
    }

    #[tokio::test]
    async fn test_writer_sink_writes_whole_lines() {
        let (writer, mut reader) = tokio::io::duplex(1024);
        let sink = WriterSink::new(Box::new(writer));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let sink = sink.clone();
                tokio::spawn(async move { sink.line(&format!("session {i} says hello")).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        drop(sink);

        let mut output = String::new();
        reader.read_to_string(&mut output).await.unwrap();
        let mut lines: Vec<_> = output.lines().collect();
        lines.sort();
        assert_eq!(
            lines,
            vec![
                "session 0 says hello",
                "session 1 says hello",
                "session 2 says hello",
                "session 3 says hello",
            ]
        );
    }
}
