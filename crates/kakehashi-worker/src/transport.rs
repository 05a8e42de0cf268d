//! Newline-delimited framing over any async byte stream.

use std::io;

use kakehashi_types::Outbound;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Reads one line at a time, without the line terminator.
pub struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Next line, or `None` at end of stream. Invalid UTF-8 is replaced, not fatal.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        while matches!(self.buf.last(), Some(b'\n' | b'\r')) {
            self.buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

/// Spawn the single task that owns the write half.
///
/// Each message becomes one line, flushed before the next is taken. The task
/// ends when every sender is gone, or when `stop` fires, after writing
/// whatever was already queued.
pub fn spawn_writer<W>(
    writer: W,
    rx: UnboundedReceiver<Outbound>,
    stop: CancellationToken,
) -> JoinHandle<io::Result<u64>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(write_loop(writer, rx, stop))
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: UnboundedReceiver<Outbound>,
    stop: CancellationToken,
) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if write_message(&mut writer, &msg).await? {
                        written += 1;
                    }
                }
                None => break,
            },
            _ = stop.cancelled() => {
                while let Ok(msg) = rx.try_recv() {
                    if write_message(&mut writer, &msg).await? {
                        written += 1;
                    }
                }
                break;
            }
        }
    }
    writer.flush().await?;
    Ok(written)
}

async fn write_message<W>(writer: &mut W, msg: &Outbound) -> io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let line = match msg.to_line() {
        Ok(line) => line,
        Err(err) => {
            warn!(error = %err, "dropping unserializable message");
            return Ok(false);
        }
    };
    trace!(%line, "send");
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kakehashi_types::RequestId;
    use tokio::io::{AsyncReadExt, BufReader};

    #[tokio::test]
    async fn test_reader_strips_terminators() {
        let input: &[u8] = b"one\r\ntwo\n\nthree";
        let mut reader = LineReader::new(BufReader::new(input));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("two"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("three"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_tolerates_bad_utf8() {
        let input: &[u8] = b"\xff\xfe\n{}\n";
        let mut reader = LineReader::new(BufReader::new(input));
        assert!(reader.next_line().await.unwrap().is_some());
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_writer_one_line_per_message() {
        let (client, server) = tokio::io::duplex(4096);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = spawn_writer(server, rx, CancellationToken::new());

        tx.send(Outbound::log("a")).unwrap();
        tx.send(Outbound::Pong {
            request_id: Some(RequestId::Number(1)),
        })
        .unwrap();
        drop(tx);
        assert_eq!(handle.await.unwrap().unwrap(), 2);

        let mut out = String::new();
        BufReader::new(client).read_to_string(&mut out).await.unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""type":"log""#));
        assert!(lines[1].contains(r#""type":"pong""#));
    }

    #[tokio::test]
    async fn test_writer_drains_on_stop() {
        let (client, server) = tokio::io::duplex(4096);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        tx.send(Outbound::log("queued")).unwrap();
        stop.cancel();
        let handle = spawn_writer(server, rx, stop);
        // Sender still alive: only the stop signal ends the task.
        assert_eq!(handle.await.unwrap().unwrap(), 1);
        drop(tx);

        let mut out = String::new();
        BufReader::new(client).read_to_string(&mut out).await.unwrap();
        assert!(out.contains("queued"));
    }
}
