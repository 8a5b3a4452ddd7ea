//! The diagnostic log channel behind `GET /ws/logs`.
//!
//! A bounded broadcast channel carries one log line per message. The tracing
//! subscriber writes into it through the `MakeWriter` implementation, so
//! everything the server logs is also visible to connected editors. Slow
//! consumers lag and lose frames; the producer never blocks.

use std::io;

use tokio::sync::broadcast;
use tracing_subscriber::fmt::MakeWriter;

/// Lines a slow client may fall behind before frames are dropped.
pub const BACKLOG: usize = 1024;

/// Handle to the process-wide log stream.
#[derive(Clone)]
pub struct LogChannel {
    tx: broadcast::Sender<String>,
}

impl Default for LogChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl LogChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BACKLOG);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Push one line to every subscriber. No subscribers is not an error.
    pub fn send_line(&self, line: String) {
        let _ = self.tx.send(line);
    }
}

/// Buffering writer handed to the tracing fmt layer; completed lines go out
/// as individual frames.
pub struct LineWriter {
    tx: broadcast::Sender<String>,
    buf: Vec<u8>,
}

impl io::Write for LineWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if !line.is_empty() {
                let _ = self.tx.send(line);
            }
        }
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            let _ = self.tx.send(line);
        }
    }
}

impl<'a> MakeWriter<'a> for LogChannel {
    type Writer = LineWriter;

    fn make_writer(&'a self) -> LineWriter {
        LineWriter {
            tx: self.tx.clone(),
            buf: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn writer_splits_lines_into_frames() {
        let channel = LogChannel::new();
        let mut rx = channel.subscribe();
        let mut writer = channel.make_writer();
        writer.write_all(b"first line\nsecond").unwrap();
        writer.write_all(b" half\n").unwrap();
        assert_eq!(rx.try_recv().unwrap(), "first line");
        assert_eq!(rx.try_recv().unwrap(), "second half");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn partial_line_flushes_on_drop() {
        let channel = LogChannel::new();
        let mut rx = channel.subscribe();
        {
            let mut writer = channel.make_writer();
            writer.write_all(b"no newline").unwrap();
        }
        assert_eq!(rx.try_recv().unwrap(), "no newline");
    }

    #[test]
    fn sending_without_subscribers_is_fine() {
        let channel = LogChannel::new();
        channel.send_line("nobody listening".into());
    }
}
