//! Control-port connection with reply/event demultiplexing.
//!
//! A background reader task parses incoming lines. Synchronous replies are
//! handed to waiting commands in FIFO order; `650` events fan out over a
//! broadcast channel. When the socket closes, every pending and future
//! command fails with [`ControlError::Disconnected`], and so does every
//! [`EventStream`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{ControlError, ControlResult};
use crate::reply::{Reply, ReplyParser};

const EVENT_CAPACITY: usize = 1024;

type PendingQueue = Arc<Mutex<VecDeque<oneshot::Sender<Reply>>>>;

fn lock_queue(queue: &PendingQueue) -> MutexGuard<'_, VecDeque<oneshot::Sender<Reply>>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A live control-port connection.
pub struct ControlConnection {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: PendingQueue,
    events: broadcast::Sender<Reply>,
    closed: watch::Receiver<bool>,
    reader: JoinHandle<()>,
}

impl ControlConnection {
    /// Connect to a control port over TCP.
    pub async fn connect(addr: SocketAddr) -> ControlResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream and start the reader task.
    pub fn from_stream(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let pending: PendingQueue = Arc::new(Mutex::new(VecDeque::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (closed_tx, closed) = watch::channel(false);

        let reader = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&pending),
            events.clone(),
            closed_tx,
        ));

        Self {
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            events,
            closed,
            reader,
        }
    }

    /// Whether the reader has seen the socket close.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Send one command line and wait for its reply.
    ///
    /// Non-2xx replies become [`ControlError::Rejected`].
    pub async fn command(&self, line: &str) -> ControlResult<Reply> {
        let verb = line.split_whitespace().next().unwrap_or("").to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut writer = self.writer.lock().await;
            {
                let mut pending = lock_queue(&self.pending);
                if self.is_closed() {
                    return Err(ControlError::Disconnected);
                }
                pending.push_back(tx);
            }
            let mut buf = String::with_capacity(line.len() + 2);
            buf.push_str(line);
            buf.push_str("\r\n");
            if let Err(e) = writer.write_all(buf.as_bytes()).await {
                debug!(command = %verb, error = %e, "control write failed");
                return Err(ControlError::Disconnected);
            }
        }
        trace!(command = %verb, "control command sent");

        let reply = rx.await.map_err(|_| ControlError::Disconnected)?;
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(ControlError::Rejected {
                command: verb,
                code: reply.code,
                message: reply.message(),
            })
        }
    }

    /// `GETINFO <key>`, returning the value for that key.
    pub async fn get_info(&self, key: &str) -> ControlResult<String> {
        let reply = self.command(&format!("GETINFO {key}")).await?;
        reply
            .info(key)
            .ok_or_else(|| ControlError::Protocol(format!("GETINFO reply lacks {key}")))
    }

    /// `SETEVENTS`, replacing the subscribed event set.
    pub async fn set_events(&self, events: &[&str]) -> ControlResult<()> {
        let mut line = String::from("SETEVENTS");
        for event in events {
            line.push(' ');
            line.push_str(event);
        }
        self.command(&line).await.map(|_| ())
    }

    /// `SETCONF key=value`.
    pub async fn set_conf(&self, key: &str, value: &str) -> ControlResult<()> {
        self.command(&format!("SETCONF {key}={value}"))
            .await
            .map(|_| ())
    }

    /// Subscribe to asynchronous events from this point on.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.events.subscribe(),
            closed: self.closed.clone(),
        }
    }
}

impl Drop for ControlConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Receiver side of the event fan-out.
pub struct EventStream {
    rx: broadcast::Receiver<Reply>,
    closed: watch::Receiver<bool>,
}

impl EventStream {
    /// Next event. Buffered events are delivered before the disconnect.
    pub async fn recv(&mut self) -> ControlResult<Reply> {
        loop {
            tokio::select! {
                biased;
                event = self.rx.recv() => match event {
                    Ok(reply) => return Ok(reply),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ControlError::Disconnected);
                    }
                },
                _ = self.closed.wait_for(|closed| *closed) => {
                    return Err(ControlError::Disconnected);
                }
            }
        }
    }
}

async fn read_loop(
    read_half: OwnedReadHalf,
    pending: PendingQueue,
    events: broadcast::Sender<Reply>,
    closed: watch::Sender<bool>,
) {
    let mut reader = BufReader::new(read_half);
    let mut parser = ReplyParser::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                debug!("control connection reached EOF");
                break;
            }
            // Log events may carry arbitrary bytes
            Ok(_) => match parser.push_line(&String::from_utf8_lossy(&buf)) {
                Ok(Some(reply)) => dispatch(reply, &pending, &events),
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "dropping malformed control reply");
                    parser.reset();
                }
            },
            Err(e) => {
                debug!(error = %e, "control connection read failed");
                break;
            }
        }
    }

    let mut queue = lock_queue(&pending);
    closed.send_replace(true);
    queue.clear();
}

fn dispatch(reply: Reply, pending: &PendingQueue, events: &broadcast::Sender<Reply>) {
    if reply.is_event() {
        // No subscribers is fine
        let _ = events.send(reply);
        return;
    }
    match lock_queue(pending).pop_front() {
        Some(tx) => {
            let _ = tx.send(reply);
        }
        None => warn!(code = reply.code, "unsolicited control reply"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Accept one client and answer with scripted lines per received command.
    async fn scripted_server(script: Vec<(&'static str, &'static str)>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            for (expect, answer) in script {
                let got = lines.next_line().await.unwrap().unwrap();
                assert_eq!(got, expect);
                write.write_all(answer.as_bytes()).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_get_info_roundtrip() {
        let addr = scripted_server(vec![(
            "GETINFO version",
            "250-version=0.4.8.10\r\n250 OK\r\n",
        )])
        .await;
        let conn = ControlConnection::connect(addr).await.unwrap();
        assert_eq!(conn.get_info("version").await.unwrap(), "0.4.8.10");
    }

    #[tokio::test]
    async fn test_rejected_command() {
        let addr = scripted_server(vec![(
            "GETINFO ns/id/NOPE",
            "552 Unrecognized key \"ns/id/NOPE\"\r\n",
        )])
        .await;
        let conn = ControlConnection::connect(addr).await.unwrap();
        let err = conn.get_info("ns/id/NOPE").await.unwrap_err();
        assert!(matches!(err, ControlError::Rejected { code: 552, .. }));
    }

    #[tokio::test]
    async fn test_events_do_not_consume_replies() {
        let addr = scripted_server(vec![(
            "SETEVENTS CIRC",
            "650 CIRC 5 LAUNCHED\r\n250 OK\r\n",
        )])
        .await;
        let conn = ControlConnection::connect(addr).await.unwrap();
        let mut events = conn.subscribe();
        conn.set_events(&["CIRC"]).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.first_text(), "CIRC 5 LAUNCHED");
    }

    #[tokio::test]
    async fn test_invalid_utf8_in_event_keeps_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(_)) = lines.next_line().await {
                write
                    .write_all(b"650 INFO exit \xff\xfe name\r\n250-version=0.4.8.10\r\n250 OK\r\n")
                    .await
                    .unwrap();
            }
        });

        let conn = ControlConnection::connect(addr).await.unwrap();
        let mut events = conn.subscribe();
        assert_eq!(conn.get_info("version").await.unwrap(), "0.4.8.10");
        let event = events.recv().await.unwrap();
        assert!(event.first_text().starts_with("INFO exit"));
        assert!(!conn.is_closed());
        assert_eq!(conn.get_info("version").await.unwrap(), "0.4.8.10");
    }

    #[tokio::test]
    async fn test_eof_surfaces_disconnected() {
        // Server answers nothing and hangs up after the first command
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            let _ = lines.next_line().await;
        });

        let conn = ControlConnection::connect(addr).await.unwrap();
        let mut events = conn.subscribe();
        let err = conn.get_info("version").await.unwrap_err();
        assert!(err.is_disconnect());
        assert!(events.recv().await.unwrap_err().is_disconnect());
        assert!(conn.is_closed());
        assert!(conn.get_info("version").await.unwrap_err().is_disconnect());
    }
}
