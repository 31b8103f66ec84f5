//! Optional external pub/sub broker.
//!
//! Only two operations are needed: publish a notice to a channel, and
//! subscribe to one for wakeups. Both speak the Redis serialization protocol
//! (RESP) over a plain TCP connection. The broker is a fanout accelerator;
//! every caller treats [`BrokerError`] as a warning and carries on without it.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::BrokerError;

const DEFAULT_PORT: u16 = 6379;
/// Refuse bulk strings larger than this from the server.
const MAX_BULK_BYTES: usize = 1024 * 1024;

/// One RESP value. Arrays only ever hold scalars in pub/sub traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Vec<Frame>),
}

impl Frame {
    fn as_text(&self) -> Option<String> {
        match self {
            Frame::Simple(s) => Some(s.clone()),
            Frame::Bulk(Some(b)) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }
}

/// JSON body published for a trigger. Receivers only need to know that
/// something is ready; the trigger file stays the source of truth.
pub fn trigger_notice(worker: &str, kind: &str, correlation_id: &str, created_at: DateTime<Utc>) -> String {
    serde_json::json!({
        "worker": worker,
        "kind": kind,
        "correlation_id": correlation_id,
        "created_at": created_at,
    })
    .to_string()
}

/// Encodes `args` as a RESP array of bulk strings.
pub fn encode_command(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, BrokerError> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(BrokerError::Protocol("connection closed".to_string()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn read_scalar<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    line: &str,
) -> Result<Frame, BrokerError> {
    let (tag, rest) = line.split_at(line.len().min(1));
    let int = |s: &str| {
        s.parse::<i64>()
            .map_err(|_| BrokerError::Protocol(format!("bad integer '{s}'")))
    };
    match tag {
        "+" => Ok(Frame::Simple(rest.to_string())),
        "-" => Ok(Frame::Error(rest.to_string())),
        ":" => Ok(Frame::Integer(int(rest)?)),
        "$" => {
            let len = int(rest)?;
            if len < 0 {
                return Ok(Frame::Bulk(None));
            }
            let len = len as usize;
            if len > MAX_BULK_BYTES {
                return Err(BrokerError::Protocol(format!("bulk string of {len} bytes")));
            }
            let mut buf = vec![0u8; len + 2];
            reader.read_exact(&mut buf).await?;
            buf.truncate(len);
            Ok(Frame::Bulk(Some(buf)))
        }
        _ => Err(BrokerError::Protocol(format!("unexpected reply '{line}'"))),
    }
}

/// Reads one reply frame.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Frame, BrokerError> {
    let line = read_line(reader).await?;
    if let Some(count) = line.strip_prefix('*') {
        let count: i64 = count
            .parse()
            .map_err(|_| BrokerError::Protocol(format!("bad array length '{count}'")))?;
        let mut items = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count.max(0) {
            let item = read_line(reader).await?;
            if item.starts_with('*') {
                return Err(BrokerError::Protocol("nested arrays are not supported".to_string()));
            }
            items.push(read_scalar(reader, &item).await?);
        }
        return Ok(Frame::Array(items));
    }
    read_scalar(reader, &line).await
}

/// `redis://[user@]host[:port][/db]` -> `(host, port)`.
pub fn parse_url(url: &str) -> Result<(String, u16), BrokerError> {
    let rest = url
        .strip_prefix("redis://")
        .ok_or_else(|| BrokerError::UnsupportedUrl(url.to_string()))?;
    let authority = rest.split('/').next().unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or_default();
    if host_port.is_empty() {
        return Err(BrokerError::UnsupportedUrl(url.to_string()));
    }
    match host_port.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| BrokerError::UnsupportedUrl(url.to_string()))?;
            Ok((host.to_string(), port))
        }
        None => Ok((host_port.to_string(), DEFAULT_PORT)),
    }
}

/// Connection settings for one broker channel.
///
/// Publishes share one connection, opened on first use and reopened after
/// any failure. Clones share it too.
#[derive(Debug, Clone)]
pub struct Broker {
    host: String,
    port: u16,
    channel: String,
    timeout: Duration,
    publisher: Arc<Mutex<Option<BufReader<TcpStream>>>>,
}

impl Broker {
    pub fn new(url: &str, channel: &str, timeout: Duration) -> Result<Self, BrokerError> {
        let (host, port) = parse_url(url)?;
        Ok(Self {
            host,
            port,
            channel: channel.to_string(),
            timeout,
            publisher: Arc::new(Mutex::new(None)),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn connect(&self) -> Result<BufReader<TcpStream>, BrokerError> {
        let addr = (self.host.as_str(), self.port);
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| BrokerError::Timeout(self.timeout))??;
        stream.set_nodelay(true)?;
        Ok(BufReader::new(stream))
    }

    /// Publishes `message`; returns how many subscribers received it.
    ///
    /// A failure on a reused connection (the server may have closed it while
    /// idle) is retried once on a fresh one.
    pub async fn publish(&self, message: &str) -> Result<i64, BrokerError> {
        let mut slot = self.publisher.lock().await;
        let reused = slot.is_some();
        match self.publish_on(&mut slot, message).await {
            Ok(n) => Ok(n),
            Err(e) => {
                *slot = None;
                if !reused {
                    return Err(e);
                }
                tracing::debug!(error = %e, "broker connection went stale; reconnecting");
                let retried = self.publish_on(&mut slot, message).await;
                if retried.is_err() {
                    *slot = None;
                }
                retried
            }
        }
    }

    async fn publish_on(
        &self,
        slot: &mut Option<BufReader<TcpStream>>,
        message: &str,
    ) -> Result<i64, BrokerError> {
        let work = async {
            if slot.is_none() {
                *slot = Some(self.connect().await?);
            }
            let Some(conn) = slot.as_mut() else {
                return Err(BrokerError::Protocol("no connection".to_string()));
            };
            conn.get_mut()
                .write_all(&encode_command(&["PUBLISH", &self.channel, message]))
                .await?;
            match read_frame(conn).await? {
                Frame::Integer(n) => Ok(n),
                Frame::Error(e) => Err(BrokerError::Protocol(e)),
                other => Err(BrokerError::Protocol(format!("unexpected reply {other:?}"))),
            }
        };
        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| BrokerError::Timeout(self.timeout))?
    }

    /// Subscribes to the channel; the returned handle yields message payloads.
    pub async fn subscribe(&self) -> Result<Subscription, BrokerError> {
        let work = async {
            let mut conn = self.connect().await?;
            conn.get_mut()
                .write_all(&encode_command(&["SUBSCRIBE", &self.channel]))
                .await?;
            match read_frame(&mut conn).await? {
                Frame::Array(items)
                    if items.first().and_then(Frame::as_text).as_deref() == Some("subscribe") =>
                {
                    Ok(Subscription { conn })
                }
                Frame::Error(e) => Err(BrokerError::Protocol(e)),
                other => Err(BrokerError::Protocol(format!("unexpected reply {other:?}"))),
            }
        };
        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| BrokerError::Timeout(self.timeout))?
    }
}

/// A live `SUBSCRIBE` connection.
pub struct Subscription {
    conn: BufReader<TcpStream>,
}

impl Subscription {
    /// Waits for the next published payload. Not cancel-safe: dropping it
    /// mid-frame desynchronizes the connection.
    pub async fn next_message(&mut self) -> Result<String, BrokerError> {
        loop {
            if let Frame::Array(items) = read_frame(&mut self.conn).await? {
                if items.len() == 3 && items[0].as_text().as_deref() == Some("message") {
                    return Ok(items[2].as_text().unwrap_or_default());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    // ── encode / decode ───────────────────────────────────────────────────────

    #[test]
    fn encode_publish_command() {
        assert_eq!(
            encode_command(&["PUBLISH", "ch", "hi"]),
            b"*3\r\n$7\r\nPUBLISH\r\n$2\r\nch\r\n$2\r\nhi\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn read_frame_scalars() {
        let mut input: &[u8] = b"+OK\r\n-ERR nope\r\n:3\r\n$5\r\nhello\r\n$-1\r\n";
        assert_eq!(read_frame(&mut input).await.unwrap(), Frame::Simple("OK".into()));
        assert_eq!(read_frame(&mut input).await.unwrap(), Frame::Error("ERR nope".into()));
        assert_eq!(read_frame(&mut input).await.unwrap(), Frame::Integer(3));
        assert_eq!(
            read_frame(&mut input).await.unwrap(),
            Frame::Bulk(Some(b"hello".to_vec()))
        );
        assert_eq!(read_frame(&mut input).await.unwrap(), Frame::Bulk(None));
    }

    #[tokio::test]
    async fn read_frame_pubsub_message() {
        let mut input: &[u8] = b"*3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$4\r\nwake\r\n";
        let frame = read_frame(&mut input).await.unwrap();
        let Frame::Array(items) = frame else { panic!("expected array") };
        assert_eq!(items[0].as_text().as_deref(), Some("message"));
        assert_eq!(items[2].as_text().as_deref(), Some("wake"));
    }

    #[tokio::test]
    async fn read_frame_rejects_garbage_and_eof() {
        let mut garbage: &[u8] = b"?what\r\n";
        assert!(matches!(read_frame(&mut garbage).await, Err(BrokerError::Protocol(_))));
        let mut empty: &[u8] = b"";
        assert!(read_frame(&mut empty).await.is_err());
    }

    #[test]
    fn trigger_notice_is_json() {
        let notice = trigger_notice("w1", "task-ready", "42", Utc::now());
        let value: serde_json::Value = serde_json::from_str(&notice).unwrap();
        assert_eq!(value["worker"], "w1");
        assert_eq!(value["correlation_id"], "42");
    }

    // ── parse_url ─────────────────────────────────────────────────────────────

    #[test]
    fn parse_url_variants() {
        assert_eq!(parse_url("redis://localhost").unwrap(), ("localhost".into(), 6379));
        assert_eq!(parse_url("redis://10.0.0.2:7000/0").unwrap(), ("10.0.0.2".into(), 7000));
        assert_eq!(parse_url("redis://user@broker:6380").unwrap(), ("broker".into(), 6380));
    }

    #[test]
    fn parse_url_rejects_other_schemes() {
        assert!(matches!(parse_url("nats://x:4222"), Err(BrokerError::UnsupportedUrl(_))));
        assert!(parse_url("redis://").is_err());
        assert!(parse_url("redis://host:port").is_err());
    }

    // ── Broker against a scripted server ──────────────────────────────────────

    #[tokio::test]
    async fn publish_returns_receiver_count() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(b":2\r\n").await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        let broker = Broker::new(
            &format!("redis://127.0.0.1:{port}"),
            "beacon:planner",
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(broker.publish("hello").await.unwrap(), 2);
        let sent = server.await.unwrap();
        assert!(sent.contains("PUBLISH"));
        assert!(sent.contains("beacon:planner"));
    }

    #[tokio::test]
    async fn publishes_share_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            for reply in [b":1\r\n", b":3\r\n"] {
                let _ = sock.read(&mut buf).await.unwrap();
                sock.write_all(reply).await.unwrap();
            }
            // A second connection would be left waiting here.
            tokio::time::timeout(Duration::from_millis(200), listener.accept())
                .await
                .is_err()
        });

        let broker = Broker::new(&format!("redis://127.0.0.1:{port}"), "ch", Duration::from_secs(1)).unwrap();
        assert_eq!(broker.publish("one").await.unwrap(), 1);
        assert_eq!(broker.clone().publish("two").await.unwrap(), 3);
        assert!(server.await.unwrap(), "publish opened a second connection");
    }

    #[tokio::test]
    async fn publish_reconnects_after_server_closes_idle_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 256];
            let (mut first, _) = listener.accept().await.unwrap();
            let _ = first.read(&mut buf).await.unwrap();
            first.write_all(b":1\r\n").await.unwrap();
            drop(first);

            let (mut second, _) = listener.accept().await.unwrap();
            let _ = second.read(&mut buf).await.unwrap();
            second.write_all(b":5\r\n").await.unwrap();
            // Hold the connection until the client has read the reply.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let broker = Broker::new(&format!("redis://127.0.0.1:{port}"), "ch", Duration::from_secs(1)).unwrap();
        assert_eq!(broker.publish("one").await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.publish("two").await.unwrap(), 5);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_yields_published_payloads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"*3\r\n$9\r\nsubscribe\r\n$2\r\nch\r\n:1\r\n")
                .await
                .unwrap();
            sock.write_all(b"*3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$5\r\nready\r\n")
                .await
                .unwrap();
            // Keep the connection open until the client is done.
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let broker = Broker::new(&format!("redis://127.0.0.1:{port}"), "ch", Duration::from_secs(1)).unwrap();
        let mut sub = broker.subscribe().await.unwrap();
        assert_eq!(sub.next_message().await.unwrap(), "ready");
    }

    #[tokio::test]
    async fn publish_to_unreachable_broker_fails_fast() {
        // Bind then drop to get a port with nobody listening.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let broker = Broker::new(
            &format!("redis://127.0.0.1:{port}"),
            "ch",
            Duration::from_millis(500),
        )
        .unwrap();
        assert!(broker.publish("x").await.is_err());
    }
}
