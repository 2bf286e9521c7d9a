//! Splunk-to-Splunk v2 wire protocol: event framing and a buffered TCP
//! client.
//!
//! Frame layout: a 4-byte big-endian message size, a 4-byte map count, then
//! key/value pairs where each string is a 4-byte length (including the NUL)
//! followed by the bytes and a NUL terminator. The raw trailer closes the
//! frame.

use std::io;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::debug;

use crate::sample::Event;

/// Keys carried as dedicated frame entries rather than `_meta` index fields.
const RESERVED: &[&str] = &[
    "source",
    "sourcetype",
    "host",
    "index",
    "_raw",
    "_time",
    "_channel",
    "_conf",
    "_linebreaker",
    "_done",
];

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32 + 1);
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_key_value(buf: &mut BytesMut, key: &str, value: &str) {
    put_string(buf, key);
    put_string(buf, value);
}

/// Encode one event as an S2S frame.
pub fn encode_event(event: &Event) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_u32(0); // message size, patched below
    buf.put_u32(0); // map count, patched below

    let get = |key: &str| event.get(key).map(String::as_str).unwrap_or_default();
    let mut time = get("_time");
    let host = get("host");
    let source = get("source");
    let sourcetype = get("sourcetype");
    let index = get("index");

    // A fractional _time moves its subseconds into the index fields.
    let mut index_fields = String::new();
    if let Some((secs, frac)) = time.split_once('.') {
        index_fields.push_str("_subsecond::");
        index_fields.push_str(frac);
        index_fields.push(' ');
        time = secs;
    }
    let mut extra: Vec<(&String, &String)> = event
        .iter()
        .filter(|(k, _)| !RESERVED.contains(&k.as_str()))
        .collect();
    extra.sort_by_key(|(k, _)| k.as_str());
    for (k, v) in extra {
        index_fields.push_str(k);
        index_fields.push_str("::");
        index_fields.push_str(v);
        index_fields.push(' ');
    }

    let mut maps: u32 = 7;
    put_key_value(&mut buf, "_raw", get("_raw"));
    if !index_fields.is_empty() {
        put_key_value(&mut buf, "_meta", index_fields.trim_end());
        maps += 1;
    }
    if event.contains_key("_done") {
        put_key_value(&mut buf, "_done", "_done");
        maps += 1;
    }
    if event.contains_key("_linebreaker") {
        put_key_value(&mut buf, "_linebreaker", "_linebreaker");
        maps += 1;
    }
    put_key_value(&mut buf, "_hpn", "_hpn");
    put_key_value(&mut buf, "_time", time);
    if let Some(conf) = event.get("_conf") {
        put_key_value(&mut buf, "_conf", conf);
        maps += 1;
    }
    put_key_value(&mut buf, "MetaData:Source", &format!("source::{source}"));
    put_key_value(&mut buf, "MetaData:Host", &format!("host::{host}"));
    put_key_value(&mut buf, "MetaData:Sourcetype", &format!("sourcetype::{sourcetype}"));
    if let Some(channel) = event.get("_channel") {
        put_key_value(&mut buf, "_channel", channel);
        maps += 1;
    }
    put_key_value(&mut buf, "_MetaData:Index", index);

    buf.put_u32(0); // null-terminate raw
    put_string(&mut buf, "_raw"); // raw trailer

    let mut out = buf.to_vec();
    let size = (out.len() - 4) as u32;
    out[0..4].copy_from_slice(&size.to_be_bytes());
    out[4..8].copy_from_slice(&maps.to_be_bytes());
    out
}

/// A buffered S2S upload connection.
pub struct S2sClient {
    writer: BufWriter<TcpStream>,
    endpoint: String,
}

impl S2sClient {
    /// Connect to one of `endpoints` (`host:port`), send the protocol
    /// signature, and buffer writes up to `buffer_bytes`.
    pub async fn connect(endpoints: &[String], buffer_bytes: usize) -> io::Result<Self> {
        use rand::Rng;
        if endpoints.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no endpoints specified"));
        }
        let endpoint = endpoints[rand::thread_rng().gen_range(0..endpoints.len())].clone();
        let stream = TcpStream::connect(&endpoint).await?;
        let mut client = S2sClient {
            writer: BufWriter::with_capacity(buffer_bytes.max(1024), stream),
            endpoint,
        };
        client.send_signature().await?;
        Ok(client)
    }

    /// The signature preamble: 128-byte signature, 256-byte server name,
    /// 16-byte management port, all NUL-padded.
    async fn send_signature(&mut self) -> io::Result<()> {
        let (server, port) = self
            .endpoint
            .split_once(':')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "endpoint must be host:port"))?;

        let mut sig = [0u8; 128 + 256 + 16];
        let banner = b"--splunk-cooked-mode-v2--";
        sig[..banner.len()].copy_from_slice(banner);
        let server = server.as_bytes();
        sig[128..128 + server.len().min(256)].copy_from_slice(&server[..server.len().min(256)]);
        let port = port.as_bytes();
        sig[384..384 + port.len().min(16)].copy_from_slice(&port[..port.len().min(16)]);

        self.writer.write_all(&sig).await
    }

    /// Stream pre-framed bytes.
    pub async fn write_payload(&mut self, payload: &[u8]) -> io::Result<()> {
        self.writer.write_all(payload).await
    }

    /// Frame and send a single event, returning the frame size.
    pub async fn send_event(&mut self, event: &Event) -> io::Result<u64> {
        let frame = encode_event(event);
        self.writer.write_all(&frame).await?;
        Ok(frame.len() as u64)
    }

    /// Flush and tear down. A short grace period lets slow receivers drain
    /// before the FIN.
    pub async fn close(mut self) -> io::Result<()> {
        self.writer.flush().await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        debug!(endpoint = %self.endpoint, "closing s2s connection");
        self.writer.shutdown().await
    }
}
