//! Raw TCP/UDP sink.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::output::{pick_endpoint, Sink, SinkError};
use crate::pipeline::OutQueueItem;

enum Conn {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

#[derive(Default)]
pub struct NetworkSink {
    conn: Option<Conn>,
}

impl NetworkSink {
    async fn connect(&mut self, item: &OutQueueItem) -> Result<(), SinkError> {
        let cfg = &item.sample.output;
        let endpoint = pick_endpoint(&cfg.endpoints)?.to_string();
        let dial_timeout = Duration::from_secs(cfg.timeout.max(1));

        let conn = if cfg.protocol.eq_ignore_ascii_case("udp") {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(&endpoint).await?;
            Conn::Udp(socket)
        } else {
            let stream = timeout(dial_timeout, TcpStream::connect(&endpoint))
                .await
                .map_err(|_| {
                    SinkError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("dial '{endpoint}' timed out"),
                    ))
                })??;
            Conn::Tcp(stream)
        };
        self.conn = Some(conn);
        Ok(())
    }
}

#[async_trait]
impl Sink for NetworkSink {
    async fn send(&mut self, item: &OutQueueItem, payload: Bytes) -> Result<u64, SinkError> {
        if self.conn.is_none() {
            self.connect(item).await?;
        }
        match self.conn.as_mut().expect("connection just initialized") {
            Conn::Tcp(stream) => stream.write_all(&payload).await?,
            Conn::Udp(socket) => {
                socket.send(&payload).await?;
            }
        }
        Ok(payload.len() as u64)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if let Some(Conn::Tcp(mut stream)) = self.conn.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }
}
