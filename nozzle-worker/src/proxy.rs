use async_trait::async_trait;
use nozzle_common::metric_point::MetricPoint;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::ProxyError;

/// A client for the downstream metrics proxy.
#[async_trait]
pub trait ProxyClient: Send + Sync + 'static {
    /// Deliver a batch of points. Either all points are handed to the proxy or an error is returned.
    async fn send(&self, points: &[MetricPoint]) -> Result<(), ProxyError>;
}

/// Proxy client speaking the line protocol over a single persistent TCP connection.
///
/// The connection is opened on first use. Any I/O error drops it, and the next
/// send dials again.
pub struct TcpProxyClient {
    address: String,
    connection: Mutex<Option<BufWriter<TcpStream>>>,
}

impl TcpProxyClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connection: Mutex::new(None),
        }
    }

    async fn dial(&self) -> Result<BufWriter<TcpStream>, ProxyError> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        debug!(address = %self.address, "connected to metrics proxy");
        Ok(BufWriter::new(stream))
    }
}

async fn write_points(
    writer: &mut BufWriter<TcpStream>,
    points: &[MetricPoint],
) -> std::io::Result<()> {
    for point in points {
        writer.write_all(point.to_line().as_bytes()).await?;
    }
    writer.flush().await
}

#[async_trait]
impl ProxyClient for TcpProxyClient {
    async fn send(&self, points: &[MetricPoint]) -> Result<(), ProxyError> {
        if points.is_empty() {
            return Ok(());
        }

        let mut connection = self.connection.lock().await;
        let mut writer = match connection.take() {
            Some(writer) => writer,
            None => self.dial().await?,
        };

        if let Err(error) = write_points(&mut writer, points).await {
            warn!(address = %self.address, "dropping metrics proxy connection: {error}");
            return Err(error.into());
        }

        *connection = Some(writer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    fn point(name: &str, value: f64) -> MetricPoint {
        MetricPoint::new(name, value, 1_700_000_000, "10.0.0.1").tag("job", "router")
    }

    #[tokio::test]
    async fn test_sends_lines_over_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind listener");
        let address = listener.local_addr().expect("no local address");

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept failed");
            let mut lines = BufReader::new(socket).lines();
            let mut received = Vec::new();
            while received.len() < 3 {
                match lines.next_line().await.expect("read failed") {
                    Some(line) => received.push(line),
                    None => break,
                }
            }
            received
        });

        let client = TcpProxyClient::new(address.to_string());
        client
            .send(&[point("a", 1.0), point("b", 2.5)])
            .await
            .expect("first send failed");
        client
            .send(&[point("c", 3.0)])
            .await
            .expect("second send failed");

        let received = server.await.expect("server task panicked");
        assert_eq!(
            received,
            vec![
                "\"a\" 1 1700000000 source=\"10.0.0.1\" \"job\"=\"router\"",
                "\"b\" 2.5 1700000000 source=\"10.0.0.1\" \"job\"=\"router\"",
                "\"c\" 3 1700000000 source=\"10.0.0.1\" \"job\"=\"router\"",
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind listener");
        let address = listener.local_addr().expect("no local address");
        drop(listener);

        let client = TcpProxyClient::new(address.to_string());
        let result = client.send(&[point("a", 1.0)]).await;

        assert!(matches!(result, Err(ProxyError::IoError(_))));
    }

    #[tokio::test]
    async fn test_empty_batch_does_not_connect() {
        let client = TcpProxyClient::new("127.0.0.1:1");

        client.send(&[]).await.expect("empty send failed");
    }
}
