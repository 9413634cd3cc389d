use std::sync::atomic::{AtomicBool, Ordering};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use log::{debug, info, warn};
use crate::config::{ServerAddress, StorageOptions};
use crate::protocol::{self, Request};
use crate::sdk::tls;
use crate::{Bucket, Error, KVReader, KVWriter, Result, StoreResult};

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Idle connections kept for reuse; extra ones are closed on release.
const MAX_IDLE_CONNECTIONS: usize = 8;

/// A session with one bucket on the remote key-value service.
///
/// Each request checks a connection out of a small pool, so calls for
/// different keys run concurrently. A connection goes back to the pool only
/// after its reply has been read; one whose request failed, timed out or was
/// abandoned by the caller is closed. The failed request is not re-sent.
pub struct Client {
    options: StorageOptions,
    tls: Option<TlsConnector>,
    idle: Mutex<Vec<Connection>>,
    closed: AtomicBool,
}

struct Connection {
    reader: BufReader<BoxedReader>,
    writer: BoxedWriter,
    server: ServerAddress,
}

impl Connection {
    async fn round_trip(&mut self, line: &str) -> std::io::Result<String> {
        self.writer.write_all(format!("{}\n", line).as_bytes()).await?;
        self.writer.flush().await?;

        let mut resp = String::new();
        if self.reader.read_line(&mut resp).await? == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed by server"));
        }
        Ok(resp)
    }
}

impl Client {
    /// Opens and authenticates a session, trying each configured server in order.
    pub async fn connect(options: StorageOptions) -> Result<Self> {
        let tls = options.tls.as_ref().map(tls::connector).transpose()?;
        let client = Self {
            options,
            tls,
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };

        let conn = client.open().await?;
        info!("Opened bucket {} on {}", client.options.bucket_name, conn.server);
        client.idle.lock().await.push(conn);
        Ok(client)
    }

    /// The server of the most recently released idle connection, if any.
    pub async fn connected_server(&self) -> Option<ServerAddress> {
        self.idle.lock().await.last().map(|c| c.server.clone())
    }

    async fn open(&self) -> Result<Connection> {
        let mut last_error = None;
        for server in &self.options.servers {
            match self.open_one(server).await {
                Ok(conn) => return Ok(conn),
                Err(e @ Error::Authentication(_)) => return Err(e),
                Err(e) => {
                    warn!("Cannot open bucket {} on {}: {}", self.options.bucket_name, server, e);
                    last_error = Some(e);
                }
            }
        }

        Err(Error::Connection(match last_error {
            Some(e) => format!("no server reachable for bucket {}, last error: {}", self.options.bucket_name, e),
            None => format!("no servers configured for bucket {}", self.options.bucket_name),
        }))
    }

    async fn open_one(&self, server: &ServerAddress) -> Result<Connection> {
        let deadline = self.options.operation_timeout;
        let tcp = timeout(deadline, TcpStream::connect((server.host.as_str(), server.port)))
            .await
            .map_err(|_| Error::Timeout)??;
        tcp.set_nodelay(true)?;

        let (reader, writer): (BoxedReader, BoxedWriter) = match &self.tls {
            Some(connector) => {
                let name = self
                    .options
                    .tls
                    .as_ref()
                    .and_then(|t| t.server_name.clone())
                    .unwrap_or_else(|| server.host.clone());
                let stream = timeout(deadline, connector.connect(tls::server_name(&name)?, tcp))
                    .await
                    .map_err(|_| Error::Timeout)??;
                let (reader, writer) = tokio::io::split(stream);
                (Box::new(reader) as BoxedReader, Box::new(writer) as BoxedWriter)
            }
            None => {
                let (reader, writer) = tcp.into_split();
                (Box::new(reader) as BoxedReader, Box::new(writer) as BoxedWriter)
            }
        };

        let mut conn = Connection {
            reader: BufReader::new(reader),
            writer,
            server: server.clone(),
        };

        let auth = Request::Auth {
            bucket: self.options.bucket_name.clone(),
            password: self.options.bucket_password.clone(),
        };
        let resp = timeout(deadline, conn.round_trip(&auth.to_line()))
            .await
            .map_err(|_| Error::Timeout)??;

        match protocol::parse_response(&resp) {
            StoreResult::Success(_) => Ok(conn),
            StoreResult::OtherFailure(detail) if detail.starts_with(protocol::AUTH) => Err(Error::Authentication(
                detail.trim_start_matches(protocol::AUTH).trim().to_string(),
            )),
            other => Err(Error::Connection(format!("unexpected handshake reply from {}: {}", server, other))),
        }
    }

    /// Reuses an idle connection or opens a new one.
    async fn checkout(&self) -> Result<Connection> {
        if let Some(conn) = self.idle.lock().await.pop() {
            return Ok(conn);
        }
        let conn = self.open().await?;
        debug!("Opened connection to bucket {} on {}", self.options.bucket_name, conn.server);
        Ok(conn)
    }

    async fn release(&self, conn: Connection) {
        let mut idle = self.idle.lock().await;
        if !self.closed.load(Ordering::SeqCst) && idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }

    async fn execute(&self, request: Request) -> StoreResult {
        if self.closed.load(Ordering::SeqCst) {
            return StoreResult::OtherFailure("client is closed".to_string());
        }

        let line = request.to_line();
        match timeout(self.options.operation_timeout, self.exchange(&line)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Request to bucket {} timed out after {:?}", self.options.bucket_name, self.options.operation_timeout);
                StoreResult::Timeout
            }
        }
    }

    /// One request and its reply on a checked-out connection.
    ///
    /// The connection is owned by this future until the reply is read, so a
    /// cancelled exchange closes it instead of leaving a reply in flight.
    async fn exchange(&self, line: &str) -> StoreResult {
        let mut conn = match self.checkout().await {
            Ok(conn) => conn,
            Err(e) => return StoreResult::OtherFailure(e.to_string()),
        };

        match conn.round_trip(line).await {
            Ok(resp) => {
                self.release(conn).await;
                protocol::parse_response(&resp)
            }
            Err(e) => {
                warn!("Connection to {} lost: {}", conn.server, e);
                StoreResult::OtherFailure(format!("connection to {} lost: {}", conn.server, e))
            }
        }
    }
}

#[async_trait]
impl KVReader for Client {
    async fn get(&self, key: &str) -> StoreResult {
        match self.execute(Request::Get { key: key.to_string() }).await {
            StoreResult::TooLarge => StoreResult::OtherFailure("unexpected TOO_LARGE reply to GET".to_string()),
            result => result,
        }
    }
}

#[async_trait]
impl KVWriter for Client {
    async fn upsert(&self, key: &str, document: &str) -> StoreResult {
        let request = Request::Upsert {
            key: key.to_string(),
            document: document.to_string(),
        };
        match self.execute(request).await {
            StoreResult::Success(_) => StoreResult::Success(None),
            StoreResult::NotFound => StoreResult::OtherFailure("unexpected NOT_FOUND reply to UPSERT".to_string()),
            result => result,
        }
    }

    async fn remove(&self, key: &str) -> StoreResult {
        match self.execute(Request::Remove { key: key.to_string() }).await {
            StoreResult::Success(_) => StoreResult::Success(None),
            StoreResult::TooLarge => StoreResult::OtherFailure("unexpected TOO_LARGE reply to REMOVE".to_string()),
            result => result,
        }
    }
}

#[async_trait]
impl Bucket for Client {
    fn name(&self) -> &str {
        &self.options.bucket_name
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let connections: Vec<Connection> = self.idle.lock().await.drain(..).collect();
        for mut conn in connections {
            let _ = conn.writer.write_all(format!("{}\n", Request::Quit.to_line()).as_bytes()).await;
            let _ = conn.writer.shutdown().await;
        }
        info!("Closed bucket {}", self.options.bucket_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemBucket, Router};
    use std::sync::Arc;
    use std::time::Duration;

    async fn serve(bucket: Arc<MemBucket>) -> ServerAddress {
        let (addr, _) = Router::new().bucket("pw", bucket).spawn().await.unwrap();
        ServerAddress { host: addr.ip().to_string(), port: addr.port() }
    }

    #[tokio::test]
    async fn test_client_operations() {
        let bucket = Arc::new(MemBucket::new("grains").with_max_document_size(16));
        let server = serve(bucket.clone()).await;
        let client = Client::connect(StorageOptions::new(vec![server], "grains", "pw")).await.unwrap();

        assert_eq!(client.get("k").await, StoreResult::NotFound);
        assert_eq!(client.upsert("k", "{\"n\":1}").await, StoreResult::Success(None));
        assert_eq!(client.get("k").await, StoreResult::Success(Some("{\"n\":1}".into())));
        assert_eq!(client.upsert("k", "{\"n\":1234567890123}").await, StoreResult::TooLarge);
        assert_eq!(client.remove("k").await, StoreResult::Success(None));
        assert_eq!(client.remove("k").await, StoreResult::NotFound);
        assert!(bucket.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let server = serve(Arc::new(MemBucket::new("grains"))).await;
        let result = Client::connect(StorageOptions::new(vec![server], "grains", "wrong")).await;
        assert!(matches!(result, Err(Error::Authentication(_))));
    }

    #[tokio::test]
    async fn test_timeout_drops_connection_and_reconnects() {
        let bucket = Arc::new(MemBucket::new("grains"));
        let server = serve(bucket.clone()).await;
        let options = StorageOptions::new(vec![server], "grains", "pw").with_operation_timeout(Duration::from_millis(100));
        let client = Client::connect(options).await.unwrap();

        bucket.set_latency(Duration::from_millis(500));
        assert_eq!(client.get("k").await, StoreResult::Timeout);
        assert!(client.connected_server().await.is_none());

        bucket.set_latency(Duration::ZERO);
        assert_eq!(client.get("k").await, StoreResult::NotFound);
        assert!(client.connected_server().await.is_some());
    }

    #[tokio::test]
    async fn test_abandoned_request_does_not_leak_its_reply() {
        let bucket = Arc::new(MemBucket::new("grains"));
        bucket.insert_document("alice", "{\"balance\":1000}");
        let server = serve(bucket.clone()).await;
        let client = Client::connect(StorageOptions::new(vec![server], "grains", "pw")).await.unwrap();

        bucket.set_latency(Duration::from_millis(200));
        assert!(tokio::time::timeout(Duration::from_millis(50), client.get("alice")).await.is_err());

        bucket.set_latency(Duration::ZERO);
        assert_eq!(client.get("bob").await, StoreResult::NotFound);
        assert_eq!(client.get("alice").await, StoreResult::Success(Some("{\"balance\":1000}".into())));
    }

    #[tokio::test]
    async fn test_concurrent_requests_each_meet_the_deadline() {
        let bucket = Arc::new(MemBucket::new("grains"));
        let server = serve(bucket.clone()).await;
        let options = StorageOptions::new(vec![server], "grains", "pw").with_operation_timeout(Duration::from_millis(500));
        let client = Arc::new(Client::connect(options).await.unwrap());
        bucket.set_latency(Duration::from_millis(300));

        let calls = (0..4).map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.get(&format!("k{}", i)).await })
        });
        for call in calls.collect::<Vec<_>>() {
            assert_eq!(call.await.unwrap(), StoreResult::NotFound);
        }
    }

    #[tokio::test]
    async fn test_deadline_covers_reconnect() {
        // Accepts connections and never answers the handshake.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let silent = ServerAddress { host: addr.ip().to_string(), port: addr.port() };
        let options = StorageOptions::new(vec![silent.clone(), silent], "grains", "pw")
            .with_operation_timeout(Duration::from_millis(200));
        let client = Client {
            options,
            tls: None,
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };

        assert_eq!(client.get("k").await, StoreResult::Timeout);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let server = serve(Arc::new(MemBucket::new("grains"))).await;
        let client = Client::connect(StorageOptions::new(vec![server], "grains", "pw")).await.unwrap();
        client.close().await;
        client.close().await;
        assert!(matches!(client.get("k").await, StoreResult::OtherFailure(_)));
    }
}
