use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use log::{debug, error};
use crate::protocol::{self, Request};
use crate::testing::MemBucket;
use crate::{KVReader, KVWriter, Result, StoreResult};

struct BucketEntry {
    password: String,
    bucket: Arc<MemBucket>,
}

/// Serves [`MemBucket`]s over the line protocol.
pub struct Router {
    buckets: HashMap<String, BucketEntry>,
    semaphore: Arc<Semaphore>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            buckets: HashMap::new(),
            semaphore: Arc::new(Semaphore::new(100)),
        }
    }

    pub fn bucket(mut self, password: &str, bucket: Arc<MemBucket>) -> Self {
        let name = crate::Bucket::name(bucket.as_ref()).to_string();
        self.buckets.insert(name, BucketEntry { password: password.to_string(), bucket });
        self
    }

    /// Operations beyond this many in flight are answered with `ERR BUSY`.
    pub fn max_in_flight(mut self, permits: usize) -> Self {
        self.semaphore = Arc::new(Semaphore::new(permits));
        self
    }

    /// Binds a loopback listener and serves connections in the background.
    pub async fn spawn(self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let router = Arc::new(self);

        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(e) = router.handle_connection(socket).await {
                        debug!("Connection error: {}", e);
                    }
                });
            }
        });
        Ok((addr, handle))
    }

    pub async fn handle_connection(&self, mut socket: TcpStream) -> Result<()> {
        let (reader, mut writer) = socket.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut session: Option<Arc<MemBucket>> = None;

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;
            if bytes_read == 0 {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }

            let request = match Request::parse(&line) {
                Ok(request) => request,
                Err(e) => {
                    writer.write_all(format!("ERR {}\n", e).as_bytes()).await?;
                    continue;
                }
            };

            let response = match request {
                Request::Quit => break,
                Request::Auth { bucket, password } => match self.buckets.get(&bucket) {
                    Some(entry) if entry.password == password => {
                        session = Some(entry.bucket.clone());
                        "OK".to_string()
                    }
                    Some(_) => format!("ERR {} invalid credentials for bucket {}", protocol::AUTH, bucket),
                    None => format!("ERR {} unknown bucket {}", protocol::AUTH, bucket),
                },
                request => match &session {
                    None => format!("ERR {} not authenticated", protocol::AUTH),
                    Some(bucket) => {
                        let result = self.dispatch(bucket, request).await;
                        protocol::response_line(&result)
                    }
                },
            };

            writer.write_all(format!("{}\n", response).as_bytes()).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, bucket: &MemBucket, request: Request) -> StoreResult {
        let _permit = match self.semaphore.try_acquire() {
            Ok(p) => p,
            Err(_) => {
                error!("Server busy: too many operations in flight");
                return StoreResult::Busy;
            }
        };

        match request {
            Request::Get { key } => bucket.get(&key).await,
            Request::Upsert { key, document } => bucket.upsert(&key, &document).await,
            Request::Remove { key } => bucket.remove(&key).await,
            Request::Auth { .. } | Request::Quit => StoreResult::OtherFailure("unexpected command".to_string()),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
