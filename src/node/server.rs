//! Storage node HTTP server.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{FsShardStore, ShardInventory, CHECKSUM_HEADER, HEALTH_PATH, SHARDS_PATH};
use crate::domain::ports::{ShardId, StoredShard};
use crate::error::{Error, Result};

/// Serves one [`FsShardStore`] over HTTP.
#[derive(Debug, Clone)]
pub struct NodeServer {
    node_id: String,
    store: Arc<FsShardStore>,
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

impl NodeServer {
    pub fn new(node_id: impl Into<String>, store: FsShardStore) -> Self {
        Self {
            node_id: node_id.into(),
            store: Arc::new(store),
        }
    }

    /// Bind `addr` and serve until `shutdown` is cancelled.
    pub async fn serve(self, addr: &str, shutdown: CancellationToken) -> Result<()> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| Error::Config(format!("Invalid node address {}: {}", addr, e)))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind node server: {}", e)))?;
        self.serve_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` is cancelled.
    pub async fn serve_listener(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(
            node = %self.node_id,
            dir = %self.store.dir().display(),
            "Node server listening on {}",
            listener.local_addr()?
        );

        loop {
            let (stream, _) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(node = %self.node_id, "Node server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted
                    .map_err(|e| Error::Internal(format!("Node server accept error: {}", e)))?,
            };

            let io = TokioIo::new(stream);
            let server = self.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle(req).await) }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Node server connection error: {}", e);
                }
            });
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        if path == HEALTH_PATH && method == Method::GET {
            return respond(StatusCode::OK, "ok");
        }
        if path == SHARDS_PATH && method == Method::GET {
            return self.list().await;
        }

        let Some(raw_id) = path
            .strip_prefix(SHARDS_PATH)
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return respond(StatusCode::NOT_FOUND, "not found");
        };
        let shard_id = match urlencoding::decode(raw_id)
            .map_err(|e| Error::InvalidShardId(e.to_string()))
            .and_then(|id| ShardId::new(id.into_owned()))
        {
            Ok(id) => id,
            Err(e) => return respond(StatusCode::BAD_REQUEST, e.to_string()),
        };

        let result = match method {
            Method::PUT => self.put(&shard_id, req).await,
            Method::GET => self.get(&shard_id).await,
            Method::DELETE => self.delete(&shard_id).await,
            _ => Ok(respond(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")),
        };
        result.unwrap_or_else(|e| {
            warn!(shard = %shard_id, "request failed: {}", e);
            respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })
    }

    async fn put(&self, shard_id: &ShardId, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let declared = req
            .headers()
            .get(CHECKSUM_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| u32::from_str_radix(v, 16).ok());
        let Some(declared) = declared else {
            return Ok(respond(StatusCode::BAD_REQUEST, "missing or malformed checksum"));
        };

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return Ok(respond(StatusCode::BAD_REQUEST, e.to_string())),
        };
        let shard = StoredShard {
            data: body,
            checksum: declared,
        };
        // Refuse bytes damaged in transit rather than store them
        if shard.verify(0).is_err() {
            return Ok(respond(StatusCode::UNPROCESSABLE_ENTITY, "checksum mismatch"));
        }

        self.store.put(shard_id, &shard).await?;
        debug!(shard = %shard_id, len = shard.len(), "shard stored");
        Ok(respond(StatusCode::CREATED, ""))
    }

    async fn get(&self, shard_id: &ShardId) -> Result<Response<Full<Bytes>>> {
        let Some(shard) = self.store.get(shard_id).await? else {
            return Ok(respond(StatusCode::NOT_FOUND, "shard not found"));
        };

        let checksum = HeaderValue::from_str(&format!("{:08x}", shard.checksum))
            .map_err(|e| Error::Internal(e.to_string()))?;
        let mut response = respond(StatusCode::OK, shard.data);
        response.headers_mut().insert(CHECKSUM_HEADER, checksum);
        Ok(response)
    }

    async fn delete(&self, shard_id: &ShardId) -> Result<Response<Full<Bytes>>> {
        if self.store.delete(shard_id).await? {
            Ok(respond(StatusCode::NO_CONTENT, ""))
        } else {
            Ok(respond(StatusCode::NOT_FOUND, "shard not found"))
        }
    }

    async fn list(&self) -> Response<Full<Bytes>> {
        let shards = match self.store.list().await {
            Ok(shards) => shards,
            Err(e) => return respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
        let inventory = ShardInventory {
            node_id: self.node_id.clone(),
            shards,
        };
        match serde_json::to_vec(&inventory) {
            Ok(body) => {
                let mut response = respond(StatusCode::OK, body);
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
            }
            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}
