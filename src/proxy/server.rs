//! Gateway server implementation using hyper
//!
//! Accepts inbound connections and runs every request through the
//! [`ProxyHandler`] pipeline.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::config::ServerConfig;
use crate::error::{GatewayError, Result};
use crate::proxy::cancel::cancellation;
use crate::proxy::handler::ProxyHandler;

/// Gateway server
pub struct ProxyServer {
    config: ServerConfig,
    handler: Arc<ProxyHandler>,
}

impl ProxyServer {
    /// Create a new gateway server
    pub fn new(config: ServerConfig, handler: Arc<ProxyHandler>) -> Self {
        Self { config, handler }
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| GatewayError::InvalidConfig(format!("invalid listen address: {}", e)))?;

        let listener = TcpListener::bind(addr).await?;
        info!("Gateway listening on {}", addr);
        Ok(listener)
    }

    /// Run the gateway server
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on an already-bound listener until shutdown
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, client_addr, handler).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection(
        stream: tokio::net::TcpStream,
        client_addr: SocketAddr,
        handler: Arc<ProxyHandler>,
    ) -> Result<()> {
        let io = TokioIo::new(stream);

        // Fires when this function returns or its task is dropped.
        let (_connection_alive, cancel) = cancellation();

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();
            let cancel = cancel.clone();

            async move {
                Ok::<_, Infallible>(handler.handle(req, Some(client_addr), cancel).await)
            }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(io, service)
            .await?;

        Ok(())
    }
}
