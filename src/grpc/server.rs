//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tracing::{error, info};

use super::proto::floodgate::v1::admission_service_server::AdmissionServiceServer;
use super::service::AdmissionServiceImpl;
use crate::config::TlsConfig;
use crate::error::{FloodgateError, Result};
use crate::ratelimit::AdmissionEngine;

/// gRPC server for the admission service.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The admission engine instance
    engine: Arc<AdmissionEngine>,
    /// Certificate and key used to serve TLS
    tls: Option<TlsConfig>,
}

impl GrpcServer {
    /// Create a new plaintext gRPC server.
    pub fn new(addr: SocketAddr, engine: Arc<AdmissionEngine>) -> Self {
        Self {
            addr,
            engine,
            tls: None,
        }
    }

    /// Serve TLS with the given certificate and key.
    pub fn with_tls(mut self, tls: Option<TlsConfig>) -> Self {
        self.tls = tls;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn builder(&self) -> Result<Server> {
        let builder = Server::builder();
        match &self.tls {
            Some(tls) => {
                let cert = tokio::fs::read(&tls.cert_path).await?;
                let key = tokio::fs::read(&tls.key_path).await?;
                info!(cert = %tls.cert_path.display(), "TLS enabled for gRPC server");
                builder
                    .tls_config(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))
                    .map_err(FloodgateError::Grpc)
            }
            None => Ok(builder),
        }
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let mut builder = self.builder().await?;
        let service = AdmissionServiceImpl::new(self.engine);

        info!(
            addr = %self.addr,
            "Starting gRPC server for AdmissionService with graceful shutdown"
        );

        builder
            .add_service(AdmissionServiceServer::new(service))
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                FloodgateError::Grpc(e)
            })
    }

    /// Serve on an already bound listener until `signal` resolves.
    ///
    /// The configured address is ignored.
    pub async fn serve_with_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let mut builder = self.builder().await?;
        let service = AdmissionServiceImpl::new(self.engine);

        info!(
            addr = ?listener.local_addr().ok(),
            "Starting gRPC server for AdmissionService on bound listener"
        );

        builder
            .add_service(AdmissionServiceServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                FloodgateError::Grpc(e)
            })
    }
}
