//! Local admin API
//!
//! Bound to loopback only. Exposes the start gate for inspection and lets
//! an operator reopen it without waiting for the cooldown.

use crate::engine::DecisionEngine;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = response(status, body.to_string());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    engine: Arc<DecisionEngine>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        engine: Arc<DecisionEngine>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            engine,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub async fn bind(self) -> anyhow::Result<BoundAdmin> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        Ok(BoundAdmin {
            listener,
            engine: self.engine,
            shutdown_rx: self.shutdown_rx,
            auth_token: self.auth_token,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        self.bind().await?.serve().await
    }
}

pub struct BoundAdmin {
    listener: TcpListener,
    engine: Arc<DecisionEngine>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl BoundAdmin {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr()?, "Admin API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let engine = Arc::clone(&self.engine);
                            let auth_token = Arc::clone(&self.auth_token);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, engine, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    engine: Arc<DecisionEngine>,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let engine = Arc::clone(&engine);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, engine, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token == expected_token)
        .unwrap_or(false)
}

async fn handle_admin_request(
    req: Request<Incoming>,
    engine: Arc<DecisionEngine>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    let response = match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        (&Method::GET, "/status") | (&Method::POST, "/gate/release")
            if !check_auth(&req, &auth_token) =>
        {
            warn!(path, "Unauthorized admin API request");
            response(StatusCode::UNAUTHORIZED, "unauthorized")
        }

        (&Method::GET, "/status") => json_response(
            StatusCode::OK,
            serde_json::json!({
                "gate": engine.gate_snapshot(),
                "public_address": engine.public_address(),
            }),
        ),

        (&Method::POST, "/gate/release") => {
            let released = engine.release_gate();
            info!(released, "Start gate released via admin API");
            json_response(StatusCode::OK, serde_json::json!({ "released": released }))
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
