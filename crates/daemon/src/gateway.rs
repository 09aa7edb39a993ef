/// Browser-facing HTTP gateway
///
/// The thin adapter between a browser and the client core: a URL arrives as
/// the request path, gets tunneled through a fresh circuit, and the body
/// comes back as the page. `http://localhost:<port>/example.org/view/`
/// fetches `http://example.org/view/` through the overlay.
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tracing::{info, warn};
use veilnet_common::{ClientConfig, Result};
use veilnet_core::{ClientCore, HttpTunnelRequest};

pub struct Gateway {
    listen_addr: String,
    core: Arc<ClientCore>,
}

impl Gateway {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            listen_addr: config.web_server_addr.clone(),
            core: Arc::new(ClientCore::new(config)),
        }
    }

    /// Serve until the process is stopped
    pub async fn serve(self) -> Result<()> {
        let app = Router::new()
            .route("/", get(usage))
            .route("/*url", get(tunnel))
            .with_state(self.core);

        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        info!(addr = %listener.local_addr()?, "gateway listening");

        axum::serve(listener, app)
            .await
            .map_err(|e| veilnet_common::VeilNetError::network(e.to_string()))
    }
}

async fn usage() -> Html<&'static str> {
    Html("<p>Usage: <code>localhost:[port]/[web address]</code></p>")
}

async fn tunnel(State(core): State<Arc<ClientCore>>, Path(url): Path<String>) -> Response {
    if url.contains("favicon") {
        return StatusCode::NO_CONTENT.into_response();
    }

    let url = if url.starts_with("http://") || url.starts_with("https://") {
        url
    } else {
        format!("http://{}", url)
    };

    match core.fetch(HttpTunnelRequest::get(&url)).await {
        Ok(body) => Html(String::from_utf8_lossy(&body).into_owned()).into_response(),
        Err(e) => {
            warn!(%url, error = %e, "tunneled request failed");
            (StatusCode::BAD_GATEWAY, format!("request failed: {}", e)).into_response()
        }
    }
}
