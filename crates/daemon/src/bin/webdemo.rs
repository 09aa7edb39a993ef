/// Demonstration web server
///
/// A plain HTTP origin for exercising the overlay end to end: a few static
/// pages an exit router can fetch. Listens on the address given as the first
/// argument (default 127.0.0.1:8000).
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let listen_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8000".to_string());

    let app = Router::new()
        .route("/", get(index))
        .route("/view/", get(view))
        .route("/view/:page", get(view_page));

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(addr = %listener.local_addr()?, "demo web server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html("<h1>VeilNet demo</h1><p>Try <a href=\"/view/\">/view/</a>.</p>")
}

async fn view() -> Html<&'static str> {
    Html("<h1>Front page</h1><p>Served in the clear, fetched through three hops.</p>")
}

async fn view_page(axum::extract::Path(page): axum::extract::Path<String>) -> Html<String> {
    Html(format!("<h1>{}</h1><p>A page like any other.</p>", page))
}
