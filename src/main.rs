use anyhow::Result;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use arena_indexer::{Config, Engine, QueryInput, QueryOutput};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("🚀 Starting Arena Indexer Service");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "📋 Configuration loaded: rpc={}, cutover day {}",
        config.rpc_url,
        config.cutover_ts / 86_400
    );

    // Prometheus exporter on its own port
    arena_indexer::metrics::init_metrics(config.metrics_port)?;
    info!("📊 Metrics exporter listening on port {}", config.metrics_port);

    let service_port = config.service_port;
    let engine = Arc::new(Engine::from_config(config).await?);
    info!("🔗 Engine initialized");

    let make_svc = make_service_fn({
        let engine = engine.clone();
        move |_conn| {
            let engine = engine.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| handle_request(engine.clone(), req)))
            }
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], service_port));
    let server = Server::bind(&addr).serve(make_svc);
    info!("✅ Query service listening on http://{}", addr);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("Query server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Received shutdown signal");
        }
    }

    info!("👋 Arena Indexer Service stopped");
    Ok(())
}

async fn handle_request(
    engine: Arc<Engine>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => Ok(Response::new(Body::from("ok"))),
        (&Method::POST, "/query") => {
            let output = match hyper::body::to_bytes(req.into_body()).await {
                Ok(bytes) => match serde_json::from_slice::<QueryInput>(&bytes) {
                    Ok(input) => engine.handle_query(input).await,
                    Err(e) => QueryOutput::failure(format!("invalid query body: {}", e)),
                },
                Err(e) => QueryOutput::failure(format!("failed to read request body: {}", e)),
            };
            Ok(json_response(&output))
        }
        _ => {
            let mut response = Response::new(Body::from("not found"));
            *response.status_mut() = StatusCode::NOT_FOUND;
            Ok(response)
        }
    }
}

fn json_response(output: &QueryOutput) -> Response<Body> {
    match serde_json::to_vec(output) {
        Ok(body) => Response::builder()
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::empty())),
        Err(e) => {
            error!("Failed to serialize query output: {}", e);
            let mut response = Response::new(Body::from("serialization error"));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}
