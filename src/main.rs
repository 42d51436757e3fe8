mod proxy;
mod telemetry;

use std::io;
use std::sync::Arc;

use actix_web::{get, web, App, HttpResponse, HttpServer, Responder};
use tracing::info;
use tracing_actix_web::TracingLogger;

use crate::proxy::{ProxyConfig, ProxyHandler, ReqwestForwarder};

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

#[tokio::main]
async fn main() -> io::Result<()> {
    // Tracing is best-effort; only a broken log subscriber stops startup
    let telemetry = telemetry::init().await.map_err(io::Error::other)?;

    let config = ProxyConfig::from_env()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let forwarder = ReqwestForwarder::new(config.force_ipv4).map_err(io::Error::other)?;

    let handler = web::Data::new(ProxyHandler::new(
        config.backend_url.as_str(),
        Arc::new(forwarder),
        telemetry.tracer(),
        telemetry.propagator(),
    ));

    telemetry::shutdown_on_signal(telemetry.clone());

    info!(
        port = config.port,
        mount = %config.mount,
        backend = %config.backend_url,
        "Starting proxy"
    );

    let mount = config.mount.clone();
    let max_body_bytes = config.max_body_bytes;
    let result = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(handler.clone())
            .app_data(web::PayloadConfig::new(max_body_bytes))
            .service(health)
            .service(proxy::route::scope(&mount))
    })
    .bind(("0.0.0.0", config.port))?
    .run()
    .await;

    telemetry.shutdown().await;
    result
}
