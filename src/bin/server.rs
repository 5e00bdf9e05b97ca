use std::sync::Arc;

use actix_web::{App, HttpResponse, HttpServer, Responder};
use skyrelay::{
    call::CallOrchestrator,
    config::ServerConfig,
    signaling::{endpoint::SignalingEndpoint, room::RoomRegistry},
};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();
    let orchestrator = Arc::new(CallOrchestrator::new(&config).map_err(std::io::Error::other)?);
    let rooms = Arc::new(RoomRegistry::new());
    let endpoint = SignalingEndpoint::new(orchestrator.clone(), rooms);

    tracing::info!("Listening on {}", config.bind_addr);
    HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .service(index)
            .configure(|cfg| endpoint.clone().configure(cfg))
    })
    .bind(&config.bind_addr)?
    .run()
    .await?;

    orchestrator.close_all().await;
    Ok(())
}

#[actix_web::get("/")]
async fn index() -> impl Responder {
    HttpResponse::Ok().body("healthy")
}
