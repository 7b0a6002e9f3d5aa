use clap::Parser;
pub use controller::*;
use tracing_subscriber::{EnvFilter, Registry, prelude::*};

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer, Responder, get, middleware,
    web::Data,
};

#[get("/metrics")]
async fn metrics(c: Data<Manager>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    HttpResponse::Ok()
        .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
        .body(metrics)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<Manager>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let params = config::Parameters::parse();

    // Setup tracing layers
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let collector = Registry::default().with(env_filter);
    if params.log_json {
        tracing::subscriber::set_global_default(collector.with(tracing_subscriber::fmt::layer().json()))?;
    } else {
        tracing::subscriber::set_global_default(collector.with(tracing_subscriber::fmt::layer()))?;
    }

    // Start kubernetes controllers
    let (manager, controller_machines, controller_images) = Manager::new(&params).await?;

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(manager.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&params.listen)?
    .shutdown_timeout(5);

    tokio::select! {
        _ = controller_machines => tracing::warn!("IBMVPCMachine controller exited"),
        _ = controller_images => tracing::warn!("IBMPowerVSImage controller exited"),
        _ = server.run() => tracing::info!("actix exited"),
    }
    Ok(())
}
