use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};

pub use interoperator::{self, controllers::Overrides, telemetry, State};

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Namespace holding SFService and SFPlan objects and the config map
    #[arg(long = "namespace", env = "POD_NAMESPACE", default_value = "default")]
    namespace: String,

    #[arg(
        long = "config-map",
        env = "INTEROPERATOR_CONFIG_MAP",
        default_value = "interoperator-config"
    )]
    config_map: String,

    #[arg(long = "instance-workers", env = "INSTANCE_WORKER_COUNT")]
    instance_workers: Option<u16>,

    #[arg(long = "binding-workers", env = "BINDING_WORKER_COUNT")]
    binding_workers: Option<u16>,

    #[arg(long = "error-threshold", env = "ERROR_THRESHOLD")]
    error_threshold: Option<u32>,
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&metrics, &mut buffer).unwrap();
    HttpResponse::Ok().body(buffer)
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init().await;

    let args: Arguments = Arguments::parse();

    // Initiatilize Kubernetes controller state
    let state = State::new(
        args.namespace,
        args.config_map,
        Overrides {
            instance_workers: args.instance_workers,
            binding_workers: args.binding_workers,
            error_threshold: args.error_threshold,
        },
    );
    let controller = interoperator::run(state.clone());
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind("0.0.0.0:8080")?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    tokio::join!(controller, server).1?;
    Ok(())
}
