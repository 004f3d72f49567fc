use actix_web::{middleware::Logger, web, App, HttpServer};
use duelbook_server::app::Engine;
use duelbook_server::config::{self, Backend};
use duelbook_server::{http, metrics};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let settings = config::settings().clone();
    let server_addr = settings.server_addr.clone();

    let engine = match settings.backend {
        Backend::Memory => {
            log::warn!("running with in-memory backends, state is lost on exit");
            Engine::in_memory(settings).0
        }
        Backend::External => Engine::connect(settings)
            .await
            .map_err(|e| std::io::Error::other(format!("{e:#}")))?,
    };

    // Background workers and repeat scheduler
    let workers = engine.spawn_workers();
    log::info!("started {} worker tasks, listening on {server_addr}", workers.len());

    let data = engine.clone();
    let served = HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(metrics::METRICS.clone())
            .app_data(web::Data::new(data.clone()))
            .configure(http::routes::init_routes)
    })
    .bind(&server_addr)?
    .run()
    .await;

    workers.shutdown().await;
    served
}
