use std::io;

use actix_web::{middleware, web, App, HttpServer};
use log::{info, warn};

use dedup_drive::api;
use dedup_drive::app_state::AppState;
use dedup_drive::config::AppConfig;

#[actix_web::main]
async fn main() -> io::Result<()> {
    let config = AppConfig::load().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    if let Err(e) = log4rs::init_file(&config.logging.config_file, Default::default()) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
        warn!("Could not load {}: {}; logging to stderr", config.logging.config_file, e);
    }

    let app_state = AppState::from_config(config.clone())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    if config.sweeper.enabled {
        app_state.vault.sweeper(&config.sweeper).start_background();
    }

    let bind = (config.server.host.clone(), config.server.port);
    info!("Starting server on {}:{}", bind.0, bind.1);

    let data = web::Data::new(app_state);
    let max_file_size = config.upload.max_file_size as usize;
    let max_payload_size = config.server.max_payload_size as usize;

    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(data.clone())
            .app_data(web::PayloadConfig::default().limit(max_file_size))
            .app_data(web::JsonConfig::default().limit(max_payload_size))
            .configure(api::configure)
    })
    .workers(config.server.workers.max(1))
    .bind(bind)?
    .run()
    .await
}
