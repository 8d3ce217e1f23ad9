use actix_cors::Cors;
use actix_web::{App, HttpServer, http::header, web};
use fundus_backend::config::{AppConfig, DEFAULT_CONFIG_PATH};
use fundus_backend::model::{self, ModelSlot};
use fundus_backend::pipeline::Pipeline;
use fundus_backend::routes::{UploadLimit, configure_routes};
use std::env;
use std::path::PathBuf;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    } else {
        log::error!("Failed to get the current working directory.");
    }

    let config_path = env::var("FUNDUS_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = AppConfig::load(&config_path).map_err(|e| {
        log::error!("Configuration error: {}", e);
        std::io::Error::other(e.to_string())
    })?;

    // The server answers health checks while the weights load.
    let slot = ModelSlot::new();
    let loader_slot = slot.clone();
    let model_config = config.model.clone();
    actix_web::rt::task::spawn_blocking(move || {
        log::info!(
            "Loading {:?} model from {}",
            model_config.backend,
            model_config.weights_path.display()
        );
        match model::load(&model_config) {
            Ok(model) => {
                let name = model.metadata().name.clone();
                if loader_slot.fill(model) {
                    log::info!("Model {} ready", name);
                }
            }
            Err(e) => log::error!("Failed to load model: {}. Serving in degraded mode", e),
        }
    });

    let pipeline = Pipeline::new(&config, slot);
    let upload_limit = UploadLimit(config.server.max_upload_bytes);
    let origins = config.server.cors_origins.clone();
    let bind_address = (config.server.host.clone(), config.server.port);

    log::info!("Starting server on {}:{}", bind_address.0, bind_address.1);

    HttpServer::new(move || {
        let cors = if origins.is_empty() {
            Cors::default().allow_any_origin()
        } else {
            origins
                .iter()
                .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
        };
        App::new()
            .wrap(
                cors.allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![header::ACCEPT, header::CONTENT_TYPE])
                    .max_age(3600),
            )
            .app_data(web::Data::new(pipeline.clone()))
            .app_data(web::Data::new(upload_limit))
            .configure(configure_routes)
    })
    .bind(bind_address)?
    .run()
    .await
}
