use actix_web::{web, App, HttpServer};
use clap::Parser;

use arestor::config::Config;
use arestor::server::config_routes;
use arestor::util::{init_tracing, AppState};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Env file first so clap's env fallbacks can see it.
    init_tracing();
    let config = Config::parse();

    let state = web::Data::new(AppState::from_config(&config)?);
    tracing::info!("arestor listening on {}", config.bind_addr);

    HttpServer::new(move || App::new().app_data(state.clone()).configure(config_routes))
        .bind(&config.bind_addr)?
        .run()
        .await?;
    Ok(())
}
