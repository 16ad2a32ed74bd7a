#[macro_use]
extern crate rocket;

mod api;
mod app_state;
mod beam;
mod config;
mod engine;
mod error;
mod logging;
mod preprocess;
mod types;

use std::sync::Arc;

use anyhow::Context;
use rocket::figment::Figment;
use rocket::{Build, Rocket};

use api::{caption, caption_without_form, default_catcher, health, index};
use app_state::AppState;
use config::CaptionConfig;
use engine::BlipEngine;

pub fn build_rocket(figment: Figment, state: Arc<AppState>) -> Rocket<Build> {
    rocket::custom(figment)
        .manage(state)
        .mount(
            "/",
            routes![
                index,
                health,
                caption,
                caption_without_form,
            ],
        )
        .register("/", catchers![default_catcher])
}

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    let figment = config::figment();
    let config = CaptionConfig::from_figment(&figment).context("invalid configuration")?;
    logging::init_logging(&config.log_filter);

    // The model must be ready before the listener exists.
    tracing::info!(model = %config.served_model(), "loading caption model");
    let engine = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || BlipEngine::load(&config))
            .await
            .context("model loader panicked")?
            .context("failed to load caption model")?
    };

    let state = AppState::new(engine);
    build_rocket(figment, state)
        .launch()
        .await
        .map_err(|e| anyhow::anyhow!("server error: {e}"))?;

    Ok(())
}
