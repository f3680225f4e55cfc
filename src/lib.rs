#[macro_use]
extern crate rocket;

pub mod api;
pub mod cache;
pub mod config;
pub mod embed;
pub mod images;

use std::sync::Arc;
use std::time::Duration;

use log::info;
use rocket::fairing::AdHoc;
use rocket::figment::Figment;
use rocket::{Build, Rocket};
use thiserror::Error;

use cache::{BlobStore, CacheError, CacheIndex, ExpirySweeper, ImageCache, SweepScheduler};
use config::{AppConfig, SettingsStore};
use images::{tools, Downloader, ImageProxyError, Pipeline};

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Cache setup failed: {0}")]
    Cache(#[from] CacheError),

    #[error("Image setup failed: {0}")]
    Image(#[from] ImageProxyError),
}

/// Assembles the server: index, settings, blob store, fetch pipeline, the
/// expiry task and every route.
pub fn build_rocket(
    figment: Figment,
    config: AppConfig,
    downloader: Arc<dyn Downloader>,
) -> Result<Rocket<Build>, StartupError> {
    let index = Arc::new(CacheIndex::open(&config.database_path)?);
    info!("Image cache index opened at {}", config.database_path.display());

    let settings = Arc::new(SettingsStore::load(index.clone(), config.default_settings())?);
    let blobs = BlobStore::new(&config.cache_dir)?;
    info!("Image cache files stored in {}", blobs.dir().display());

    let placeholder = tools::load_placeholder(config.placeholder_path.as_deref())?;
    let pipeline = Pipeline::new(downloader, blobs.clone(), placeholder);
    let image_cache = ImageCache::new(&config, index.clone(), pipeline, settings.clone())?;

    let sweeper = Arc::new(ExpirySweeper::new(index, blobs));
    let scheduler = SweepScheduler::new(
        sweeper,
        settings,
        Duration::from_secs(config.sweep_interval_secs),
    );

    if config.admin_token.as_deref().map_or(true, str::is_empty) {
        info!("No admin token configured, admin routes are closed");
    }

    Ok(rocket::custom(figment)
        .attach(AdHoc::on_liftoff("Image cache sweeper", |rocket| {
            Box::pin(async move {
                if let (Some(scheduler), Some(cache)) =
                    (rocket.state::<SweepScheduler>(), rocket.state::<ImageCache>())
                {
                    scheduler.sync_with(cache.settings().get().enabled);
                }
            })
        }))
        .manage(image_cache)
        .manage(scheduler)
        .manage(config)
        .mount("/", routes![api::imagecache::serve_image])
        .mount(
            "/admin/imagecache",
            routes![
                api::admin::get_settings,
                api::admin::update_settings,
                api::admin::clean,
                api::admin::sweep,
                api::admin::render,
            ],
        )
        .register("/admin/imagecache", catchers![api::admin::unauthorized]))
}
