#[macro_use]
extern crate rocket;

use std::env;
use std::sync::Arc;

use dotenv::dotenv;
use env_logger::Env;
use imgcache::config::AppConfig;
use imgcache::images::ImageProxy;
use log::{error, info};
use rocket::{
    figment::{
        providers::{Format, Toml},
        Figment, Profile,
    },
    Config,
};

#[launch]
async fn rocket() -> _ {
    dotenv().ok();

    // Load config
    let mut figment = Figment::from(Config::default()).merge(Toml::file("App.toml").nested());

    if let Ok(site_url) = env::var("IMAGECACHE_SITE_URL") {
        figment = figment.merge(("site_url", site_url));
    }

    if let Ok(token) = env::var("IMAGECACHE_ADMIN_TOKEN") {
        figment = figment.merge(("admin_token", token));
    }

    // Outbound proxy for image downloads, e.g. socks5://127.0.0.1:1080
    if let Ok(proxy) = env::var("IMAGECACHE_FETCH_PROXY") {
        figment = figment.merge(("fetch_proxy", proxy));
    }

    figment = figment.select(Profile::from_env_or("APP_PROFILE", "default"));

    // App config
    let config = figment.extract::<AppConfig>().unwrap();

    // Initialize logger
    env_logger::init_from_env(Env::default().default_filter_or("info"));
    info!("Configuration loaded successfully");

    let image_proxy = match ImageProxy::new(&config) {
        Ok(proxy) => proxy,
        Err(e) => {
            error!("Failed to create image downloader: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(proxy) = &config.fetch_proxy {
        info!("Image downloads go through {}", proxy);
    }

    info!(
        "Starting image cache for {} on {}:{}",
        config.site_url, config.address, config.port
    );

    match imgcache::build_rocket(figment, config, Arc::new(image_proxy)) {
        Ok(rocket) => rocket,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}
