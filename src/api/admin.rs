use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket::State;
use serde::{Deserialize, Serialize};

use crate::api::ApiError;
use crate::cache::{CleanStats, ImageCache, IndexStats, SweepScheduler, SweepStats};
use crate::config::{AppConfig, ImageCacheSettings, SettingsUpdate};
use crate::embed::RenderPass;

pub const TOKEN_HEADER: &str = "X-Admin-Token";

/// Proof that the request carried the configured admin token.
pub struct AdminToken;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminToken {
    type Error = ApiError;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let expected = req
            .rocket()
            .state::<AppConfig>()
            .and_then(|config| config.admin_token.as_deref())
            .filter(|token| !token.is_empty());

        match (expected, req.headers().get_one(TOKEN_HEADER)) {
            (Some(expected), Some(given)) if expected == given => Outcome::Success(AdminToken),
            // No configured token closes the admin routes
            _ => Outcome::Error((Status::Unauthorized, ApiError::Unauthorized)),
        }
    }
}

#[catch(401)]
pub fn unauthorized() -> ApiError {
    ApiError::Unauthorized
}

#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    pub settings: ImageCacheSettings,
    pub stats: IndexStats,
    pub sweep_registered: bool,
}

fn settings_response(
    cache: &ImageCache,
    scheduler: &SweepScheduler,
) -> Result<Json<SettingsResponse>, ApiError> {
    let stats = cache.index().stats(cache.retry_policy().max_retry)?;

    Ok(Json(SettingsResponse {
        settings: cache.settings().get(),
        stats,
        sweep_registered: scheduler.is_registered(),
    }))
}

#[get("/settings")]
pub fn get_settings(
    _token: AdminToken,
    cache: &State<ImageCache>,
    scheduler: &State<SweepScheduler>,
) -> Result<Json<SettingsResponse>, ApiError> {
    settings_response(cache, scheduler)
}

#[put("/settings", data = "<update>")]
pub fn update_settings(
    _token: AdminToken,
    update: Json<SettingsUpdate>,
    cache: &State<ImageCache>,
    scheduler: &State<SweepScheduler>,
) -> Result<Json<SettingsResponse>, ApiError> {
    let toggled = update.enabled.is_some();
    let settings = cache.settings().update(update.into_inner())?;
    log::info!("Image cache settings updated: {:?}", settings);

    if toggled {
        scheduler.sync_with(settings.enabled);
    }

    settings_response(cache, scheduler)
}

#[post("/clean")]
pub async fn clean(_token: AdminToken, cache: &State<ImageCache>) -> Result<Json<CleanStats>, ApiError> {
    Ok(Json(cache.clean_all().await?))
}

#[post("/sweep")]
pub async fn sweep(
    _token: AdminToken,
    cache: &State<ImageCache>,
    scheduler: &State<SweepScheduler>,
) -> Result<Json<SweepStats>, ApiError> {
    let keep_days = cache.settings().get().keep_days;
    Ok(Json(scheduler.sweep_now(keep_days).await?))
}

#[derive(Debug, Deserialize)]
pub struct RenderRequest {
    pub html: String,
}

#[derive(Debug, Serialize)]
pub struct RenderResponse {
    pub html: String,
    pub needs_loader: bool,
}

#[post("/render", data = "<request>")]
pub async fn render(
    _token: AdminToken,
    request: Json<RenderRequest>,
    cache: &State<ImageCache>,
) -> Json<RenderResponse> {
    let mut pass = RenderPass::new(cache);
    let html = pass.rewrite(&request.html).await;

    Json(RenderResponse {
        html,
        needs_loader: pass.needs_loader(),
    })
}
