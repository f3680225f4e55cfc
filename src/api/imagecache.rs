use std::io::{Cursor, SeekFrom};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use rocket::http::{ContentType, Header, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::response::{self, Responder, Response};
use rocket::State;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::api::ApiError;
use crate::cache::{CacheState, ImageCache};
use crate::images::tools;

// Larger files are streamed from disk instead of read into memory
const STREAM_THRESHOLD: u64 = 4 * 1024 * 1024;
const ETAG_LENGTH: usize = 64;
const MAX_AGE_SECS: i64 = 31_536_000;
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Host of the page that embedded the image, when the browser says.
pub struct RefererHost(Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RefererHost {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let host = req
            .headers()
            .get_one("Referer")
            .and_then(|referer| Url::parse(referer).ok())
            .and_then(|referer| referer.host_str().map(str::to_string));

        Outcome::Success(RefererHost(host))
    }
}

#[get("/imagecache?<image>&<hash>")]
pub async fn serve_image(
    image: Option<String>,
    hash: Option<String>,
    referer: RefererHost,
    cache: &State<ImageCache>,
) -> Result<ImageResponse, ApiError> {
    let (image, hash) = match (image, hash) {
        (Some(image), Some(hash)) => (image.trim().to_string(), hash.trim().to_string()),
        _ => return Err(ApiError::Rejected),
    };
    if image.is_empty() || hash.is_empty() {
        return Err(ApiError::Rejected);
    }

    let key = cache.key_for(&image);
    if key != hash {
        log::debug!("Rejected image request with a bad hash for {}", image);
        return Err(ApiError::Rejected);
    }

    if !cache.blobs().exists(&key) {
        log::debug!("No cached file for {}, forgetting entry", key);
        if let Err(e) = cache.index().delete_entry(&key) {
            log::error!("Failed to forget image cache entry {}: {}", key, e);
        }
        return Err(ApiError::Rejected);
    }

    if let RefererHost(Some(host)) = &referer {
        let own_host = cache.site().host_str().unwrap_or_default();
        if !host.eq_ignore_ascii_case(own_host) {
            log::debug!("Rejected hotlink of {} from {}", key, host);
            return Err(ApiError::Rejected);
        }
    }

    let state = cache.access(&image).await;
    ImageResponse::open(cache, key, state).await
}

enum ImageBody {
    Bytes(Vec<u8>),
    File(tokio::fs::File),
}

// Responder for a cached image file
pub struct ImageResponse {
    key: String,
    body: ImageBody,
    len: u64,
    modified: SystemTime,
    content_type: &'static str,
    // Placeholders must not stick in browser caches
    cacheable: bool,
}

impl ImageResponse {
    async fn open(cache: &ImageCache, key: String, state: CacheState) -> Result<Self, ApiError> {
        let path = cache.blob_path(&key);

        // Size and mtime must describe the handle that is served
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ApiError::Rejected),
            Err(e) => return Err(e.into()),
        };
        let metadata = file.metadata().await?;
        let modified = metadata.modified()?;

        let (body, len, content_type) = if metadata.len() > STREAM_THRESHOLD {
            let mut head = [0u8; 12];
            let read = file.read(&mut head).await?;
            file.seek(SeekFrom::Start(0)).await?;

            (ImageBody::File(file), metadata.len(), tools::detect_image_type(&head[..read]))
        } else {
            let mut data = Vec::with_capacity(metadata.len() as usize);
            file.read_to_end(&mut data).await?;
            let content_type = tools::detect_image_type(&data);

            (ImageBody::Bytes(data), metadata.len(), content_type)
        };

        Ok(Self {
            key,
            body,
            len,
            modified,
            content_type,
            cacheable: state.is_cached(),
        })
    }

    fn modified_secs(&self) -> u64 {
        self.modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }

    fn etag(&self) -> String {
        let seed = format!("{}{}", self.key, self.modified_secs());
        let seed: String = seed.chars().take(ETAG_LENGTH).collect();
        format!("\"{}\"", seed)
    }

    fn is_not_modified(&self, req: &Request<'_>, etag: &str) -> bool {
        let since = req
            .headers()
            .get_one("If-Modified-Since")
            .and_then(|value| DateTime::parse_from_rfc2822(value).ok());
        if let Some(since) = since {
            if since.timestamp() >= self.modified_secs() as i64 {
                return true;
            }
        }

        req.headers()
            .get("If-None-Match")
            .any(|value| value.contains(etag))
    }
}

impl<'r> Responder<'r, 'static> for ImageResponse {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let etag = self.etag();

        if self.cacheable && self.is_not_modified(req, &etag) {
            return Response::build()
                .status(Status::NotModified)
                .header(Header::new("ETag", etag))
                .header(Header::new("Cache-Control", format!("max-age={}, private", MAX_AGE_SECS)))
                .ok();
        }

        let content_type = match self.content_type {
            "image/jpeg" => ContentType::JPEG,
            "image/png" => ContentType::PNG,
            "image/gif" => ContentType::GIF,
            "image/webp" => ContentType::new("image", "webp"),
            "image/bmp" => ContentType::new("image", "bmp"),
            _ => ContentType::JPEG,
        };
        let last_modified = DateTime::<Utc>::from(self.modified).format(HTTP_DATE).to_string();

        let mut response = Response::build();
        response
            .header(content_type)
            .header(Header::new("Content-Disposition", "inline"))
            .header(Header::new("Last-Modified", last_modified))
            .header(Header::new("Accept-Ranges", "bytes"));

        if self.cacheable {
            let expires = (Utc::now() + Duration::seconds(MAX_AGE_SECS)).format(HTTP_DATE).to_string();
            response
                .header(Header::new("ETag", etag))
                .header(Header::new("Cache-Control", format!("max-age={}, private", MAX_AGE_SECS)))
                .header(Header::new("Expires", expires));
        }

        let len = usize::try_from(self.len).ok();
        match self.body {
            ImageBody::Bytes(data) => response.sized_body(data.len(), Cursor::new(data)),
            ImageBody::File(file) => response.sized_body(len, file),
        };

        response.ok()
    }
}
