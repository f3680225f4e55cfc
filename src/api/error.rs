use crate::cache::CacheError;
use crate::images::ImageProxyError;
use rocket::http::Status;
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    // Empty 403, no detail
    Rejected,
    Unauthorized,
    Internal(String),
}

impl From<CacheError> for ApiError {
    fn from(error: CacheError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

impl From<ImageProxyError> for ApiError {
    fn from(error: ImageProxyError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(error: std::io::Error) -> Self {
        ApiError::Internal(error.to_string())
    }
}

impl<'r> rocket::response::Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        match self {
            ApiError::Rejected => rocket::Response::build()
                .status(Status::Forbidden)
                .sized_body(None, std::io::Cursor::new(Vec::new()))
                .ok(),
            ApiError::Unauthorized => {
                let body = json!({
                    "error": "Unauthorized",
                    "message": "A valid admin token is required"
                })
                .to_string();

                rocket::Response::build()
                    .status(Status::Unauthorized)
                    .header(rocket::http::ContentType::JSON)
                    .sized_body(None, std::io::Cursor::new(body))
                    .ok()
            }
            ApiError::Internal(message) => {
                log::error!("Request failed: {}", message);
                let body = json!({
                    "error": "Internal error",
                    "message": message
                })
                .to_string();

                rocket::Response::build()
                    .status(Status::InternalServerError)
                    .header(rocket::http::ContentType::JSON)
                    .sized_body(None, std::io::Cursor::new(body))
                    .ok()
            }
        }
    }
}
