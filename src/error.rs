//! Application error type.
//!
//! Library code returns [`AppResult`]; the HTTP layer turns an [`AppError`]
//! into a response (redirect to the login page, 400, 404 or 500).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read workbook: {0}")]
    WorkbookRead(#[from] calamine::XlsxError),

    #[error("failed to write workbook: {0}")]
    WorkbookWrite(#[from] rust_xlsxwriter::XlsxError),

    #[error("invalid JSON log: {0}")]
    Json(#[from] serde_json::Error),

    #[error("chart rendering failed: {0}")]
    Chart(String),

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("PDF export failed: {0}")]
    Pdf(String),

    #[cfg(feature = "web")]
    #[error("template rendering failed: {0}")]
    Template(#[from] handlebars::RenderError),

    #[cfg(feature = "web")]
    #[error("invalid template: {0}")]
    TemplateSyntax(#[from] handlebars::TemplateError),

    #[cfg(feature = "web")]
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("unknown site `{0}`")]
    UnknownSite(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("access denied")]
    Unauthorized,
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(feature = "web")]
impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        use axum::response::Redirect;

        match self {
            AppError::Unauthorized => Redirect::to("/login").into_response(),
            AppError::UnknownSite(_) | AppError::NotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string()).into_response()
            }
            AppError::Validation(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            other => {
                log::error!("request failed: {}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, "Erreur interne du serveur").into_response()
            }
        }
    }
}
