use http::StatusCode;
use quick_xml::Writer;
use quick_xml::events::BytesText;
use std::io::Cursor;

/// Engine-level error taxonomy. Adapters pattern-match the variant to
/// produce wire codes; anything outside the closed set is wrapped in `Io`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("The specified bucket, object, upload, or part does not exist")]
    NotFound,
    #[error("The target already exists")]
    AlreadyExists,
    #[error("Access Denied")]
    PermissionDenied,
    #[error("The operation is not supported by this backend")]
    Unsupported,
    #[error("Invalid argument: {0}")]
    InvalidInput(String),
    #[error("The operation was cancelled")]
    Cancelled,
    #[error("Internal server error")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound,
            std::io::ErrorKind::AlreadyExists => StoreError::AlreadyExists,
            std::io::ErrorKind::PermissionDenied => StoreError::PermissionDenied,
            _ => StoreError::Io(err),
        }
    }
}

impl StoreError {
    pub fn code(&self) -> &str {
        match self {
            StoreError::NotFound => "NoSuchKey",
            StoreError::AlreadyExists => "BucketAlreadyExists",
            StoreError::PermissionDenied => "AccessDenied",
            StoreError::Unsupported => "NotImplemented",
            StoreError::InvalidInput(_) => "InvalidArgument",
            StoreError::Cancelled => "OperationAborted",
            StoreError::Io(_) => "InternalError",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            StoreError::NotFound => StatusCode::NOT_FOUND,
            StoreError::AlreadyExists => StatusCode::CONFLICT,
            StoreError::PermissionDenied => StatusCode::FORBIDDEN,
            StoreError::Unsupported => StatusCode::NOT_IMPLEMENTED,
            StoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            StoreError::Cancelled => StatusCode::BAD_REQUEST,
            StoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// S3-style XML error body for the XML/HTTP surface.
    pub fn to_xml(&self) -> String {
        self.log_internal();
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer
            .create_element("Error")
            .write_inner_content(|w| {
                w.create_element("Code")
                    .write_text_content(BytesText::new(self.code()))?;
                w.create_element("Message")
                    .write_text_content(BytesText::new(&self.to_string()))?;
                Ok(())
            })
            .unwrap();
        let bytes = writer.into_inner().into_inner();
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>{}",
            String::from_utf8(bytes).unwrap()
        )
    }

    /// JSON error body for the JSON/HTTP surface.
    pub fn to_json(&self) -> String {
        self.log_internal();
        serde_json::json!({
            "statusCode": self.status_code().as_u16().to_string(),
            "error": self.code(),
            "message": self.to_string(),
        })
        .to_string()
    }

    // Log internal errors server-side but don't leak details to clients.
    fn log_internal(&self) {
        if let StoreError::Io(detail) = self {
            tracing::error!(detail = %detail, "Internal server error");
        }
    }
}
