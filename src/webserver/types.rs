use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::Json;
use std::borrow::Cow;

pub(crate) trait ApiResponse: erased_serde::Serialize {}
erased_serde::serialize_trait_object!(ApiResponse);

/// Every endpoint exposes a Response type
#[derive(serde::Serialize)]
#[serde(untagged)]
#[non_exhaustive]
pub(crate) enum Response<'a> {
    Ok(Box<dyn erased_serde::Serialize + Send + Sync + 'static>),
    Error(EndpointError<'a>),
}

impl<T: ApiResponse + Send + Sync + 'static> From<T> for Response<'static> {
    fn from(value: T) -> Self {
        Self::Ok(Box::new(value))
    }
}

/// The response upon encountering an error
#[derive(serde::Serialize, PartialEq, Eq, Debug)]
pub struct EndpointError<'a> {
    /// The kind of this error
    kind: ErrorKind,

    /// A context aware message describing the error
    message: Cow<'a, str>,
}

/// The kind of an error
#[derive(serde::Serialize, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorKind {
    User,
    Unknown,
    NotFound,
    Configuration,
    UpstreamService,
    Internal,
}

#[derive(Debug)]
pub struct Error {
    status: StatusCode,
    body: EndpointError<'static>,
}

impl Error {
    fn new(kind: ErrorKind, status: StatusCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            body: EndpointError {
                kind,
                message: message.into(),
            },
        }
    }

    pub fn user(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::User, StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::NotFound, StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Internal, StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn upstream(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::UpstreamService, StatusCode::BAD_GATEWAY, message)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> AxumResponse {
        (self.status, Json(Response::Error(self.body))).into_response()
    }
}

impl From<crate::chat::db::ChatDbError> for Error {
    fn from(error: crate::chat::db::ChatDbError) -> Self {
        use crate::chat::db::ChatDbError;
        match &error {
            ChatDbError::ChatNotFound(_) | ChatDbError::MessageNotFound(_) => {
                Error::not_found(error.to_string())
            }
            _ => Error::internal(error.to_string()),
        }
    }
}

impl From<crate::search::client::SearchError> for Error {
    fn from(error: crate::search::client::SearchError) -> Self {
        Error::upstream(error.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::user(format!("malformed request payload: {}", error))
    }
}

impl From<llm_client::clients::types::LLMClientError> for Error {
    fn from(error: llm_client::clients::types::LLMClientError) -> Self {
        Error::upstream(error.to_string())
    }
}

pub(crate) fn json<'a, T>(val: T) -> Json<Response<'a>>
where
    Response<'a>: From<T>,
{
    Json(Response::from(val))
}

pub(crate) type Result<T> = std::result::Result<T, Error>;
