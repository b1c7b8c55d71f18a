use std::io::Cursor;

use log::{debug, error};
use rocket::{
    http::{Header, Status},
    response::{self, Responder},
    Request, Response,
};
use thiserror::Error;

use crate::model::InvalidVote;
use crate::notify::NotifyError;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    InvalidVote(#[from] InvalidVote),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
    #[error("Failed to encode metrics: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn status(&self) -> Status {
        match self {
            Self::InvalidVote(_) | Self::BadRequest(_) => Status::BadRequest,
            Self::RateLimited { .. } => Status::TooManyRequests,
            Self::NotFound(_) => Status::NotFound,
            Self::Store(_) | Self::Notify(_) | Self::Metrics(_) => Status::InternalServerError,
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'o> {
        let status = self.status();
        if status == Status::InternalServerError {
            error!("{self}");
        } else {
            debug!("{self}");
        }

        let message = self.to_string();
        let mut response = Response::build();
        response
            .status(status)
            .sized_body(message.len(), Cursor::new(message));
        if let Self::RateLimited { retry_after_secs } = self {
            response.header(Header::new("Retry-After", retry_after_secs.to_string()));
        }
        Ok(response.finalize())
    }
}
