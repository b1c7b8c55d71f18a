use std::convert::Infallible;

use rocket::{
    request::{FromRequest, Outcome},
    Request, Route,
};

use crate::admission::TrafficClass;
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;

mod elections;
mod votes;

pub fn routes() -> Vec<Route> {
    let mut routes = Vec::new();
    routes.extend(votes::routes());
    routes.extend(elections::routes());
    routes
}

/// Identity used to rate limit requests that carry no voter ID: the client's
/// address, or a shared anonymous bucket if it cannot be determined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

pub const ANONYMOUS: &str = "anonymous";

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIdentity {
    type Error = Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let identity = req
            .client_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| ANONYMOUS.to_string());
        Outcome::Success(ClientIdentity(identity))
    }
}

/// Charge one request of the given class to `identity`.
fn admit(pipeline: &Pipeline, class: TrafficClass, identity: &str) -> Result<()> {
    let decision = pipeline.admission.try_admit(class, identity);
    if decision.allowed {
        Ok(())
    } else {
        Err(Error::RateLimited {
            retry_after_secs: decision.retry_after_secs,
        })
    }
}
