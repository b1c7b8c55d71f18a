#[macro_use]
extern crate rocket;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use rocket::{Build, Rocket};

pub mod admission;
pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod processor;
pub mod replicator;
pub mod scheduled_task;
pub mod store;

use config::{BackgroundFairing, ConfigFairing, PipelineFairing};
use logging::LoggerFairing;
use pipeline::Pipeline;

/// Build the server: config, pipeline and background tasks are set up by
/// fairings as it ignites.
pub fn build() -> Rocket<Build> {
    rocket::build()
        .attach(LoggerFairing)
        .attach(ConfigFairing)
        .attach(PipelineFairing)
        .attach(BackgroundFairing::default())
        .mount("/", api::routes())
}

/// Build a server around an existing pipeline, without background tasks.
pub fn rocket_for_pipeline(pipeline: Pipeline) -> Rocket<Build> {
    rocket::build()
        .attach(LoggerFairing)
        .manage(pipeline)
        .mount("/", api::routes())
}

/// An in-memory pipeline with the example candidates and default config.
#[cfg(test)]
pub(crate) fn test_pipeline() -> Pipeline {
    use model::Candidate;

    Pipeline::in_memory(
        &config::Config::default(),
        [Candidate::example1(), Candidate::example2()],
    )
}
