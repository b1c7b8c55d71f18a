use std::sync::Mutex;
use std::time::Duration;

use log::{error, info};
use mongodb::Client as MongoClient;
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Orbit, Rocket,
};
use serde::Deserialize;

use crate::admission::AdmissionConfig;
use crate::model::Candidate;
use crate::pipeline::{Background, Pipeline};
use crate::processor::ProcessorConfig;
use crate::store::{ensure_indexes_exist, FaultPolicy};

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. Every field has a default, so an empty
/// configuration runs a purely in-memory pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub admission: AdmissionConfig,
    pub processor: ProcessorConfig,
    /// Fault tolerance applied to each replicated store.
    pub stores: FaultPolicy,
    /// Fault tolerance applied to vote saves.
    pub vote_store: FaultPolicy,
    /// Seconds between resubmissions of every known election.
    pub replication_interval_secs: u64,
    /// Seconds between sweeps of idle rate buckets.
    pub sweep_interval_secs: u64,
    /// MongoDB connection string. Without one, all stores live in memory.
    pub db_uri: Option<String>,
    pub db_name: String,
    /// Candidates seeded into the in-memory candidate store.
    pub candidates: Vec<Candidate>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            processor: ProcessorConfig::default(),
            stores: FaultPolicy::default(),
            vote_store: FaultPolicy::for_votes(),
            replication_interval_secs: 300,
            sweep_interval_secs: 60,
            db_uri: None,
            db_name: "voting".to_string(),
            candidates: Vec::new(),
        }
    }
}

impl Config {
    pub fn replication_interval(&self) -> Duration {
        Duration::from_secs(self.replication_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// A fairing that loads the application config and puts it in managed state.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        // Manage the state.
        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// A fairing that builds the voting pipeline from the managed config,
/// connecting to MongoDB if a `db_uri` is set, and manages it.
/// Must be attached after [`ConfigFairing`].
pub struct PipelineFairing;

#[rocket::async_trait]
impl Fairing for PipelineFairing {
    fn info(&self) -> Info {
        Info {
            name: "Pipeline",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.state::<Config>() {
            Some(config) => config.clone(),
            None => {
                error!("Pipeline requires the application config");
                return Err(rocket);
            }
        };

        let pipeline = match &config.db_uri {
            None => {
                info!("No database configured, using in-memory stores");
                Pipeline::in_memory(&config, config.candidates.clone())
            }
            Some(db_uri) => {
                info!("Loaded database config, connecting...");
                let client = match MongoClient::with_uri_str(db_uri).await {
                    Ok(client) => client,
                    Err(e) => {
                        error!("Failed to connect to database: {e}");
                        return Err(rocket);
                    }
                };
                let db = client.database(&config.db_name);

                // Ensure the required indexes exist.
                if let Err(e) = ensure_indexes_exist(&db).await {
                    error!("Failed to connect to database: {e}");
                    return Err(rocket);
                }
                info!("...database connection online!");

                Pipeline::mongo(&config, client, &db)
            }
        };

        rocket = rocket.manage(pipeline);
        Ok(rocket)
    }
}

/// A fairing that runs the pipeline's background work between liftoff and
/// shutdown: the notification listener, the idle bucket sweep and periodic
/// replication.
#[derive(Default)]
pub struct BackgroundFairing {
    running: Mutex<Option<Background>>,
}

#[rocket::async_trait]
impl Fairing for BackgroundFairing {
    fn info(&self) -> Info {
        Info {
            name: "Background tasks",
            kind: Kind::Liftoff | Kind::Shutdown,
        }
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        let (Some(pipeline), Some(config)) = (rocket.state::<Pipeline>(), rocket.state::<Config>())
        else {
            error!("Background tasks need a managed pipeline and config");
            return;
        };
        let background = pipeline.start_background(config);
        if let Ok(mut running) = self.running.lock() {
            *running = Some(background);
        }
    }

    async fn on_shutdown(&self, rocket: &Rocket<Orbit>) {
        if let Some(pipeline) = rocket.state::<Pipeline>() {
            pipeline.processor.shutdown();
        }
        let background = self.running.lock().ok().and_then(|mut running| running.take());
        if let Some(background) = background {
            background.stop();
        }
    }
}
