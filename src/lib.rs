pub mod bounce;
pub mod config;
pub mod delivery;
pub mod detection;
pub mod disposition;
pub mod domain_utils;
pub mod error_log;
pub mod fingerprint;
pub mod message;
pub mod pipeline;
pub mod quarantine;
pub mod recipient;
pub mod retry;
pub mod statistics;
pub mod store;
pub mod sync;

pub use config::Config;
pub use disposition::{Action, DispositionRouter};
pub use message::ParsedMessage;
pub use pipeline::{Pipeline, PipelineError, ProcessOutcome, Supervisor};
pub use statistics::{StatEvent, StatisticsCollector};
