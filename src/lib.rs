pub mod bucket;
pub mod config;
pub mod discovery;
pub mod envelope;
pub mod inbound;
pub mod locale;
pub mod mailbox;
pub mod pipeline;
pub mod psinet;
pub mod record;
pub mod redact;
pub mod relay;
pub mod sanitize;
pub mod store;
pub mod template;
pub mod transform;
pub mod translate;
pub mod worker;
pub mod workers;

pub use config::{Config, Recipients, Secret};
pub use envelope::{Envelope, EnvelopeError, EnvelopeKey};
pub use pipeline::{IngestError, Pipeline};
pub use record::DiagnosticRecord;
pub use store::Datastore;
pub use worker::{run_worker, TickOutcome, Worker};
