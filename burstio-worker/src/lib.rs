//! burstio worker
//!
//! A worker owns one queue and one staging directory. It:
//! - Moves cached chunks into staging (`Write`)
//! - Serves reads of staged or parallel file system ranges (`Read`)
//! - Writes chunks back to the parallel file system (`Flush`)
//! - Removes released staged chunks (`Delete`)
//! - Prefetches parallel file system ranges (`Stage`)
//! - Publishes its score and free capacity for the schedulers

pub mod io_client;
pub mod score;
pub mod staging;
pub mod worker;

pub use io_client::{IoClient, IoClients, PosixClient, StdioClient};
pub use score::{bucket_score, ScoreInputs, POLICY_WEIGHTS};
pub use staging::Staging;
pub use worker::{PublishedStatus, Worker};
