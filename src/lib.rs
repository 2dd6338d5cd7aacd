use std::future::Future;

use tokio_util::sync::CancellationToken;

pub mod config;
pub mod device;
pub mod document;
pub mod error;
pub mod fuzzer;
pub mod minimizer;
pub mod mutations;
pub mod protocol;
pub mod reference;
pub mod response;
pub mod seed_pool;
pub mod session;
pub mod testcase;
pub mod transport;
pub mod xml;

pub use config::FuzzConfig;
pub use device::{DeviceControl, DeviceController, HealthStatus, NoDevice};
pub use document::Document;
pub use error::FuzzError;
pub use fuzzer::{PrinterFuzzer, Stage};
pub use minimizer::{Minimizer, MinimizeOutcome};
pub use protocol::Protocol;
pub use reference::Reference;
pub use transport::{TcpTransport, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzingStats {
    pub rounds: u64,
    pub seeds: usize,
    pub crashes: u64,
    pub stage: Stage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The target accepted the request; `novel` when it became a seed.
    Ok { novel: bool },
    /// The target rejected the request.
    Invalid,
    /// Survival or health probing failed after the round.
    Crash(String),
    /// Mutation produced nothing worth sending.
    Skipped,
}

pub trait FuzzTarget {
    fn init(&mut self) -> impl Future<Output = Result<(), FuzzError>>;

    fn run(
        &mut self,
        shutdown: CancellationToken,
    ) -> impl Future<Output = Result<FuzzingStats, FuzzError>>;
}
