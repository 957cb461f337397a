pub mod bus;
pub mod error;
pub mod fingerprint;
pub mod orchestrator;
pub mod poller;
pub mod scan;
pub mod testutil;
pub mod traits;

pub use bus::{NotificationBus, ScanEvent, Subscription};
pub use error::ScanError;
pub use fingerprint::Fingerprint;
pub use orchestrator::{OrchestratorConfig, ScanOrchestrator};
pub use poller::{PollConfig, PollScheduler};
pub use scan::{ScanRecord, ScanReport, ScanState};
pub use traits::{AggregatorClient, ResultStore};
