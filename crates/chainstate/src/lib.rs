//! Block index, coin database and the hybrid proof-of-work/proof-of-stake
//! chain state machine.

pub mod chain;
pub mod chaindb;
pub mod clock;
pub mod coins;
pub mod deployment;
pub mod entry;
pub mod error;
pub mod events;
pub mod kernel;
pub mod metrics;
pub mod options;
pub mod orphans;
pub mod validation;

pub use chain::Chain;
pub use chaindb::{ChainDb, ResetTarget};
pub use clock::{Clock, FixedClock, SystemClock};
pub use coins::{BlockUndo, Coin, CoinView};
pub use deployment::DeploymentState;
pub use entry::ChainEntry;
pub use error::{ChainError, KernelError, VerifyError, VerifyErrorKind};
pub use events::{ChainEvent, EventBus};
pub use kernel::{Kernel, StakeProof};
pub use metrics::{ConnectMetrics, ConnectMetricsSnapshot};
pub use options::ChainOptions;
pub use validation::ValidationFlags;
