pub mod broker;
pub mod bus;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod filesync;
pub mod interfaces;
pub mod netinfo;
pub mod outbox;
pub mod rpc;
pub mod services;

pub use crate::broker::{BrokerConfig, BrokerMessenger};
pub use crate::bus::{EventBus, Subscription};
pub use crate::config::QueueConfig;
pub use crate::envelope::{Envelope, Target};
pub use crate::error::{FleetwireError, Result};
pub use crate::filesync::{SyncEndpoint, SyncReport, SyncRole, SyncSpec};
pub use crate::interfaces::messenger::{MessageListener, Messenger};
pub use crate::interfaces::scheduler::{Scheduler, TaskHandle};
pub use crate::outbox::QueuedMessenger;
pub use crate::rpc::{RpcClient, RpcError};
pub use crate::services::in_memory::InMemoryMessenger;
pub use crate::services::scheduler::TokioScheduler;
