//! Orchestration layer: batch controllers, their actors, and the dispatcher
//! that routes inbound messages to them.

mod actor;
mod context;
mod controller;
mod dispatcher;
mod listener;
mod outlet;
mod publisher;
mod stats;

pub use actor::{BatchActor, BatchEvent, BatchHandle, Launch};
pub use context::{AttemptOutcome, ContextCoordinator};
pub use controller::{BatchController, BatchMeta, Handled, Timer, TimerEvent};
pub use dispatcher::Dispatcher;
pub use listener::{screen, Discard};
pub use outlet::Outlet;
pub use publisher::{DispatchOutcome, DispatchPublisher};
pub use stats::{DispatcherStats, StatsSnapshot};
