//! Task subsystem of the Quiver control plane: persisted task records with an
//! enforced status machine, plus the process-local queue dispatcher with
//! retry and cooperative cancellation.

pub mod dispatch;
pub mod memory;
pub mod retry;
pub mod store;

pub use dispatch::{Actor, ActorContext, Dispatcher};
pub use memory::InMemoryTaskStore;
pub use retry::RetryPolicy;
pub use store::PgTaskStore;
