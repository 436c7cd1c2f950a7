pub mod descriptor;
pub mod router;
pub mod waiter;

pub use descriptor::{CommandDescriptor, CommandHandler, SourceScope};
pub use router::{CommandContext, CommandRouter, RouteOutcome};
pub use waiter::{RegexOptions, WaitRegistry, WaitRequest, WaitResult};
