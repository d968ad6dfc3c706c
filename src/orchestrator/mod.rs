pub mod dispatcher;
pub mod invoker;

pub use dispatcher::Dispatcher;
pub use invoker::{
    CommandInvoker, OutcomeStatus, PhaseInvocation, PhaseInvoker, PhaseOutcome, parse_findings,
};
