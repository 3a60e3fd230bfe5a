//! Host side: spawn a worker per call and settle one outcome.

mod invoker;
pub mod options;
pub mod process;
mod settle;

pub use invoker::{Invoker, create_invoker};
pub use options::InvokerOptions;
pub use process::{ProcessEvent, ProcessHandle};
pub use settle::Outcome;
