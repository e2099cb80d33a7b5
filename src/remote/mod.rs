//! Out-of-process execution.
//!
//! A [`RemoteHostRun`] binds a Unix domain socket, launches
//! `run-orchestrator client --pipe <socket>` and streams the serialized model
//! system to it. The worker process runs [`serve`], which executes the model
//! system through a [`RemoteClientRun`] and reports back over the
//! [`protocol`].

mod client;
mod host;
pub mod protocol;
mod session;


pub use client::RemoteClientRun;
pub use host::RemoteHostRun;
pub use session::serve;
