//! Module-side SDK for switchyard.
//!
//! A module binary implements [`Module`], registers it in a
//! [`ModuleRegistry`] and hands control to [`serve`]:
//!
//! ```no_run
//! use switchyard_sdk::{InitContext, Module, Request, Response};
//!
//! #[derive(Default)]
//! struct Hello;
//!
//! impl Module for Hello {
//!     fn name(&self) -> String { "Hello".into() }
//!     fn init(&mut self, _ctx: InitContext) -> anyhow::Result<()> { Ok(()) }
//!     fn handle(&self, _req: Request) -> anyhow::Result<Response> {
//!         Ok(Response::text("hello"))
//!     }
//! }
//!
//! fn main() -> std::process::ExitCode {
//!     switchyard_sdk::serve_module::<Hello>("Hello")
//! }
//! ```

pub mod http;
pub mod module;
pub mod protocol;
pub mod registry;
pub mod runner;

pub use http::{Request, RequestUrl, Response};
pub use module::{InitContext, Module, ModuleLogger, SettingsSaver};
pub use protocol::{FailureStage, LogLevel, RemoteError};
pub use registry::{ModuleRegistry, ResolveError};
pub use runner::{serve, serve_module};
