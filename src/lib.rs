pub mod authres;
pub mod config;
pub mod context;
pub mod control;
pub mod dns;
pub mod handler;
pub mod handlers;
pub mod metrics;
pub mod milter;
pub mod pipeline;
pub mod smtp;
pub mod supervisor;

pub use authres::Fragment;
pub use config::{Config, ListenerSpec, Protocol};
pub use context::{Disposition, SessionContext};
pub use handler::{Handler, HandlerError, Stage};
pub use pipeline::Pipeline;
