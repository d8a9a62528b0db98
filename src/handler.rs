use crate::config::Config;
use crate::context::SessionContext;
use std::fmt;
use std::net::IpAddr;

/// Named events in the message-processing order. `Header` and `Body`
/// repeat per header line / body chunk; the rest fire at most once per
/// message (or connection, for `Connect`/`Helo`/`Close`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Connect,
    Helo,
    EnvFrom,
    EnvRcpt,
    Header,
    Eoh,
    Body,
    Eom,
    Abort,
    Close,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::Connect,
        Stage::Helo,
        Stage::EnvFrom,
        Stage::EnvRcpt,
        Stage::Header,
        Stage::Eoh,
        Stage::Body,
        Stage::Eom,
        Stage::Abort,
        Stage::Close,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Connect => "connect",
            Stage::Helo => "helo",
            Stage::EnvFrom => "envfrom",
            Stage::EnvRcpt => "envrcpt",
            Stage::Header => "header",
            Stage::Eoh => "eoh",
            Stage::Body => "body",
            Stage::Eom => "eom",
            Stage::Abort => "abort",
            Stage::Close => "close",
        };
        f.write_str(name)
    }
}

/// Typed error a handler callback may raise. Never propagates out of the
/// pipeline: the dispatcher reifies it as a `temperror` or `permerror`
/// fragment for the failing handler and carries on with the others.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("temporary failure: {0}")]
    Temp(String),
    #[error("permanent failure: {0}")]
    Perm(String),
}

impl HandlerError {
    pub fn result_token(&self) -> &'static str {
        match self {
            HandlerError::Temp(_) => "temperror",
            HandlerError::Perm(_) => "permerror",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            HandlerError::Temp(msg) | HandlerError::Perm(msg) => msg,
        }
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// A pluggable authentication module.
///
/// Implementations declare the stages they want and, per stage, ordering
/// constraints against peer handlers by name. Callbacks default to no-ops
/// so a handler only writes the stages it cares about.
pub trait Handler: Send {
    fn name(&self) -> &'static str;

    fn stages(&self) -> &'static [Stage];

    /// Peer handlers that must run *before* this one at the given stage.
    fn requires_before(&self, _stage: Stage) -> &'static [&'static str] {
        &[]
    }

    /// Peer handlers that must run *after* this one at the given stage.
    fn required_after(&self, _stage: Stage) -> &'static [&'static str] {
        &[]
    }

    /// Called once per worker before the accept loop; registers any
    /// handler-declared metrics and validates handler options.
    fn setup(&mut self, _config: &Config) -> anyhow::Result<()> {
        Ok(())
    }

    /// Registers any lazily-initialized metrics for this handler.
    fn register_metrics(&self) {}

    fn connect(
        &mut self,
        _ctx: &mut SessionContext,
        _hostname: &str,
        _ip: Option<IpAddr>,
    ) -> HandlerResult {
        Ok(())
    }

    fn helo(&mut self, _ctx: &mut SessionContext, _helo: &str) -> HandlerResult {
        Ok(())
    }

    fn envfrom(&mut self, _ctx: &mut SessionContext, _from: &str) -> HandlerResult {
        Ok(())
    }

    fn envrcpt(&mut self, _ctx: &mut SessionContext, _rcpt: &str) -> HandlerResult {
        Ok(())
    }

    fn header(&mut self, _ctx: &mut SessionContext, _name: &str, _value: &str) -> HandlerResult {
        Ok(())
    }

    fn eoh(&mut self, _ctx: &mut SessionContext) -> HandlerResult {
        Ok(())
    }

    fn body(&mut self, _ctx: &mut SessionContext, _chunk: &[u8]) -> HandlerResult {
        Ok(())
    }

    fn eom(&mut self, _ctx: &mut SessionContext) -> HandlerResult {
        Ok(())
    }

    fn abort(&mut self, _ctx: &mut SessionContext) -> HandlerResult {
        Ok(())
    }

    fn close(&mut self, _ctx: &mut SessionContext) -> HandlerResult {
        Ok(())
    }
}
