use crate::config::Config;
use crate::dns::Resolver;
use crate::handler::Handler;
use anyhow::bail;
use std::sync::Arc;

pub mod dkim;
pub mod dmarc;
pub mod ptr;
pub mod spf;

type Factory = fn(&Config, Arc<Resolver>) -> anyhow::Result<Box<dyn Handler>>;

/// One installed handler module.
///
/// Handlers register here at compile time; `load_handlers` is the
/// config-time allowlist choosing which of them actually run.
pub struct HandlerEntry {
    pub name: &'static str,
    pub factory: Factory,
    /// Runs in the parent once, before the accept loop starts.
    pub pre_loop_setup: Option<fn(&Config) -> anyhow::Result<()>>,
    /// Runs in the parent before each worker spawn.
    pub pre_fork_setup: Option<fn(&Config)>,
}

pub const INSTALLED: &[HandlerEntry] = &[
    HandlerEntry {
        name: "dkim",
        factory: dkim::factory,
        pre_loop_setup: None,
        pre_fork_setup: None,
    },
    HandlerEntry {
        name: "dmarc",
        factory: dmarc::factory,
        pre_loop_setup: None,
        pre_fork_setup: None,
    },
    HandlerEntry {
        name: "ptr",
        factory: ptr::factory,
        pre_loop_setup: None,
        pre_fork_setup: None,
    },
    HandlerEntry {
        name: "spf",
        factory: spf::factory,
        pre_loop_setup: None,
        pre_fork_setup: None,
    },
];

fn find(name: &str) -> Option<&'static HandlerEntry> {
    INSTALLED.iter().find(|entry| entry.name == name)
}

/// Check the configured load list against the installed modules without
/// instantiating anything; used by `--test-config`.
pub fn check_load_list(config: &Config) -> anyhow::Result<()> {
    for name in &config.load_handlers {
        if find(name).is_none() {
            bail!("unknown handler module \"{name}\" in load_handlers");
        }
    }
    Ok(())
}

/// Instantiate and set up one handler object per active module, in
/// configuration order. An unknown name is fatal.
pub fn build_handlers(
    config: &Config,
    resolver: &Arc<Resolver>,
) -> anyhow::Result<Vec<Box<dyn Handler>>> {
    let mut handlers = Vec::with_capacity(config.load_handlers.len());
    for name in &config.load_handlers {
        let Some(entry) = find(name) else {
            bail!("unknown handler module \"{name}\" in load_handlers");
        };
        let mut handler = (entry.factory)(config, resolver.clone())?;
        handler.setup(config)?;
        handlers.push(handler);
    }
    Ok(handlers)
}

/// Parent-side hook, once before the first fork.
pub fn pre_loop_setup(config: &Config) -> anyhow::Result<()> {
    for name in &config.load_handlers {
        if let Some(hook) = find(name).and_then(|e| e.pre_loop_setup) {
            hook(config)?;
        }
    }
    Ok(())
}

/// Parent-side hook, before every worker spawn.
pub fn pre_fork_setup(config: &Config) {
    for name in &config.load_handlers {
        if let Some(hook) = find(name).and_then(|e| e.pre_fork_setup) {
            hook(config);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_handler_is_fatal() {
        let mut config = Config::default();
        config.load_handlers = vec!["dkim".to_string(), "nonesuch".to_string()];
        let err = check_load_list(&config).unwrap_err();
        assert!(err.to_string().contains("nonesuch"));
    }

    #[test]
    fn test_default_load_list_is_installed() {
        check_load_list(&Config::default()).unwrap();
    }
}
