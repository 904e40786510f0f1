//! Dispatch of parsed commands to handlers.
//!
//! The router is an ordinary value built at startup; handlers are keyed by
//! `(role class, command name)`. Role commands register under
//! [`RoleClass::Role`] and receive whatever concrete role was typed.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::grammar::{self, ParsedCommand, RoleClass};

/// Outcome of one routed command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    pub data: Value,
}

impl CommandResult {
    pub fn ok(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }

    pub fn err(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: false,
            message: message.into(),
            data,
        }
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.success { "OK" } else { "ERR" };
        write!(f, "[{status}] {}", self.message)
    }
}

/// Everything a handler may touch, passed explicitly.
#[derive(Debug, Clone)]
pub struct Context {
    pub repo_root: PathBuf,
    pub config: Config,
    /// Set on Ctrl-C; long-running handlers stop dispatching new work.
    pub cancel: Arc<AtomicBool>,
}

impl Context {
    pub fn new(repo_root: PathBuf, config: Config) -> Self {
        Self {
            repo_root,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }
}

pub type Handler =
    Box<dyn Fn(&ParsedCommand, &Context) -> anyhow::Result<CommandResult> + Send + Sync>;

#[derive(Default)]
pub struct Router {
    handlers: BTreeMap<(RoleClass, String), Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// A router with every built-in handler registered.
    pub fn with_default_handlers() -> Self {
        let mut router = Self::new();
        crate::handlers::register_all(&mut router);
        router
    }

    pub fn register<F>(&mut self, class: RoleClass, command: &str, handler: F)
    where
        F: Fn(&ParsedCommand, &Context) -> anyhow::Result<CommandResult> + Send + Sync + 'static,
    {
        self.handlers
            .insert((class, command.to_string()), Box::new(handler));
    }

    /// Validate and dispatch. Never fails: unknown commands, validation
    /// errors, handler errors and handler panics all become failure results.
    pub fn route(&self, cmd: &ParsedCommand, ctx: &Context) -> CommandResult {
        let class = cmd.role_class();
        let Some(handler) = self.handlers.get(&(class, cmd.command().to_string())) else {
            return CommandResult::err(
                format!("No handler registered for {class}::{}", cmd.command()),
                Value::Null,
            );
        };
        if let Err(reason) = grammar::validate(cmd) {
            return CommandResult::err(format!("Invalid command: {reason}"), Value::Null);
        }

        debug!(command = %cmd, "routing");
        match panic::catch_unwind(AssertUnwindSafe(|| handler(cmd, ctx))) {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(command = %cmd, error = %err, "handler failed");
                CommandResult::err(
                    format!("Handler error: {err:#}"),
                    serde_json::json!({ "error": format!("{err:#}") }),
                )
            }
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(command = %cmd, reason = %reason, "handler panicked");
                CommandResult::err(format!("Handler panicked: {reason}"), Value::Null)
            }
        }
    }

    /// Registered commands per role class, optionally for one class only.
    pub fn list_commands(&self, class: Option<RoleClass>) -> BTreeMap<RoleClass, Vec<String>> {
        let mut out: BTreeMap<RoleClass, Vec<String>> = BTreeMap::new();
        for (c, name) in self.handlers.keys() {
            if class.is_none_or(|wanted| wanted == *c) {
                out.entry(*c).or_default().push(name.clone());
            }
        }
        out
    }
}
