//! Function registry.
//!
//! Work items name the function they call; the registry resolves that name
//! to an async handler at launch time. Completion callbacks are resolved the
//! same way. Command-backed functions can be loaded from a directory of TOML
//! files, one `[function]` table per file.

pub mod command;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::work::{CompletionEvent, WorkId, WorkKind};

/// What a handler receives for one attempt.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub work_id: WorkId,
    /// Attempts already completed before this one.
    pub attempt: u32,
    pub kind: WorkKind,
    pub args: serde_json::Value,
}

pub type HandlerResult = std::result::Result<serde_json::Value, String>;
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
pub type Handler = Arc<dyn Fn(Invocation) -> HandlerFuture + Send + Sync>;

pub type CallbackFuture = Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>>;
pub type Callback = Arc<dyn Fn(CompletionEvent) -> CallbackFuture + Send + Sync>;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct FunctionFile {
    function: CommandFunction,
}

/// A function implemented by an external executable.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandFunction {
    pub name: String,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Registry of handlers and completion callbacks, indexed by name.
#[derive(Default)]
pub struct FunctionRegistry {
    handlers: HashMap<String, Handler>,
    callbacks: HashMap<String, Callback>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register an async handler under `name`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |inv| Box::pin(f(inv)) as HandlerFuture);
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Register a completion callback under `name`.
    pub fn register_callback<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(CompletionEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        let callback: Callback = Arc::new(move |event| Box::pin(f(event)) as CallbackFuture);
        self.callbacks.insert(name.into(), callback);
        self
    }

    /// Register an external command as a handler.
    pub fn register_command(&mut self, function: CommandFunction) -> &mut Self {
        let name = function.name.clone();
        let function = Arc::new(function);
        self.register(name, move |inv| {
            let function = Arc::clone(&function);
            async move { command::run(&function, inv).await }
        })
    }

    /// Load all `.toml` files from a directory as command functions.
    pub fn load_commands_from_dir(&mut self, dir: &Path) -> Result<usize> {
        let entries = std::fs::read_dir(dir).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("function dir {}", dir.display()))
            }
            _ => Error::Config(format!("cannot read function dir {}: {e}", dir.display())),
        })?;

        let mut loaded = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let file: FunctionFile = toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("bad function config {}: {e}", path.display()))
                })?;
                tracing::debug!(function = %file.function.name, path = %path.display(), "loaded command function");
                self.register_command(file.function);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    pub fn handler(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    pub fn callback(&self, name: &str) -> Option<&Callback> {
        self.callbacks.get(name)
    }

    /// Names of all registered handlers, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}
