//! JMESPath expressions with optional file-backed inputs.
//!
//! Expressions are compiled once when configuration is loaded. An expression
//! may name context files; their parsed JSON is made available to the
//! expression under the input's `files` field and reloaded periodically by a
//! background task. A file that fails to load keeps its last good contents.

use std::{collections::BTreeMap, fmt, path::PathBuf, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{AuthError, Result};

/// Default interval between reloads of context files.
pub const DEFAULT_CONTEXT_FILE_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

const FILES_FIELD: &str = "files";

/// A compiled JMESPath expression.
pub struct Expression {
    source: String,
    compiled: jmespath::Expression<'static>,
    files: Option<Arc<ArcSwap<Map<String, Value>>>>,
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expression")
            .field("source", &self.source)
            .field("has_context_files", &self.files.is_some())
            .finish()
    }
}

impl Expression {
    /// Compiles an expression without context files.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidArgument` if the expression does not parse.
    pub fn compile(expression: &str) -> Result<Self> {
        let compiled = jmespath::compile(expression).map_err(|err| {
            AuthError::invalid_argument(format!("Failed to compile expression {expression:?}: {err}"))
        })?;
        Ok(Self { source: expression.to_owned(), compiled, files: None })
    }

    /// Compiles an expression whose input is extended with the contents of
    /// `context_files`, reloaded every `refresh_interval` until `shutdown`
    /// is cancelled.
    ///
    /// The files are read once before this returns, so configuration errors
    /// surface at startup.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidArgument` if the expression does not parse
    /// or a file cannot be read or parsed, and `AuthError::Internal` if
    /// called outside a Tokio runtime.
    pub fn with_context_files(
        expression: &str,
        context_files: &BTreeMap<String, PathBuf>,
        refresh_interval: Duration,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        let mut compiled = Self::compile(expression)?;
        if context_files.is_empty() {
            return Ok(compiled);
        }

        let mut contents = Map::new();
        for (name, path) in context_files {
            let bytes = std::fs::read(path).map_err(|err| {
                AuthError::invalid_argument(format!(
                    "Failed to read context file {name:?} at {}: {err}",
                    path.display()
                ))
            })?;
            contents.insert(name.clone(), parse_context_file(name, &bytes)?);
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|err| {
            AuthError::internal_with_source("Context file reloader requires a Tokio runtime", err)
        })?;
        let files = Arc::new(ArcSwap::from_pointee(contents));
        runtime.spawn(reload_context_files(
            context_files.clone(),
            Arc::clone(&files),
            refresh_interval,
            shutdown.clone(),
        ));

        compiled.files = Some(files);
        Ok(compiled)
    }

    /// Returns the expression's source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression against `input`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if evaluation fails.
    pub fn search(&self, input: &Value) -> Result<Value> {
        let result = self.evaluate(input)?;
        serde_json::to_value(&*result).map_err(|err| {
            AuthError::internal_with_source(
                format!("Failed to convert result of expression {:?}", self.source),
                err,
            )
        })
    }

    /// Evaluates the expression and returns `true` only if it yields the
    /// boolean `true`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if evaluation fails.
    pub fn evaluate_boolean(&self, input: &Value) -> Result<bool> {
        Ok(self.evaluate(input)?.as_boolean() == Some(true))
    }

    /// Evaluates the expression and applies JMESPath truthiness to the
    /// result.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if evaluation fails.
    pub fn is_truthy(&self, input: &Value) -> Result<bool> {
        Ok(self.evaluate(input)?.is_truthy())
    }

    fn evaluate(&self, input: &Value) -> Result<jmespath::Rcvar> {
        let result = match (&self.files, input) {
            (Some(files), Value::Object(object)) => {
                let mut object = object.clone();
                object.insert(FILES_FIELD.to_owned(), Value::Object((**files.load()).clone()));
                self.compiled.search(Value::Object(object))
            },
            _ => self.compiled.search(input),
        };
        result.map_err(|err| {
            AuthError::internal(format!("Failed to evaluate expression {:?}: {err}", self.source))
        })
    }
}

fn parse_context_file(name: &str, bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes).map_err(|err| {
        AuthError::invalid_argument(format!("Context file {name:?} is not valid JSON: {err}"))
    })
}

async fn reload_context_files(
    paths: BTreeMap<String, PathBuf>,
    files: Arc<ArcSwap<Map<String, Value>>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately and the files were just loaded.
    ticker.tick().await;
    tracing::info!(files = paths.len(), "context file reloader started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("context file reloader shutting down");
                break;
            }
            _ = ticker.tick() => {
                let mut contents = (**files.load()).clone();
                for (name, path) in &paths {
                    let loaded = match tokio::fs::read(path).await {
                        Ok(bytes) => parse_context_file(name, &bytes),
                        Err(err) => Err(AuthError::unavailable_with_source(
                            format!("Failed to read context file {name:?}"),
                            err,
                        )),
                    };
                    match loaded {
                        Ok(value) => {
                            contents.insert(name.clone(), value);
                        },
                        Err(err) => {
                            tracing::warn!(
                                file = %name,
                                path = %path.display(),
                                error = %err,
                                "failed to reload context file, keeping previous contents"
                            );
                        },
                    }
                }
                files.store(Arc::new(contents));
            }
        }
    }
}
