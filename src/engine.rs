//! Execution engine boundary.
//!
//! The server never interprets a request itself. It hands the framed
//! payload to an [`Engine`] and writes back whatever string comes out.
//!
//! The binary uses [`TemplateEngine`]: the handler script is a minijinja
//! template rendered with the request bound to `payload`.

use minijinja::{context, Environment};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Kind of a non-string value returned by a handler.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Undefined,
    Null,
    Boolean,
    Number,
    Object,
}

/// Outcome of running the registered handler on one request.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineResult {
    /// Handler produced a string; this is the response body.
    String(String),
    /// Handler produced something other than a string. Nothing is sent back.
    Value(ValueKind),
    /// Handler failed.
    Error(String),
}

impl EngineResult {
    /// Body to write to the client, if any.
    pub fn body(&self) -> Option<&[u8]> {
        match self {
            EngineResult::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

/// Something that can run a request handler.
pub trait Engine {
    /// Whether a handler has been registered by the loaded script.
    fn has_registered_handler(&self) -> bool;

    /// Run the handler on `payload`. Failures are reported in the result.
    fn dispatch(&mut self, payload: &str) -> EngineResult;
}

/// Handler script loading errors
#[derive(Debug)]
pub enum EngineLoadError {
    Read(PathBuf, std::io::Error),
    Compile(PathBuf, minijinja::Error),
}

impl std::fmt::Display for EngineLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineLoadError::Read(path, e) => {
                write!(f, "Could not open script file '{}': {}", path.display(), e)
            }
            EngineLoadError::Compile(path, e) => {
                write!(f, "Failed to compile script '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for EngineLoadError {}

/// Engine backed by a minijinja template.
///
/// A blank script registers no handler, the same as a script that never
/// sets one up.
pub struct TemplateEngine {
    env: Environment<'static>,
    source: Option<String>,
}

impl TemplateEngine {
    /// Read and compile the handler script at `path`.
    pub fn load(path: &Path) -> Result<Self, EngineLoadError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| EngineLoadError::Read(path.to_path_buf(), e))?;
        let engine = Self::from_source(source)
            .map_err(|e| EngineLoadError::Compile(path.to_path_buf(), e))?;
        info!(
            script = %path.display(),
            handler = engine.has_registered_handler(),
            "Loaded handler script"
        );
        Ok(engine)
    }

    /// Compile a handler from template source.
    pub fn from_source(source: String) -> Result<Self, minijinja::Error> {
        if source.trim().is_empty() {
            return Ok(Self {
                env: Environment::new(),
                source: None,
            });
        }
        // Surface syntax errors at startup rather than on the first request
        Environment::new().template_from_str(&source)?;
        Ok(Self {
            env: Environment::new(),
            source: Some(source),
        })
    }
}

impl Engine for TemplateEngine {
    fn has_registered_handler(&self) -> bool {
        self.source.is_some()
    }

    fn dispatch(&mut self, payload: &str) -> EngineResult {
        let Some(source) = &self.source else {
            return EngineResult::Value(ValueKind::Undefined);
        };
        match self.env.render_str(source, context! { payload => payload }) {
            Ok(rendered) => EngineResult::String(rendered),
            Err(e) => {
                debug!(error = %e, "Handler failed");
                EngineResult::Error(e.to_string())
            }
        }
    }
}
