//! Static scheme → handler table, resolved once at startup.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::handler::{SourceDescriptor, TransferError, TransferHandler};
use super::http::HttpHandler;
use super::local::LocalHandler;
use super::managed::ManagedHandler;
use crate::config::{default_schemes, Config, ConfigError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    Local,
    Http,
    Managed,
}

pub struct HandlerRegistry {
    schemes: BTreeMap<String, HandlerKind>,
    handlers: HashMap<HandlerKind, Arc<dyn TransferHandler>>,
}

impl HandlerRegistry {
    /// Registry with the given scheme table and no handlers yet.
    pub fn new(schemes: BTreeMap<String, HandlerKind>) -> Self {
        Self {
            schemes,
            handlers: HashMap::new(),
        }
    }

    /// Built-in schemes with the local handler and an HTTP handler using
    /// default settings.
    pub fn with_defaults() -> Result<Self, ConfigError> {
        Self::from_config(&Config::default())
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let schemes = config.scheme_table()?;
        let mut registry = Self::new(schemes)
            .with_handler(HandlerKind::Local, Arc::new(LocalHandler::new()))
            .with_handler(
                HandlerKind::Http,
                Arc::new(HttpHandler::new(&config.transfer.http)?),
            );
        if let Some(ref managed) = config.transfer.managed {
            registry = registry.with_handler(
                HandlerKind::Managed,
                Arc::new(ManagedHandler::from_config(managed)?),
            );
        }
        Ok(registry)
    }

    pub fn with_handler(mut self, kind: HandlerKind, handler: Arc<dyn TransferHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn with_scheme(mut self, scheme: &str, kind: HandlerKind) -> Self {
        self.schemes.insert(scheme.to_ascii_lowercase(), kind);
        self
    }

    pub fn schemes(&self) -> &BTreeMap<String, HandlerKind> {
        &self.schemes
    }

    /// Handler for a source. Unknown schemes fail the transfer fatally.
    pub fn resolve(&self, source: &SourceDescriptor) -> Result<Arc<dyn TransferHandler>, TransferError> {
        let kind = self.schemes.get(&source.scheme).ok_or_else(|| {
            TransferError::Fatal(format!("no handler for scheme {:?}", source.scheme))
        })?;
        self.handlers.get(kind).cloned().ok_or_else(|| {
            TransferError::Fatal(format!("handler {kind:?} is not available"))
        })
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new(default_schemes()).with_handler(HandlerKind::Local, Arc::new(LocalHandler::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let registry = HandlerRegistry::with_defaults().unwrap();
        let resolve = |s: &str| registry.resolve(&SourceDescriptor::parse(s)).map(|h| h.name());
        assert_eq!(resolve("/data/x").unwrap(), "local");
        assert_eq!(resolve("file:///data/x").unwrap(), "local");
        assert_eq!(resolve("http://host/x").unwrap(), "http");
        assert_eq!(resolve("https://host/x").unwrap(), "http");
    }

    #[test]
    fn test_unknown_scheme_is_fatal() {
        let registry = HandlerRegistry::default();
        let err = registry
            .resolve(&SourceDescriptor::parse("gopher://host/x"))
            .err()
            .unwrap();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("gopher"));
    }
}
