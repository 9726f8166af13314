//! Named message transformers applied by diverts and bridges.

use std::sync::Arc;

use dashmap::DashMap;
use mq_common::Message;

use crate::error::ControlError;
use crate::Result;

/// Rewrites a message in flight.
pub trait Transformer: Send + Sync {
    fn transform(&self, message: Message) -> Message;
}

impl<F> Transformer for F
where
    F: Fn(Message) -> Message + Send + Sync,
{
    fn transform(&self, message: Message) -> Message {
        self(message)
    }
}

#[derive(Default)]
pub struct TransformerRegistry {
    transformers: DashMap<String, Arc<dyn Transformer>>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, transformer: Arc<dyn Transformer>) {
        self.transformers.insert(name.to_string(), transformer);
    }

    /// Look up an optional transformer name; an unknown name is an error.
    pub fn resolve(&self, name: Option<&str>) -> Result<Option<Arc<dyn Transformer>>> {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            None => Ok(None),
            Some(name) => self
                .transformers
                .get(name)
                .map(|t| Some(t.value().clone()))
                .ok_or_else(|| ControlError::invalid(format!("unknown transformer: {}", name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let registry = TransformerRegistry::new();
        registry.register(
            "stamp",
            Arc::new(|m: Message| m.with_property("stamped", "yes")),
        );

        assert!(registry.resolve(None).unwrap().is_none());
        assert!(registry.resolve(Some("")).unwrap().is_none());
        assert!(registry.resolve(Some("missing")).is_err());

        let stamp = registry.resolve(Some("stamp")).unwrap().unwrap();
        assert_eq!(stamp.transform(Message::new("x")).property("stamped"), Some("yes"));
    }
}
