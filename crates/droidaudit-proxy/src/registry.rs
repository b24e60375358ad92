//! In-process transport used when the sandbox refuses a listening socket.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ProxyError, ProxyResult};
use crate::service::ActionService;

/// Services registered by `(host, port)`. Clones share one table.
#[derive(Debug, Clone, Default)]
pub struct InProcessRegistry {
    services: Arc<Mutex<HashMap<(String, u16), Arc<ActionService>>>>,
}

impl InProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, host: &str, port: u16, service: Arc<ActionService>) -> ProxyResult<()> {
        let mut services = self.services.lock();
        let key = (host.to_string(), port);
        if services.contains_key(&key) {
            return Err(ProxyError::AlreadyRegistered {
                host: host.to_string(),
                port,
            });
        }
        services.insert(key, service);
        Ok(())
    }

    pub fn unregister(&self, host: &str, port: u16) -> bool {
        self.services
            .lock()
            .remove(&(host.to_string(), port))
            .is_some()
    }

    pub fn lookup(&self, host: &str, port: u16) -> Option<Arc<ActionService>> {
        self.services.lock().get(&(host.to_string(), port)).cloned()
    }

    pub fn len(&self) -> usize {
        self.services.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::CommTraceWriter;

    #[test]
    fn duplicate_registration_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let trace = Arc::new(CommTraceWriter::open(&dir.path().join("t.jsonl")).unwrap());
        let svc = Arc::new(ActionService::new("/act", 64, trace));
        let registry = InProcessRegistry::new();
        registry.register("127.0.0.1", 9000, svc.clone()).unwrap();
        assert!(matches!(
            registry.register("127.0.0.1", 9000, svc.clone()),
            Err(ProxyError::AlreadyRegistered { port: 9000, .. })
        ));
        assert!(registry.lookup("127.0.0.1", 9001).is_none());
        assert!(registry.clone().unregister("127.0.0.1", 9000));
        assert!(registry.is_empty());
    }
}
