//! Per-document exclusive leases.
//!
//! The orchestrator takes a lease before driving a document, so no two
//! workers ever run stages for the same document. Leases expire after a
//! TTL so a wedged worker cannot hold a document forever, and are released
//! when the [`LeaseGuard`] drops (completion, error, or cancellation).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug)]
struct Lease {
    holder: Uuid,
    expires: Instant,
}

#[derive(Debug)]
pub struct LeaseManager {
    ttl: Duration,
    leases: Mutex<HashMap<String, Lease>>,
}

impl LeaseManager {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            leases: Mutex::new(HashMap::new()),
        })
    }

    /// Claim `document_id`, or `None` if another live lease holds it.
    pub fn acquire(self: &Arc<Self>, document_id: &str) -> Option<LeaseGuard> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        if let Some(existing) = leases.get(document_id) {
            if existing.expires > now {
                return None;
            }
            tracing::warn!(document_id, holder = %existing.holder, "taking over expired lease");
        }

        let holder = Uuid::new_v4();
        leases.insert(
            document_id.to_string(),
            Lease {
                holder,
                expires: now + self.ttl,
            },
        );
        Some(LeaseGuard {
            manager: Arc::clone(self),
            document_id: document_id.to_string(),
            holder,
        })
    }

    pub fn is_held(&self, document_id: &str) -> bool {
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases
            .get(document_id)
            .is_some_and(|l| l.expires > Instant::now())
    }

    fn release(&self, document_id: &str, holder: Uuid) {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if leases.get(document_id).is_some_and(|l| l.holder == holder) {
            leases.remove(document_id);
        }
    }
}

/// Held lease; dropping it releases the document.
#[derive(Debug)]
pub struct LeaseGuard {
    manager: Arc<LeaseManager>,
    document_id: String,
    holder: Uuid,
}

impl LeaseGuard {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Push the expiry out by another TTL. Returns false if the lease was
    /// lost to another holder after expiring.
    pub fn renew(&self) -> bool {
        let mut leases = self.manager.leases.lock().unwrap_or_else(|e| e.into_inner());
        match leases.get_mut(&self.document_id) {
            Some(lease) if lease.holder == self.holder => {
                lease.expires = Instant::now() + self.manager.ttl;
                true
            }
            _ => false,
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.manager.release(&self.document_id, self.holder);
    }
}
