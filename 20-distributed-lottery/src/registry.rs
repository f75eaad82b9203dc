use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
};

use thiserror::Error;

use crate::bet::AgencyId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("agency {agency} is outside 1..={max}")]
    UnknownAgency { agency: AgencyId, max: AgencyId },
    #[error("agency {0} is already connected")]
    DuplicateAgency(AgencyId),
}

/// Tracks which agencies currently hold a connection.
#[derive(Debug)]
pub struct AgencyRegistry {
    agencies: AgencyId,
    connected: Mutex<HashMap<AgencyId, Option<SocketAddr>>>,
}

impl AgencyRegistry {
    pub fn new(agencies: AgencyId) -> Self {
        Self {
            agencies,
            connected: Mutex::new(HashMap::new()),
        }
    }

    /// Claims `agency` for one connection. The claim lasts as long as the
    /// returned lease.
    pub fn register(
        self: &Arc<Self>,
        agency: AgencyId,
        peer: Option<SocketAddr>,
    ) -> Result<AgencyLease, RegistrationError> {
        if agency == 0 || agency > self.agencies {
            return Err(RegistrationError::UnknownAgency {
                agency,
                max: self.agencies,
            });
        }

        let mut connected = self.lock();
        if connected.contains_key(&agency) {
            return Err(RegistrationError::DuplicateAgency(agency));
        }
        connected.insert(agency, peer);

        Ok(AgencyLease {
            agency,
            registry: Arc::clone(self),
        })
    }

    #[cfg(test)]
    pub fn is_connected(&self, agency: AgencyId) -> bool {
        self.lock().contains_key(&agency)
    }

    /// Address of the connection currently holding `agency`, when known.
    pub fn peer(&self, agency: AgencyId) -> Option<SocketAddr> {
        self.lock().get(&agency).copied().flatten()
    }

    /// Connected agencies in ascending order.
    pub fn connected(&self) -> Vec<AgencyId> {
        let mut agencies: Vec<_> = self.lock().keys().copied().collect();
        agencies.sort_unstable();
        agencies
    }

    fn release(&self, agency: AgencyId) {
        self.lock().remove(&agency);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AgencyId, Option<SocketAddr>>> {
        self.connected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Proof that a connection owns an agency id. Dropping it frees the id.
#[derive(Debug)]
pub struct AgencyLease {
    agency: AgencyId,
    registry: Arc<AgencyRegistry>,
}

impl AgencyLease {
    pub fn agency(&self) -> AgencyId {
        self.agency
    }
}

impl Drop for AgencyLease {
    fn drop(&mut self) {
        self.registry.release(self.agency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ids_outside_range() {
        let registry = Arc::new(AgencyRegistry::new(5));
        assert_eq!(
            registry.register(0, None).map(|lease| lease.agency()),
            Err(RegistrationError::UnknownAgency { agency: 0, max: 5 })
        );
        assert_eq!(
            registry.register(6, None).map(|lease| lease.agency()),
            Err(RegistrationError::UnknownAgency { agency: 6, max: 5 })
        );
        assert!(registry.connected().is_empty());
    }

    #[test]
    fn one_connection_per_agency() {
        let registry = Arc::new(AgencyRegistry::new(3));
        let peer: SocketAddr = "127.0.0.1:4000".parse().expect("address");
        let first = registry.register(2, Some(peer)).expect("first claim");
        assert_eq!(registry.peer(2), Some(peer));

        assert_eq!(
            registry.register(2, None).map(|lease| lease.agency()),
            Err(RegistrationError::DuplicateAgency(2))
        );
        assert!(registry.is_connected(2), "failed claim keeps the first one");

        let _other = registry.register(3, None).expect("other agency");
        assert_eq!(registry.connected(), vec![2, 3]);
        drop(first);
    }

    #[test]
    fn dropping_lease_frees_the_id() {
        let registry = Arc::new(AgencyRegistry::new(1));
        let lease = registry.register(1, None).expect("claim");
        drop(lease);

        assert!(!registry.is_connected(1));
        registry.register(1, None).expect("reconnect after release");
    }
}
