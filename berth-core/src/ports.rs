//! Port allocator: optimistic allocation with one bounded retry.
//!
//! # Algorithm
//!
//! 1. Read phase (no write lock): resolve the session, load its existing
//!    bindings, and build the exclusion set = ports held by active sessions ∪
//!    reserved ports.
//! 2. Probe phase: ask the [`PortProbe`] for one port per unbound service. Each
//!    chosen port joins the exclusion set before the next probe, so ports from
//!    one call are pairwise distinct.
//! 3. Commit phase: one `BEGIN IMMEDIATE` transaction re-checks every binding
//!    the call keeps and inserts every new one.
//!
//! Between 1 and 3 another process may commit one of the same ports, or reserve
//! one, including a port the session already holds. The UNIQUE constraint on
//! `port_allocations.port` (and a reservation re-check inside the transaction)
//! turns that into a rolled-back attempt, and the whole read-probe-commit
//! sequence runs once more. A second loss surfaces as
//! [`RegistryError::AllocationConflict`].
//!
//! Services already bound to the session keep their port, unless that port has
//! since been reserved, in which case it is re-probed and rebound.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::{Ipv4Addr, TcpListener};

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};

use crate::error::{is_unique_violation, RegistryError};
use crate::store::Store;
use crate::types::{encode_timestamp, PortAllocation, PortRange, SessionId};

/// Probe-and-commit rounds before giving up with `AllocationConflict`.
pub const MAX_ALLOCATION_ATTEMPTS: u32 = 2;

/// Binds tried in ephemeral mode before reporting `NoFreePort`.
const MAX_EPHEMERAL_PROBES: usize = 64;

/// Finds a port that is free at the OS level.
///
/// Implementations must never return a port contained in `excluded`.
pub trait PortProbe {
    fn probe(&mut self, excluded: &BTreeSet<u16>) -> Result<u16, RegistryError>;
}

impl<F> PortProbe for F
where
    F: FnMut(&BTreeSet<u16>) -> Result<u16, RegistryError>,
{
    fn probe(&mut self, excluded: &BTreeSet<u16>) -> Result<u16, RegistryError> {
        self(excluded)
    }
}

/// Probes by binding a listener on all interfaces and releasing it immediately.
#[derive(Debug, Clone)]
pub struct OsPortProbe {
    range: Option<PortRange>,
    cursor: usize,
}

impl OsPortProbe {
    /// Let the OS choose from its ephemeral range (bind to port 0).
    pub fn ephemeral() -> Self {
        Self {
            range: None,
            cursor: 0,
        }
    }

    /// Scan `range`, starting at a per-process offset so concurrent processes
    /// tend not to collide on the same first candidate.
    pub fn in_range(range: PortRange) -> Self {
        let cursor = std::process::id() as usize % range.size();
        Self {
            range: Some(range),
            cursor,
        }
    }

    fn probe_ephemeral(excluded: &BTreeSet<u16>) -> Result<u16, RegistryError> {
        for _ in 0..MAX_EPHEMERAL_PROBES {
            let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(|e| {
                RegistryError::NoFreePort {
                    detail: format!("cannot bind an ephemeral port: {e}"),
                }
            })?;
            let port = listener
                .local_addr()
                .map_err(|e| RegistryError::NoFreePort {
                    detail: format!("cannot read bound address: {e}"),
                })?
                .port();
            drop(listener);
            if !excluded.contains(&port) {
                return Ok(port);
            }
        }
        Err(RegistryError::NoFreePort {
            detail: format!("{MAX_EPHEMERAL_PROBES} ephemeral binds all hit excluded ports"),
        })
    }

    fn probe_range(
        &mut self,
        range: PortRange,
        excluded: &BTreeSet<u16>,
    ) -> Result<u16, RegistryError> {
        let size = range.size();
        for step in 0..size {
            let offset = (self.cursor + step) % size;
            // offset < size <= 65535, so the sum stays within u16.
            let port = range.start + offset as u16;
            if excluded.contains(&port) || !bindable(port) {
                continue;
            }
            self.cursor = (offset + 1) % size;
            return Ok(port);
        }
        Err(RegistryError::NoFreePort {
            detail: format!("every port in {range} is excluded or in use"),
        })
    }
}

impl PortProbe for OsPortProbe {
    fn probe(&mut self, excluded: &BTreeSet<u16>) -> Result<u16, RegistryError> {
        let port = match self.range {
            Some(range) => self.probe_range(range, excluded)?,
            None => Self::probe_ephemeral(excluded)?,
        };
        tracing::debug!(port, "probed free port");
        Ok(port)
    }
}

fn bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

enum Attempt {
    Committed(Vec<(String, u16)>),
    Conflict,
}

impl Store {
    /// Allocate one port per service for `session_id`, in input order.
    ///
    /// Uses an [`OsPortProbe`] over the configured port range, or the OS
    /// ephemeral range when none is configured.
    pub fn allocate(
        &mut self,
        session_id: &SessionId,
        services: &[&str],
    ) -> Result<Vec<(String, u16)>, RegistryError> {
        let mut probe = match self.port_range() {
            Some(range) => OsPortProbe::in_range(range),
            None => OsPortProbe::ephemeral(),
        };
        self.allocate_with(session_id, services, &mut probe)
    }

    /// [`Store::allocate`] with a caller-supplied probe.
    ///
    /// An empty `services` slice returns an empty result without touching the store.
    pub fn allocate_with<P>(
        &mut self,
        session_id: &SessionId,
        services: &[&str],
        probe: &mut P,
    ) -> Result<Vec<(String, u16)>, RegistryError>
    where
        P: PortProbe + ?Sized,
    {
        if services.is_empty() {
            return Ok(Vec::new());
        }
        validate_services(services)?;

        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            match self.try_allocate(session_id, services, probe)? {
                Attempt::Committed(ports) => {
                    tracing::debug!(
                        session_id = %session_id,
                        attempt,
                        ports = ?ports,
                        "allocated ports"
                    );
                    return Ok(ports);
                }
                Attempt::Conflict => {
                    tracing::warn!(
                        session_id = %session_id,
                        attempt,
                        "port allocation lost a commit race"
                    );
                }
            }
        }

        Err(RegistryError::AllocationConflict {
            session_id: session_id.0.clone(),
            attempts: MAX_ALLOCATION_ATTEMPTS,
        })
    }

    fn try_allocate<P>(
        &mut self,
        session_id: &SessionId,
        services: &[&str],
        probe: &mut P,
    ) -> Result<Attempt, RegistryError>
    where
        P: PortProbe + ?Sized,
    {
        let key = self
            .active_session_key(session_id)?
            .ok_or_else(|| RegistryError::UnknownSession {
                session_id: session_id.0.clone(),
            })?;
        let reserved = self.reserved_ports()?;
        let existing = self.bindings_for_key(key)?;
        let mut excluded = self.excluded_ports()?;

        let mut chosen = Vec::with_capacity(services.len());
        // (service, port) bindings kept as they are
        let mut kept: Vec<(&str, u16)> = Vec::new();
        // (service, new port, previous port when rebinding)
        let mut pending: Vec<(&str, u16, Option<u16>)> = Vec::new();
        for &service in services {
            let previous = existing.get(service).copied();
            if let Some(port) = previous.filter(|p| !reserved.contains(p)) {
                chosen.push((service.to_owned(), port));
                kept.push((service, port));
                continue;
            }
            let port = probe.probe(&excluded)?;
            if !excluded.insert(port) {
                return Err(RegistryError::NoFreePort {
                    detail: format!("probe returned excluded port {port}"),
                });
            }
            chosen.push((service.to_owned(), port));
            pending.push((service, port, previous));
        }

        // Kept bindings are re-checked under the write lock too: a reservation
        // committed after the read phase must force a rebind.
        let tx = self.write_tx()?;
        if session_key_in_tx(&tx, session_id)? != Some(key) {
            return Err(RegistryError::UnknownSession {
                session_id: session_id.0.clone(),
            });
        }
        for &(service, port) in &kept {
            if port_reserved_in_tx(&tx, port)? || !binding_in_tx(&tx, key, service, port)? {
                return Ok(Attempt::Conflict);
            }
        }
        let allocated_at = encode_timestamp(Utc::now());
        for &(service, port, previous) in &pending {
            if port_reserved_in_tx(&tx, port)? {
                return Ok(Attempt::Conflict);
            }
            let written = match previous {
                None => tx.execute(
                    "INSERT INTO port_allocations (
                         session_key, session_id, service_name, port, allocated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![key, session_id.as_str(), service, port, allocated_at],
                ),
                Some(old) => tx.execute(
                    "UPDATE port_allocations SET port = ?1, allocated_at = ?2
                     WHERE session_key = ?3 AND service_name = ?4 AND port = ?5",
                    params![port, allocated_at, key, service, old],
                ),
            };
            match written {
                Ok(1) => {}
                // The binding being replaced changed under us.
                Ok(_) => return Ok(Attempt::Conflict),
                Err(err) if is_unique_violation(&err) => return Ok(Attempt::Conflict),
                Err(err) => return Err(err.into()),
            }
        }
        tx.commit()?;
        Ok(Attempt::Committed(chosen))
    }

    /// Allocations of the active session `session_id`, in allocation order.
    pub fn ports_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<PortAllocation>, RegistryError> {
        let mut stmt = self.conn.prepare(
            "SELECT pa.session_id, pa.service_name, pa.port
             FROM port_allocations pa
             JOIN sessions s ON s.id = pa.session_key
             WHERE s.session_id = ?1 AND s.destroyed_at IS NULL
             ORDER BY pa.rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id.as_str()], map_allocation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Every allocation of every active session, ordered by port.
    pub fn all_allocations(&self) -> Result<Vec<PortAllocation>, RegistryError> {
        let mut stmt = self.conn.prepare(
            "SELECT pa.session_id, pa.service_name, pa.port
             FROM port_allocations pa
             JOIN sessions s ON s.id = pa.session_key
             WHERE s.destroyed_at IS NULL
             ORDER BY pa.port ASC",
        )?;
        let rows = stmt
            .query_map([], map_allocation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Ports no automatic allocation may hand out right now.
    pub fn excluded_ports(&self) -> Result<BTreeSet<u16>, RegistryError> {
        let mut stmt = self.conn.prepare(
            "SELECT pa.port FROM port_allocations pa
             JOIN sessions s ON s.id = pa.session_key
             WHERE s.destroyed_at IS NULL
             UNION
             SELECT port FROM port_reservations",
        )?;
        let ports = stmt
            .query_map([], |row| row.get::<_, u16>(0))?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        Ok(ports)
    }

    fn active_session_key(&self, session_id: &SessionId) -> Result<Option<i64>, RegistryError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM sessions WHERE session_id = ?1 AND destroyed_at IS NULL",
                params![session_id.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn bindings_for_key(&self, key: i64) -> Result<HashMap<String, u16>, RegistryError> {
        let mut stmt = self
            .conn
            .prepare("SELECT service_name, port FROM port_allocations WHERE session_key = ?1")?;
        let bindings = stmt
            .query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<HashMap<String, u16>>>()?;
        Ok(bindings)
    }
}

fn session_key_in_tx(
    tx: &Transaction<'_>,
    session_id: &SessionId,
) -> Result<Option<i64>, RegistryError> {
    Ok(tx
        .query_row(
            "SELECT id FROM sessions WHERE session_id = ?1 AND destroyed_at IS NULL",
            params![session_id.as_str()],
            |row| row.get(0),
        )
        .optional()?)
}

fn port_reserved_in_tx(tx: &Transaction<'_>, port: u16) -> Result<bool, RegistryError> {
    Ok(tx
        .query_row(
            "SELECT 1 FROM port_reservations WHERE port = ?1",
            params![port],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn binding_in_tx(
    tx: &Transaction<'_>,
    key: i64,
    service: &str,
    port: u16,
) -> Result<bool, RegistryError> {
    Ok(tx
        .query_row(
            "SELECT 1 FROM port_allocations
             WHERE session_key = ?1 AND service_name = ?2 AND port = ?3",
            params![key, service, port],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn map_allocation(row: &rusqlite::Row<'_>) -> rusqlite::Result<PortAllocation> {
    Ok(PortAllocation {
        session_id: SessionId(row.get(0)?),
        service_name: row.get(1)?,
        port: row.get(2)?,
    })
}

fn validate_services(services: &[&str]) -> Result<(), RegistryError> {
    let mut seen = HashSet::with_capacity(services.len());
    for &service in services {
        if service.trim().is_empty() {
            return Err(RegistryError::InvalidRequest(
                "service name must not be empty".to_owned(),
            ));
        }
        if !seen.insert(service) {
            return Err(RegistryError::InvalidRequest(format!(
                "service '{service}' requested more than once"
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
