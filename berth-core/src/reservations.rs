//! Reservation store: operator-withheld ports.
//!
//! Reservations are independent of session lifecycle. Reserving a port that an
//! active session already holds does not evict it immediately; the binding is
//! replaced the next time that session allocates.

use std::collections::BTreeSet;

use chrono::Utc;
use rusqlite::params;

use crate::error::RegistryError;
use crate::store::Store;
use crate::types::{decode_timestamp, encode_timestamp, Reservation};

impl Store {
    /// Withhold `port` from automatic allocation. Re-reserving overwrites the reason.
    pub fn reserve(&mut self, port: u16, reason: &str) -> Result<(), RegistryError> {
        if port == 0 {
            return Err(RegistryError::InvalidRequest(
                "port 0 cannot be reserved".to_owned(),
            ));
        }
        let tx = self.write_tx()?;
        tx.execute(
            "INSERT INTO port_reservations (port, reason, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(port) DO UPDATE SET reason = excluded.reason",
            params![port, reason, encode_timestamp(Utc::now())],
        )?;
        tx.commit()?;
        tracing::info!(port, reason, "reserved port");
        Ok(())
    }

    /// Release a reservation. Returns `false` if the port was not reserved.
    pub fn unreserve(&mut self, port: u16) -> Result<bool, RegistryError> {
        let tx = self.write_tx()?;
        let deleted = tx.execute(
            "DELETE FROM port_reservations WHERE port = ?1",
            params![port],
        )?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    pub fn reserved_ports(&self) -> Result<BTreeSet<u16>, RegistryError> {
        let mut stmt = self.conn.prepare("SELECT port FROM port_reservations")?;
        let ports = stmt
            .query_map([], |row| row.get::<_, u16>(0))?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        Ok(ports)
    }

    /// All reservations, ordered by port.
    pub fn reservations(&self) -> Result<Vec<Reservation>, RegistryError> {
        let mut stmt = self
            .conn
            .prepare("SELECT port, reason, created_at FROM port_reservations ORDER BY port ASC")?;
        let rows = stmt
            .query_map([], |row| {
                let created_at: String = row.get(2)?;
                Ok(Reservation {
                    port: row.get(0)?,
                    reason: row.get(1)?,
                    created_at: decode_timestamp(&created_at).ok_or_else(|| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            Box::new(std::io::Error::other(format!(
                                "invalid timestamp '{created_at}'"
                            ))),
                        )
                    })?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_is_an_upsert_on_port() {
        let mut store = Store::in_memory().unwrap();
        store.reserve(5432, "local postgres").unwrap();
        store.reserve(5432, "system postgres").unwrap();

        let all = store.reservations().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].reason, "system postgres");
    }

    #[test]
    fn unreserve_reports_whether_anything_changed() {
        let mut store = Store::in_memory().unwrap();
        store.reserve(8080, "").unwrap();
        assert!(store.unreserve(8080).unwrap());
        assert!(!store.unreserve(8080).unwrap());
        assert!(store.reserved_ports().unwrap().is_empty());
    }

    #[test]
    fn port_zero_is_rejected() {
        let mut store = Store::in_memory().unwrap();
        assert!(matches!(
            store.reserve(0, "x"),
            Err(RegistryError::InvalidRequest(_))
        ));
    }
}
