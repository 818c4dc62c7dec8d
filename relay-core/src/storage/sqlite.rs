// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! SQLite-backed protocol store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::{state_keys, DeviceState, ProtocolStore, StoreError, StoreResult};
use crate::address::Address;
use crate::keys::{IdentityKeyPair, PreKeyPair};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS our_identity (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        private_key BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS identities (
        user_id TEXT PRIMARY KEY,
        identity_key BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS pre_keys (
        key_id INTEGER PRIMARY KEY,
        key_pair TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS signed_pre_keys (
        key_id INTEGER PRIMARY KEY,
        key_pair TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS sessions (
        user_id TEXT NOT NULL,
        device_id INTEGER NOT NULL,
        record BLOB NOT NULL,
        PRIMARY KEY (user_id, device_id)
    );
    CREATE TABLE IF NOT EXISTS blocked (
        user_id TEXT PRIMARY KEY
    );
";

/// Protocol store persisted in a local SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens or creates a store database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Creates an in-memory store (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn block(&self, user_id: &str) -> StoreResult<()> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO blocked (user_id) VALUES (?1)",
            params![user_id],
        )?;
        Ok(())
    }

    pub fn unblock(&self, user_id: &str) -> StoreResult<()> {
        self.conn()?
            .execute("DELETE FROM blocked WHERE user_id = ?1", params![user_id])?;
        Ok(())
    }

    fn load_key_pair(&self, table: &str, key_id: u32) -> StoreResult<Option<PreKeyPair>> {
        let json: Option<String> = self
            .conn()?
            .query_row(
                &format!("SELECT key_pair FROM {table} WHERE key_id = ?1"),
                params![key_id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
            .transpose()
    }

    fn store_key_pair(&self, table: &str, key_id: u32, pair: &PreKeyPair) -> StoreResult<()> {
        let json = serde_json::to_string(pair)?;
        self.conn()?.execute(
            &format!("INSERT OR REPLACE INTO {table} (key_id, key_pair) VALUES (?1, ?2)"),
            params![key_id, json],
        )?;
        Ok(())
    }

    fn remove_key_pair(&self, table: &str, key_id: u32) -> StoreResult<()> {
        self.conn()?.execute(
            &format!("DELETE FROM {table} WHERE key_id = ?1"),
            params![key_id],
        )?;
        Ok(())
    }
}

fn device_of(addr: &Address) -> StoreResult<u32> {
    addr.device_id()
        .ok_or_else(|| StoreError::NotFound(format!("session address without device: {addr}")))
}

fn write_state(conn: &Connection, key: &str, value: &Value) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO state (key, value) VALUES (?1, ?2)",
        params![key, serde_json::to_string(value)?],
    )?;
    Ok(())
}

#[async_trait]
impl ProtocolStore for SqliteStore {
    async fn get_state(&self, key: &str) -> StoreResult<Option<Value>> {
        let json: Option<String> = self
            .conn()?
            .query_row(
                "SELECT value FROM state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
            .transpose()
    }

    async fn put_state(&self, key: &str, value: Value) -> StoreResult<()> {
        let conn = self.conn()?;
        write_state(&conn, key, &value)
    }

    async fn remove_state(&self, key: &str) -> StoreResult<()> {
        self.conn()?
            .execute("DELETE FROM state WHERE key = ?1", params![key])?;
        Ok(())
    }

    async fn put_states(&self, entries: &[(&str, Value)]) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (key, value) in entries {
            write_state(&tx, key, value)?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_our_identity(&self) -> StoreResult<Option<IdentityKeyPair>> {
        let private: Option<Vec<u8>> = self
            .conn()?
            .query_row(
                "SELECT private_key FROM our_identity WHERE id = 0",
                [],
                |row| row.get(0),
            )
            .optional()?;
        private
            .map(|p| {
                IdentityKeyPair::from_private_key(&p)
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .transpose()
    }

    async fn save_our_identity(&self, pair: &IdentityKeyPair) -> StoreResult<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO our_identity (id, private_key) VALUES (0, ?1)",
            params![pair.private_key().to_vec()],
        )?;
        Ok(())
    }

    async fn remove_our_identity(&self) -> StoreResult<()> {
        self.conn()?.execute("DELETE FROM our_identity", [])?;
        Ok(())
    }

    async fn load_identity(&self, user_id: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT identity_key FROM identities WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    async fn save_identity(&self, user_id: &str, identity_key: &[u8]) -> StoreResult<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO identities (user_id, identity_key) VALUES (?1, ?2)",
            params![user_id, identity_key],
        )?;
        Ok(())
    }

    async fn remove_identity(&self, user_id: &str) -> StoreResult<()> {
        self.conn()?.execute(
            "DELETE FROM identities WHERE user_id = ?1",
            params![user_id],
        )?;
        Ok(())
    }

    async fn load_pre_key(&self, key_id: u32) -> StoreResult<Option<PreKeyPair>> {
        self.load_key_pair("pre_keys", key_id)
    }

    async fn store_pre_key(&self, key_id: u32, pair: &PreKeyPair) -> StoreResult<()> {
        self.store_key_pair("pre_keys", key_id, pair)
    }

    async fn remove_pre_key(&self, key_id: u32) -> StoreResult<()> {
        self.remove_key_pair("pre_keys", key_id)
    }

    async fn load_signed_pre_key(&self, key_id: u32) -> StoreResult<Option<PreKeyPair>> {
        self.load_key_pair("signed_pre_keys", key_id)
    }

    async fn store_signed_pre_key(&self, key_id: u32, pair: &PreKeyPair) -> StoreResult<()> {
        self.store_key_pair("signed_pre_keys", key_id, pair)
    }

    async fn remove_signed_pre_key(&self, key_id: u32) -> StoreResult<()> {
        self.remove_key_pair("signed_pre_keys", key_id)
    }

    async fn signed_pre_key_ids(&self) -> StoreResult<Vec<u32>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key_id FROM signed_pre_keys ORDER BY key_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<u32>, _>>()?;
        Ok(ids)
    }

    async fn load_session(&self, addr: &Address) -> StoreResult<Option<Vec<u8>>> {
        let device = device_of(addr)?;
        Ok(self
            .conn()?
            .query_row(
                "SELECT record FROM sessions WHERE user_id = ?1 AND device_id = ?2",
                params![addr.user_id(), device],
                |row| row.get(0),
            )
            .optional()?)
    }

    async fn store_session(&self, addr: &Address, record: &[u8]) -> StoreResult<()> {
        let device = device_of(addr)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO sessions (user_id, device_id, record) VALUES (?1, ?2, ?3)",
            params![addr.user_id(), device, record],
        )?;
        Ok(())
    }

    async fn remove_session(&self, addr: &Address) -> StoreResult<()> {
        let device = device_of(addr)?;
        self.conn()?.execute(
            "DELETE FROM sessions WHERE user_id = ?1 AND device_id = ?2",
            params![addr.user_id(), device],
        )?;
        Ok(())
    }

    async fn remove_all_sessions(&self, user_id: &str) -> StoreResult<()> {
        self.conn()?
            .execute("DELETE FROM sessions WHERE user_id = ?1", params![user_id])?;
        Ok(())
    }

    async fn clear_session_store(&self) -> StoreResult<()> {
        self.conn()?.execute("DELETE FROM sessions", [])?;
        Ok(())
    }

    async fn device_ids(&self, user_id: &str) -> StoreResult<Vec<u32>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT device_id FROM sessions WHERE user_id = ?1 ORDER BY device_id")?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<Result<Vec<u32>, _>>()?;
        Ok(ids)
    }

    async fn save_device_state(&self, state: &DeviceState) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM sessions", [])?;
        tx.execute("DELETE FROM our_identity", [])?;
        for key in state_keys::DEVICE_STATE {
            tx.execute("DELETE FROM state WHERE key = ?1", params![key])?;
        }
        tx.execute(
            "DELETE FROM identities WHERE user_id = ?1",
            params![state.addr],
        )?;
        for (key, value) in state.state_entries() {
            write_state(&tx, key, &value)?;
        }
        tx.execute(
            "INSERT INTO identities (user_id, identity_key) VALUES (?1, ?2)",
            params![state.addr, state.identity.public_key().to_vec()],
        )?;
        tx.execute(
            "INSERT INTO our_identity (id, private_key) VALUES (0, ?1)",
            params![state.identity.private_key().to_vec()],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn is_blocked(&self, user_id: &str) -> StoreResult<bool> {
        let found: Option<String> = self
            .conn()?
            .query_row(
                "SELECT user_id FROM blocked WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}
