//! SQLite implementation of the signon secrets tier.
//!
//! One database file (`signon-secrets.db` by convention), possibly on
//! encrypted media that the daemon mounts and unmounts at runtime. The
//! adapter is only constructed while that media is available; absence is
//! handled a layer up by the credentials DB façade and its cache.

use async_trait::async_trait;
use sqlx::{sqlite, Row, SqlitePool};
use std::{fmt::Debug, path::Path};

use signon_types::error::{StoreError, StoreResult};
use signon_types::secrets_adapter::{SecretsAdapter, SecretsRecord, MAX_DATA_STORAGE};
use signon_types::types::{IdentityId, SessionData};

mod schema;

fn inspect(err: &sqlx::Error) {
	tracing::warn!("secrets db: {:#?}", err);
}

fn stmt_err(err: sqlx::Error) -> StoreError {
	inspect(&err);
	StoreError::Statement
}

/// Serialized size of a blob map, as counted against [`MAX_DATA_STORAGE`].
fn data_size(data: &SessionData) -> usize {
	data.iter()
		.map(|(key, value)| key.len() + value.to_string().len())
		.sum()
}

pub struct SecretsAdapterSqlite {
	db: SqlitePool,
}

impl Debug for SecretsAdapterSqlite {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SecretsAdapterSqlite").finish()
	}
}

impl SecretsAdapterSqlite {
	pub async fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
		let opts = sqlite::SqliteConnectOptions::new()
			.filename(path.as_ref())
			.create_if_missing(true)
			.journal_mode(sqlite::SqliteJournalMode::Wal);
		let db = sqlite::SqlitePoolOptions::new()
			.max_connections(5)
			.connect_with(opts)
			.await
			.inspect_err(inspect)
			.map_err(|_| StoreError::Connection)?;

		schema::init_db(&db).await.map_err(stmt_err)?;

		Ok(Self { db })
	}
}

#[async_trait]
impl SecretsAdapter for SecretsAdapterSqlite {
	async fn update_credentials(&self, id: IdentityId, record: &SecretsRecord) -> StoreResult<()> {
		sqlx::query("INSERT OR REPLACE INTO CREDENTIALS (id, username, password) VALUES (?1, ?2, ?3)")
			.bind(id.0)
			.bind(record.username.as_deref())
			.bind(record.password.as_deref())
			.execute(&self.db)
			.await
			.map_err(stmt_err)?;
		Ok(())
	}

	async fn read_credentials(&self, id: IdentityId) -> StoreResult<Option<SecretsRecord>> {
		let row = sqlx::query("SELECT username, password FROM CREDENTIALS WHERE id = ?1")
			.bind(id.0)
			.fetch_optional(&self.db)
			.await
			.map_err(stmt_err)?;

		match row {
			Some(row) => Ok(Some(SecretsRecord {
				username: row.try_get("username").map_err(stmt_err)?,
				password: row.try_get("password").map_err(stmt_err)?,
			})),
			None => Ok(None),
		}
	}

	async fn remove_credentials(&self, id: IdentityId) -> StoreResult<()> {
		sqlx::query("DELETE FROM CREDENTIALS WHERE id = ?1")
			.bind(id.0)
			.execute(&self.db)
			.await
			.map_err(stmt_err)?;
		Ok(())
	}

	async fn check_password(
		&self,
		id: IdentityId,
		username: Option<&str>,
		password: &str,
	) -> StoreResult<bool> {
		let count: i64 = match username {
			Some(username) => sqlx::query_scalar(
				"SELECT COUNT(*) FROM CREDENTIALS WHERE id = ?1 AND username = ?2 AND password = ?3",
			)
			.bind(id.0)
			.bind(username)
			.bind(password)
			.fetch_one(&self.db)
			.await,
			None => sqlx::query_scalar(
				"SELECT COUNT(*) FROM CREDENTIALS WHERE id = ?1 AND password = ?2",
			)
			.bind(id.0)
			.bind(password)
			.fetch_one(&self.db)
			.await,
		}
		.map_err(stmt_err)?;

		Ok(count > 0)
	}

	async fn load_data(&self, id: IdentityId, method_id: u32) -> StoreResult<SessionData> {
		let rows = sqlx::query("SELECT key, value FROM STORE WHERE identity_id = ?1 AND method_id = ?2")
			.bind(id.0)
			.bind(method_id)
			.fetch_all(&self.db)
			.await
			.map_err(stmt_err)?;

		let mut data = SessionData::new();
		for row in rows {
			let key: String = row.try_get("key").map_err(stmt_err)?;
			let raw: Vec<u8> = row.try_get("value").map_err(stmt_err)?;
			let value = serde_json::from_slice(&raw).map_err(|err| {
				tracing::warn!("secrets db: undecodable blob value for key {}: {}", key, err);
				StoreError::Statement
			})?;
			data.insert(key, value);
		}
		Ok(data)
	}

	async fn store_data(
		&self,
		id: IdentityId,
		method_id: u32,
		data: &SessionData,
	) -> StoreResult<()> {
		// Budget check happens before any row is touched, so an oversized
		// blob never destroys the previous one.
		let size = data_size(data);
		if size > MAX_DATA_STORAGE {
			tracing::warn!(
				"data storage limit exceeded for identity {} method {}: {} bytes",
				id,
				method_id,
				size
			);
			return Err(StoreError::Statement);
		}

		let mut tx = self.db.begin().await.map_err(stmt_err)?;
		sqlx::query("DELETE FROM STORE WHERE identity_id = ?1 AND method_id = ?2")
			.bind(id.0)
			.bind(method_id)
			.execute(&mut *tx)
			.await
			.map_err(stmt_err)?;
		for (key, value) in data {
			sqlx::query(
				"INSERT INTO STORE (identity_id, method_id, key, value) VALUES (?1, ?2, ?3, ?4)",
			)
			.bind(id.0)
			.bind(method_id)
			.bind(key)
			.bind(value.to_string().into_bytes())
			.execute(&mut *tx)
			.await
			.map_err(stmt_err)?;
		}
		tx.commit().await.map_err(stmt_err)?;
		Ok(())
	}

	async fn remove_data(&self, id: IdentityId, method_id: Option<u32>) -> StoreResult<()> {
		match method_id {
			Some(method_id) => {
				sqlx::query("DELETE FROM STORE WHERE identity_id = ?1 AND method_id = ?2")
					.bind(id.0)
					.bind(method_id)
					.execute(&self.db)
					.await
			}
			None => {
				sqlx::query("DELETE FROM STORE WHERE identity_id = ?1")
					.bind(id.0)
					.execute(&self.db)
					.await
			}
		}
		.map_err(stmt_err)?;
		Ok(())
	}

	async fn clear(&self) -> StoreResult<()> {
		let mut tx = self.db.begin().await.map_err(stmt_err)?;
		sqlx::query("DELETE FROM STORE").execute(&mut *tx).await.map_err(stmt_err)?;
		sqlx::query("DELETE FROM CREDENTIALS").execute(&mut *tx).await.map_err(stmt_err)?;
		tx.commit().await.map_err(stmt_err)?;
		Ok(())
	}
}

// vim: ts=4
