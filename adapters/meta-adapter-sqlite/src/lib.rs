//! SQLite implementation of the signon metadata tier.
//!
//! One database file (`signon.db` by convention) holding identity rows,
//! the method/mechanism/token catalogs and the per-identity join tables.
//! The ACL join carries (method, mechanism, token) triples; the method map
//! of an identity and its distinct token set are both derived from it.

use async_trait::async_trait;
use sqlx::{sqlite, Row, SqlitePool};
use std::{collections::HashMap, fmt::Debug, path::Path};

use signon_types::error::{StoreError, StoreResult};
use signon_types::meta_adapter::{MetaAdapter, Reference};
use signon_types::types::{CredentialsType, IdentityId, IdentityInfo, MethodMap};

mod schema;

fn inspect(err: &sqlx::Error) {
	tracing::warn!("metadata db: {:#?}", err);
}

fn stmt_err(err: sqlx::Error) -> StoreError {
	inspect(&err);
	StoreError::Statement
}

pub struct MetaAdapterSqlite {
	db: SqlitePool,
}

impl Debug for MetaAdapterSqlite {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MetaAdapterSqlite").finish()
	}
}

impl MetaAdapterSqlite {
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

	async fn ensure_catalog_id(
		tx: &mut sqlx::SqliteConnection,
		table: &str,
		column: &str,
		name: &str,
	) -> Result<u32, sqlx::Error> {
		let existing: Option<u32> =
			sqlx::query_scalar(&format!("SELECT id FROM {} WHERE {} = ?1", table, column))
				.bind(name)
				.fetch_optional(&mut *tx)
				.await?;
		if let Some(id) = existing {
			return Ok(id);
		}
		sqlx::query_scalar(&format!(
			"INSERT INTO {} ({}) VALUES (?1) RETURNING id",
			table, column
		))
		.bind(name)
		.fetch_one(&mut *tx)
		.await
	}

	/// Writes the ACL / OWNER / REALMS child rows of an identity. The ACL
	/// table gets the (method × mechanism × token) cross product; absent
	/// dimensions are stored as NULL so that an identity with tokens but
	/// no methods (or the other way around) is still representable.
	async fn insert_children(
		tx: &mut sqlx::SqliteConnection,
		id: IdentityId,
		info: &IdentityInfo,
	) -> Result<(), sqlx::Error> {
		for realm in &info.realms {
			sqlx::query(
				"INSERT OR IGNORE INTO REALMS (identity_id, realm, hostname) VALUES (?1, ?2, '')",
			)
			.bind(id.0)
			.bind(&**realm)
			.execute(&mut *tx)
			.await?;
		}

		let mut token_ids = Vec::with_capacity(info.access_control_list.len());
		for token in &info.access_control_list {
			token_ids.push(Self::ensure_catalog_id(tx, "TOKENS", "token", token).await?);
		}

		let mut acl_rows: Vec<(Option<u32>, Option<u32>, Option<u32>)> = Vec::new();
		for (method, mechanisms) in &info.methods {
			let method_id = Self::ensure_catalog_id(tx, "METHODS", "method", method).await?;
			let mech_ids = if mechanisms.is_empty() {
				vec![None]
			} else {
				let mut ids = Vec::with_capacity(mechanisms.len());
				for mech in mechanisms {
					ids.push(Some(
						Self::ensure_catalog_id(tx, "MECHANISMS", "mechanism", mech).await?,
					));
				}
				ids
			};
			for mech_id in mech_ids {
				if token_ids.is_empty() {
					acl_rows.push((Some(method_id), mech_id, None));
				} else {
					for token_id in &token_ids {
						acl_rows.push((Some(method_id), mech_id, Some(*token_id)));
					}
				}
			}
		}
		if info.methods.is_empty() {
			for token_id in &token_ids {
				acl_rows.push((None, None, Some(*token_id)));
			}
		}
		for (method_id, mech_id, token_id) in acl_rows {
			sqlx::query(
				"INSERT INTO ACL (identity_id, method_id, mechanism_id, token_id)
				VALUES (?1, ?2, ?3, ?4)",
			)
			.bind(id.0)
			.bind(method_id)
			.bind(mech_id)
			.bind(token_id)
			.execute(&mut *tx)
			.await?;
		}

		for token in &info.owner_list {
			let token_id = Self::ensure_catalog_id(tx, "TOKENS", "token", token).await?;
			sqlx::query("INSERT INTO OWNER (identity_id, token_id) VALUES (?1, ?2)")
				.bind(id.0)
				.bind(token_id)
				.execute(&mut *tx)
				.await?;
		}

		Ok(())
	}

	async fn delete_children(
		tx: &mut sqlx::SqliteConnection,
		id: IdentityId,
	) -> Result<(), sqlx::Error> {
		for stmt in [
			"DELETE FROM REALMS WHERE identity_id = ?1",
			"DELETE FROM ACL WHERE identity_id = ?1",
			"DELETE FROM OWNER WHERE identity_id = ?1",
		] {
			sqlx::query(stmt).bind(id.0).execute(&mut *tx).await?;
		}
		Ok(())
	}

	async fn read_methods(&self, id: IdentityId) -> Result<MethodMap, sqlx::Error> {
		let rows = sqlx::query(
			"SELECT METHODS.method, MECHANISMS.mechanism
			FROM ACL
			JOIN METHODS ON ACL.method_id = METHODS.id
			LEFT JOIN MECHANISMS ON ACL.mechanism_id = MECHANISMS.id
			WHERE ACL.identity_id = ?1",
		)
		.bind(id.0)
		.fetch_all(&self.db)
		.await?;

		let mut methods = MethodMap::new();
		for row in rows {
			let method: Box<str> = row.try_get("method")?;
			let mechanism: Option<Box<str>> = row.try_get("mechanism")?;
			let entry = methods.entry(method).or_default();
			if let Some(mechanism) = mechanism {
				if !entry.contains(&mechanism) {
					entry.push(mechanism);
				}
			}
		}
		Ok(methods)
	}

	async fn read_tokens(&self, id: IdentityId, table: &str) -> Result<Vec<Box<str>>, sqlx::Error> {
		let rows = sqlx::query(&format!(
			"SELECT DISTINCT TOKENS.token FROM {table}
			JOIN TOKENS ON {table}.token_id = TOKENS.id
			WHERE {table}.identity_id = ?1",
		))
		.bind(id.0)
		.fetch_all(&self.db)
		.await?;
		rows.iter().map(|row| row.try_get("token")).collect()
	}

	async fn assemble(&self, row: sqlx::sqlite::SqliteRow) -> Result<IdentityInfo, sqlx::Error> {
		let id = IdentityId(row.try_get("id")?);
		let mut info = IdentityInfo {
			id,
			caption: row.try_get::<Option<Box<str>>, _>("caption")?.unwrap_or_default(),
			username: row.try_get("username")?,
			typ: CredentialsType::try_from(row.try_get::<u32, _>("type")?).unwrap_or_default(),
			..IdentityInfo::default()
		};
		info.apply_flags(row.try_get::<u32, _>("flags")?);

		info.methods = self.read_methods(id).await?;
		info.realms = sqlx::query_scalar("SELECT realm FROM REALMS WHERE identity_id = ?1")
			.bind(id.0)
			.fetch_all(&self.db)
			.await?;
		info.access_control_list = self.read_tokens(id, "ACL").await?;
		info.owner_list = self.read_tokens(id, "OWNER").await?;
		info.ref_count =
			sqlx::query_scalar("SELECT COUNT(*) FROM REFS WHERE identity_id = ?1")
				.bind(id.0)
				.fetch_one(&self.db)
				.await?;

		Ok(info)
	}
}

#[async_trait]
impl MetaAdapter for MetaAdapterSqlite {
	async fn insert_identity(&self, info: &IdentityInfo) -> StoreResult<IdentityId> {
		let mut tx = self.db.begin().await.map_err(stmt_err)?;

		// Secret usernames never land in the metadata tier.
		let username = if info.username_is_secret { None } else { info.username.as_deref() };
		let id: u32 = sqlx::query_scalar(
			"INSERT INTO CREDENTIALS (caption, username, flags, type)
			VALUES (?1, ?2, ?3, ?4) RETURNING id",
		)
		.bind(&*info.caption)
		.bind(username)
		.bind(info.flags())
		.bind(u32::from(info.typ))
		.fetch_one(&mut *tx)
		.await
		.map_err(stmt_err)?;

		Self::insert_children(&mut tx, IdentityId(id), info).await.map_err(stmt_err)?;
		tx.commit().await.map_err(stmt_err)?;

		Ok(IdentityId(id))
	}

	async fn update_identity(&self, info: &IdentityInfo) -> StoreResult<()> {
		let mut tx = self.db.begin().await.map_err(stmt_err)?;

		let username = if info.username_is_secret { None } else { info.username.as_deref() };
		let result = sqlx::query(
			"UPDATE CREDENTIALS SET caption = ?2, username = ?3, flags = ?4, type = ?5
			WHERE id = ?1",
		)
		.bind(info.id.0)
		.bind(&*info.caption)
		.bind(username)
		.bind(info.flags())
		.bind(u32::from(info.typ))
		.execute(&mut *tx)
		.await
		.map_err(stmt_err)?;
		if result.rows_affected() == 0 {
			return Err(StoreError::Statement);
		}

		Self::delete_children(&mut tx, info.id).await.map_err(stmt_err)?;
		Self::insert_children(&mut tx, info.id, info).await.map_err(stmt_err)?;
		tx.commit().await.map_err(stmt_err)?;

		Ok(())
	}

	async fn remove_identity(&self, id: IdentityId) -> StoreResult<bool> {
		let result = sqlx::query("DELETE FROM CREDENTIALS WHERE id = ?1")
			.bind(id.0)
			.execute(&self.db)
			.await
			.map_err(stmt_err)?;
		Ok(result.rows_affected() > 0)
	}

	async fn read_identity(&self, id: IdentityId) -> StoreResult<Option<IdentityInfo>> {
		let row = sqlx::query("SELECT id, caption, username, flags, type FROM CREDENTIALS WHERE id = ?1")
			.bind(id.0)
			.fetch_optional(&self.db)
			.await
			.map_err(stmt_err)?;

		match row {
			Some(row) => Ok(Some(self.assemble(row).await.map_err(stmt_err)?)),
			None => Ok(None),
		}
	}

	async fn list_identities(
		&self,
		_filter: &HashMap<String, serde_json::Value>,
	) -> StoreResult<Vec<IdentityInfo>> {
		// The filter hook is accepted but unused.
		let rows = sqlx::query("SELECT id, caption, username, flags, type FROM CREDENTIALS ORDER BY id")
			.fetch_all(&self.db)
			.await
			.map_err(stmt_err)?;

		let mut identities = Vec::with_capacity(rows.len());
		for row in rows {
			identities.push(self.assemble(row).await.map_err(stmt_err)?);
		}
		Ok(identities)
	}

	async fn method_id(&self, method: &str) -> StoreResult<Option<u32>> {
		sqlx::query_scalar("SELECT id FROM METHODS WHERE method = ?1")
			.bind(method)
			.fetch_optional(&self.db)
			.await
			.map_err(stmt_err)
	}

	async fn insert_method(&self, method: &str) -> StoreResult<u32> {
		let mut tx = self.db.begin().await.map_err(stmt_err)?;
		let id = Self::ensure_catalog_id(&mut tx, "METHODS", "method", method)
			.await
			.map_err(stmt_err)?;
		tx.commit().await.map_err(stmt_err)?;
		Ok(id)
	}

	async fn acl_tokens(&self, id: IdentityId) -> StoreResult<Vec<Box<str>>> {
		self.read_tokens(id, "ACL").await.map_err(stmt_err)
	}

	async fn owner_tokens(&self, id: IdentityId) -> StoreResult<Vec<Box<str>>> {
		self.read_tokens(id, "OWNER").await.map_err(stmt_err)
	}

	async fn add_reference(&self, id: IdentityId, token: &str, reference: &str) -> StoreResult<()> {
		let mut tx = self.db.begin().await.map_err(stmt_err)?;
		let token_id =
			Self::ensure_catalog_id(&mut tx, "TOKENS", "token", token).await.map_err(stmt_err)?;
		sqlx::query("INSERT OR IGNORE INTO REFS (identity_id, token_id, ref) VALUES (?1, ?2, ?3)")
			.bind(id.0)
			.bind(token_id)
			.bind(reference)
			.execute(&mut *tx)
			.await
			.map_err(stmt_err)?;
		tx.commit().await.map_err(stmt_err)?;
		Ok(())
	}

	async fn remove_reference(
		&self,
		id: IdentityId,
		token: &str,
		reference: Option<&str>,
	) -> StoreResult<bool> {
		let result = match reference {
			Some(reference) => sqlx::query(
				"DELETE FROM REFS WHERE identity_id = ?1 AND ref = ?3
				AND token_id = (SELECT id FROM TOKENS WHERE token = ?2)",
			)
			.bind(id.0)
			.bind(token)
			.bind(reference)
			.execute(&self.db)
			.await,
			None => sqlx::query(
				"DELETE FROM REFS WHERE identity_id = ?1
				AND token_id = (SELECT id FROM TOKENS WHERE token = ?2)",
			)
			.bind(id.0)
			.bind(token)
			.execute(&self.db)
			.await,
		}
		.map_err(stmt_err)?;

		Ok(result.rows_affected() > 0)
	}

	async fn references(
		&self,
		id: IdentityId,
		token: Option<&str>,
	) -> StoreResult<Vec<Reference>> {
		let rows = match token {
			Some(token) => sqlx::query(
				"SELECT TOKENS.token, REFS.ref FROM REFS
				JOIN TOKENS ON REFS.token_id = TOKENS.id
				WHERE REFS.identity_id = ?1 AND TOKENS.token = ?2",
			)
			.bind(id.0)
			.bind(token)
			.fetch_all(&self.db)
			.await,
			None => sqlx::query(
				"SELECT TOKENS.token, REFS.ref FROM REFS
				JOIN TOKENS ON REFS.token_id = TOKENS.id
				WHERE REFS.identity_id = ?1",
			)
			.bind(id.0)
			.fetch_all(&self.db)
			.await,
		}
		.map_err(stmt_err)?;

		rows.iter()
			.map(|row| {
				Ok(Reference {
					token: row.try_get("token").map_err(stmt_err)?,
					reference: row.try_get("ref").map_err(stmt_err)?,
				})
			})
			.collect()
	}

	async fn clear(&self) -> StoreResult<()> {
		let mut tx = self.db.begin().await.map_err(stmt_err)?;
		for stmt in [
			"DELETE FROM CREDENTIALS",
			"DELETE FROM METHODS",
			"DELETE FROM MECHANISMS",
			"DELETE FROM TOKENS",
		] {
			sqlx::query(stmt).execute(&mut *tx).await.map_err(stmt_err)?;
		}
		tx.commit().await.map_err(stmt_err)?;
		Ok(())
	}
}

// vim: ts=4
