//! Metadata database schema and migrations.
//!
//! The schema version lives in SQLite's `user_version` pragma. Version 0
//! is treated as corrupt (or empty) and the schema is re-created from
//! scratch; older versions are upgraded with additive steps only. Cascade
//! deletes from CREDENTIALS to every child table are enforced by triggers
//! so that manual writes against the file stay consistent too.

use sqlx::SqlitePool;

pub(crate) const DB_VERSION: i32 = 2;

pub(crate) async fn init_db(db: &SqlitePool) -> Result<(), sqlx::Error> {
	let version: i32 = sqlx::query_scalar("PRAGMA user_version").fetch_one(db).await?;

	match version {
		0 => recreate(db).await?,
		1 => upgrade_v1(db).await?,
		v if v == DB_VERSION => {}
		v => {
			tracing::warn!("metadata db has newer schema version {}, using as-is", v);
		}
	}

	Ok(())
}

async fn recreate(db: &SqlitePool) -> Result<(), sqlx::Error> {
	let mut tx = db.begin().await?;

	for table in ["REFS", "OWNER", "ACL", "REALMS", "TOKENS", "MECHANISMS", "METHODS", "CREDENTIALS"] {
		sqlx::query(&format!("DROP TABLE IF EXISTS {}", table)).execute(&mut *tx).await?;
	}

	sqlx::query(
		"CREATE TABLE CREDENTIALS (
			id INTEGER PRIMARY KEY AUTOINCREMENT,
			caption TEXT,
			username TEXT,
			flags INTEGER,
			type INTEGER
		)",
	)
	.execute(&mut *tx)
	.await?;

	sqlx::query(
		"CREATE TABLE METHODS (
			id INTEGER PRIMARY KEY AUTOINCREMENT,
			method TEXT UNIQUE
		)",
	)
	.execute(&mut *tx)
	.await?;

	sqlx::query(
		"CREATE TABLE MECHANISMS (
			id INTEGER PRIMARY KEY AUTOINCREMENT,
			mechanism TEXT UNIQUE
		)",
	)
	.execute(&mut *tx)
	.await?;

	sqlx::query(
		"CREATE TABLE TOKENS (
			id INTEGER PRIMARY KEY AUTOINCREMENT,
			token TEXT UNIQUE
		)",
	)
	.execute(&mut *tx)
	.await?;

	sqlx::query(
		"CREATE TABLE REALMS (
			identity_id INTEGER,
			realm TEXT,
			hostname TEXT,
			PRIMARY KEY (identity_id, realm, hostname)
		)",
	)
	.execute(&mut *tx)
	.await?;

	sqlx::query(
		"CREATE TABLE ACL (
			rowid INTEGER PRIMARY KEY AUTOINCREMENT,
			identity_id INTEGER,
			method_id INTEGER,
			mechanism_id INTEGER,
			token_id INTEGER
		)",
	)
	.execute(&mut *tx)
	.await?;
	sqlx::query("CREATE INDEX idx_acl_identity ON ACL(identity_id)").execute(&mut *tx).await?;

	sqlx::query(
		"CREATE TABLE OWNER (
			rowid INTEGER PRIMARY KEY AUTOINCREMENT,
			identity_id INTEGER,
			token_id INTEGER
		)",
	)
	.execute(&mut *tx)
	.await?;
	sqlx::query("CREATE INDEX idx_owner_identity ON OWNER(identity_id)")
		.execute(&mut *tx)
		.await?;

	sqlx::query(
		"CREATE TABLE REFS (
			identity_id INTEGER,
			token_id INTEGER,
			ref TEXT,
			PRIMARY KEY (identity_id, token_id, ref)
		)",
	)
	.execute(&mut *tx)
	.await?;

	// Cascade deletes from CREDENTIALS to the child tables.
	sqlx::query(
		"CREATE TRIGGER tg_delete_credentials
			AFTER DELETE ON CREDENTIALS
			FOR EACH ROW BEGIN
				DELETE FROM REALMS WHERE identity_id = OLD.id;
				DELETE FROM ACL WHERE identity_id = OLD.id;
				DELETE FROM OWNER WHERE identity_id = OLD.id;
				DELETE FROM REFS WHERE identity_id = OLD.id;
			END",
	)
	.execute(&mut *tx)
	.await?;

	// Dropping a catalog row invalidates the ACL rows referencing it.
	sqlx::query(
		"CREATE TRIGGER tg_delete_method
			AFTER DELETE ON METHODS
			FOR EACH ROW BEGIN
				DELETE FROM ACL WHERE method_id = OLD.id;
			END",
	)
	.execute(&mut *tx)
	.await?;

	sqlx::query(&format!("PRAGMA user_version = {}", DB_VERSION)).execute(&mut *tx).await?;

	tx.commit().await?;
	Ok(())
}

/// v1 predates per-realm hostnames.
async fn upgrade_v1(db: &SqlitePool) -> Result<(), sqlx::Error> {
	let mut tx = db.begin().await?;
	let _ = sqlx::query("ALTER TABLE REALMS ADD COLUMN hostname TEXT").execute(&mut *tx).await;
	sqlx::query(&format!("PRAGMA user_version = {}", DB_VERSION)).execute(&mut *tx).await?;
	tx.commit().await?;
	Ok(())
}

// vim: ts=4
