//! Secrets database schema.
//!
//! Versioned independently from the metadata tier. The STORE table holds
//! the per-(identity, method) key→value blobs; deleting a credentials row
//! cascade-deletes its blobs through a trigger.

use sqlx::SqlitePool;

pub(crate) const DB_VERSION: i32 = 1;

pub(crate) async fn init_db(db: &SqlitePool) -> Result<(), sqlx::Error> {
	let version: i32 = sqlx::query_scalar("PRAGMA user_version").fetch_one(db).await?;
	if version == DB_VERSION {
		return Ok(());
	}

	let mut tx = db.begin().await?;

	if version == 0 {
		sqlx::query("DROP TABLE IF EXISTS STORE").execute(&mut *tx).await?;
		sqlx::query("DROP TABLE IF EXISTS CREDENTIALS").execute(&mut *tx).await?;

		sqlx::query(
			"CREATE TABLE CREDENTIALS (
				id INTEGER PRIMARY KEY,
				username TEXT,
				password TEXT
			)",
		)
		.execute(&mut *tx)
		.await?;

		sqlx::query(
			"CREATE TABLE STORE (
				identity_id INTEGER,
				method_id INTEGER,
				key TEXT,
				value BLOB,
				PRIMARY KEY (identity_id, method_id, key)
			)",
		)
		.execute(&mut *tx)
		.await?;

		sqlx::query(
			"CREATE TRIGGER tg_delete_credentials
				AFTER DELETE ON CREDENTIALS
				FOR EACH ROW BEGIN
					DELETE FROM STORE WHERE identity_id = OLD.id;
				END",
		)
		.execute(&mut *tx)
		.await?;
	}

	sqlx::query(&format!("PRAGMA user_version = {}", DB_VERSION)).execute(&mut *tx).await?;
	tx.commit().await?;

	Ok(())
}

// vim: ts=4
