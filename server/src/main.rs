//! signond binary: config + logging init, storage adapters, bus server.

use std::sync::Arc;

use signond::prelude::*;
use signond::{AppBuilder, Config};

use signon_meta_adapter_sqlite::MetaAdapterSqlite;
use signon_secrets_adapter_sqlite::SecretsAdapterSqlite;

fn init_logging(config: &Config) {
	let filter = config
		.logging_level
		.clone()
		.or_else(|| std::env::var("RUST_LOG").ok())
		.unwrap_or_else(|| "info".to_owned());
	let builder = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::new(filter))
		.with_target(false);

	match &config.logging_output {
		Some(path) => {
			match std::fs::OpenOptions::new().create(true).append(true).open(path) {
				Ok(file) => builder.with_writer(Arc::new(file)).with_ansi(false).init(),
				Err(err) => {
					builder.init();
					warn!("cannot open log file {}: {}", path.display(), err);
				}
			}
		}
		None => builder.init(),
	}
}

fn ensure_storage_dir(config: &Config) -> std::io::Result<()> {
	use std::os::unix::fs::DirBuilderExt;
	if !config.storage_path.exists() {
		// Nothing under the storage dir is for other users' eyes.
		std::fs::DirBuilder::new().recursive(true).mode(0o700).create(&config.storage_path)?;
	}
	Ok(())
}

#[tokio::main]
async fn main() {
	let config = Config::load();
	init_logging(&config);
	info!("signond starting, storage at {}", config.storage_path.display());

	if let Err(err) = run(config).await {
		error!("signond failed: {}", err);
		std::process::exit(1);
	}
}

async fn run(config: Config) -> SsoResult<()> {
	ensure_storage_dir(&config)?;

	let meta = MetaAdapterSqlite::new(config.metadata_db_path()).await.map_err(|err| {
		error!("cannot open metadata db: {}", err);
		Error::InternalServer
	})?;

	// Without a secure-storage manager the secrets tier lives beside the
	// metadata and is available from the start. With one, the daemon
	// would boot with the tier closed and attach it on the mount event.
	let secrets =
		SecretsAdapterSqlite::new(config.secrets_db_path()).await.map_err(|err| {
			error!("cannot open secrets db: {}", err);
			Error::InternalServer
		})?;

	let app = AppBuilder::new(config)
		.meta_adapter(Arc::new(meta))
		.secrets_adapter(Arc::new(secrets))
		.build()
		.await?;

	app.run().await
}

// vim: ts=4
