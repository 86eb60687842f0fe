pub mod commands;
pub mod config;
pub mod core;
pub mod logging;

use std::path::{Path, PathBuf};

use commands::App;
use tokio_util::sync::CancellationToken;

/// Loads `.env.local` then `.env` from the working directory; values already
/// in the environment win. Returns the files that were read, since this runs
/// before logging is set up.
pub fn load_env() -> Vec<PathBuf> {
    load_env_from(Path::new("."))
}

pub fn load_env_from(dir: &Path) -> Vec<PathBuf> {
    [".env.local", ".env"]
        .into_iter()
        .map(|file| dir.join(file))
        .filter(|path| dotenvy::from_path(path).is_ok())
        .collect()
}

/// Runs the periodic sync and title translation loops until Ctrl-C.
pub async fn serve(app: App) -> std::io::Result<()> {
    let cancel = CancellationToken::new();
    let handles = app.services().spawn_background(&cancel);
    tracing::info!(tasks = handles.len(), "background workers running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    cancel.cancel();
    for handle in handles {
        if let Err(error) = handle.await {
            tracing::warn!(%error, "background task ended abnormally");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_files_are_reported_in_load_order() {
        let directory = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            directory.path().join(".env.local"),
            "RSSR_ENV_FILE_MARKER=local\n",
        )
        .expect("write env file");

        let loaded = load_env_from(directory.path());

        assert_eq!(loaded, vec![directory.path().join(".env.local")]);
        assert_eq!(
            std::env::var("RSSR_ENV_FILE_MARKER").as_deref(),
            Ok("local")
        );
    }
}
