use crate::types::{Result, WatermarkState};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One JSON document per account holding its cursor, pinned-item tracking
/// and cached profile asset URLs.
///
/// Saves go through a temporary file and a rename, so a crash never leaves a
/// half-written document behind. There is exactly one writer per process.
pub struct WatermarkStore {
    dir: PathBuf,
}

impl WatermarkStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, account: &str) -> PathBuf {
        self.dir.join(format!("state_{}.json", sanitize_label(account)))
    }

    /// Load the account's state, or an empty state on first run
    pub async fn load(&self, account: &str) -> Result<WatermarkState> {
        let path = self.path_for(account);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state: WatermarkState = serde_json::from_slice(&bytes)?;
                debug!("Loaded watermark for @{}: {:?}", account, state.last_processed_at);
                Ok(state)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No watermark for @{} yet ({})", account, path.display());
                Ok(WatermarkState::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, account: &str, state: &WatermarkState) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(account);
        let tmp = tmp_path(&path);

        let body = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Saved watermark for @{}: {:?}", account, state.last_processed_at);
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Handles are `[A-Za-z0-9_]`; anything else is replaced so a label can never
/// escape the state directory.
fn sanitize_label(account: &str) -> String {
    account
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}
