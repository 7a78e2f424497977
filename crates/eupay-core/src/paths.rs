use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "nl";
pub const APP_ORG: &str = "delaparra";
pub const APP_NAME: &str = "eupay";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("EUPAY_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn config_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("config.json"))
}

pub fn audit_log_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("audit.log"))
}
