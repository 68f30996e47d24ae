use crate::error::Result;
use chrono::Utc;
use std::path::Path;

pub mod config;

/// Prefix shared by all DAR sequence ids allocated by this process run.
pub fn mk_id_base() -> String {
    format!("{}-", Utc::now().format("%Y%m%d%H%M%S"))
}

/// A unique leaf directory name: `<root><yymmdd>_<random>`.
pub fn mk_fname(root: &str) -> String {
    let rnd = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}_{}", root, Utc::now().format("%y%m%d"), &rnd[..7])
}

/// # Errors
///
/// Fails if the path exists but is not a directory, or creation fails.
pub fn check_or_make_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    std::fs::create_dir(path)?;
    Ok(())
}

/// Creates a directory that must not exist yet.
pub fn make_new_dir(path: &Path) -> Result<()> {
    std::fs::create_dir(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnames_are_unique() {
        let a = mk_fname("sc05_");
        let b = mk_fname("sc05_");
        assert!(a.starts_with("sc05_"));
        assert_ne!(a, b);
    }

    #[test]
    fn make_new_dir_refuses_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("fresh");
        make_new_dir(&dir).unwrap();
        assert!(make_new_dir(&dir).is_err());
        check_or_make_dir(&dir).unwrap();
    }
}
