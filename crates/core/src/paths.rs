use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".chatcell"))
            .unwrap_or_else(|| PathBuf::from(".chatcell"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.base.join("exports")
    }

    /// Profile directory used when the daemon launches its own browser.
    pub fn browser_profile_dir(&self) -> PathBuf {
        self.base.join("browser-profile")
    }

    pub fn context_dir(&self) -> PathBuf {
        self.base.join("context")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_under_base() {
        let paths = Paths::with_base(PathBuf::from("/tmp/cc"));
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/cc/config.json"));
        assert_eq!(paths.browser_profile_dir(), PathBuf::from("/tmp/cc/browser-profile"));
        assert!(paths.exports_dir().starts_with(&paths.base));
    }
}
