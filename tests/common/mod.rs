/// Common test utilities and helpers for repovault tests
use assert_fs::fixture::{FileWriteStr, PathChild};
use assert_fs::TempDir;
use std::path::PathBuf;

/// Isolated filesystem layout for CLI tests: config dir, download dir and a
/// tracked-list file, all under one temp root passed to the binary via
/// XDG environment variables and an explicit --config path.
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub config_path: PathBuf,
    pub download_dir: PathBuf,
    pub tracklist_path: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let download_dir = temp_dir.child("mirror").path().to_path_buf();
        std::fs::create_dir_all(&download_dir).expect("Failed to create download dir");

        let tracklist_path = download_dir.join("repositories.txt");
        let config_path = temp_dir
            .child("config/repovault/config.yml")
            .path()
            .to_path_buf();

        let env = Self {
            temp_dir,
            config_path,
            download_dir,
            tracklist_path,
        };
        env.write_config();
        env
    }

    /// Write a minimal valid config pointing at the temp layout
    pub fn write_config(&self) {
        let content = format!(
            r#"
download_dir: "{}"
tracklist: "{}"
sync:
  max_parallel: 2
  interval: "30m"
"#,
            self.download_dir.display(),
            self.tracklist_path.display()
        );
        self.temp_dir
            .child("config/repovault/config.yml")
            .write_str(&content)
            .expect("Failed to write test config");
    }

    /// Seed the tracked-list file with the given lines
    pub fn write_tracklist(&self, lines: &[&str]) {
        let mut content = String::new();
        for line in lines {
            content.push_str(line);
            content.push('\n');
        }
        self.temp_dir
            .child("mirror/repositories.txt")
            .write_str(&content)
            .expect("Failed to write tracked list");
    }

    /// XDG data home inside the temp root, for event log isolation
    pub fn data_home(&self) -> PathBuf {
        self.temp_dir.path().join("data")
    }

    pub fn config_arg(&self) -> String {
        self.config_path.to_string_lossy().into_owned()
    }
}

/// Assertion helpers for test validation
#[allow(dead_code)]
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}

#[allow(dead_code)]
pub fn assert_contains_any(text: &str, expected: &[&str]) {
    let found = expected.iter().any(|item| text.contains(item));
    assert!(
        found,
        "Expected text to contain at least one of {:?}, but it didn't. Text: {}",
        expected, text
    );
}
