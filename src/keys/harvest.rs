// dedrm-core - E-book DRM Removal Engine
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Key discovery
//!
//! Reading vendor application data (Kindle for PC/Mac, Adobe Digital Editions,
//! NOOK Study) is platform specific and lives outside this crate. The engine only
//! sees a [`KeyHarvester`]: something that, given a scheme, returns raw key
//! material, possibly none.
//!
//! # External Helpers
//! [`CommandHarvester`] runs a configured helper program (for example a key
//! retrieval script run under a Windows compatibility layer) and collects the
//! key files it writes:
//!
//! ```text
//! <program> <args...> <output_dir>
//! <output_dir>/*.der   Adobe Adept RSA keys
//! <output_dir>/*.b64   Barnes & Noble keys (base64 text)
//! <output_dir>/*.k4i   Kindle device keys (JSON)
//! ```
//!
//! An argument equal to `{output_dir}` is replaced by the directory instead of
//! appending it. The helper is killed when the timeout expires.

use super::KeyScheme;
use crate::error::{DeDrmError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;

/// Placeholder in helper arguments replaced by the output directory
pub const OUTPUT_DIR_PLACEHOLDER: &str = "{output_dir}";

/// Default helper timeout in seconds
pub const DEFAULT_HARVEST_TIMEOUT_SECS: u64 = 120;

/// Source of freshly discovered key material for one scheme
///
/// Errors are non-fatal to callers: the orchestrator logs them and continues
/// as if no keys were found.
pub trait KeyHarvester {
    fn harvest(&self, scheme: KeyScheme) -> Result<Vec<Vec<u8>>>;
}

impl<F> KeyHarvester for F
where
    F: Fn(KeyScheme) -> Result<Vec<Vec<u8>>>,
{
    fn harvest(&self, scheme: KeyScheme) -> Result<Vec<Vec<u8>>> {
        self(scheme)
    }
}

/// Harvester for platforms with no discovery support
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHarvester;

impl KeyHarvester for NoHarvester {
    fn harvest(&self, scheme: KeyScheme) -> Result<Vec<Vec<u8>>> {
        Err(DeDrmError::discovery_unavailable(
            scheme,
            "no key harvester configured",
        ))
    }
}

/// Runs an external helper program and collects the key files it writes
#[derive(Debug, Clone)]
pub struct CommandHarvester {
    program: PathBuf,
    args: Vec<String>,
    output_extension: Option<String>,
    timeout: Duration,
}

impl CommandHarvester {
    /// # Arguments
    /// * `program` - Helper executable
    /// * `args` - Arguments; `{output_dir}` is substituted, otherwise the directory is appended
    pub fn new<P: Into<PathBuf>>(program: P, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            output_extension: None,
            timeout: Duration::from_secs(DEFAULT_HARVEST_TIMEOUT_SECS),
        }
    }

    /// Collect files with this extension instead of the scheme's usual one
    pub fn with_output_extension<S: Into<String>>(mut self, extension: S) -> Self {
        self.output_extension = Some(extension.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_command(&self, output_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        let mut substituted = false;
        for arg in &self.args {
            if arg == OUTPUT_DIR_PLACEHOLDER {
                cmd.arg(output_dir);
                substituted = true;
            } else {
                cmd.arg(arg);
            }
        }
        if !substituted {
            cmd.arg(output_dir);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, scheme: KeyScheme, output_dir: &Path) -> Result<()> {
        let mut cmd = self.build_command(output_dir);
        let child = cmd.spawn().map_err(|e| {
            DeDrmError::discovery_unavailable(
                scheme,
                format!("failed to start {}: {}", self.program.display(), e),
            )
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| DeDrmError::HarvesterTimeout(self.timeout.as_secs()))?
            .map_err(|e| {
                DeDrmError::discovery_unavailable(scheme, format!("failed to wait for helper: {}", e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::debug!(%scheme, stderr = %stderr.trim(), "Key helper output");
            return Err(DeDrmError::discovery_unavailable(
                scheme,
                format!(
                    "helper exited with status {}",
                    output.status.code().unwrap_or(-1)
                ),
            ));
        }
        Ok(())
    }

    fn collect(&self, scheme: KeyScheme, output_dir: &Path) -> Result<Vec<Vec<u8>>> {
        let extension = match self.output_extension.as_deref().or(scheme.harvest_extension()) {
            Some(extension) => extension.trim_start_matches('.').to_string(),
            None => {
                return Err(DeDrmError::discovery_unavailable(
                    scheme,
                    "scheme has no key file format",
                ))
            }
        };

        let mut files: Vec<PathBuf> = std::fs::read_dir(output_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case(&extension))
            })
            .collect();
        files.sort();

        let mut keys: Vec<Vec<u8>> = Vec::new();
        for path in files {
            let contents = std::fs::read(&path)?;
            match scheme.material_from_file(&contents) {
                Ok(material) if !material.is_empty() && !keys.contains(&material) => {
                    keys.push(material)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(%scheme, error = %e, "Ignoring unreadable key file"),
            }
        }
        Ok(keys)
    }
}

impl KeyHarvester for CommandHarvester {
    fn harvest(&self, scheme: KeyScheme) -> Result<Vec<Vec<u8>>> {
        let output_dir = scratch_dir()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        tracing::info!(%scheme, program = %self.program.display(), "Running key helper");
        runtime.block_on(self.run(scheme, output_dir.path()))?;

        let keys = self.collect(scheme, output_dir.path())?;
        tracing::info!(%scheme, found = keys.len(), "Key helper finished");
        Ok(keys)
    }
}

/// Private, randomly named directory for the helper's key files, removed on drop
fn scratch_dir() -> Result<TempDir> {
    Ok(tempfile::Builder::new().prefix("dedrm-harvest-").tempdir()?)
}

/// Per-scheme harvesters built from configuration
#[derive(Debug, Default)]
pub struct HarvesterSet {
    by_scheme: BTreeMap<KeyScheme, CommandHarvester>,
}

impl HarvesterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scheme: KeyScheme, harvester: CommandHarvester) {
        self.by_scheme.insert(scheme, harvester);
    }

    pub fn is_empty(&self) -> bool {
        self.by_scheme.is_empty()
    }
}

impl KeyHarvester for HarvesterSet {
    fn harvest(&self, scheme: KeyScheme) -> Result<Vec<Vec<u8>>> {
        match self.by_scheme.get(&scheme) {
            Some(harvester) => harvester.harvest(scheme),
            None => NoHarvester.harvest(scheme),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_harvester() {
        let harvester = |scheme: KeyScheme| -> Result<Vec<Vec<u8>>> {
            Ok(if scheme == KeyScheme::Adept {
                vec![vec![1, 2, 3]]
            } else {
                Vec::new()
            })
        };
        assert_eq!(harvester.harvest(KeyScheme::Adept).unwrap(), vec![vec![1, 2, 3]]);
        assert!(harvester.harvest(KeyScheme::EReader).unwrap().is_empty());
    }

    #[test]
    fn test_no_harvester_is_unavailable() {
        assert!(matches!(
            NoHarvester.harvest(KeyScheme::Adept),
            Err(DeDrmError::DiscoveryUnavailable { .. })
        ));
        assert!(matches!(
            HarvesterSet::new().harvest(KeyScheme::KindleDevice),
            Err(DeDrmError::DiscoveryUnavailable { .. })
        ));
    }

    #[test]
    fn test_output_dir_placeholder() {
        let harvester = CommandHarvester::new(
            "helper",
            vec!["--out".to_string(), OUTPUT_DIR_PLACEHOLDER.to_string()],
        );
        let cmd = harvester.build_command(Path::new("/tmp/x"));
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args, vec!["--out", "/tmp/x"]);

        let harvester = CommandHarvester::new("helper", vec!["-v".to_string()]);
        let cmd = harvester.build_command(Path::new("/tmp/x"));
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args, vec!["-v", "/tmp/x"]);
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let harvester = CommandHarvester::new("/nonexistent/dedrm-helper", Vec::new());
        assert!(matches!(
            harvester.harvest(KeyScheme::Adept),
            Err(DeDrmError::DiscoveryUnavailable { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_collects_key_files_by_extension() {
        let script = "printf 'AAEC' > \"$1/nook.b64\"; printf 'x' > \"$1/notes.txt\"";
        let harvester = CommandHarvester::new(
            "sh",
            vec![
                "-c".to_string(),
                script.to_string(),
                "sh".to_string(),
                OUTPUT_DIR_PLACEHOLDER.to_string(),
            ],
        );
        let keys = harvester.harvest(KeyScheme::BarnesNoble).unwrap();
        assert_eq!(keys, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_scratch_dirs_are_private_and_removed() {
        let first = scratch_dir().unwrap();
        let second = scratch_dir().unwrap();
        assert_ne!(first.path(), second.path());
        let name = first.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("dedrm-harvest-"), "{}", name);
        assert_eq!(std::fs::read_dir(first.path()).unwrap().count(), 0);

        let path = first.path().to_path_buf();
        drop(first);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_helper_output_dir_is_removed_after_harvest() {
        let record = tempfile::NamedTempFile::new().unwrap();
        let script = "printf '%s' \"$1\" > \"$0\"";
        let harvester = CommandHarvester::new(
            "sh",
            vec![
                "-c".to_string(),
                script.to_string(),
                record.path().display().to_string(),
                OUTPUT_DIR_PLACEHOLDER.to_string(),
            ],
        );
        assert!(harvester.harvest(KeyScheme::Adept).unwrap().is_empty());

        let used = std::fs::read_to_string(record.path()).unwrap();
        assert!(used.contains("dedrm-harvest-"), "{}", used);
        assert!(!Path::new(&used).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_helper_failure_is_unavailable() {
        let harvester =
            CommandHarvester::new("sh", vec!["-c".to_string(), "exit 3".to_string()]);
        assert!(matches!(
            harvester.harvest(KeyScheme::Adept),
            Err(DeDrmError::DiscoveryUnavailable { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_helper_timeout() {
        let harvester = CommandHarvester::new("sh", vec!["-c".to_string(), "sleep 5".to_string()])
            .with_timeout(Duration::from_millis(200));
        assert!(matches!(
            harvester.harvest(KeyScheme::Adept),
            Err(DeDrmError::HarvesterTimeout(_))
        ));
    }
}
