//! Scratch directories, generated audio, and ready-to-use configuration.

use std::f32::consts::PI;
use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use demix_config::DemixConfig;
use tempfile::TempDir;

/// Sample rate of generated test tones.
pub const TONE_SAMPLE_RATE: u32 = 44_100;

/// Create a temporary directory with a recognisable prefix.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn scratch_dir() -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix("demix-test-")
        .tempdir()
        .context("failed to create scratch directory")
}

/// Render a 16-bit mono sine tone as an in-memory WAV file.
///
/// # Errors
///
/// Returns an error if the WAV encoder rejects the samples.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn tone_wav(seconds: u32, frequency_hz: f32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: TONE_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut buffer, spec).context("failed to create WAV writer")?;
        let total = seconds * TONE_SAMPLE_RATE;
        for index in 0..total {
            let t = index as f32 / TONE_SAMPLE_RATE as f32;
            let sample = (2.0 * PI * frequency_hz * t).sin() * 0.5;
            writer
                .write_sample((sample * f32::from(i16::MAX)) as i16)
                .context("failed to write WAV sample")?;
        }
        writer.finalize().context("failed to finalize WAV file")?;
    }
    Ok(buffer.into_inner())
}

/// The three-second 440 Hz tone used by end-to-end tests.
///
/// # Errors
///
/// Returns an error if the WAV encoder rejects the samples.
pub fn three_second_tone() -> Result<Vec<u8>> {
    tone_wav(3, 440.0)
}

/// Configuration whose workspace and cache live under `root`.
#[must_use]
pub fn test_config(root: &Path) -> DemixConfig {
    let mut config = DemixConfig::default();
    config.workspace.root = root.join("jobs");
    config.workspace.abandon_after_secs = 60;
    config.workspace.reap_interval_secs = 1;
    config.cache.root = root.join("cache");
    config.cache.ttl_secs = 3_600;
    config.cache.max_entries = 8;
    config
}

/// Guard that strips write permission from a directory until dropped.
#[cfg(unix)]
#[derive(Debug)]
pub struct ReadOnlyDir {
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl ReadOnlyDir {
    /// Make `path` read-only so its entries cannot be unlinked.
    ///
    /// Returns `None` when the process can still write into it, as root can,
    /// in which case the permissions are already restored.
    ///
    /// # Errors
    ///
    /// Returns an error if the permissions cannot be changed.
    pub fn lock(path: &Path) -> Result<Option<Self>> {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o555))
            .with_context(|| format!("failed to lock {}", path.display()))?;
        let guard = Self {
            path: path.to_path_buf(),
        };
        let check = path.join(".write-check");
        if fs::write(&check, b"").is_ok() {
            fs::remove_file(&check).context("failed to remove write check")?;
            return Ok(None);
        }
        Ok(Some(guard))
    }
}

#[cfg(unix)]
impl Drop for ReadOnlyDir {
    fn drop(&mut self) {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o755));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tone_has_expected_length_and_format() -> Result<()> {
        let bytes = three_second_tone()?;
        let reader = hound::WavReader::new(Cursor::new(bytes))?;
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, TONE_SAMPLE_RATE);
        assert_eq!(reader.duration(), 3 * TONE_SAMPLE_RATE);
        Ok(())
    }

    #[test]
    fn test_config_scopes_paths_under_root() -> Result<()> {
        let dir = scratch_dir()?;
        let config = test_config(dir.path());
        assert!(config.workspace.root.starts_with(dir.path()));
        assert!(config.cache.root.starts_with(dir.path()));
        Ok(())
    }
}
