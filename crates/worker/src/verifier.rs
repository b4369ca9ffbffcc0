//! Archive password verification boundary.
//!
//! The search only needs a yes/no answer per candidate; how an archive is
//! opened is up to the [`ArchiveVerifier`] implementation. Any error is a
//! hard failure for the job.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// `unrar` exit status for a CRC failure, which older archive formats
/// report when the password is wrong.
const UNRAR_EXIT_CRC_ERROR: i32 = 3;

/// `unrar` exit status for an incorrect password.
const UNRAR_EXIT_BAD_PASSWORD: i32 = 11;

/// Errors that make a candidate impossible to check.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("Archive {path} is not readable: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("Failed to run {tool}: {reason}")]
    Spawn { tool: String, reason: String },

    #[error("{tool} exited with status {code:?} while testing {path}")]
    Tool {
        tool: String,
        code: Option<i32>,
        path: PathBuf,
    },
}

/// Tests one candidate password against one archive.
///
/// Calls are blocking; the enumerator runs on a blocking thread.
pub trait ArchiveVerifier: Send + Sync {
    fn verify(&self, artifact: &Path, candidate: &str) -> Result<bool, VerifyError>;
}

impl<F> ArchiveVerifier for F
where
    F: Fn(&Path, &str) -> Result<bool, VerifyError> + Send + Sync,
{
    fn verify(&self, artifact: &Path, candidate: &str) -> Result<bool, VerifyError> {
        self(artifact, candidate)
    }
}

/// Verifier that shells out to the `unrar` command line tool.
#[derive(Debug, Clone)]
pub struct UnrarVerifier {
    tool: String,
}

impl UnrarVerifier {
    /// * `tool` - path or name of the `unrar` binary.
    pub fn new(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }
}

impl ArchiveVerifier for UnrarVerifier {
    fn verify(&self, artifact: &Path, candidate: &str) -> Result<bool, VerifyError> {
        if let Err(e) = std::fs::metadata(artifact) {
            return Err(VerifyError::Unreadable {
                path: artifact.to_path_buf(),
                reason: e.to_string(),
            });
        }

        let status = Command::new(&self.tool)
            .arg("t")
            .arg("-inul")
            .arg("-y")
            .arg(format!("-p{candidate}"))
            .arg("--")
            .arg(artifact)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| VerifyError::Spawn {
                tool: self.tool.clone(),
                reason: e.to_string(),
            })?;

        match status.code() {
            Some(0) => Ok(true),
            Some(UNRAR_EXIT_CRC_ERROR | UNRAR_EXIT_BAD_PASSWORD) => Ok(false),
            code => Err(VerifyError::Tool {
                tool: self.tool.clone(),
                code,
                path: artifact.to_path_buf(),
            }),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use assert_matches::assert_matches;

    use super::*;

    /// Write a stand-in for `unrar` that accepts `secret`, reports a
    /// broken archive for `boom`, and rejects everything else.
    fn fake_unrar(dir: &Path) -> PathBuf {
        let script = dir.join("unrar");
        std::fs::write(
            &script,
            "#!/bin/sh\ncase \"$4\" in\n  -psecret) exit 0 ;;\n  -pboom) exit 2 ;;\n  -pold) exit 3 ;;\n  *) exit 11 ;;\nesac\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn archive(dir: &Path) -> PathBuf {
        let path = dir.join("a.rar");
        std::fs::write(&path, b"Rar!").unwrap();
        path
    }

    #[test]
    fn exit_codes_map_to_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = UnrarVerifier::new(fake_unrar(dir.path()).to_string_lossy());
        let archive = archive(dir.path());

        assert!(verifier.verify(&archive, "secret").unwrap());
        assert!(!verifier.verify(&archive, "wrong").unwrap());
        assert!(!verifier.verify(&archive, "old").unwrap());
        assert_matches!(
            verifier.verify(&archive, "boom"),
            Err(VerifyError::Tool { code: Some(2), .. })
        );
    }

    #[test]
    fn missing_archive_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = UnrarVerifier::new(fake_unrar(dir.path()).to_string_lossy());

        assert_matches!(
            verifier.verify(&dir.path().join("missing.rar"), "secret"),
            Err(VerifyError::Unreadable { .. })
        );
    }

    #[test]
    fn missing_tool_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = UnrarVerifier::new(dir.path().join("no-such-unrar").to_string_lossy());

        assert_matches!(
            verifier.verify(&archive(dir.path()), "secret"),
            Err(VerifyError::Spawn { .. })
        );
    }

    #[test]
    fn closures_are_verifiers() {
        let verifier = |_: &Path, candidate: &str| Ok(candidate == "x");
        assert!(verifier.verify(Path::new("/unused"), "x").unwrap());
    }
}
