//! Authenticode signing, strong naming and signature removal.
//!
//! The actual cryptography is delegated to a [`CodeSigner`]. [`ToolSigner`] drives the
//! `osslsigncode` and `sn` command line tools; tests substitute a recording implementation.
//! [`sign_file`] adds the timestamp-authority rotation on top of any signer.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use log::{debug, info, warn};

use crate::{
    pe::{PeHeaders, PeImage, PeProbe},
    signing::certificate::Certificate,
    Error, Result,
};

/// Result of one signing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignOutcome {
    /// The file is signed and timestamped
    Signed,
    /// The timestamp authority could not be used; the file is unchanged
    TimestampFailed(String),
}

/// A backend able to sign and verify PE files in place.
pub trait CodeSigner: Send + Sync + fmt::Debug {
    /// Applies an Authenticode signature, timestamped by `timestamp_url`.
    ///
    /// # Errors
    /// Returns [`Error::Signing`] if the backend fails for any reason other than the
    /// timestamp authority
    fn sign(&self, path: &Path, certificate: &Certificate, timestamp_url: &str)
        -> Result<SignOutcome>;

    /// Fills the strong-name signature slot of a managed assembly.
    ///
    /// # Errors
    /// Returns [`Error::Signing`] if the backend fails
    fn apply_strong_name(&self, path: &Path, certificate: &Certificate) -> Result<()>;

    /// Checks the Authenticode signature of a file.
    ///
    /// # Errors
    /// Returns an error if the backend can't be run
    fn verify(&self, path: &Path) -> Result<bool>;
}

/// Signs through the `osslsigncode` and `sn` executables.
#[derive(Debug, Clone)]
pub struct ToolSigner {
    osslsigncode: PathBuf,
    sn: PathBuf,
}

impl Default for ToolSigner {
    fn default() -> Self {
        ToolSigner {
            osslsigncode: PathBuf::from("osslsigncode"),
            sn: PathBuf::from("sn"),
        }
    }
}

impl ToolSigner {
    /// A signer using the tools found on `PATH`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses explicit tool locations
    #[must_use]
    pub fn with_tools(osslsigncode: impl Into<PathBuf>, sn: impl Into<PathBuf>) -> Self {
        ToolSigner {
            osslsigncode: osslsigncode.into(),
            sn: sn.into(),
        }
    }

    fn sign_command(
        &self,
        input: &Path,
        output: &Path,
        certificate: &Certificate,
        timestamp_url: &str,
    ) -> Result<Command> {
        let reference = certificate.reference().ok_or_else(|| Error::Signing {
            path: input.to_path_buf(),
            message: "certificate was not loaded from a file and has no private key".to_string(),
        })?;

        let mut command = Command::new(&self.osslsigncode);
        command.arg("sign");
        if reference.is_pkcs12() {
            command.arg("-pkcs12").arg(&reference.path);
        } else {
            command
                .arg("-certs")
                .arg(&reference.path)
                .arg("-key")
                .arg(&reference.path);
        }
        if let Some(password) = &reference.password {
            command.arg("-pass").arg(password);
        }
        command
            .arg("-h")
            .arg("sha256")
            .arg("-t")
            .arg(timestamp_url)
            .arg("-in")
            .arg(input)
            .arg("-out")
            .arg(output);
        Ok(command)
    }

    fn run(path: &Path, command: &mut Command) -> Result<Output> {
        debug!("Running {:?}", command);
        command.output().map_err(|e| Error::Signing {
            path: path.to_path_buf(),
            message: format!("failed to run {}: {e}", command.get_program().to_string_lossy()),
        })
    }
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text.trim().to_string()
}

fn is_timestamp_message(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    text.contains("timestamp") || text.contains("curl")
}

impl CodeSigner for ToolSigner {
    fn sign(
        &self,
        path: &Path,
        certificate: &Certificate,
        timestamp_url: &str,
    ) -> Result<SignOutcome> {
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        let signed = tempfile::Builder::new()
            .prefix(".signed-")
            .tempfile_in(directory)?
            .into_temp_path();

        let mut command = self.sign_command(path, &signed, certificate, timestamp_url)?;
        let output = Self::run(path, &mut command)?;
        if !output.status.success() {
            let message = combined_output(&output);
            if is_timestamp_message(&message) {
                return Ok(SignOutcome::TimestampFailed(message));
            }
            return Err(Error::Signing {
                path: path.to_path_buf(),
                message,
            });
        }

        signed
            .persist(path)
            .map_err(|e| Error::FileError(e.error))?;
        Ok(SignOutcome::Signed)
    }

    fn apply_strong_name(&self, path: &Path, certificate: &Certificate) -> Result<()> {
        let reference = certificate.reference().ok_or_else(|| Error::Signing {
            path: path.to_path_buf(),
            message: "certificate was not loaded from a file and has no private key".to_string(),
        })?;

        let mut command = Command::new(&self.sn);
        command.arg("-q").arg("-R").arg(path).arg(&reference.path);
        let output = Self::run(path, &mut command)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::Signing {
                path: path.to_path_buf(),
                message: combined_output(&output),
            })
        }
    }

    fn verify(&self, path: &Path) -> Result<bool> {
        let mut command = Command::new(&self.osslsigncode);
        command.arg("verify").arg("-in").arg(path);
        Ok(Self::run(path, &mut command)?.status.success())
    }
}

/// Signs `path`, rotating through `servers` until one timestamps successfully.
///
/// Server `i % servers.len()` is used for attempt `i`, for `servers.len() * rounds` attempts.
///
/// # Errors
/// Returns [`Error::FailedTimestamp`] when every attempt hit a timestamp failure, or the first
/// non-timestamp error of the signer
pub fn sign_file(
    path: &Path,
    certificate: &Certificate,
    signer: &dyn CodeSigner,
    servers: &[String],
    rounds: usize,
) -> Result<()> {
    for attempt in 0..servers.len() * rounds {
        let url = &servers[attempt % servers.len()];
        match signer.sign(path, certificate, url)? {
            SignOutcome::Signed => {
                info!("Signed {} (timestamp {url})", path.display());
                return Ok(());
            }
            SignOutcome::TimestampFailed(message) => {
                warn!(
                    "{}: timestamp server {url} failed, trying the next one: {message}",
                    path.display()
                );
            }
        }
    }

    Err(Error::FailedTimestamp {
        path: path.to_path_buf(),
        url: "All of them!".to_string(),
    })
}

/// Removes every Authenticode signature from the file at `path`.
///
/// Returns `false` when there was nothing to remove, including for files that are not PE
/// images; such files are left untouched.
///
/// # Errors
/// Returns an error if the file can't be read or written, or its headers are malformed
pub fn strip_signatures(path: impl AsRef<Path>) -> Result<bool> {
    let path = path.as_ref();
    let data = fs::read(path)?;
    if matches!(PeHeaders::parse(&data)?, PeProbe::NotPe) {
        return Ok(false);
    }

    let mut image = PeImage::new(data)?;
    if !image.strip_certificates()? {
        return Ok(false);
    }
    image.write(path)?;
    debug!("Stripped signatures from {}", path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{pe::ImageBuilder, signing::CertificateReference};

    const PEM: &str = include_str!("../../tests/data/signing.pem");

    #[derive(Debug, Default)]
    struct FlakyTimestamps {
        failures: usize,
        urls: Mutex<Vec<String>>,
    }

    impl CodeSigner for FlakyTimestamps {
        fn sign(&self, _: &Path, _: &Certificate, url: &str) -> Result<SignOutcome> {
            let mut urls = self.urls.lock().unwrap();
            urls.push(url.to_string());
            if urls.len() <= self.failures {
                Ok(SignOutcome::TimestampFailed("no response".to_string()))
            } else {
                Ok(SignOutcome::Signed)
            }
        }

        fn apply_strong_name(&self, _: &Path, _: &Certificate) -> Result<()> {
            Ok(())
        }

        fn verify(&self, _: &Path) -> Result<bool> {
            Ok(true)
        }
    }

    fn servers() -> Vec<String> {
        vec!["http://a".to_string(), "http://b".to_string()]
    }

    fn certificate() -> Certificate {
        Certificate::from_pem(PEM).unwrap()
    }

    #[test]
    fn timestamp_servers_rotate() {
        let signer = FlakyTimestamps {
            failures: 3,
            ..Default::default()
        };
        sign_file(Path::new("a.dll"), &certificate(), &signer, &servers(), 3).unwrap();
        assert_eq!(
            *signer.urls.lock().unwrap(),
            vec!["http://a", "http://b", "http://a", "http://b"]
        );
    }

    #[test]
    fn every_server_failing() {
        let signer = FlakyTimestamps {
            failures: usize::MAX,
            ..Default::default()
        };
        let err = sign_file(Path::new("a.dll"), &certificate(), &signer, &servers(), 3).unwrap_err();
        assert!(err.is_timestamp_failure());
        assert!(err.to_string().contains("All of them!"));
        assert_eq!(signer.urls.lock().unwrap().len(), 6);

        let err = sign_file(Path::new("a.dll"), &certificate(), &signer, &[], 3).unwrap_err();
        assert!(matches!(err, Error::FailedTimestamp { .. }));
    }

    #[test]
    fn tool_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let pfx = dir.path().join("code.pfx");
        fs::write(&pfx, include_bytes!("../../tests/data/signing.pfx")).unwrap();
        let from_pfx =
            Certificate::load(&CertificateReference::new(&pfx).with_password("pw")).unwrap();

        let args = |certificate: &Certificate| -> Result<Vec<String>> {
            let command = ToolSigner::new().sign_command(
                Path::new("app.exe"),
                Path::new("app.signed"),
                certificate,
                "http://ts",
            )?;
            Ok(command
                .get_args()
                .map(|a| a.to_string_lossy().into_owned())
                .collect())
        };

        let pfx_args = args(&from_pfx).unwrap();
        assert_eq!(pfx_args[0], "sign");
        assert_eq!(pfx_args[1], "-pkcs12");
        assert!(pfx_args.windows(2).any(|w| w == ["-pass", "pw"]));
        assert!(pfx_args.windows(2).any(|w| w == ["-t", "http://ts"]));
        assert!(pfx_args.windows(2).any(|w| w == ["-out", "app.signed"]));

        assert!(matches!(args(&certificate()), Err(Error::Signing { .. })));
    }

    #[test]
    fn strip_removes_certificate_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signed.dll");
        let image = ImageBuilder::new()
            .certificate(vec![0xAB; 100])
            .build()
            .unwrap();
        fs::write(&path, &image).unwrap();

        assert!(strip_signatures(&path).unwrap());
        let stripped = fs::read(&path).unwrap();
        assert!(stripped.len() < image.len());
        let probe = PeHeaders::parse(&stripped).unwrap();
        assert!(probe
            .headers()
            .unwrap()
            .directory(crate::pe::DataDirectoryType::Certificate)
            .is_empty());

        assert!(!strip_signatures(&path).unwrap());
    }

    #[test]
    fn strip_leaves_other_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let text = dir.path().join("readme.txt");
        fs::write(&text, "hello").unwrap();
        assert!(!strip_signatures(&text).unwrap());
        assert_eq!(fs::read(&text).unwrap(), b"hello");

        assert!(matches!(
            strip_signatures(dir.path().join("missing.dll")),
            Err(Error::FileError(_))
        ));
    }
}
