//! Shared fixtures for the integration tests: a recording signing backend and a registry
//! rooted in a temporary directory.

#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use pesmith::{
    signing::{Certificate, CodeSigner, SignOutcome},
    BinaryRegistry, EngineConfig, Result,
};
use tempfile::TempDir;

pub const SIGNING_PEM: &str = include_str!("../data/signing.pem");

/// Token of the strong-name key derived from `SIGNING_PEM`
pub const SIGNING_TOKEN: &str = "fce483ab0958b723";

/// One call the engine made into the signing backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Sign { file: String, url: String },
    StrongName { file: String },
}

impl Call {
    pub fn file(&self) -> &str {
        match self {
            Call::Sign { file, .. } | Call::StrongName { file } => file,
        }
    }
}

/// Records every call; optionally fails every timestamp or delays signing.
#[derive(Debug, Default)]
pub struct RecordingSigner {
    pub calls: Mutex<Vec<Call>>,
    pub fail_timestamps: bool,
    pub delay: Option<Duration>,
}

impl RecordingSigner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_timestamps() -> Arc<Self> {
        Arc::new(RecordingSigner {
            fail_timestamps: true,
            ..Self::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(RecordingSigner {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sign_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Sign { .. }))
            .collect()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl CodeSigner for RecordingSigner {
    fn sign(&self, path: &Path, _: &Certificate, timestamp_url: &str) -> Result<SignOutcome> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.calls.lock().unwrap().push(Call::Sign {
            file: file_name(path),
            url: timestamp_url.to_string(),
        });

        if self.fail_timestamps {
            return Ok(SignOutcome::TimestampFailed(format!("{timestamp_url} unreachable")));
        }
        Ok(SignOutcome::Signed)
    }

    fn apply_strong_name(&self, path: &Path, _: &Certificate) -> Result<()> {
        self.calls.lock().unwrap().push(Call::StrongName {
            file: file_name(path),
        });
        Ok(())
    }

    fn verify(&self, _: &Path) -> Result<bool> {
        Ok(true)
    }
}

/// A scratch directory with a registry whose working copies live under `work/`.
pub struct Workspace {
    pub dir: TempDir,
    pub signer: Arc<RecordingSigner>,
    pub registry: Arc<BinaryRegistry>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::with(RecordingSigner::new(), |config| config)
    }

    pub fn with(
        signer: Arc<RecordingSigner>,
        configure: impl FnOnce(EngineConfig) -> EngineConfig,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir(&work).unwrap();

        let config = configure(
            EngineConfig::default()
                .with_working_directory(&work)
                .with_timestamp_servers(
                    vec!["http://ts-a.test".to_string(), "http://ts-b.test".to_string()],
                    3,
                ),
        );
        let registry = BinaryRegistry::new(config, signer.clone());
        Workspace {
            dir,
            signer,
            registry,
        }
    }

    /// Writes `bytes` as `name` into the workspace
    pub fn file(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    /// Names of the working copies currently on disk
    pub fn working_copies(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.dir.path().join("work"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// A registry over the same directory, with nothing loaded
    pub fn fresh_registry(&self) -> Arc<BinaryRegistry> {
        BinaryRegistry::new(
            EngineConfig::default().with_working_directory(self.dir.path().join("work")),
            RecordingSigner::new(),
        )
    }
}

pub fn certificate() -> Certificate {
    Certificate::from_pem(SIGNING_PEM).unwrap()
}
