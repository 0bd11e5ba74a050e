//! Native engine builds running next to the local content build.
//!
//! The remote build is a single unit of work hosted on its own thread. It
//! never touches the build state, the resource cache or the task set; the
//! only shared value is the [`CancelToken`].

use std::fs;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::core::{CancelToken, Options, keys};
use crate::error::RemoteBuildError;
use crate::resource::FileSystem;

pub const VARIANT_RELEASE: &str = "release";

/// Which binary the remote build produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Engine,
    Library,
}

/// Everything a remote builder needs to know, captured before the build
/// starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBuildRequest {
    pub variant: String,
    pub with_symbols: bool,
    /// Raw `build-artifacts` value, passed through to the build service.
    pub build_artifacts: Option<String>,
    pub artifact: Artifact,
    pub architectures: Vec<String>,
    pub output_dir: Utf8PathBuf,
}

impl RemoteBuildRequest {
    pub fn from_options(options: &Options, default_architectures: Vec<String>, output_dir: Utf8PathBuf) -> Self {
        let architectures = match options.list(keys::ARCHITECTURES) {
            custom if !custom.is_empty() => custom,
            _ => default_architectures,
        };

        let artifact = if options.should_build_artifact("library") {
            Artifact::Library
        } else {
            Artifact::Engine
        };

        Self {
            variant: options.option(keys::VARIANT, VARIANT_RELEASE).to_string(),
            with_symbols: options.has_option(keys::WITH_SYMBOLS),
            build_artifacts: options.get(keys::BUILD_ARTIFACTS).map(String::from),
            artifact,
            architectures,
            output_dir,
        }
    }

    /// Output directory of one architecture.
    pub fn platform_dir(&self, architecture: &str) -> Utf8PathBuf {
        self.output_dir.join(architecture)
    }
}

/// A build service producing native binaries for the project.
pub trait RemoteBuilder: Send + Sync {
    /// Whether the project carries native code that needs a remote build.
    fn requires_remote_build(&self, fs: &FileSystem) -> bool;

    /// Architectures built when the `architectures` option is absent.
    fn default_architectures(&self, platform: &str) -> Vec<String>;

    /// File names of the engine binary on `architecture`.
    fn binary_names(&self, architecture: &str) -> Vec<String>;

    /// Builds one architecture into `dir`. Long running implementations
    /// should poll `cancel`.
    fn build(
        &self,
        request: &RemoteBuildRequest,
        architecture: &str,
        dir: &Utf8Path,
        cancel: &CancelToken,
    ) -> Result<(), RemoteBuildError>;
}

/// Hosts the one concurrent unit of work of a build session.
pub(crate) struct Worker;

impl Worker {
    pub(crate) fn spawn<F>(name: &str, job: F) -> io::Result<RemoteBuildHandle>
    where
        F: FnOnce() -> Result<(), RemoteBuildError> + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.to_string()).spawn(job)?;
        Ok(RemoteBuildHandle { handle })
    }
}

/// A running remote build.
pub struct RemoteBuildHandle {
    handle: JoinHandle<Result<(), RemoteBuildError>>,
}

impl RemoteBuildHandle {
    /// Waits for the build. A panic in the worker is reported as
    /// [`RemoteBuildError::Panicked`].
    pub fn join(self) -> Result<(), RemoteBuildError> {
        match self.handle.join() {
            Ok(result) => result,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    String::from("unknown payload")
                };
                Err(RemoteBuildError::Panicked(msg))
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Starts building every requested architecture on a worker thread.
pub fn launch(
    builder: Arc<dyn RemoteBuilder>,
    request: RemoteBuildRequest,
    cancel: CancelToken,
) -> io::Result<RemoteBuildHandle> {
    Worker::spawn("remote-build", move || {
        let s = Instant::now();
        info!("Building remote engine for {}", request.architectures.join(", "));

        for architecture in &request.architectures {
            if cancel.is_cancelled() {
                return Err(RemoteBuildError::Cancelled);
            }

            let dir = request.platform_dir(architecture);
            fs::create_dir_all(&dir).map_err(|e| RemoteBuildError::Compile(format!("{dir}: {e}")))?;

            debug!("remote build of {architecture} ({:?})", request.artifact);
            builder.build(&request, architecture, &dir, &cancel)?;
        }

        info!("Remote engine build finished {}", crate::utils::as_overhead(s));
        Ok(())
    })
}

/// Removes remotely built engines left in `output_dir` by earlier sessions.
/// A platform directory is deleted only when it holds one of that
/// platform's engine binaries.
pub fn clean_engines(
    builder: &dyn RemoteBuilder,
    output_dir: &Utf8Path,
    architectures: &[String],
) -> io::Result<usize> {
    let mut removed = 0;

    for architecture in architectures {
        let dir = output_dir.join(architecture);
        if !dir.is_dir() {
            continue;
        }

        let has_engine = builder
            .binary_names(architecture)
            .iter()
            .any(|name| dir.join(name).exists());

        if has_engine {
            debug!("removing stale engine build {dir}");
            fs::remove_dir_all(&dir)?;
            removed += 1;
        }
    }

    Ok(removed)
}

/// `<arch>-<os>` of the running host, used when no `platform` is given.
pub fn host_platform() -> String {
    format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        built: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl RemoteBuilder for Recorder {
        fn requires_remote_build(&self, _: &FileSystem) -> bool {
            true
        }

        fn default_architectures(&self, _: &str) -> Vec<String> {
            vec!["x86_64-linux".into()]
        }

        fn binary_names(&self, _: &str) -> Vec<String> {
            vec!["engine".into(), "engine.exe".into()]
        }

        fn build(
            &self,
            _: &RemoteBuildRequest,
            architecture: &str,
            dir: &Utf8Path,
            _: &CancelToken,
        ) -> Result<(), RemoteBuildError> {
            if self.fail_on == Some(architecture) {
                return Err(RemoteBuildError::Compile(format!("{architecture}: missing symbol")));
            }
            fs::write(dir.join("engine"), b"elf").unwrap();
            self.built.lock().unwrap().push(architecture.to_string());
            Ok(())
        }
    }

    fn temp() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_request_from_options() {
        let mut options = Options::new();
        let request = RemoteBuildRequest::from_options(&options, vec!["arm64-ios".into()], "out".into());
        assert_eq!(request.variant, VARIANT_RELEASE);
        assert_eq!(request.architectures, ["arm64-ios"]);
        assert_eq!(request.artifact, Artifact::Engine);
        assert!(!request.with_symbols);

        options
            .set(keys::ARCHITECTURES, "armv7-android,arm64-android")
            .set(keys::VARIANT, "debug")
            .set(keys::WITH_SYMBOLS, "")
            .set(keys::BUILD_ARTIFACTS, "library");
        let request = RemoteBuildRequest::from_options(&options, vec!["arm64-ios".into()], "out".into());
        assert_eq!(request.architectures, ["armv7-android", "arm64-android"]);
        assert_eq!(request.variant, "debug");
        assert!(request.with_symbols);
        assert_eq!(request.artifact, Artifact::Library);
        assert_eq!(request.build_artifacts.as_deref(), Some("library"));
    }

    #[test]
    fn test_launch_and_join() {
        let (_dir, out) = temp();
        let builder = Arc::new(Recorder::default());
        let request = RemoteBuildRequest {
            variant: VARIANT_RELEASE.into(),
            with_symbols: false,
            build_artifacts: None,
            artifact: Artifact::Engine,
            architectures: vec!["a".into(), "b".into()],
            output_dir: out.clone(),
        };

        let handle = launch(builder.clone(), request, CancelToken::new()).unwrap();
        handle.join().unwrap();

        assert_eq!(*builder.built.lock().unwrap(), ["a", "b"]);
        assert!(out.join("b/engine").is_file());
    }

    #[test]
    fn test_failure_is_reported_on_join() {
        let (_dir, out) = temp();
        let builder = Arc::new(Recorder {
            fail_on: Some("b"),
            ..Default::default()
        });
        let request = RemoteBuildRequest::from_options(
            &[(keys::ARCHITECTURES, "a,b")].into_iter().collect(),
            Vec::new(),
            out,
        );

        let err = launch(builder, request, CancelToken::new()).unwrap().join().unwrap_err();
        assert!(matches!(err, RemoteBuildError::Compile(msg) if msg.contains("missing symbol")));
    }

    #[test]
    fn test_cancelled_before_start() {
        let (_dir, out) = temp();
        let cancel = CancelToken::new();
        cancel.cancel();
        let request = RemoteBuildRequest::from_options(&Options::new(), vec!["a".into()], out);

        let err = launch(Arc::new(Recorder::default()), request, cancel)
            .unwrap()
            .join()
            .unwrap_err();
        assert!(matches!(err, RemoteBuildError::Cancelled));
    }

    #[test]
    fn test_panic_is_normalized() {
        let handle = Worker::spawn("panicky", || panic!("boom")).unwrap();
        assert!(matches!(handle.join(), Err(RemoteBuildError::Panicked(msg)) if msg == "boom"));
    }

    #[test]
    fn test_clean_engines_only_with_binary() {
        let (_dir, out) = temp();
        fs::create_dir_all(out.join("x86_64-linux")).unwrap();
        fs::write(out.join("x86_64-linux/engine"), b"elf").unwrap();
        fs::create_dir_all(out.join("arm64-ios")).unwrap();
        fs::write(out.join("arm64-ios/notes.txt"), b"keep").unwrap();

        let archs = vec!["x86_64-linux".to_string(), "arm64-ios".to_string(), "js-web".to_string()];
        let removed = clean_engines(&Recorder::default(), &out, &archs).unwrap();

        assert_eq!(removed, 1);
        assert!(!out.join("x86_64-linux").exists());
        assert!(out.join("arm64-ios/notes.txt").exists());
    }
}
