//! The top level: a configured project running build commands.
use std::collections::HashMap;
use std::fmt::Display;
use std::fs;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, error, info, warn};

use crate::builder::{Builder, BuilderDescriptor, BuilderRegistry};
use crate::cache::{CacheConfig, RemoteStore, ResourceCache};
use crate::conflict;
use crate::core::{CancelToken, Options, keys};
use crate::engine::Engine;
use crate::error::{KilnError, RemoteBuildError};
use crate::factory::TaskFactory;
use crate::remote::{self, RemoteBuildHandle, RemoteBuildRequest, RemoteBuilder};
use crate::resource::FileSystem;
use crate::sources;
use crate::state::State;
use crate::task::TaskResult;
use crate::utils::as_overhead;

/// Name of the persisted signature store inside the build directory.
pub const STATE_FILE: &str = "_KilnBuildState_";
pub const DEFAULT_BUILD_DIR: &str = "build";
/// Project-local directory holding tool data. Never scanned for sources.
pub const INTERNAL_DIR: &str = ".internal";
pub const LIB_DIR: &str = ".internal/lib";

/// A step of a build session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Creates and runs the tasks, and the remote engine build if needed.
    Build,
    /// Deletes every output recorded in the build state.
    Clean,
    /// Deletes the whole build directory.
    Distclean,
    /// Hands the build directory to the configured [`Bundler`].
    Bundle,
}

impl FromStr for Command {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(Command::Build),
            "clean" => Ok(Command::Clean),
            "distclean" => Ok(Command::Distclean),
            "bundle" => Ok(Command::Bundle),
            other => Err(KilnError::Config(format!("Unknown command '{other}'"))),
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Command::Build => "build",
            Command::Clean => "clean",
            Command::Distclean => "distclean",
            Command::Bundle => "bundle",
        })
    }
}

/// Packages built content for distribution.
pub trait Bundler: Send + Sync {
    fn bundle(&self, fs: &FileSystem, options: &Options, output_dir: &Utf8Path) -> anyhow::Result<()>;
}

/// Builder for a [`Project`]. Registration errors are collected and
/// reported by [`finish`](Config::finish).
pub struct Config {
    root: Utf8PathBuf,
    build_dir: Utf8PathBuf,
    options: Options,
    inputs: Vec<Utf8PathBuf>,
    registry: BuilderRegistry,
    remote_builder: Option<Arc<dyn RemoteBuilder>>,
    remote_store: Option<Box<dyn RemoteStore>>,
    bundler: Option<Box<dyn Bundler>>,
    library_dir: Option<Utf8PathBuf>,
    libraries: Vec<String>,
    error: Option<KilnError>,
}

impl Config {
    fn new(root: Utf8PathBuf) -> Self {
        Self {
            root,
            build_dir: Utf8PathBuf::from(DEFAULT_BUILD_DIR),
            options: Options::new(),
            inputs: Vec::new(),
            registry: BuilderRegistry::new(),
            remote_builder: None,
            remote_store: None,
            bundler: None,
            library_dir: None,
            libraries: Vec::new(),
            error: None,
        }
    }

    /// Output directory, relative to the root unless absolute.
    pub fn build_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.build_dir = dir.into();
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.set(key, value);
        self
    }

    pub fn options(mut self, options: impl IntoIterator<Item = (String, String)>) -> Self {
        for (key, value) in options {
            self.options.set(key, value);
        }
        self
    }

    /// Paths scanned for sources. The whole root when none are given.
    pub fn inputs(mut self, paths: impl IntoIterator<Item = impl Into<Utf8PathBuf>>) -> Self {
        self.inputs.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn builder(mut self, descriptor: BuilderDescriptor, builder: Arc<dyn Builder>) -> Self {
        if self.error.is_some() {
            return self;
        }
        if let Err(e) = self.registry.register(descriptor, builder) {
            self.error = Some(e.into());
        }
        self
    }

    /// Registers the descriptors of a JSON manifest, see
    /// [`BuilderRegistry::load_manifest`].
    pub fn manifest(mut self, json: &str, impls: &HashMap<String, Arc<dyn Builder>>) -> Self {
        if self.error.is_some() {
            return self;
        }
        if let Err(e) = self.registry.load_manifest(json, impls) {
            self.error = Some(e.into());
        }
        self
    }

    pub fn remote_builder(mut self, builder: Arc<dyn RemoteBuilder>) -> Self {
        self.remote_builder = Some(builder);
        self
    }

    /// Remote tier used in place of the HTTP store configured through
    /// `resource-cache-remote`.
    pub fn remote_store(mut self, store: Box<dyn RemoteStore>) -> Self {
        self.remote_store = Some(store);
        self
    }

    pub fn bundler(mut self, bundler: Box<dyn Bundler>) -> Self {
        self.bundler = Some(bundler);
        self
    }

    pub fn library_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.library_dir = Some(dir.into());
        self
    }

    /// Library archives the project depends on, by URL or file name.
    pub fn libraries(mut self, libraries: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.libraries.extend(libraries.into_iter().map(Into::into));
        self
    }

    pub fn finish(self) -> Result<Project, KilnError> {
        if let Some(e) = self.error {
            return Err(e);
        }

        let fs = FileSystem::new(self.root, &self.build_dir);

        let cache = match (CacheConfig::from_options(&self.options, fs.root()), self.remote_store) {
            (CacheConfig::Remote { dir, .. } | CacheConfig::Local { dir }, Some(store)) => {
                ResourceCache::local(dir).with_remote(store)
            }
            (config, _) => ResourceCache::from_config(&config)
                .map_err(|e| KilnError::Config(format!("Couldn't set up the resource cache: {e}")))?,
        };

        let library_dir = match self.library_dir {
            Some(dir) => fs.root().join(dir),
            None => fs.root().join(LIB_DIR),
        };

        let inputs = if self.inputs.is_empty() {
            vec![Utf8PathBuf::new()]
        } else {
            self.inputs
        };

        Ok(Project {
            fs,
            options: Arc::new(self.options),
            registry: Arc::new(self.registry),
            inputs,
            cache,
            remote_builder: self.remote_builder,
            bundler: self.bundler,
            library_dir,
            libraries: self.libraries,
        })
    }
}

#[derive(Default)]
struct Session {
    results: Vec<TaskResult>,
    aborted: Option<KilnError>,
    remote: Option<RemoteBuildError>,
    cancelled: bool,
}

impl Session {
    fn is_ok(&self) -> bool {
        self.aborted.is_none()
            && self.remote.is_none()
            && !self.cancelled
            && self.results.iter().all(|r| r.ok)
    }

    fn finish(self) -> Result<Vec<TaskResult>, KilnError> {
        if let Some(source) = self.remote {
            return Err(KilnError::RemoteBuild {
                source,
                results: self.results,
            });
        }
        if let Some(e) = self.aborted {
            return Err(e);
        }
        if self.cancelled {
            return Err(KilnError::Cancelled);
        }
        Ok(self.results)
    }
}

/// A content project: where its sources are, how they are built and where
/// the results go.
pub struct Project {
    fs: FileSystem,
    options: Arc<Options>,
    registry: Arc<BuilderRegistry>,
    inputs: Vec<Utf8PathBuf>,
    cache: ResourceCache,
    remote_builder: Option<Arc<dyn RemoteBuilder>>,
    bundler: Option<Box<dyn Bundler>>,
    library_dir: Utf8PathBuf,
    libraries: Vec<String>,
}

impl Project {
    pub fn config(root: impl Into<Utf8PathBuf>) -> Config {
        Config::new(root.into())
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn registry(&self) -> &BuilderRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn state_path(&self) -> Utf8PathBuf {
        self.fs.build_dir().join(STATE_FILE)
    }

    /// Where remotely built engines are written.
    pub fn binary_output(&self) -> Utf8PathBuf {
        match self.options.get(keys::BINARY_OUTPUT) {
            Some(dir) => self.fs.root().join(dir),
            None => self.fs.build_dir().to_path_buf(),
        }
    }

    /// Runs `commands` in order and returns the results of every executed
    /// task. Commands after a failed `build` are skipped. The build state is
    /// saved once at the end, also when the session was cancelled or
    /// aborted.
    ///
    /// Compile errors are reported through the results. Unexpected failures,
    /// stalls, remote build failures and cancellation are returned as
    /// errors, in that order of precedence: remote build, then abort, then
    /// cancellation.
    pub fn build(&self, commands: &[Command], cancel: &CancelToken) -> Result<Vec<TaskResult>, KilnError> {
        let s = Instant::now();
        let state_path = self.state_path();
        let mut state = State::load(&state_path)?;
        let mut session = Session::default();

        let result = self.run_commands(commands, &mut state, cancel, &mut session);

        if !state.is_empty() || state_path.exists() {
            match state.save(&state_path) {
                Ok(()) => debug!("saved build state to {state_path}"),
                Err(e) if result.is_ok() => return Err(e.into()),
                Err(e) => warn!("Couldn't save build state: {e}"),
            }
        }

        result?;
        info!("Session finished {}", as_overhead(s));
        session.finish()
    }

    fn run_commands(
        &self,
        commands: &[Command],
        state: &mut State,
        cancel: &CancelToken,
        session: &mut Session,
    ) -> Result<(), KilnError> {
        for &command in commands {
            if cancel.is_cancelled() {
                session.cancelled = true;
                break;
            }

            info!("Running {command}");
            match command {
                Command::Build => {
                    self.build_once(state, cancel, session)?;
                    if !session.is_ok() {
                        break;
                    }
                }
                Command::Clean => {
                    let removed = state.clean()?;
                    info!("Removed {removed} output(s)");
                }
                Command::Distclean => {
                    let dir = self.fs.build_dir();
                    if dir.exists() {
                        fs::remove_dir_all(dir)?;
                    }
                    *state = State::new();
                }
                Command::Bundle => {
                    let bundler = self
                        .bundler
                        .as_ref()
                        .ok_or_else(|| KilnError::Config("No bundler configured".into()))?;

                    let output = match self.options.get(keys::BUNDLE_OUTPUT) {
                        Some(dir) => self.fs.root().join(dir),
                        None => self.fs.build_dir().to_path_buf(),
                    };

                    bundler
                        .bundle(&self.fs, &self.options, &output)
                        .map_err(KilnError::Bundle)?;
                }
            }
        }

        Ok(())
    }

    /// The remote build starts first so that it overlaps with the whole
    /// local build, and is joined on every exit path.
    fn build_once(&self, state: &mut State, cancel: &CancelToken, session: &mut Session) -> Result<(), KilnError> {
        let remote = self.start_remote_build(cancel)?;
        let local = self.build_content(state, cancel, session);

        if let Some(handle) = remote {
            if !handle.is_finished() {
                info!("Waiting for the remote engine build");
            }

            match handle.join() {
                Ok(()) => {}
                Err(RemoteBuildError::Cancelled) => session.cancelled = true,
                Err(e) => {
                    error!("{e}");
                    session.remote = Some(e);
                }
            }
        }

        local
    }

    fn build_content(&self, state: &mut State, cancel: &CancelToken, session: &mut Session) -> Result<(), KilnError> {
        self.mount_libraries()?;

        let excludes = sources::load_excludes(self.fs.root(), &self.options)?;
        let inputs = self.scan()?;

        let mut factory = TaskFactory::new(self.fs.clone(), self.options.clone(), self.registry.clone());
        factory.create_tasks(&inputs, &excludes)?;
        info!("Created {} task(s) from {} input(s)", factory.tasks().len(), inputs.len());

        conflict::validate(factory.tasks())?;

        if self.options.should_build_engine() {
            let outcome = Engine::new(&mut factory, state, &self.cache, cancel).run();
            session.results.extend(outcome.results);
            session.cancelled |= outcome.cancelled;
            if session.aborted.is_none() {
                session.aborted = outcome.aborted;
            }
        }

        Ok(())
    }

    /// Sources under every scanned path that some builder claims.
    fn scan(&self) -> Result<Vec<Utf8PathBuf>, KilnError> {
        let mut skip = vec![INTERNAL_DIR.to_string()];
        if let Some(build) = self.fs.relative(self.fs.build_dir()) {
            skip.push(build.to_string());
        }

        let mut found = Vec::new();
        for path in &self.inputs {
            found.extend(sources::find_sources(self.fs.root(), path, &skip)?);
        }
        found.sort();
        found.dedup();

        Ok(sources::prune(found, &self.registry))
    }

    fn start_remote_build(&self, cancel: &CancelToken) -> Result<Option<RemoteBuildHandle>, KilnError> {
        let Some(builder) = &self.remote_builder else {
            return Ok(None);
        };

        let platform = match self.options.get(keys::PLATFORM) {
            Some(platform) => platform.to_string(),
            None => remote::host_platform(),
        };
        let request = RemoteBuildRequest::from_options(
            &self.options,
            builder.default_architectures(&platform),
            self.binary_output(),
        );

        if builder.requires_remote_build(&self.fs) {
            let handle = remote::launch(builder.clone(), request, cancel.clone())?;
            return Ok(Some(handle));
        }

        let removed = remote::clean_engines(builder.as_ref(), &request.output_dir, &request.architectures)?;
        if removed > 0 {
            info!("Removed {removed} stale engine build(s)");
        }
        Ok(None)
    }

    /// Checks that the declared library archives are present. Returns how
    /// many were found.
    pub fn mount_libraries(&self) -> Result<usize, KilnError> {
        if self.libraries.is_empty() {
            return Ok(0);
        }

        if !self.library_dir.is_dir() {
            return Err(KilnError::MissingLibraries(self.library_dir.clone()));
        }

        let mut mounted = 0;
        for library in &self.libraries {
            let name = library.rsplit('/').next().unwrap_or(library);
            let archive = self.library_dir.join(name);
            if archive.is_file() {
                debug!("mounted library {archive}");
                mounted += 1;
            } else {
                warn!("Library '{library}' not found in {}", self.library_dir);
            }
        }

        Ok(mounted)
    }
}
