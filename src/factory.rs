//! Task construction, deduplicated per (input, builder).
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::builder::{BuilderId, BuilderRegistry, Registered};
use crate::core::{Hash32, Options};
use crate::error::{BuildError, KilnError};
use crate::resource::{FileSystem, Resource};
use crate::task::Task;

/// Marker in the file name of resources produced by other tasks at build
/// time. Such outputs are exempt from conflict checks.
pub const GENERATED_MARKER: &str = "_generated_";

type TaskKey = (Utf8PathBuf, BuilderId);

/// Creates tasks and owns the live task set until the engine drains it.
pub struct TaskFactory {
    fs: FileSystem,
    options: Arc<Options>,
    registry: Arc<BuilderRegistry>,
    tasks: HashMap<TaskKey, Arc<Task>>,
    order: Vec<Arc<Task>>,
    fresh: Vec<Arc<Task>>,
    creating: HashSet<TaskKey>,
    generated: HashMap<(String, u64), Resource>,
}

impl TaskFactory {
    pub fn new(fs: FileSystem, options: Arc<Options>, registry: Arc<BuilderRegistry>) -> Self {
        Self {
            fs,
            options,
            registry,
            tasks: HashMap::new(),
            order: Vec::new(),
            fresh: Vec::new(),
            creating: HashSet::new(),
            generated: HashMap::new(),
        }
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn shared_options(&self) -> Arc<Options> {
        self.options.clone()
    }

    pub fn registry(&self) -> &BuilderRegistry {
        &self.registry
    }

    /// Every task created so far, in creation order.
    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.order
    }

    /// Takes the tasks created since the previous call.
    pub(crate) fn drain_new(&mut self) -> Vec<Arc<Task>> {
        std::mem::take(&mut self.fresh)
    }

    /// Task for `path` using the builder registered for its extension. An
    /// input no builder claims yields `None` with a warning.
    pub fn create_task_for_path(
        &mut self,
        path: impl AsRef<Utf8Path>,
    ) -> Result<Option<Arc<Task>>, KilnError> {
        let resource = self.fs.get(path);
        self.create_task_auto(&resource)
    }

    /// Task for `resource` using the builder registered for its extension.
    pub fn create_task_auto(
        &mut self,
        resource: &Resource,
    ) -> Result<Option<Arc<Task>>, KilnError> {
        let Some(registered) = self.registry.resolve_resource(resource).cloned() else {
            tracing::warn!("No builder for '{resource}' found");
            return Ok(None);
        };

        self.create_with(resource, &registered)
    }

    /// Task for `resource` built by the builder registered under `id`.
    ///
    /// Asking twice for the same resource and builder returns the task
    /// created the first time.
    pub fn create_task(
        &mut self,
        resource: &Resource,
        id: &str,
    ) -> Result<Option<Arc<Task>>, KilnError> {
        let registered = self
            .registry
            .get(id)
            .cloned()
            .ok_or_else(|| crate::error::RegistryError::UnknownBuilder(id.to_string()))?;

        self.create_with(resource, &registered)
    }

    fn create_with(
        &mut self,
        resource: &Resource,
        registered: &Registered,
    ) -> Result<Option<Arc<Task>>, KilnError> {
        let key: TaskKey = (resource.abs_path().to_owned(), registered.id.clone());
        if let Some(task) = self.tasks.get(&key) {
            return Ok(Some(task.clone()));
        }

        if !self.creating.insert(key.clone()) {
            return Err(KilnError::Create {
                input: resource.path().to_owned(),
                source: anyhow::anyhow!(
                    "builder '{}' requested its own task recursively",
                    registered.id
                ),
            });
        }

        let result = registered
            .builder
            .create(&registered.descriptor, resource, self);
        self.creating.remove(&key);

        let def = match result {
            Ok(Some(def)) => def,
            Ok(None) => return Ok(None),
            Err(BuildError::Compile(e)) => return Err(KilnError::Compile(e)),
            Err(BuildError::Cancelled) => return Err(KilnError::Cancelled),
            Err(BuildError::Fatal(source)) => {
                return Err(KilnError::Create {
                    input: resource.path().to_owned(),
                    source,
                });
            }
        };

        let task = Arc::new(def.finish(registered));
        tracing::trace!("created task {}", task.name());

        self.tasks.insert(key, task.clone());
        self.order.push(task.clone());
        self.fresh.push(task.clone());

        Ok(Some(task))
    }

    /// Creates tasks for the scanned `inputs`: excluded entries are dropped,
    /// the rest are ordered by their builder's create order (stable), and
    /// inputs whose builder opts out of automatic creation are skipped.
    pub fn create_tasks(
        &mut self,
        inputs: &[Utf8PathBuf],
        excludes: &[String],
    ) -> Result<(), KilnError> {
        let mut sorted: Vec<(i32, Resource)> = inputs
            .iter()
            .map(|path| self.fs.get(path))
            .filter(|res| !is_excluded(res.path(), excludes))
            .map(|res| {
                let order = self
                    .registry
                    .resolve_resource(&res)
                    .map(|r| r.descriptor.create_order)
                    .unwrap_or(i32::MAX);
                (order, res)
            })
            .collect();

        sorted.sort_by_key(|(order, _)| *order);

        for (_, input) in sorted {
            let auto = self
                .registry
                .resolve_resource(&input)
                .map(|r| r.descriptor.auto_create);

            if auto == Some(false) {
                continue;
            }

            self.create_task_auto(&input)?;
        }

        Ok(())
    }

    /// Output resource named after `hash` and `suffix`, registered so that
    /// [`generated_resource`](Self::generated_resource) can find it again.
    pub fn create_generated_resource(&mut self, hash: Hash32, suffix: &str) -> Resource {
        let suffix = suffix.trim_start_matches('.');
        let key = hash.to_u64();
        let name = format!("{GENERATED_MARKER}{key:x}.{suffix}");
        let resource = self.fs.get(name).output();

        self.generated
            .entry((suffix.to_string(), key))
            .or_insert(resource)
            .clone()
    }

    pub fn generated_resource(&self, hash: Hash32, suffix: &str) -> Option<&Resource> {
        let suffix = suffix.trim_start_matches('.');
        self.generated.get(&(suffix.to_string(), hash.to_u64()))
    }
}

/// Prefix match against the project-relative path.
pub(crate) fn is_excluded(path: &Utf8Path, excludes: &[String]) -> bool {
    excludes
        .iter()
        .any(|entry| path.as_str().starts_with(entry.as_str()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::builder::{BuildContext, Builder, BuilderDescriptor};
    use crate::error::CompileError;
    use crate::task::TaskDef;

    #[derive(Default)]
    struct Counting {
        created: AtomicUsize,
    }

    impl Builder for Counting {
        fn create(
            &self,
            descriptor: &BuilderDescriptor,
            input: &Resource,
            _: &mut TaskFactory,
        ) -> Result<Option<TaskDef>, BuildError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let output = input.output().with_extension(&descriptor.output_extension);
            Ok(Some(TaskDef::new(input.clone()).output(output)))
        }

        fn build(&self, _: &Task, _: &mut BuildContext<'_>) -> Result<(), BuildError> {
            Ok(())
        }
    }

    /// Requests a task for the companion `.b` file of every `.a` input.
    struct Pair;

    impl Builder for Pair {
        fn create(
            &self,
            descriptor: &BuilderDescriptor,
            input: &Resource,
            factory: &mut TaskFactory,
        ) -> Result<Option<TaskDef>, BuildError> {
            let companion = input.with_extension("b");
            let task = factory.create_task(&companion, "b")?;
            let output = input.output().with_extension(&descriptor.output_extension);

            let mut def = TaskDef::new(input.clone()).output(output);
            if let Some(task) = task {
                def = def.input(task.outputs()[0].clone());
            }
            Ok(Some(def))
        }

        fn build(&self, _: &Task, _: &mut BuildContext<'_>) -> Result<(), BuildError> {
            Ok(())
        }
    }

    struct Broken;

    impl Builder for Broken {
        fn create(
            &self,
            _: &BuilderDescriptor,
            input: &Resource,
            _: &mut TaskFactory,
        ) -> Result<Option<TaskDef>, BuildError> {
            Err(CompileError::at(input.path(), 3, "bad header").into())
        }

        fn build(&self, _: &Task, _: &mut BuildContext<'_>) -> Result<(), BuildError> {
            Ok(())
        }
    }

    fn factory(registry: BuilderRegistry) -> TaskFactory {
        TaskFactory::new(
            FileSystem::new("/project", "build"),
            Arc::new(Options::new()),
            Arc::new(registry),
        )
    }

    #[test]
    fn test_create_task_is_deduplicated() {
        let counting = Arc::new(Counting::default());
        let mut registry = BuilderRegistry::new();
        registry
            .register(BuilderDescriptor::new("x", "x", "xc"), counting.clone())
            .unwrap();

        let mut factory = factory(registry);
        let a = factory.create_task_for_path("a.x").unwrap().unwrap();
        let b = factory.create_task_for_path("/a.x").unwrap().unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(counting.created.load(Ordering::SeqCst), 1);
        assert_eq!(factory.tasks().len(), 1);
        assert_eq!(factory.drain_new().len(), 1);
        assert!(factory.drain_new().is_empty());
    }

    #[test]
    fn test_unknown_extension_is_skipped() {
        let mut factory = factory(BuilderRegistry::new());
        assert!(factory.create_task_for_path("readme.md").unwrap().is_none());
        assert!(factory.tasks().is_empty());
    }

    #[test]
    fn test_create_order_and_excludes() {
        let mut registry = BuilderRegistry::new();
        registry
            .register(
                BuilderDescriptor::new("late", "late", "latec").create_order(5),
                Arc::new(Counting::default()),
            )
            .unwrap();
        registry
            .register(BuilderDescriptor::new("early", "early", "earlyc"), Arc::new(Counting::default()))
            .unwrap();
        registry
            .register(
                BuilderDescriptor::new("manual", "manual", "manualc").no_auto_create(),
                Arc::new(Counting::default()),
            )
            .unwrap();

        let inputs: Vec<Utf8PathBuf> = ["z.late", "b.early", "y.late", "a.early", "m.manual", "skip/c.early"]
            .into_iter()
            .map(Utf8PathBuf::from)
            .collect();

        let mut factory = factory(registry);
        factory.create_tasks(&inputs, &["skip".to_string()]).unwrap();

        let order: Vec<_> = factory.tasks().iter().map(|t| t.inputs()[0].path().to_string()).collect();
        assert_eq!(order, ["b.early", "a.early", "z.late", "y.late"]);
    }

    #[test]
    fn test_builder_requests_nested_task() {
        let mut registry = BuilderRegistry::new();
        registry
            .register(BuilderDescriptor::new("a", "a", "ac"), Arc::new(Pair))
            .unwrap();
        registry
            .register(
                BuilderDescriptor::new("b", "b", "bc").no_auto_create(),
                Arc::new(Counting::default()),
            )
            .unwrap();

        let mut factory = factory(registry);
        let task = factory.create_task_for_path("dir/x.a").unwrap().unwrap();

        assert_eq!(factory.tasks().len(), 2);
        assert_eq!(task.inputs()[1].abs_path(), "/project/build/dir/x.bc");
    }

    #[test]
    fn test_create_compile_error() {
        let mut registry = BuilderRegistry::new();
        registry
            .register(BuilderDescriptor::new("broken", "bad", "badc"), Arc::new(Broken))
            .unwrap();

        let mut factory = factory(registry);
        let err = factory.create_task_for_path("x.bad").unwrap_err();
        assert!(matches!(err, KilnError::Compile(ref e) if e.line == 3));
    }

    #[test]
    fn test_generated_resource() {
        let mut factory = factory(BuilderRegistry::new());
        let hash = Hash32::hash(b"shader source");

        assert!(factory.generated_resource(hash, "spc").is_none());
        let res = factory.create_generated_resource(hash, ".spc");
        assert!(res.is_output());
        assert!(res.path().as_str().starts_with(GENERATED_MARKER));
        assert!(res.path().as_str().ends_with(".spc"));
        assert_eq!(factory.generated_resource(hash, "spc"), Some(&res));
    }

    #[test]
    fn test_is_excluded() {
        let excludes = vec!["assets/raw".to_string()];
        assert!(is_excluded(Utf8Path::new("assets/raw/a.png"), &excludes));
        assert!(is_excluded(Utf8Path::new("assets/rawfile.png"), &excludes));
        assert!(!is_excluded(Utf8Path::new("assets/a.png"), &excludes));
    }
}
