//! Builder capabilities and the extension registry.
//!
//! A [`Builder`] turns one input [`Resource`] into a [`TaskDef`] and later
//! executes the resulting [`Task`]. Builders are registered explicitly in a
//! [`BuilderRegistry`] together with a [`BuilderDescriptor`], either in code
//! or through a JSON manifest.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, CancelToken, Options};
use crate::error::{BuildError, RegistryError};
use crate::factory::TaskFactory;
use crate::resource::{FileSystem, Resource};
use crate::task::{Task, TaskDef};

/// Stable identity of a builder, also the key used in manifests.
pub type BuilderId = Arc<str>;

/// Static capabilities of a builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderDescriptor {
    pub id: String,
    /// Extensions this builder claims, without the leading dot.
    pub input_extensions: Vec<String>,
    pub output_extension: String,
    /// Lower values create their tasks first.
    #[serde(default)]
    pub create_order: i32,
    /// When `false` the builder only receives tasks requested by other
    /// builders, never from the input scan.
    #[serde(default = "yes")]
    pub auto_create: bool,
    #[serde(default = "yes")]
    pub cacheable: bool,
}

fn yes() -> bool {
    true
}

impl BuilderDescriptor {
    pub fn new(id: impl Into<String>, input: &str, output: &str) -> Self {
        Self {
            id: id.into(),
            input_extensions: vec![normalize_ext(input)],
            output_extension: normalize_ext(output),
            create_order: 0,
            auto_create: true,
            cacheable: true,
        }
    }

    pub fn extension(mut self, ext: &str) -> Self {
        self.input_extensions.push(normalize_ext(ext));
        self
    }

    pub fn create_order(mut self, order: i32) -> Self {
        self.create_order = order;
        self
    }

    pub fn no_auto_create(mut self) -> Self {
        self.auto_create = false;
        self
    }

    pub fn uncacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }
}

pub(crate) fn normalize_ext(ext: &str) -> String {
    ext.trim_start_matches('.').to_ascii_lowercase()
}

/// Something that turns one resource into N outputs.
pub trait Builder: Send + Sync {
    /// Describes the task for `input`, or `None` when there is nothing to
    /// build. The default produces a single output next to the input in the
    /// build directory, with the descriptor's output extension.
    ///
    /// Builders may request further tasks from `factory` here.
    fn create(
        &self,
        descriptor: &BuilderDescriptor,
        input: &Resource,
        factory: &mut TaskFactory,
    ) -> Result<Option<TaskDef>, BuildError> {
        let _ = factory;
        let output = input.output().with_extension(&descriptor.output_extension);
        Ok(Some(TaskDef::new(input.clone()).output(output)))
    }

    /// Writes every declared output of `task`.
    fn build(&self, task: &Task, ctx: &mut BuildContext<'_>) -> Result<(), BuildError>;

    /// Mixes builder specific material into the task signature, for example
    /// the version of an external tool.
    fn signature(&self, task: &Task, hasher: &mut Blake3Hasher) {
        let _ = (task, hasher);
    }
}

/// Access to the live task set while a builder runs.
pub struct BuildContext<'a> {
    pub(crate) factory: &'a mut TaskFactory,
    pub(crate) cancel: &'a CancelToken,
}

impl<'a> BuildContext<'a> {
    pub fn options(&self) -> &Options {
        self.factory.options()
    }

    pub fn fs(&self) -> &FileSystem {
        self.factory.fs()
    }

    /// Tasks created through the factory are scheduled in a later pass of
    /// the same build.
    pub fn factory(&mut self) -> &mut TaskFactory {
        self.factory
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns [`BuildError::Cancelled`] once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), BuildError> {
        if self.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        Ok(())
    }
}

/// A registered builder: its descriptor plus the implementation.
#[derive(Clone)]
pub struct Registered {
    pub id: BuilderId,
    pub descriptor: Arc<BuilderDescriptor>,
    pub builder: Arc<dyn Builder>,
}

impl Debug for Registered {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registered")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    builders: Vec<BuilderDescriptor>,
}

/// Maps input extensions to builders.
#[derive(Debug, Default, Clone)]
pub struct BuilderRegistry {
    builders: HashMap<BuilderId, Registered>,
    extensions: HashMap<String, BuilderId>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `builder` under `descriptor`. Every extension may be claimed
    /// by a single builder only.
    pub fn register(
        &mut self,
        descriptor: BuilderDescriptor,
        builder: Arc<dyn Builder>,
    ) -> Result<&Registered, RegistryError> {
        let mut descriptor = descriptor;
        descriptor.input_extensions = descriptor
            .input_extensions
            .iter()
            .map(|ext| normalize_ext(ext))
            .collect();
        descriptor.output_extension = normalize_ext(&descriptor.output_extension);

        for ext in &descriptor.input_extensions {
            if let Some(owner) = self.extensions.get(ext) {
                return Err(RegistryError::DuplicateExtension {
                    ext: ext.clone(),
                    builder: owner.to_string(),
                });
            }
        }

        let id: BuilderId = Arc::from(descriptor.id.as_str());
        for ext in &descriptor.input_extensions {
            self.extensions.insert(ext.clone(), id.clone());
        }

        let registered = Registered {
            id: id.clone(),
            descriptor: Arc::new(descriptor),
            builder,
        };

        Ok(self.builders.entry(id).insert_entry(registered).into_mut())
    }

    /// Loads descriptors from a JSON manifest and binds each one to the
    /// implementation registered under the same id in `impls`.
    ///
    /// ```json
    /// { "builders": [
    ///   { "id": "script", "input_extensions": ["script"],
    ///     "output_extension": "scriptc", "create_order": 0 }
    /// ] }
    /// ```
    pub fn load_manifest(
        &mut self,
        json: &str,
        impls: &HashMap<String, Arc<dyn Builder>>,
    ) -> Result<(), RegistryError> {
        let manifest: Manifest = serde_json::from_str(json)?;

        for descriptor in manifest.builders {
            let builder = impls
                .get(&descriptor.id)
                .cloned()
                .ok_or_else(|| RegistryError::UnknownBuilder(descriptor.id.clone()))?;

            self.register(descriptor, builder)?;
        }

        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Registered> {
        self.builders.get(id)
    }

    /// Builder claiming `ext`, with or without the leading dot.
    pub fn resolve(&self, ext: &str) -> Option<&Registered> {
        let id = self.extensions.get(&normalize_ext(ext))?;
        self.builders.get(id)
    }

    pub fn resolve_resource(&self, resource: &Resource) -> Option<&Registered> {
        self.resolve(resource.extension()?)
    }

    /// Output extension produced for `ext`, or `ext` itself when no builder
    /// claims it.
    pub fn replace_ext(&self, ext: &str) -> String {
        match self.resolve(ext) {
            Some(registered) => registered.descriptor.output_extension.clone(),
            None => normalize_ext(ext),
        }
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Builder for Noop {
        fn build(&self, _: &Task, _: &mut BuildContext<'_>) -> Result<(), BuildError> {
            Ok(())
        }
    }

    #[test]
    fn test_resolve_by_extension() {
        let mut registry = BuilderRegistry::new();
        registry
            .register(
                BuilderDescriptor::new("script", ".script", ".scriptc").extension("gui_script"),
                Arc::new(Noop),
            )
            .unwrap();

        assert_eq!(registry.resolve("script").unwrap().id.as_ref(), "script");
        assert_eq!(registry.resolve(".GUI_SCRIPT").unwrap().id.as_ref(), "script");
        assert!(registry.resolve("png").is_none());
        assert_eq!(registry.replace_ext(".script"), "scriptc");
        assert_eq!(registry.replace_ext("png"), "png");
    }

    #[test]
    fn test_duplicate_extension() {
        let mut registry = BuilderRegistry::new();
        registry
            .register(BuilderDescriptor::new("a", "x", "xc"), Arc::new(Noop))
            .unwrap();
        let err = registry
            .register(BuilderDescriptor::new("b", "x", "xd"), Arc::new(Noop))
            .unwrap_err();

        assert!(matches!(
            err,
            RegistryError::DuplicateExtension { ref ext, ref builder } if ext == "x" && builder == "a"
        ));
    }

    #[test]
    fn test_manifest() {
        let json = r#"{ "builders": [
            { "id": "tex", "input_extensions": [".png", "jpg"], "output_extension": "texturec",
              "create_order": 2, "cacheable": false },
            { "id": "atlas", "input_extensions": ["atlas"], "output_extension": "a.texturesetc",
              "auto_create": false }
        ] }"#;

        let mut impls: HashMap<String, Arc<dyn Builder>> = HashMap::new();
        impls.insert("tex".into(), Arc::new(Noop));
        impls.insert("atlas".into(), Arc::new(Noop));

        let mut registry = BuilderRegistry::new();
        registry.load_manifest(json, &impls).unwrap();

        let tex = registry.resolve("jpg").unwrap();
        assert_eq!(tex.descriptor.create_order, 2);
        assert!(!tex.descriptor.cacheable);
        assert!(tex.descriptor.auto_create);

        let atlas = registry.resolve("atlas").unwrap();
        assert!(!atlas.descriptor.auto_create);
        assert!(atlas.descriptor.cacheable);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_manifest_unknown_builder() {
        let json = r#"{ "builders": [
            { "id": "missing", "input_extensions": ["m"], "output_extension": "mc" }
        ] }"#;

        let err = BuilderRegistry::new()
            .load_manifest(json, &HashMap::new())
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownBuilder(id) if id == "missing"));
    }
}
