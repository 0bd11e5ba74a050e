//! Tasks: a builder applied to a list of inputs, producing a list of outputs.
use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::builder::{Builder, BuilderDescriptor, BuilderId};
use crate::core::{Blake3Hasher, Hash32, Options, Signature};
use crate::resource::Resource;

/// Description of a task returned by [`Builder::create`]. The first input is
/// the primary one and gives the task its identity.
#[derive(Debug, Clone)]
pub struct TaskDef {
    name: Option<String>,
    inputs: Vec<Resource>,
    outputs: Vec<Resource>,
    cacheable: bool,
    extra: Vec<u8>,
}

impl TaskDef {
    pub fn new(input: Resource) -> Self {
        Self {
            name: None,
            inputs: vec![input],
            outputs: Vec::new(),
            cacheable: true,
            extra: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds a secondary input. Inputs produced by other tasks delay this
    /// task until they are built.
    pub fn input(mut self, input: Resource) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn output(mut self, output: Resource) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn disable_cache(mut self) -> Self {
        self.cacheable = false;
        self
    }

    /// Extra bytes folded into the signature.
    pub fn signature_data(mut self, data: impl AsRef<[u8]>) -> Self {
        self.extra.extend_from_slice(data.as_ref());
        self
    }

    pub(crate) fn finish(self, registered: &crate::builder::Registered) -> Task {
        let name = self.name.unwrap_or_else(|| {
            format!("{} {}", registered.id, self.inputs[0].path())
        });

        Task {
            name,
            cacheable: self.cacheable && registered.descriptor.cacheable,
            inputs: self.inputs,
            outputs: self.outputs,
            extra: self.extra,
            id: registered.id.clone(),
            descriptor: registered.descriptor.clone(),
            builder: registered.builder.clone(),
        }
    }
}

/// A unit of work handed to the engine.
pub struct Task {
    name: String,
    inputs: Vec<Resource>,
    outputs: Vec<Resource>,
    cacheable: bool,
    extra: Vec<u8>,
    id: BuilderId,
    descriptor: Arc<BuilderDescriptor>,
    builder: Arc<dyn Builder>,
}

impl Task {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[Resource] {
        &self.inputs
    }

    /// Input at `index`, `0` being the primary one.
    pub fn input(&self, index: usize) -> Option<&Resource> {
        self.inputs.get(index)
    }

    pub fn outputs(&self) -> &[Resource] {
        &self.outputs
    }

    pub fn output(&self, index: usize) -> Option<&Resource> {
        self.outputs.get(index)
    }

    pub fn builder_id(&self) -> &BuilderId {
        &self.id
    }

    pub fn descriptor(&self) -> &BuilderDescriptor {
        &self.descriptor
    }

    pub(crate) fn builder(&self) -> &Arc<dyn Builder> {
        &self.builder
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Fingerprint of everything that can change what this task writes: the
    /// builder, its output extension, content-affecting options, every input
    /// path with its content, every output path, and whatever the builder
    /// adds itself.
    ///
    /// Missing inputs hash as a fixed marker.
    pub fn calculate_signature(&self, options: &Options) -> io::Result<Signature> {
        let mut hasher = Blake3Hasher::new();
        hasher
            .field(self.id.as_bytes())
            .field(self.descriptor.output_extension.as_bytes())
            .hash32(options.content_hash());

        for input in &self.inputs {
            hasher.field(input.path().as_str());
            match Hash32::hash_file(input.abs_path()) {
                Ok(hash) => hasher.hash32(hash),
                Err(e) if e.kind() == io::ErrorKind::NotFound => hasher.field(b"<missing>"),
                Err(e) => return Err(e),
            };
        }

        for output in &self.outputs {
            hasher.field(output.path().as_str());
        }

        hasher.field(&self.extra);
        self.builder.signature(self, &mut hasher);

        Ok(hasher.finish32().into())
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("builder", &self.id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// Outcome of one executed task.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task: String,
    /// Primary input of the task.
    pub input: Option<Utf8PathBuf>,
    pub ok: bool,
    /// One-based line of a compile error, `0` when unknown.
    pub line: u32,
    pub message: Option<String>,
    /// Set for failures that aborted the run.
    pub cause: Option<Arc<anyhow::Error>>,
}

impl TaskResult {
    pub(crate) fn ok(task: &Task) -> Self {
        Self {
            task: task.name.clone(),
            input: task.inputs.first().map(|r| r.path().to_owned()),
            ok: true,
            line: 0,
            message: None,
            cause: None,
        }
    }

    pub(crate) fn fail(mut self, line: u32, message: impl Into<String>) -> Self {
        self.ok = false;
        self.line = line;
        self.message = Some(message.into());
        self
    }
}
