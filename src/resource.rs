//! File-like handles on project sources and build outputs.
//!
//! A [`Resource`] is identified by its absolute path. Source resources live
//! under the project root, output resources under the build directory with
//! the same project-relative path.

use std::fmt::{Debug, Display};
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

/// Project layout: where sources are read from and where outputs go.
#[derive(Clone)]
pub struct FileSystem {
    inner: Arc<Layout>,
}

struct Layout {
    root: Utf8PathBuf,
    build: Utf8PathBuf,
}

impl FileSystem {
    /// `build_dir` is relative to `root` unless absolute.
    pub fn new(root: impl Into<Utf8PathBuf>, build_dir: impl AsRef<Utf8Path>) -> Self {
        let root = root.into();
        let build = if build_dir.as_ref().is_absolute() {
            build_dir.as_ref().to_path_buf()
        } else {
            root.join(build_dir.as_ref())
        };

        Self {
            inner: Arc::new(Layout { root, build }),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.inner.root
    }

    pub fn build_dir(&self) -> &Utf8Path {
        &self.inner.build
    }

    /// Source resource for a project-relative path. A leading `/` is
    /// ignored.
    pub fn get(&self, path: impl AsRef<Utf8Path>) -> Resource {
        let path = strip_leading_slash(path.as_ref());
        Resource {
            abs: self.inner.root.join(&path),
            path,
            output: false,
            cacheable: true,
            fs: self.clone(),
        }
    }

    /// Project-relative form of an absolute path under the root.
    pub fn relative<'a>(&self, path: &'a Utf8Path) -> Option<&'a Utf8Path> {
        path.strip_prefix(&self.inner.root).ok()
    }
}

impl Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
            .field("root", &self.inner.root)
            .field("build", &self.inner.build)
            .finish()
    }
}

pub(crate) fn strip_leading_slash(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(path.as_str().trim_start_matches('/'))
}

/// A file-like handle. Equality and hashing use the absolute path only.
#[derive(Clone)]
pub struct Resource {
    path: Utf8PathBuf,
    abs: Utf8PathBuf,
    output: bool,
    cacheable: bool,
    fs: FileSystem,
}

impl Resource {
    /// Project-relative path.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn abs_path(&self) -> &Utf8Path {
        &self.abs
    }

    pub fn extension(&self) -> Option<&str> {
        self.path.extension()
    }

    pub fn is_output(&self) -> bool {
        self.output
    }

    /// Whether the content of this resource may be stored in the resource
    /// cache.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn disable_cache(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn exists(&self) -> bool {
        self.abs.is_file()
    }

    pub fn content(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.abs)
    }

    /// Writes `data`, creating parent directories as needed.
    pub fn set_content(&self, data: &[u8]) -> io::Result<()> {
        if let Some(dir) = self.abs.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&self.abs, data)
    }

    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_file(&self.abs) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    /// The same project-relative path placed in the build directory.
    pub fn output(&self) -> Resource {
        if self.output {
            return self.clone();
        }

        Resource {
            abs: self.fs.build_dir().join(&self.path),
            path: self.path.clone(),
            output: true,
            cacheable: self.cacheable,
            fs: self.fs.clone(),
        }
    }

    pub fn with_extension(&self, ext: &str) -> Resource {
        let ext = ext.trim_start_matches('.');
        Resource {
            path: self.path.with_extension(ext),
            abs: self.abs.with_extension(ext),
            output: self.output,
            cacheable: self.cacheable,
            fs: self.fs.clone(),
        }
    }

    /// Sibling resource resolved relative to this one's directory.
    pub fn sibling(&self, name: &str) -> Resource {
        let parent = self.path.parent().unwrap_or(Utf8Path::new(""));
        let res = self.fs.get(parent.join(name));
        if self.output { res.output() } else { res }
    }

    /// Lower-cased file name with the extension removed, twice, so that
    /// `a/Foo.tar.gz` becomes `foo`.
    pub(crate) fn base_name(&self) -> String {
        let stem = self.path.file_stem().unwrap_or_default();
        let stem = Utf8Path::new(stem).file_stem().unwrap_or(stem);
        stem.to_lowercase()
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.abs == other.abs
    }
}

impl Eq for Resource {}

impl Hash for Resource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.abs.hash(state);
    }
}

impl Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}", self.path)
    }
}

impl Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.output {
            write!(f, "Resource(build:/{})", self.path)
        } else {
            write!(f, "Resource(/{})", self.path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs() -> FileSystem {
        FileSystem::new("/project", "build")
    }

    #[test]
    fn test_output_maps_to_build_dir() {
        let res = fs().get("/main/player.script");
        assert_eq!(res.path(), "main/player.script");
        assert_eq!(res.abs_path(), "/project/main/player.script");

        let out = res.output().with_extension("scriptc");
        assert!(out.is_output());
        assert_eq!(out.abs_path(), "/project/build/main/player.scriptc");
        assert_ne!(res, out);
    }

    #[test]
    fn test_identity_is_absolute_path() {
        let a = fs().get("a/b.png").disable_cache();
        let b = fs().get("/a/b.png");
        assert_eq!(a, b);
        assert!(!a.is_cacheable());
        assert!(b.is_cacheable());
    }

    #[test]
    fn test_base_name() {
        let res = fs().get("levels/Level_One.collection");
        assert_eq!(res.base_name(), "level_one");
        let res = fs().get("levels/Level_One.collection.bak");
        assert_eq!(res.base_name(), "level_one");
    }

    #[test]
    fn test_sibling_keeps_side() {
        let out = fs().get("a/b.font").output();
        let glyphs = out.sibling("b.glyphs");
        assert!(glyphs.is_output());
        assert_eq!(glyphs.abs_path(), "/project/build/a/b.glyphs");
    }

    #[test]
    fn test_content_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let fs = FileSystem::new(root, "build");

        let res = fs.get("deep/nested/file.bin").output();
        assert!(!res.exists());
        res.set_content(b"payload").unwrap();
        assert!(res.exists());
        assert_eq!(res.content().unwrap(), b"payload");
        res.remove().unwrap();
        res.remove().unwrap();
        assert!(!res.exists());
    }
}
