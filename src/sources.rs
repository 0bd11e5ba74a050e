//! Source discovery and the exclude list.
use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern};

use crate::builder::BuilderRegistry;
use crate::core::{Options, keys};
use crate::error::KilnError;

/// Per-project ignore file, one path prefix per line.
pub const IGNORE_FILE: &str = ".kilnignore";

const GLOB_OPTS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Lists every file under `path`, relative to `root`.
///
/// `path` may be absolute as long as it lies under `root`. Files inside one
/// of `skip_dirs` and dot-files such as `.project` are left out.
pub fn find_sources(
    root: &Utf8Path,
    path: &Utf8Path,
    skip_dirs: &[String],
) -> Result<Vec<Utf8PathBuf>, KilnError> {
    let rel = if path.is_absolute() {
        path.strip_prefix(root).map_err(|_| {
            not_found(format!("the source '{path}' must be located under the root '{root}'"))
        })?
    } else {
        path
    };

    let start = match rel.as_str() {
        "" | "." => root.to_path_buf(),
        _ => root.join(rel),
    };
    if !start.exists() {
        return Err(not_found(format!(
            "the path '{rel}' can not be found under the root '{root}'"
        )));
    }

    let mut found = Vec::new();

    if start.is_file() {
        found.push(rel.to_path_buf());
    } else {
        let pattern = format!("{}/**/*", Pattern::escape(start.as_str()));
        for entry in glob::glob_with(&pattern, GLOB_OPTS)? {
            let entry = Utf8PathBuf::try_from(entry?)?;
            if entry.is_dir() {
                continue;
            }
            if let Ok(rel) = entry.strip_prefix(root) {
                found.push(rel.to_path_buf());
            }
        }
    }

    found.retain(|path| !in_skipped_dir(path, skip_dirs) && !is_dot_file(path));
    Ok(found)
}

fn not_found(message: String) -> KilnError {
    KilnError::Io(io::Error::new(io::ErrorKind::NotFound, message))
}

fn in_skipped_dir(path: &Utf8Path, skip_dirs: &[String]) -> bool {
    skip_dirs.iter().any(|dir| {
        let dir = dir.trim_matches('/');
        !dir.is_empty() && path.starts_with(dir)
    })
}

/// A file whose name is a bare extension, like `.gitignore`.
fn is_dot_file(path: &Utf8Path) -> bool {
    path.file_name().is_some_and(|name| name.rfind('.') == Some(0))
}

/// Drops inputs no builder claims.
pub fn prune(inputs: Vec<Utf8PathBuf>, registry: &BuilderRegistry) -> Vec<Utf8PathBuf> {
    inputs
        .into_iter()
        .filter(|path| path.extension().is_some_and(|ext| registry.resolve(ext).is_some()))
        .collect()
}

/// Entries of the `exclude-build-folder` option followed by the lines of
/// `<root>/.kilnignore`, each without its leading `/`.
pub fn load_excludes(root: &Utf8Path, options: &Options) -> Result<Vec<String>, KilnError> {
    let mut entries = options.list(keys::EXCLUDE_BUILD_FOLDER);

    let ignore = root.join(IGNORE_FILE);
    if ignore.is_file() {
        let content = fs::read_to_string(&ignore)?;
        entries.extend(
            content
                .lines()
                .map(str::trim_end)
                .filter(|line| !line.is_empty())
                .map(String::from),
        );
    }

    Ok(entries
        .into_iter()
        .map(|entry| entry.strip_prefix('/').map(String::from).unwrap_or(entry))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::builder::{BuildContext, Builder, BuilderDescriptor};
    use crate::error::BuildError;
    use crate::task::Task;

    fn project() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        for file in [
            "main/player.script",
            "main/.project",
            "main/sprites/hero.png",
            "build/main/player.scriptc",
            ".internal/cache/ab/abcd",
            "docs/readme.md",
        ] {
            let path = root.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, b"x").unwrap();
        }
        (dir, root)
    }

    #[test]
    fn test_walk_skips_dirs_and_dot_files() {
        let (_dir, root) = project();
        let skip = vec!["build".to_string(), "/.internal".to_string()];

        let mut found = find_sources(&root, Utf8Path::new(""), &skip).unwrap();
        found.sort();
        assert_eq!(
            found,
            ["docs/readme.md", "main/player.script", "main/sprites/hero.png"].map(Utf8PathBuf::from)
        );
    }

    #[test]
    fn test_walk_subdirectory_and_absolute_path() {
        let (_dir, root) = project();
        let found = find_sources(&root, &root.join("main/sprites"), &[]).unwrap();
        assert_eq!(found, [Utf8PathBuf::from("main/sprites/hero.png")]);
    }

    #[test]
    fn test_walk_outside_root() {
        let (_dir, root) = project();
        let err = find_sources(&root, Utf8Path::new("/definitely/elsewhere"), &[]).unwrap_err();
        assert!(matches!(err, KilnError::Io(ref e) if e.kind() == io::ErrorKind::NotFound));

        let err = find_sources(&root, Utf8Path::new("missing"), &[]).unwrap_err();
        assert!(matches!(err, KilnError::Io(ref e) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn test_dot_file() {
        assert!(is_dot_file(Utf8Path::new("a/.gitignore")));
        assert!(!is_dot_file(Utf8Path::new("a/.hidden.png")));
        assert!(!is_dot_file(Utf8Path::new("a/b.png")));
    }

    #[test]
    fn test_excludes() {
        let (_dir, root) = project();
        fs::write(root.join(IGNORE_FILE), "/assets/raw\r\n\n/tmp\n").unwrap();

        let mut options = Options::new();
        options.set(keys::EXCLUDE_BUILD_FOLDER, "/levels/wip, docs");

        let excludes = load_excludes(&root, &options).unwrap();
        assert_eq!(excludes, ["levels/wip", "docs", "assets/raw", "tmp"]);
    }

    #[test]
    fn test_prune() {
        struct Noop;

        impl Builder for Noop {
            fn build(&self, _: &Task, _: &mut BuildContext<'_>) -> Result<(), BuildError> {
                Ok(())
            }
        }

        let mut registry = BuilderRegistry::new();
        registry
            .register(BuilderDescriptor::new("script", "script", "scriptc"), Arc::new(Noop))
            .unwrap();

        let inputs = ["a.script", "b.md", "Makefile"].map(Utf8PathBuf::from).to_vec();
        assert_eq!(prune(inputs, &registry), [Utf8PathBuf::from("a.script")]);
    }
}
