//! Mapping request paths onto readable files.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// A resolved resource: a stream positioned at offset 0 and its total length.
pub struct Resource<S> {
    pub stream: S,
    pub size: u64,
}

pub trait Resolve {
    type Stream: io::Read;

    /// Resolves a request path. Fails with `Error::NotFound` if the path does not name a readable
    /// regular file.
    fn resolve(&self, path: &str) -> Result<Resource<Self::Stream>>;
}

/// Serves files relative to a root directory.
pub struct Resolver {
    root: PathBuf,
}

impl Resolver {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Joins a request path onto the root. Leading separators are stripped; anything that could
    /// escape the root is refused.
    fn local_path(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));

        let mut local = self.root.clone();
        let mut depth = 0;

        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    local.push(part);
                    depth += 1;
                }
                Component::CurDir => (),
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }

        if depth == 0 {
            None
        } else {
            Some(local)
        }
    }
}

impl Resolve for Resolver {
    type Stream = fs::File;

    fn resolve(&self, path: &str) -> Result<Resource<fs::File>> {
        let not_found = || Error::NotFound(path.to_string());

        let local = self.local_path(path).ok_or_else(not_found)?;

        let file = fs::File::open(&local).map_err(|_| not_found())?;
        let metadata = file.metadata().map_err(|_| not_found())?;

        if !metadata.is_file() {
            return Err(not_found());
        }

        Ok(Resource {
            stream: file,
            size: metadata.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Read;

    #[test]
    fn resolve_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/index.html"), b"<html></html>").unwrap();

        let resolver = Resolver::new(dir.path());

        let mut resource = resolver.resolve("/docs/index.html").unwrap();
        assert_eq!(resource.size, 13);

        let mut content = Vec::new();
        resource.stream.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"<html></html>");

        // Leading separator is optional
        assert_eq!(resolver.resolve("docs/index.html").unwrap().size, 13);
        assert_eq!(resolver.resolve("/./docs/index.html").unwrap().size, 13);
    }

    #[test]
    fn not_found() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("secret"), b"x").unwrap();

        let resolver = Resolver::new(dir.path().join("docs"));

        for path in ["/missing", "/", "", "/../secret", "/docs/../../secret"] {
            assert!(
                matches!(resolver.resolve(path), Err(Error::NotFound(_))),
                "{path:?} resolved"
            );
        }

        // Directories are not files
        let resolver = Resolver::new(dir.path());
        assert!(matches!(resolver.resolve("/docs"), Err(Error::NotFound(_))));
    }
}
