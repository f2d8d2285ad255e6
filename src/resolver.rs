use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use crate::protocol::ErrorKind;

/// Largest file the server will offer for download. Legacy guardrail: block
/// counts are derived from 16-bit arithmetic on both ends and several
/// historical clients break past a signed 32-bit byte count.
pub const MAX_TRANSFER_SIZE: u64 = i32::MAX as u64 - 1;

/// Maps a requested transfer name onto a byte stream. The session machine
/// only sees this contract; the sandbox policy lives behind it.
pub trait StreamResolver: Sync {
    /// Open `name` for a read transfer, returning the stream and its total
    /// length (used to answer the `tsize` option).
    fn open_read(&self, name: &str) -> Result<(Box<dyn Read + Send + Sync>, u64), ErrorKind>;

    /// Create `name` for a write transfer. The target must not exist yet.
    fn open_write(&self, name: &str) -> Result<Box<dyn Write + Send + Sync>, ErrorKind>;
}

/// The default resolver: buffered file streams rooted at a served directory.
pub struct DirResolver {
    root: PathBuf,
}

impl DirResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Ensure the requested name stays inside the served directory.
    /// Supports subdirectory paths (e.g. `ios/config/router.cfg`) while
    /// rejecting traversal (`..`), absolute paths, Windows drive letters and
    /// embedded NUL bytes. The containment check runs on the resolved path,
    /// not the raw request string.
    fn resolve(&self, name: &str) -> Result<PathBuf, ErrorKind> {
        if name.is_empty() || name.contains('\0') {
            return Err(ErrorKind::AccessViolation);
        }

        let normalized = name.replace('\\', "/");

        if normalized.starts_with('/') {
            return Err(ErrorKind::AccessViolation);
        }

        for component in normalized.split('/') {
            if component == ".." || is_drive_letter(component) {
                return Err(ErrorKind::AccessViolation);
            }
        }

        // Filter out empty segments and `.` components.
        let clean: PathBuf = normalized
            .split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .collect();

        if clean.as_os_str().is_empty() {
            return Err(ErrorKind::AccessViolation);
        }

        let candidate = self.root.join(&clean);

        let canonical_root = self
            .root
            .canonicalize()
            .map_err(|_| ErrorKind::AccessViolation)?;

        if candidate.exists() {
            let canonical = candidate
                .canonicalize()
                .map_err(|_| ErrorKind::AccessViolation)?;
            if !canonical.starts_with(&canonical_root) {
                return Err(ErrorKind::AccessViolation);
            }
            Ok(canonical)
        } else {
            // New file (write request): verify the deepest existing ancestor
            // is still inside the root.
            let mut ancestor = candidate.parent();
            while let Some(a) = ancestor {
                if a.exists() {
                    let canonical_ancestor =
                        a.canonicalize().map_err(|_| ErrorKind::AccessViolation)?;
                    if !canonical_ancestor.starts_with(&canonical_root) {
                        return Err(ErrorKind::AccessViolation);
                    }
                    return Ok(candidate);
                }
                ancestor = a.parent();
            }
            Err(ErrorKind::AccessViolation)
        }
    }
}

/// `C:` style components smuggle an absolute path on Windows shares.
fn is_drive_letter(component: &str) -> bool {
    let bytes = component.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn map_io_error(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::FileNotFound,
        io::ErrorKind::AlreadyExists => ErrorKind::FileAlreadyExists,
        io::ErrorKind::PermissionDenied => ErrorKind::AccessViolation,
        io::ErrorKind::StorageFull => ErrorKind::DiskFull,
        _ => ErrorKind::AccessViolation,
    }
}

impl StreamResolver for DirResolver {
    fn open_read(&self, name: &str) -> Result<(Box<dyn Read + Send + Sync>, u64), ErrorKind> {
        let path = self.resolve(name)?;
        let metadata = std::fs::metadata(&path).map_err(|e| map_io_error(&e))?;
        if !metadata.is_file() {
            return Err(ErrorKind::FileNotFound);
        }
        if metadata.len() > MAX_TRANSFER_SIZE {
            return Err(ErrorKind::AccessViolation);
        }
        let file = File::open(&path).map_err(|e| map_io_error(&e))?;
        Ok((Box::new(BufReader::new(file)), metadata.len()))
    }

    fn open_write(&self, name: &str) -> Result<Box<dyn Write + Send + Sync>, ErrorKind> {
        let path = self.resolve(name)?;
        if path.exists() {
            return Err(ErrorKind::FileAlreadyExists);
        }
        // Uploads may target a fresh subdirectory inside the sandbox.
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| map_io_error(&e))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| map_io_error(&e))?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_simple_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"test").unwrap();
        let resolver = DirResolver::new(dir.path());
        let result = resolver.resolve("hello.txt").unwrap();
        assert!(result.ends_with("hello.txt"));
    }

    #[test]
    fn resolve_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        std::fs::write(dir.path().join("sub/deep/file.cfg"), b"data").unwrap();
        let resolver = DirResolver::new(dir.path());
        let result = resolver.resolve("sub/deep/file.cfg").unwrap();
        assert!(result.ends_with("sub/deep/file.cfg"));
    }

    #[test]
    fn resolve_rejects_dotdot() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DirResolver::new(dir.path());
        assert_eq!(
            resolver.resolve("../etc/passwd"),
            Err(ErrorKind::AccessViolation)
        );
        assert_eq!(
            resolver.resolve("sub/../../etc/passwd"),
            Err(ErrorKind::AccessViolation)
        );
    }

    #[test]
    fn resolve_rejects_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DirResolver::new(dir.path());
        assert_eq!(
            resolver.resolve("/etc/passwd"),
            Err(ErrorKind::AccessViolation)
        );
        assert_eq!(
            resolver.resolve("\\etc\\passwd"),
            Err(ErrorKind::AccessViolation)
        );
    }

    #[test]
    fn resolve_rejects_drive_letters() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DirResolver::new(dir.path());
        assert_eq!(
            resolver.resolve("C:\\boot.ini"),
            Err(ErrorKind::AccessViolation)
        );
        assert_eq!(
            resolver.resolve("c:/boot.ini"),
            Err(ErrorKind::AccessViolation)
        );
    }

    #[test]
    fn resolve_rejects_nul_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DirResolver::new(dir.path());
        assert_eq!(resolver.resolve(""), Err(ErrorKind::AccessViolation));
        assert_eq!(resolver.resolve("."), Err(ErrorKind::AccessViolation));
        assert_eq!(resolver.resolve(".."), Err(ErrorKind::AccessViolation));
        assert_eq!(
            resolver.resolve("fi\0le.txt"),
            Err(ErrorKind::AccessViolation)
        );
    }

    #[test]
    fn resolve_normalizes_backslashes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("ios")).unwrap();
        std::fs::write(dir.path().join("ios/config.cfg"), b"data").unwrap();
        let resolver = DirResolver::new(dir.path());
        let result = resolver.resolve("ios\\config.cfg").unwrap();
        assert!(result.ends_with("ios/config.cfg"));
    }

    #[test]
    fn resolve_nonexistent_path_within_dir() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DirResolver::new(dir.path());
        // New file in a non-existent subdirectory (write request).
        let result = resolver.resolve("new_dir/file.bin").unwrap();
        assert!(result.ends_with("new_dir/file.bin"));
    }

    #[test]
    fn open_read_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("five.bin"), b"Hello").unwrap();
        let resolver = DirResolver::new(dir.path());
        let (mut stream, size) = resolver.open_read("five.bin").unwrap();
        assert_eq!(size, 5);
        let mut contents = Vec::new();
        stream.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"Hello");
    }

    #[test]
    fn open_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DirResolver::new(dir.path());
        assert!(matches!(
            resolver.open_read("nope.txt"),
            Err(ErrorKind::FileNotFound)
        ));
    }

    #[test]
    fn open_read_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let resolver = DirResolver::new(dir.path());
        assert!(matches!(
            resolver.open_read("sub"),
            Err(ErrorKind::FileNotFound)
        ));
    }

    #[test]
    fn open_read_rejects_oversized_files() {
        let dir = tempfile::tempdir().unwrap();
        // Sparse file just past the guardrail.
        let file = File::create(dir.path().join("huge.bin")).unwrap();
        file.set_len(MAX_TRANSFER_SIZE + 1).unwrap();
        let resolver = DirResolver::new(dir.path());
        assert!(matches!(
            resolver.open_read("huge.bin"),
            Err(ErrorKind::AccessViolation)
        ));
    }

    #[test]
    fn open_write_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("existing.txt"), b"old").unwrap();
        let resolver = DirResolver::new(dir.path());
        assert!(matches!(
            resolver.open_write("existing.txt"),
            Err(ErrorKind::FileAlreadyExists)
        ));
    }

    #[test]
    fn open_write_creates_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DirResolver::new(dir.path());
        let mut stream = resolver.open_write("new/sub/upload.bin").unwrap();
        stream.write_all(b"payload").unwrap();
        stream.flush().unwrap();
        drop(stream);
        let written = std::fs::read(dir.path().join("new/sub/upload.bin")).unwrap();
        assert_eq!(written, b"payload");
    }
}
