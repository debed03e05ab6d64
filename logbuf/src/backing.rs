//! The memory an arena lives in.
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use logbuf_state::Span;
use memmap2::{MmapMut, MmapRaw};

use crate::OpenError;

pub(crate) struct Backing {
    span: Span,
    /// Whether the file had the expected size when opened, i.e. may hold an arena to recover.
    existed: bool,
    mapping: Mapping,
    #[cfg(test)]
    failing: core::sync::atomic::AtomicBool,
}

enum Mapping {
    Anonymous(MmapMut),
    File {
        map: MmapRaw,
        /// Holds the lock. Purely for the `Drop`.
        #[allow(dead_code)]
        file: File,
        path: Option<PathBuf>,
    },
}

impl Backing {
    /// Private, zeroed memory. Gone with the process.
    pub(crate) fn anonymous(len: usize) -> Result<Self, OpenError> {
        let mut map = MmapMut::map_anon(len)?;
        // Safety: the mapping is kept alive in `Self`, which outlives every use of the span.
        let span = unsafe { Span::new(map.as_mut_ptr(), len) }.ok_or(OpenError::Unaligned)?;

        Ok(Backing {
            span,
            existed: false,
            mapping: Mapping::Anonymous(map),
            #[cfg(test)]
            failing: Default::default(),
        })
    }

    /// A shared mapping of the file at `path`, created if needed.
    pub(crate) fn file(path: &Path, len: usize) -> Result<Self, OpenError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Self::map_file(file, len, Some(path.to_owned()))
    }

    /// A shared mapping of an already opened file.
    pub(crate) fn from_file(file: File, len: usize) -> Result<Self, OpenError> {
        Self::map_file(file, len, None)
    }

    fn map_file(file: File, len: usize, path: Option<PathBuf>) -> Result<Self, OpenError> {
        if !lock_exclusive(&file)? {
            let name = path.as_deref().map_or_else(
                || format!("fd {}", file.as_raw_fd()),
                |path| path.display().to_string(),
            );
            return Err(OpenError::Locked(name));
        }

        let existed = file.metadata()?.len() == len as u64;
        if !existed {
            // Whatever was there is not an arena of this layout. Start from zeroes.
            file.set_len(0)?;
            file.set_len(len as u64)?;
        }

        let map = MmapRaw::map_raw(&file)?;
        // Safety: the mapping is kept alive in `Self`. Pages of a file mapping are initialized.
        let span = unsafe { Span::new(map.as_mut_ptr(), len) }.ok_or(OpenError::Unaligned)?;

        Ok(Backing {
            span,
            existed,
            mapping: Mapping::File { map, file, path },
            #[cfg(test)]
            failing: Default::default(),
        })
    }

    pub(crate) fn span(&self) -> Span {
        self.span
    }

    pub(crate) fn existed(&self) -> bool {
        self.existed
    }

    pub(crate) fn is_persistent(&self) -> bool {
        matches!(self.mapping, Mapping::File { .. })
    }

    pub(crate) fn path(&self) -> Option<&Path> {
        match &self.mapping {
            Mapping::File { path, .. } => path.as_deref(),
            Mapping::Anonymous(_) => None,
        }
    }

    /// Schedule the write-back of a range of the mapping.
    pub(crate) fn flush_async_range(&self, offset: usize, len: usize) -> io::Result<()> {
        #[cfg(test)]
        self.injected_failure()?;

        match &self.mapping {
            Mapping::File { map, .. } => map.flush_async_range(offset, len),
            Mapping::Anonymous(_) => Ok(()),
        }
    }

    /// Write back the whole mapping and wait for it.
    pub(crate) fn flush(&self) -> io::Result<()> {
        #[cfg(test)]
        self.injected_failure()?;

        match &self.mapping {
            Mapping::File { map, .. } => map.flush(),
            Mapping::Anonymous(_) => Ok(()),
        }
    }
}

#[cfg(test)]
impl Backing {
    /// Make every following write-back fail.
    pub(crate) fn fail_write_back(&self) {
        self.failing.store(true, core::sync::atomic::Ordering::Relaxed);
    }

    fn injected_failure(&self) -> io::Result<()> {
        if self.failing.load(core::sync::atomic::Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write-back failure"));
        }

        Ok(())
    }
}

/// Take the exclusive advisory lock without blocking. `Ok(false)` if another holder has it.
fn lock_exclusive(file: &File) -> io::Result<bool> {
    match unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } {
        0 => Ok(true),
        _ => {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                Ok(false)
            } else {
                Err(err)
            }
        }
    }
}

#[test]
fn anonymous_is_zeroed() {
    let backing = Backing::anonymous(4096).unwrap();
    let span = backing.span();

    assert_eq!(span.len(), 4096);
    assert!(!backing.existed());
    assert!(!backing.is_persistent());
    let bytes = unsafe { core::slice::from_raw_parts(span.as_ptr(), span.len()) };
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn file_is_locked_exclusively() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("arena.mmap");

    let backing = Backing::file(&path, 8192).unwrap();
    assert!(!backing.existed());
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192);
    assert!(matches!(Backing::file(&path, 8192), Err(OpenError::Locked(_))));
    drop(backing);

    let backing = Backing::file(&path, 8192).unwrap();
    assert!(backing.existed());
    assert_eq!(backing.path(), Some(path.as_path()));
}
