// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Sample file directory management: opening a directory, checking its
//! metadata against what the database expects, and creating/unlinking the
//! recording files within it. Serving byte ranges over HTTP is out of
//! scope here; that lives in the (external) API layer.

mod meta;

use crate::db::CompositeId;
use base::{bail, err, Error};
pub use meta::DirMeta;
use nix::{
    fcntl::{FlockArg, OFlag},
    sys::stat::Mode,
    sys::statvfs::Statvfs,
    NixPath,
};
use std::ffi::CStr;
use std::fs;
use std::io::Write;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

/// A sample file directory. Typically one per physical disk drive.
#[derive(Debug)]
pub struct SampleFileDir {
    pub(crate) fd: Arc<Fd>,
}

/// The on-disk filename of a recording file within the sample file directory:
/// the [`CompositeId`] as 16 lowercase hexadigits, null-terminated so it can
/// be passed to system calls without copying.
pub(crate) struct CompositeIdPath([u8; 17]);

impl CompositeIdPath {
    pub(crate) fn from(id: CompositeId) -> Self {
        let mut buf = [0u8; 17];
        write!(&mut buf[..16], "{:016x}", id.0).expect("can't format id to pathname buf");
        CompositeIdPath(buf)
    }
}

impl NixPath for CompositeIdPath {
    fn is_empty(&self) -> bool {
        false
    }
    fn len(&self) -> usize {
        16
    }

    fn with_nix_path<T, F>(&self, f: F) -> Result<T, nix::Error>
    where
        F: FnOnce(&CStr) -> T,
    {
        let p = CStr::from_bytes_with_nul(&self.0[..]).expect("no interior nuls");
        Ok(f(p))
    }
}

/// A file descriptor associated with a directory (not necessarily the sample file dir).
#[derive(Debug)]
pub struct Fd(RawFd);

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if let Err(e) = nix::unistd::close(self.0) {
            tracing::warn!("unable to close sample file dir: {}", e);
        }
    }
}

impl Fd {
    /// Opens the given path as a directory, creating it first if `mkdir`.
    pub fn open<P: ?Sized + NixPath>(path: &P, mkdir: bool) -> Result<Fd, nix::Error> {
        if mkdir {
            match nix::unistd::mkdir(path, Mode::S_IRWXU) {
                Ok(()) | Err(nix::Error::EEXIST) => {}
                Err(e) => return Err(e),
            }
        }
        let fd = nix::fcntl::open(path, OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty())?;
        Ok(Fd(fd))
    }

    pub(crate) fn sync(&self) -> Result<(), nix::Error> {
        nix::unistd::fsync(self.0)
    }

    pub fn lock(&self, arg: FlockArg) -> Result<(), nix::Error> {
        nix::fcntl::flock(self.0, arg)
    }

    pub fn statfs(&self) -> Result<Statvfs, nix::Error> {
        nix::sys::statvfs::fstatvfs(self)
    }
}

impl SampleFileDir {
    /// Opens an existing directory, checking its on-disk metadata against
    /// what the database expects. `expected_meta.in_progress_open` should be
    /// set iff the directory is being opened for writing.
    pub fn open(path: &Path, expected_meta: &DirMeta) -> Result<Arc<SampleFileDir>, Error> {
        let read_write = expected_meta.in_progress_open.is_some();
        let s = SampleFileDir::open_self(path, false)?;
        s.fd.lock(if read_write {
            FlockArg::LockExclusiveNonblock
        } else {
            FlockArg::LockSharedNonblock
        })
        .map_err(|e| err!(Unknown, msg("unable to lock dir {}", path.display()), source(e)))?;
        let dir_meta =
            meta::read_meta(&s.fd).map_err(|e| err!(Unknown, msg("unable to read meta file"), source(e)))?;
        if let Err(e) = SampleFileDir::check_consistent(expected_meta, &dir_meta) {
            bail!(
                FailedPrecondition,
                msg(
                    "metadata mismatch for {}: {}\nexpected:\n{:#?}\n\nactual:\n{:#?}",
                    path.display(),
                    e,
                    expected_meta,
                    &dir_meta
                ),
            );
        }
        if expected_meta.in_progress_open.is_some() {
            s.write_meta(expected_meta)?;
        }
        Ok(s)
    }

    /// Checks that the existing directory and database metadata are consistent; the
    /// directory is then openable.
    pub(crate) fn check_consistent(expected_meta: &DirMeta, actual_meta: &DirMeta) -> Result<(), String> {
        if actual_meta.db_uuid != expected_meta.db_uuid {
            return Err("db uuid mismatch".into());
        }
        if actual_meta.dir_uuid != expected_meta.dir_uuid {
            return Err("dir uuid mismatch".into());
        }
        if expected_meta.last_complete_open.is_some()
            && (expected_meta.last_complete_open != actual_meta.last_complete_open
                && expected_meta.last_complete_open != actual_meta.in_progress_open)
        {
            return Err(format!(
                "expected open {:?}; but got {:?} (complete) or {:?} (in progress)",
                expected_meta.last_complete_open, actual_meta.last_complete_open, actual_meta.in_progress_open,
            ));
        }
        if expected_meta.last_complete_open.is_none() && actual_meta.last_complete_open.is_some() {
            return Err("expected never opened".into());
        }
        Ok(())
    }

    pub fn create(path: &Path, db_meta: &DirMeta) -> Result<Arc<SampleFileDir>, Error> {
        let s = SampleFileDir::open_self(path, true)?;
        s.fd.lock(FlockArg::LockExclusiveNonblock)
            .map_err(|e| err!(Unknown, msg("unable to lock dir {}", path.display()), source(e)))?;
        let old_meta = meta::read_meta(&s.fd)?;
        if old_meta.last_complete_open.is_some() {
            bail!(
                FailedPrecondition,
                msg("can't create dir at path {}: already in use:\n{:?}", path.display(), old_meta),
            );
        }
        if !s.is_empty()? {
            bail!(FailedPrecondition, msg("can't create dir at path {} with existing files", path.display()));
        }
        s.write_meta(db_meta)?;
        Ok(s)
    }

    pub(crate) fn opendir(&self) -> Result<nix::dir::Dir, nix::Error> {
        nix::dir::Dir::openat(self.fd.as_raw_fd(), ".", OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty())
    }

    /// Determines if the directory is empty, aside from metadata.
    pub(crate) fn is_empty(&self) -> Result<bool, Error> {
        let mut dir = self.opendir()?;
        for e in dir.iter() {
            let e = e?;
            match e.file_name().to_bytes() {
                b"." | b".." => continue,
                b"meta" => continue,
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn open_self(path: &Path, create: bool) -> Result<Arc<SampleFileDir>, Error> {
        let fd = Arc::new(Fd::open(path, create)?);
        Ok(Arc::new(SampleFileDir { fd }))
    }

    pub fn open_file(&self, composite_id: CompositeId) -> Result<fs::File, nix::Error> {
        let p = CompositeIdPath::from(composite_id);
        crate::fs::openat(self.fd.0, &p, OFlag::O_RDONLY, Mode::empty())
    }

    pub fn create_file(&self, composite_id: CompositeId) -> Result<fs::File, nix::Error> {
        let p = CompositeIdPath::from(composite_id);
        crate::fs::openat(
            self.fd.0,
            &p,
            OFlag::O_WRONLY | OFlag::O_EXCL | OFlag::O_CREAT,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
    }

    pub(crate) fn write_meta(&self, meta: &DirMeta) -> Result<(), Error> {
        meta::write_meta(self.fd.0, meta)
    }

    pub fn statfs(&self) -> Result<Statvfs, nix::Error> {
        self.fd.statfs()
    }

    /// Unlinks the given sample file within this directory.
    pub fn unlink_file(&self, id: CompositeId) -> Result<(), nix::Error> {
        let p = CompositeIdPath::from(id);
        nix::unistd::unlinkat(Some(self.fd.0), &p, nix::unistd::UnlinkatFlags::NoRemoveDir)
    }

    /// Syncs the directory itself (new dirents durable, not file contents).
    pub(crate) fn sync(&self) -> Result<(), nix::Error> {
        self.fd.sync()
    }
}

/// Parses a composite id filename: exactly 16 bytes, lowercase hex, as
/// created by [`CompositeIdPath`].
pub(crate) fn parse_id(id: &[u8]) -> Result<CompositeId, ()> {
    if id.len() != 16 {
        return Err(());
    }
    let mut v: u64 = 0;
    for b in id {
        v = (v << 4)
            | match b {
                b @ b'0'..=b'9' => b - b'0',
                b @ b'a'..=b'f' => b - b'a' + 10,
                _ => return Err(()),
            } as u64;
    }
    Ok(CompositeId(v as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_id_roundtrip() {
        assert_eq!(parse_id(b"0000000000000000").unwrap().0, 0);
        assert_eq!(parse_id(b"0000000100000002").unwrap().0, 0x0000_0001_0000_0002);
        parse_id(b"").unwrap_err();
        parse_id(b"meta").unwrap_err();
        parse_id(b"0").unwrap_err();
        parse_id(b"000000010000000x").unwrap_err();
    }

    #[test]
    fn create_open_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let db_meta = DirMeta {
            db_uuid: [7u8; 16],
            dir_uuid: [9u8; 16],
            last_complete_open: None,
            in_progress_open: Some([1u8; 16]),
        };
        let dir = SampleFileDir::create(tmp.path(), &db_meta).unwrap();
        drop(dir);
        let reopened = SampleFileDir::open(tmp.path(), &db_meta).unwrap();
        assert!(reopened.is_empty().unwrap());
    }
}
