// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! On-disk metadata for a sample file directory: a small fixed-length
//! record identifying which database and which "open" (start/stop cycle)
//! last wrote to the directory, so a directory can't accidentally be
//! attached to the wrong database or replay a half-finished open.

use base::{bail, err, Error, ErrorKind};
use std::convert::TryInto;
use std::io::{Read, Write};
use std::os::unix::io::RawFd;

/// The fixed length of a directory's `meta` file.
pub(crate) const FIXED_DIR_META_LEN: usize = 512;

const MAGIC: u32 = 0x4D465344; // "MFSD"

/// Metadata describing which database owns a sample file directory and
/// the most recent opens of it. Analogous to a superblock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirMeta {
    pub db_uuid: [u8; 16],
    pub dir_uuid: [u8; 16],
    pub last_complete_open: Option<[u8; 16]>,
    pub in_progress_open: Option<[u8; 16]>,
}

impl DirMeta {
    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(FIXED_DIR_META_LEN);
        v.extend_from_slice(&MAGIC.to_le_bytes());
        v.extend_from_slice(&self.db_uuid);
        v.extend_from_slice(&self.dir_uuid);
        Self::encode_open(&mut v, self.last_complete_open);
        Self::encode_open(&mut v, self.in_progress_open);
        v.resize(FIXED_DIR_META_LEN, 0);
        v
    }

    fn encode_open(v: &mut Vec<u8>, o: Option<[u8; 16]>) {
        match o {
            None => v.push(0),
            Some(uuid) => {
                v.push(1);
                v.extend_from_slice(&uuid);
            }
        }
    }

    fn decode_open(data: &[u8], pos: &mut usize) -> Result<Option<[u8; 16]>, Error> {
        let present = *data.get(*pos).ok_or_else(|| err!(DataLoss, msg("short meta")))?;
        *pos += 1;
        if present == 0 {
            return Ok(None);
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&data[*pos..*pos + 16]);
        *pos += 16;
        Ok(Some(uuid))
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() != FIXED_DIR_META_LEN {
            bail!(
                DataLoss,
                msg(
                    "expected {}-byte meta file, got {}-byte",
                    FIXED_DIR_META_LEN,
                    data.len()
                ),
            );
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != MAGIC {
            bail!(DataLoss, msg("bad meta magic {:#010x}", magic));
        }
        let mut pos = 4;
        let mut db_uuid = [0u8; 16];
        db_uuid.copy_from_slice(&data[pos..pos + 16]);
        pos += 16;
        let mut dir_uuid = [0u8; 16];
        dir_uuid.copy_from_slice(&data[pos..pos + 16]);
        pos += 16;
        let last_complete_open = Self::decode_open(data, &mut pos)?;
        let in_progress_open = Self::decode_open(data, &mut pos)?;
        Ok(DirMeta {
            db_uuid,
            dir_uuid,
            last_complete_open,
            in_progress_open,
        })
    }
}

/// Reads `dir`'s metadata. If none is found, returns a default (all-zero) meta.
pub(crate) fn read_meta(dir: &super::Fd) -> Result<DirMeta, Error> {
    use nix::fcntl::OFlag;
    use nix::sys::stat::Mode;
    use std::os::unix::io::AsRawFd;

    let mut f = match crate::fs::openat(dir.as_raw_fd(), c"meta", OFlag::O_RDONLY, Mode::empty()) {
        Err(nix::Error::ENOENT) => return Ok(DirMeta::default()),
        Err(e) => return Err(e.into()),
        Ok(f) => f,
    };
    let mut data = Vec::new();
    f.read_to_end(&mut data)
        .map_err(|e| err!(Unknown, msg("unable to read meta file"), source(e)))?;
    DirMeta::decode(&data)
}

/// Writes `dirfd`'s metadata, clobbering any existing contents.
pub(crate) fn write_meta(dirfd: RawFd, meta: &DirMeta) -> Result<(), Error> {
    use nix::fcntl::OFlag;
    use nix::sys::stat::Mode;

    let data = meta.encode();
    debug_assert_eq!(data.len(), FIXED_DIR_META_LEN);
    let mut f = crate::fs::openat(
        dirfd,
        c"meta",
        OFlag::O_CREAT | OFlag::O_WRONLY,
        Mode::S_IRUSR | Mode::S_IWUSR,
    )
    .map_err(|e| err!(Unknown, msg("unable to open meta file"), source(e)))?;
    f.write_all(&data)
        .map_err(|e| err!(Unknown, msg("unable to write meta file"), source(e)))?;
    f.sync_all()
        .map_err(|e| err!(Unknown, msg("unable to sync meta file"), source(e)))?;
    nix::unistd::fsync(dirfd).map_err(|e| err!(Unknown, msg("unable to sync dir"), source(e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let meta = DirMeta {
            db_uuid: [1u8; 16],
            dir_uuid: [2u8; 16],
            last_complete_open: Some([3u8; 16]),
            in_progress_open: Some([4u8; 16]),
        };
        let encoded = meta.encode();
        assert_eq!(encoded.len(), FIXED_DIR_META_LEN);
        assert_eq!(DirMeta::decode(&encoded).unwrap(), meta);
    }

    #[test]
    fn empty_round_trip() {
        let meta = DirMeta::default();
        let encoded = meta.encode();
        assert_eq!(DirMeta::decode(&encoded).unwrap(), meta);
    }

    #[test]
    fn bad_magic() {
        let data = vec![0u8; FIXED_DIR_META_LEN];
        DirMeta::decode(&data).unwrap_err();
    }
}
