//! Reproducible tar construction with content-addressed identity.
//!
//! Given identical tree contents, ownership configuration, and host-OS
//! class, the emitted byte stream is identical across runs and machines:
//! entries follow a pre-order walk with lexicographic sibling order, and
//! every header is normalized (pinned mod-time, configured uid/gid, empty
//! user/group names). The digest of the tar bytes is the layer's identity
//! and drives the reuse-vs-rebuild decision.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tar::{Archive, Builder, EntryType, Header};
use walkdir::WalkDir;

/// Archive schema selector. Windows-class images use the `Files/` +
/// `Hives/` layout with slash-normalized names. The class is configured by
/// the caller, never read from the build target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostOs {
    Unix,
    Windows,
}

impl HostOs {
    pub fn current() -> Self {
        if cfg!(windows) {
            HostOs::Windows
        } else {
            HostOs::Unix
        }
    }
}

const FIXED_MTIME: u64 = 315_532_801; // 1980-01-01T00:00:01Z

/// Archives every entry reachable from `source_dir` (which may also be a
/// single file) into a tar at `dest`, preceded by directory entries for
/// each ancestor of `source_dir`. Returns the `sha256:` digest of the tar
/// byte stream. The destination is truncated when archiving fails, so a
/// partial tar never survives.
pub fn write_dir_tar(
    source_dir: &Path,
    dest: &Path,
    uid: u32,
    gid: u32,
    host_os: HostOs,
) -> Result<String> {
    let file = File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
    match append_dir_archive(HashingWriter::new(file), source_dir, uid, gid, host_os) {
        Ok(writer) => Ok(format!("sha256:{:x}", writer.hasher.finalize())),
        Err(err) => {
            let _ = File::create(dest);
            Err(err)
        }
    }
}

/// Archives an explicit member list into a tar at `dest`. Duplicate paths
/// are archived exactly once; the returned set is the deduplicated set of
/// members actually written. Directory members are recorded header-only.
pub fn write_files_tar(
    dest: &Path,
    uid: u32,
    gid: u32,
    host_os: HostOs,
    files: &[PathBuf],
) -> Result<(String, BTreeSet<PathBuf>)> {
    let file = File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
    let mut written = BTreeSet::new();
    match append_files_archive(HashingWriter::new(file), files, &mut written, uid, gid, host_os) {
        Ok(writer) => Ok((format!("sha256:{:x}", writer.hasher.finalize()), written)),
        Err(err) => {
            let _ = File::create(dest);
            Err(err)
        }
    }
}

/// Restores an archive produced by this module under `dest`. Unknown entry
/// types are rejected.
pub fn extract_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);
    for entry in archive.entries().context("reading archive")? {
        let mut entry = entry.context("reading archive entry")?;
        let relative = entry.path().context("reading entry path")?.into_owned();
        let path = dest.join(&relative);
        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&path)
                    .with_context(|| format!("creating {}", path.display()))?;
            }
            EntryType::Regular => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                let mode = entry.header().mode().context("reading entry mode")?;
                let mut file = File::create(&path)
                    .with_context(|| format!("creating {}", path.display()))?;
                io::copy(&mut entry, &mut file)
                    .with_context(|| format!("writing {}", path.display()))?;
                set_file_mode(&path, mode)?;
            }
            EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .context("reading link target")?
                    .with_context(|| format!("entry {} has no link target", relative.display()))?
                    .into_owned();
                make_symlink(&target, &path)?;
            }
            other => bail!(
                "unsupported entry type {:?} for {}",
                other,
                relative.display()
            ),
        }
    }
    Ok(())
}

fn append_dir_archive<W: Write>(
    writer: HashingWriter<W>,
    source_dir: &Path,
    uid: u32,
    gid: u32,
    host_os: HostOs,
) -> Result<HashingWriter<W>> {
    let mut builder = Builder::new(writer);
    builder.follow_symlinks(false);
    append_ancestors(&mut builder, source_dir, uid, gid, host_os)?;
    for entry in WalkDir::new(source_dir).sort_by(|a, b| a.path().cmp(b.path())) {
        let entry = entry.with_context(|| format!("walking {}", source_dir.display()))?;
        append_path(&mut builder, entry.path(), uid, gid, host_os)?;
    }
    builder.into_inner().context("finalizing archive")
}

fn append_files_archive<W: Write>(
    writer: HashingWriter<W>,
    files: &[PathBuf],
    written: &mut BTreeSet<PathBuf>,
    uid: u32,
    gid: u32,
    host_os: HostOs,
) -> Result<HashingWriter<W>> {
    let mut builder = Builder::new(writer);
    builder.follow_symlinks(false);
    if host_os == HostOs::Windows {
        append_virtual_roots(&mut builder)?;
    }
    for path in files {
        if !written.insert(path.clone()) {
            continue;
        }
        append_path(&mut builder, path, uid, gid, host_os)?;
    }
    builder.into_inner().context("finalizing archive")
}

fn append_ancestors<W: Write>(
    builder: &mut Builder<W>,
    source_dir: &Path,
    uid: u32,
    gid: u32,
    host_os: HostOs,
) -> Result<()> {
    if host_os == HostOs::Windows {
        append_virtual_roots(builder)?;
    }
    let mut ancestors: Vec<&Path> = source_dir
        .ancestors()
        .skip(1)
        .filter(|dir| {
            dir.components()
                .any(|c| matches!(c, Component::Normal(_)))
        })
        .collect();
    ancestors.reverse();
    for dir in ancestors {
        let meta =
            fs::metadata(dir).with_context(|| format!("reading metadata for {}", dir.display()))?;
        let mut header = base_header(&meta, uid, gid);
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        builder
            .append_data(&mut header, archive_name(dir, host_os), io::empty())
            .with_context(|| format!("archiving {}", dir.display()))?;
    }
    Ok(())
}

fn append_virtual_roots<W: Write>(builder: &mut Builder<W>) -> Result<()> {
    for name in ["Files", "Hives"] {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_mtime(FIXED_MTIME);
        header.set_size(0);
        builder
            .append_data(&mut header, name, io::empty())
            .with_context(|| format!("archiving virtual root {name}"))?;
    }
    Ok(())
}

fn append_path<W: Write>(
    builder: &mut Builder<W>,
    path: &Path,
    uid: u32,
    gid: u32,
    host_os: HostOs,
) -> Result<()> {
    let meta = fs::symlink_metadata(path)
        .with_context(|| format!("reading metadata for {}", path.display()))?;
    let file_type = meta.file_type();
    if is_socket(&file_type) {
        return Ok(());
    }
    let name = archive_name(path, host_os);
    let mut header = base_header(&meta, uid, gid);
    if file_type.is_symlink() {
        let target = fs::read_link(path)
            .with_context(|| format!("reading link target of {}", path.display()))?;
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        builder
            .append_link(&mut header, &name, &target)
            .with_context(|| format!("archiving {}", path.display()))?;
    } else if file_type.is_dir() {
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        builder
            .append_data(&mut header, &name, io::empty())
            .with_context(|| format!("archiving {}", path.display()))?;
    } else if file_type.is_file() {
        header.set_entry_type(EntryType::Regular);
        header.set_size(meta.len());
        let file =
            File::open(path).with_context(|| format!("opening {}", path.display()))?;
        builder
            .append_data(&mut header, &name, file)
            .with_context(|| format!("archiving {}", path.display()))?;
    } else if let Some(entry_type) = special_entry_type(&file_type) {
        header.set_entry_type(entry_type);
        header.set_size(0);
        builder
            .append_data(&mut header, &name, io::empty())
            .with_context(|| format!("archiving {}", path.display()))?;
    } else {
        tracing::debug!(path = %path.display(), "skipping unsupported file type");
    }
    Ok(())
}

fn base_header(meta: &fs::Metadata, uid: u32, gid: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_mode(file_mode(meta));
    header.set_mtime(FIXED_MTIME);
    header.set_uid(u64::from(uid));
    header.set_gid(u64::from(gid));
    let _ = header.set_username("");
    let _ = header.set_groupname("");
    header
}

/// Archive member name for a host path: the path without its root, and on
/// the Windows class additionally under the `Files/` prefix.
fn archive_name(path: &Path, host_os: HostOs) -> PathBuf {
    let relative: PathBuf = path
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    match host_os {
        HostOs::Unix => relative,
        HostOs::Windows => Path::new("Files").join(relative),
    }
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

#[cfg(unix)]
fn is_socket(file_type: &fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_socket()
}

#[cfg(not(unix))]
fn is_socket(_file_type: &fs::FileType) -> bool {
    false
}

#[cfg(unix)]
fn special_entry_type(file_type: &fs::FileType) -> Option<EntryType> {
    use std::os::unix::fs::FileTypeExt;
    if file_type.is_fifo() {
        Some(EntryType::Fifo)
    } else if file_type.is_char_device() {
        Some(EntryType::Char)
    } else if file_type.is_block_device() {
        Some(EntryType::Block)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn special_entry_type(_file_type: &fs::FileType) -> Option<EntryType> {
    None
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("setting mode on {}", path.display()))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, path: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, path)
        .with_context(|| format!("creating symlink {}", path.display()))
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, path: &Path) -> Result<()> {
    bail!("symlinks are not supported on this platform: {}", path.display())
}

struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
