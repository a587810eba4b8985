//! Chart archive (`.tgz`) packing and extraction
//!
//! Archives are written deterministically: entries are sorted, timestamps
//! and ownership are zeroed, so packaging the same tree twice yields the same
//! bytes and therefore the same digest.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path};
use tar::{Archive, Builder, EntryType, Header};

use crate::error::{CoreError, Result};

/// Pack a directory into gzip-compressed tar bytes, every entry under `prefix/`
pub fn pack_directory(src: &Path, prefix: &str) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);

    let walker = walkdir::WalkDir::new(src)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();

    for entry in walker {
        let entry = entry.map_err(|e| CoreError::Archive {
            message: format!("Failed to walk {}: {}", src.display(), e),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel_path = entry
            .path()
            .strip_prefix(src)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let data = std::fs::read(entry.path())?;
        append_bytes(&mut builder, &format!("{}/{}", prefix, rel_path), &data)?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn append_bytes<W: std::io::Write>(builder: &mut Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

/// Extract an archive file into `dest`
///
/// Entries escaping `dest` (absolute paths, `..`) are rejected.
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive_path)?;
    extract_reader(file, dest).map_err(|e| CoreError::Archive {
        message: format!("Failed to extract {}: {}", archive_path.display(), e),
    })
}

/// Extract gzip-compressed tar bytes into `dest`
pub fn extract_bytes(data: &[u8], dest: &Path) -> Result<()> {
    extract_reader(std::io::Cursor::new(data), dest)
}

fn extract_reader<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(GzDecoder::new(reader));
    std::fs::create_dir_all(dest)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(CoreError::Archive {
                message: format!("Illegal path in archive: {}", path.display()),
            });
        }
        entry.unpack_in(dest)?;
    }

    Ok(())
}

/// Read a single file from an archive without extracting it
pub fn read_file_from_archive(archive_path: &Path, file_path: &str) -> Result<Vec<u8>> {
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == file_path {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            return Ok(content);
        }
    }

    Err(CoreError::Archive {
        message: format!("File not found in archive {}: {}", archive_path.display(), file_path),
    })
}

/// `sha256:<hex>` digest of some bytes
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Compare two digests ignoring the `sha256:` prefix and case
pub fn digest_matches(expected: &str, actual: &str) -> bool {
    normalize_digest(expected) == normalize_digest(actual)
}

/// Hex part of a digest, lowercased
pub fn normalize_digest(digest: &str) -> String {
    let digest = digest.trim();
    digest
        .strip_prefix("sha256:")
        .unwrap_or(digest)
        .to_ascii_lowercase()
}
