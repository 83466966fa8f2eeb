use std::{
    fs::{self, File},
    io::{self, BufReader, Error, ErrorKind},
    path::{Component, Path},
};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

use crate::humanize;

/// Unpacks a "tar.gz" archive into the directory. Entries that would land
/// outside of the directory (absolute paths, "..") are rejected.
/// Returns the number of files extracted.
pub fn unpack_tar_gzip(src_archive_path: &Path, dst_dir_path: &Path) -> io::Result<usize> {
    let meta = fs::metadata(src_archive_path)?;
    log::info!(
        "unpacking '{}' to '{}' (current size {})",
        src_archive_path.display(),
        dst_dir_path.display(),
        humanize::bytes(meta.len() as usize),
    );
    fs::create_dir_all(dst_dir_path)?;

    let f = File::open(src_archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(f)));

    let mut extracted = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel_path = entry.path()?.into_owned();
        if rel_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("archive entry '{}' escapes the target directory", rel_path.display()),
            ));
        }

        let output_path = dst_dir_path.join(&rel_path);
        match entry.header().entry_type() {
            EntryType::Directory => {
                log::debug!("extracting directory {}", output_path.display());
                fs::create_dir_all(&output_path)?;
            }
            EntryType::Regular => {
                log::debug!("extracting file {}", output_path.display());
                if let Some(p) = output_path.parent() {
                    fs::create_dir_all(p)?;
                }
                let mut out = File::create(&output_path)?;
                io::copy(&mut entry, &mut out)?;
                extracted += 1;
            }
            other => {
                log::warn!(
                    "skipping archive entry '{}' of type {:?}",
                    rel_path.display(),
                    other
                );
            }
        }
    }

    log::info!(
        "unpacked {} files into '{}'",
        extracted,
        dst_dir_path.display()
    );
    Ok(extracted)
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- compress::test_unpack_tar_gzip --exact --show-output
#[test]
fn test_unpack_tar_gzip() {
    use flate2::{write::GzEncoder, Compression};

    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .is_test(true)
        .try_init();

    let tmp_dir = tempfile::tempdir().unwrap();
    let archive_path = tmp_dir.path().join("model.tar.gz");

    let saved_model = random_manager::secure_string(100);
    {
        let f = File::create(&archive_path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(f, Compression::default()));

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "variables/", io::empty())
            .unwrap();

        for (name, contents) in [
            ("saved_model.pb", saved_model.as_bytes()),
            ("variables/variables.index", b"index".as_slice()),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    let out_dir = tmp_dir.path().join("model");
    let n = unpack_tar_gzip(&archive_path, &out_dir).unwrap();
    assert_eq!(n, 2);
    assert_eq!(
        fs::read_to_string(out_dir.join("saved_model.pb")).unwrap(),
        saved_model
    );
    assert_eq!(
        fs::read(out_dir.join("variables").join("variables.index")).unwrap(),
        b"index".to_vec()
    );

    let missing = tmp_dir.path().join(random_manager::secure_string(10));
    assert!(unpack_tar_gzip(&missing, &out_dir).is_err());

    let not_gzip = tmp_dir.path().join("not-gzip.tar.gz");
    fs::write(&not_gzip, b"plain text").unwrap();
    assert!(unpack_tar_gzip(&not_gzip, &out_dir).is_err());
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- compress::test_unpack_tar_gzip_traversal --exact --show-output
#[test]
fn test_unpack_tar_gzip_traversal() {
    use flate2::{write::GzEncoder, Compression};

    let tmp_dir = tempfile::tempdir().unwrap();
    let archive_path = tmp_dir.path().join("evil.tar.gz");
    {
        let f = File::create(&archive_path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(f, Compression::default()));

        // "append_data" refuses "..", so the name is written into the raw header
        let mut header = tar::Header::new_old();
        let name = b"../escaped.txt";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(4);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append(&header, b"evil".as_slice()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    let out_dir = tmp_dir.path().join("model");
    let err = unpack_tar_gzip(&archive_path, &out_dir).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidData);
    assert!(!tmp_dir.path().join("escaped.txt").exists());
}
