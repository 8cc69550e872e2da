//! IPA extraction into a scratch working tree.
//!
//! [`WorkingTree`] owns a uniquely named temporary directory holding
//! `Payload/<App>.app`. The directory is removed when the tree is dropped,
//! whichever way the pipeline using it ends.

use crate::bundle::{is_app_bundle, is_real_dir};
use crate::{Error, Result};
use log::debug;
use memmap2::Mmap;
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;
use zip::ZipArchive;

/// Name of the directory holding the application bundle.
pub const PAYLOAD_DIR: &str = "Payload";

/// Entry metadata for parallel extraction
struct ExtractEntry {
    index: usize,
    outpath: PathBuf,
    is_symlink: bool,
    unix_mode: Option<u32>,
}

/// Scratch directory holding one unpacked archive.
#[derive(Debug)]
pub struct WorkingTree {
    dir: TempDir,
    app_bundle: PathBuf,
}

impl WorkingTree {
    /// Unpack `ipa_path` into a fresh temporary directory.
    ///
    /// Fails if the archive is missing, is not a ZIP file, or does not hold
    /// exactly one `.app` directly under `Payload/`.
    pub fn extract(ipa_path: impl AsRef<Path>) -> Result<Self> {
        let ipa_path = ipa_path.as_ref();
        validate_ipa(ipa_path)?;

        let dir = scratch_dir()?;
        extract_ipa(ipa_path, dir.path())?;
        let app_bundle = find_app_bundle(dir.path())?;
        debug!("extracted {} to {}", ipa_path.display(), dir.path().display());

        Ok(Self { dir, app_bundle })
    }

    /// Stage an existing `.app` bundle as `Payload/<App>.app`.
    pub fn stage_bundle(bundle_path: impl AsRef<Path>) -> Result<Self> {
        let bundle_path = bundle_path.as_ref();
        if !is_app_bundle(bundle_path) {
            return Err(Error::not_found("application bundle", bundle_path));
        }
        let name = bundle_path
            .file_name()
            .ok_or_else(|| Error::StructuralIntegrity("bundle path has no name".into()))?;

        let dir = scratch_dir()?;
        let app_bundle = dir.path().join(PAYLOAD_DIR).join(name);
        copy_tree(bundle_path, &app_bundle)?;

        Ok(Self { dir, app_bundle })
    }

    /// Root of the scratch directory (parent of `Payload/`).
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// The single application bundle.
    pub fn app_bundle(&self) -> &Path {
        &self.app_bundle
    }

    /// A path inside the scratch directory but outside `Payload/`.
    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Remove the scratch directory, reporting any failure.
    pub fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        debug!("removed working tree {}", path.display());
        Ok(())
    }
}

fn scratch_dir() -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix("fox-")
        .tempdir()
        .map_err(|e| Error::Io(io::Error::other(format!("Failed to create temp directory: {e}"))))
}

/// Extract every entry of an IPA file into `dest_dir`.
///
/// Directories are created up front; file contents are then written in
/// parallel, each worker reading from its own view of the memory-mapped
/// archive. Symlinks and Unix permissions are restored.
pub fn extract_ipa(ipa_path: impl AsRef<Path>, dest_dir: impl AsRef<Path>) -> Result<()> {
    let ipa_path = ipa_path.as_ref();
    let dest_dir = dest_dir.as_ref();

    let file = File::open(ipa_path)?;
    // SAFETY: the archive is opened read-only and only read for the lifetime of the map.
    let mmap = unsafe { Mmap::map(&file)? };

    let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))?;
    fs::create_dir_all(dest_dir)?;

    let mut entries = Vec::with_capacity(archive.len());
    let mut dirs = Vec::new();

    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;

        let outpath = match entry.enclosed_name() {
            Some(path) => dest_dir.join(path),
            None => {
                return Err(Error::StructuralIntegrity(format!(
                    "archive entry '{}' escapes the extraction directory",
                    entry.name()
                )))
            }
        };

        let unix_mode = entry.unix_mode();
        if entry.is_dir() {
            dirs.push(outpath);
            continue;
        }

        if let Some(parent) = outpath.parent() {
            dirs.push(parent.to_path_buf());
        }
        entries.push(ExtractEntry {
            index,
            outpath,
            is_symlink: unix_mode.is_some_and(|mode| mode & 0o170000 == 0o120000),
            unix_mode,
        });
    }

    dirs.sort();
    dirs.dedup();
    for dir in &dirs {
        fs::create_dir_all(dir)?;
    }

    entries.par_iter().try_for_each(|entry| -> Result<()> {
        let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))?;
        let mut file = archive.by_index(entry.index)?;

        #[cfg(unix)]
        if entry.is_symlink {
            let mut target = String::new();
            file.read_to_string(&mut target)?;
            if entry.outpath.symlink_metadata().is_ok() {
                fs::remove_file(&entry.outpath)?;
            }
            std::os::unix::fs::symlink(&target, &entry.outpath)?;
            return Ok(());
        }

        let mut outfile = File::create(&entry.outpath)?;
        io::copy(&mut file, &mut outfile)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&entry.outpath, fs::Permissions::from_mode(mode & 0o7777))?;
        }

        Ok(())
    })?;

    Ok(())
}

/// The single `.app` directory directly under `<root>/Payload`.
///
/// A `Payload` or `.app` that is a symbolic link is rejected.
pub fn find_app_bundle(root: impl AsRef<Path>) -> Result<PathBuf> {
    let payload_dir = root.as_ref().join(PAYLOAD_DIR);

    if !is_real_dir(&payload_dir) {
        return Err(Error::StructuralIntegrity(
            "no Payload directory in archive".into(),
        ));
    }

    let mut bundles = Vec::new();
    for entry in fs::read_dir(&payload_dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_symlink() && path.extension().is_some_and(|ext| ext == "app") {
            return Err(Error::StructuralIntegrity(format!(
                "{} in Payload/ is a symbolic link",
                entry.file_name().to_string_lossy()
            )));
        }
        if is_app_bundle(&path) {
            bundles.push(path);
        }
    }

    match bundles.len() {
        1 => Ok(bundles.swap_remove(0)),
        0 => Err(Error::StructuralIntegrity(
            "no .app bundle found in Payload/".into(),
        )),
        n => {
            bundles.sort();
            let names: Vec<String> = bundles
                .iter()
                .filter_map(|b| b.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .collect();
            Err(Error::StructuralIntegrity(format!(
                "expected one .app bundle in Payload/, found {n}: {}",
                names.join(", ")
            )))
        }
    }
}

/// Check that a path exists and starts with a ZIP signature.
pub fn validate_ipa(ipa_path: impl AsRef<Path>) -> Result<()> {
    let ipa_path = ipa_path.as_ref();

    if !ipa_path.is_file() {
        return Err(Error::not_found("IPA", ipa_path));
    }

    let mut magic = [0u8; 4];
    let read = File::open(ipa_path)?.read(&mut magic)?;
    if read < 2 || &magic[0..2] != b"PK" {
        return Err(Error::StructuralIntegrity(format!(
            "{} is not a ZIP archive",
            ipa_path.display()
        )));
    }

    Ok(())
}

/// Recursively copy `src` to `dest`, recreating symlinks as links.
fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Io(io::Error::other(e)))?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
            #[cfg(not(unix))]
            fs::copy(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// Create a test IPA holding the given bundle names under Payload/.
    fn create_test_ipa(dir: &Path, bundles: &[&str]) -> PathBuf {
        let ipa_path = dir.join("test.ipa");
        let file = File::create(&ipa_path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        zip.add_directory("Payload/", options).unwrap();
        for bundle in bundles {
            zip.add_directory(format!("Payload/{bundle}/"), options).unwrap();
            zip.start_file(format!("Payload/{bundle}/Info.plist"), options)
                .unwrap();
            zip.write_all(b"<?xml version=\"1.0\"?><plist><dict></dict></plist>")
                .unwrap();
        }

        zip.finish().unwrap();
        ipa_path
    }

    #[test]
    fn test_extract_single_bundle() {
        let temp_dir = TempDir::new().unwrap();
        let ipa_path = create_test_ipa(temp_dir.path(), &["Test.app"]);

        let tree = WorkingTree::extract(&ipa_path).unwrap();
        assert!(tree.app_bundle().ends_with("Payload/Test.app"));
        assert!(tree.app_bundle().join("Info.plist").exists());
        assert!(tree.app_bundle().starts_with(tree.root()));
    }

    #[test]
    fn test_tree_removed_on_drop_and_close() {
        let temp_dir = TempDir::new().unwrap();
        let ipa_path = create_test_ipa(temp_dir.path(), &["Test.app"]);

        let tree = WorkingTree::extract(&ipa_path).unwrap();
        let root = tree.root().to_path_buf();
        drop(tree);
        assert!(!root.exists());

        let tree = WorkingTree::extract(&ipa_path).unwrap();
        let root = tree.root().to_path_buf();
        tree.close().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_extract_rejects_two_bundles() {
        let temp_dir = TempDir::new().unwrap();
        let ipa_path = create_test_ipa(temp_dir.path(), &["A.app", "B.app"]);

        let err = WorkingTree::extract(&ipa_path).unwrap_err();
        assert!(matches!(err, Error::StructuralIntegrity(ref msg) if msg.contains("found 2")));
    }

    #[test]
    fn test_extract_rejects_no_bundle() {
        let temp_dir = TempDir::new().unwrap();
        let ipa_path = create_test_ipa(temp_dir.path(), &[]);

        let err = WorkingTree::extract(&ipa_path).unwrap_err();
        assert!(matches!(err, Error::StructuralIntegrity(_)));
    }

    #[test]
    fn test_extract_not_found() {
        let err = WorkingTree::extract("/nonexistent/file.ipa").unwrap_err();
        assert!(matches!(err, Error::InputNotFound { kind: "IPA", .. }));
    }

    #[test]
    fn test_validate_ipa_invalid_format() {
        let temp_dir = TempDir::new().unwrap();
        let invalid_path = temp_dir.path().join("invalid.ipa");
        fs::write(&invalid_path, b"not a zip file").unwrap();

        assert!(matches!(
            validate_ipa(&invalid_path),
            Err(Error::StructuralIntegrity(_))
        ));
    }

    #[test]
    #[cfg(unix)]
    fn test_extract_rejects_linked_bundle() {
        let temp_dir = TempDir::new().unwrap();
        let outside = temp_dir.path().join("Outside");
        fs::create_dir_all(outside.join("_CodeSignature")).unwrap();
        fs::write(outside.join("Info.plist"), b"<plist/>").unwrap();

        let ipa_path = temp_dir.path().join("linked.ipa");
        let mut zip = ZipWriter::new(File::create(&ipa_path).unwrap());
        zip.add_symlink(
            "Payload/App.app",
            outside.to_str().unwrap(),
            SimpleFileOptions::default(),
        )
        .unwrap();
        zip.finish().unwrap();

        let err = WorkingTree::extract(&ipa_path).unwrap_err();
        assert!(matches!(err, Error::StructuralIntegrity(ref msg) if msg.contains("symbolic link")));
        assert!(outside.join("_CodeSignature").is_dir());
        assert_eq!(fs::read(outside.join("Info.plist")).unwrap(), b"<plist/>");
    }

    #[test]
    #[cfg(unix)]
    fn test_find_app_bundle_rejects_linked_payload() {
        let temp_dir = TempDir::new().unwrap();
        let real = temp_dir.path().join("elsewhere");
        fs::create_dir_all(real.join("App.app")).unwrap();
        let root = temp_dir.path().join("root");
        fs::create_dir_all(&root).unwrap();
        std::os::unix::fs::symlink(&real, root.join(PAYLOAD_DIR)).unwrap();

        assert!(matches!(
            find_app_bundle(&root),
            Err(Error::StructuralIntegrity(_))
        ));
    }

    #[test]
    fn test_find_app_bundle_no_payload() {
        let temp_dir = TempDir::new().unwrap();
        assert!(find_app_bundle(temp_dir.path()).is_err());
    }

    #[test]
    fn test_stage_bundle_copies_contents() {
        let temp_dir = TempDir::new().unwrap();
        let app = temp_dir.path().join("Built.app");
        fs::create_dir_all(app.join("Frameworks")).unwrap();
        fs::write(app.join("Info.plist"), b"<plist/>").unwrap();
        fs::write(app.join("Frameworks/lib.dylib"), b"dylib").unwrap();

        let tree = WorkingTree::stage_bundle(&app).unwrap();
        assert!(tree.app_bundle().ends_with("Payload/Built.app"));
        assert_eq!(
            fs::read(tree.app_bundle().join("Frameworks/lib.dylib")).unwrap(),
            b"dylib"
        );
        assert!(app.join("Info.plist").exists());
    }

    #[test]
    #[cfg(unix)]
    fn test_extract_ipa_with_symlinks() {
        let temp_dir = TempDir::new().unwrap();
        let ipa_path = temp_dir.path().join("symlink_test.ipa");

        let file = File::create(&ipa_path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        zip.add_directory("Payload/Test.app/Frameworks/Test.framework/Versions/A/", options)
            .unwrap();
        zip.start_file("Payload/Test.app/Frameworks/Test.framework/Versions/A/Test", options)
            .unwrap();
        zip.write_all(b"binary content").unwrap();
        zip.add_symlink(
            "Payload/Test.app/Frameworks/Test.framework/Versions/Current",
            "A",
            options,
        )
        .unwrap();
        zip.finish().unwrap();

        let tree = WorkingTree::extract(&ipa_path).unwrap();
        let link = tree
            .app_bundle()
            .join("Frameworks/Test.framework/Versions/Current");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("A"));
    }
}
