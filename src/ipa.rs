use crate::bundle::AppBundle;
use crate::error::{ResignError, Result};
use log::{debug, info};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

const PAYLOAD: &str = "Payload";

fn archive_err(what: impl std::fmt::Display) -> impl FnOnce(io::Error) -> ResignError {
    move |e| ResignError::Archive(format!("{}: {}", what, e))
}

/// Unpack `ipa_path` into `dest` and load the app bundle inside `Payload/`.
pub fn extract_ipa<P: AsRef<Path>, Q: AsRef<Path>>(ipa_path: P, dest: Q) -> Result<AppBundle> {
    let ipa_path = ipa_path.as_ref();
    let dest = dest.as_ref();

    let file = File::open(ipa_path).map_err(archive_err(ipa_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| {
            ResignError::Archive(format!("{} is not a zip archive: {}", ipa_path.display(), e))
        })?;

    let has_payload = archive
        .file_names()
        .any(|name| name.starts_with("Payload/"));
    if !has_payload {
        return Err(ResignError::Archive("No Payload folder found".to_string()));
    }

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| ResignError::Archive(format!("reading entry {}: {}", i, e)))?;
        let relative = file
            .enclosed_name()
            .ok_or_else(|| ResignError::Archive(format!("unsafe entry path: {}", file.name())))?;
        let outpath = dest.join(relative);

        if file.is_dir() {
            fs::create_dir_all(&outpath).map_err(archive_err(outpath.display()))?;
        } else {
            if let Some(p) = outpath.parent() {
                fs::create_dir_all(p).map_err(archive_err(p.display()))?;
            }
            let mut outfile = File::create(&outpath).map_err(archive_err(outpath.display()))?;
            io::copy(&mut file, &mut outfile).map_err(archive_err(outpath.display()))?;

            // Preserve Unix permissions
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = file.unix_mode() {
                    fs::set_permissions(&outpath, fs::Permissions::from_mode(mode & 0o7777))
                        .map_err(archive_err(outpath.display()))?;
                }
            }
        }
    }

    let app_path = find_app_in_payload(&dest.join(PAYLOAD))?;
    debug!("selected bundle {}", app_path.display());
    AppBundle::new(dest, &app_path)
}

/// Lexicographically first `*.app` directory directly inside `payload`.
pub fn find_app_in_payload(payload: &Path) -> Result<PathBuf> {
    let entries = fs::read_dir(payload).map_err(archive_err("reading Payload"))?;

    let mut candidates = Vec::new();
    for entry in entries {
        let path = entry.map_err(archive_err("reading Payload"))?.path();
        if path.is_dir() && path.extension().map(|e| e == "app").unwrap_or(false) {
            candidates.push(path);
        }
    }

    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| ResignError::Archive("No .app folder found".to_string()))
}

/// Rebuilds an archive from an extraction root.
pub struct ArchiveBuilder {
    compression_level: u32,
    min_size_ratio: f64,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self {
            compression_level: 6,
            min_size_ratio: 0.5,
        }
    }
}

impl ArchiveBuilder {
    pub fn new(compression_level: u32, min_size_ratio: f64) -> Self {
        Self {
            compression_level,
            min_size_ratio,
        }
    }

    /// Zip every file under the bundle's extraction root into `output`, then
    /// check the result against `input` before handing it back. A rejected
    /// archive is removed.
    pub fn build<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        bundle: &AppBundle,
        input: P,
        output: Q,
    ) -> Result<PathBuf> {
        let output = output.as_ref();

        if let Err(e) = self.write_archive(bundle.extraction_root(), output) {
            let _ = fs::remove_file(output);
            return Err(e);
        }

        if let Err(e) = self.verify(bundle, input.as_ref(), output) {
            let _ = fs::remove_file(output);
            return Err(e);
        }

        info!("packaged {}", output.display());
        Ok(output.to_path_buf())
    }

    fn write_archive(&self, root: &Path, output: &Path) -> Result<()> {
        let packaging = |what: &str, e: &dyn std::fmt::Display| {
            ResignError::Packaging(format!("{}: {}", what, e))
        };

        let file = File::create(output).map_err(|e| packaging(&output.display().to_string(), &e))?;
        let mut zip = zip::ZipWriter::new(file);

        let compression = match self.compression_level {
            0 => CompressionMethod::Stored,
            _ => CompressionMethod::Deflated,
        };

        // Stored entries take no level.
        let level = (self.compression_level != 0).then_some(self.compression_level as i64);
        let options = SimpleFileOptions::default()
            .compression_method(compression)
            .compression_level(level);

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| packaging("walking extraction root", &e))?;
            let path = entry.path();
            let name = match path.strip_prefix(root) {
                Ok(name) if !name.as_os_str().is_empty() => name,
                _ => continue,
            };
            let name_str = name.to_string_lossy().replace('\\', "/");

            if entry.file_type().is_file() {
                #[cfg(unix)]
                let options = {
                    use std::os::unix::fs::PermissionsExt;
                    let mode = entry
                        .metadata()
                        .map(|m| m.permissions().mode())
                        .unwrap_or(0o644);
                    options.unix_permissions(mode)
                };
                zip.start_file(name_str.as_str(), options)
                    .map_err(|e| packaging(&name_str, &e))?;
                let mut f = File::open(path).map_err(|e| packaging(&name_str, &e))?;
                io::copy(&mut f, &mut zip).map_err(|e| packaging(&name_str, &e))?;
            } else if entry.file_type().is_dir() {
                zip.add_directory(format!("{}/", name_str), options)
                    .map_err(|e| packaging(&name_str, &e))?;
            }
        }

        zip.finish().map_err(|e| packaging("finishing archive", &e))?;
        Ok(())
    }

    fn verify(&self, bundle: &AppBundle, input: &Path, output: &Path) -> Result<()> {
        let input_len = fs::metadata(input).map(|m| m.len()).unwrap_or(0);
        let output_len = fs::metadata(output)
            .map_err(|e| ResignError::Packaging(format!("output archive missing: {}", e)))?
            .len();

        let floor = (input_len as f64 * self.min_size_ratio) as u64;
        if output_len < floor {
            return Err(ResignError::Packaging(format!(
                "output archive is {} bytes, expected at least {} ({}% of {})",
                output_len,
                floor,
                (self.min_size_ratio * 100.0) as u32,
                input_len
            )));
        }

        let file = File::open(output)
            .map_err(|e| ResignError::Packaging(format!("reopening output archive: {}", e)))?;
        let archive = zip::ZipArchive::new(file)
            .map_err(|e| ResignError::Packaging(format!("output archive is unreadable: {}", e)))?;

        let bundle_name = bundle.name();
        let has_bundle = archive
            .file_names()
            .any(|name| name.split('/').any(|part| part == bundle_name));
        if !has_bundle {
            return Err(ResignError::Packaging(format!(
                "output archive has no {} entry",
                bundle_name
            )));
        }

        let has_info_plist = archive
            .file_names()
            .any(|name| name.rsplit('/').next() == Some("Info.plist"));
        if !has_info_plist {
            return Err(ResignError::Packaging(
                "output archive has no Info.plist".to_string(),
            ));
        }

        debug!(
            "archive check passed: {} -> {} bytes, {} entries",
            input_len,
            output_len,
            archive.len()
        );
        Ok(())
    }
}
