use goblin::mach::header::{MH_BUNDLE, MH_DYLIB, MH_EXECUTE};
use goblin::Hint;
use log::debug;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extensions that are never code, whatever their contents look like.
const RESOURCE_EXTENSIONS: &[&str] = &[
    "plist", "strings", "stringsdict", "xcent", "entitlements", "mobileprovision", "sig",
    "png", "jpg", "jpeg", "gif", "heic", "webp", "pdf", "car", "icns", "ico",
    "ttf", "otf", "ttc", "woff", "woff2",
    "txt", "md", "json", "xml", "html", "htm", "css", "js", "yaml", "yml", "csv",
    "nib", "storyboardc", "lproj", "mp3", "m4a", "wav", "caf", "mp4", "mov",
];

const PROBE_LEN: usize = 16;
const NUL_SCAN_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Signable,
    Resource,
}

/// Decide whether `path` is a loadable Mach-O. Never fails; anything that
/// cannot be inspected is a resource.
pub fn classify<P: AsRef<Path>>(path: P) -> Classification {
    let path = path.as_ref();

    if has_resource_extension(path) {
        return Classification::Resource;
    }

    let mut head = Vec::with_capacity(NUL_SCAN_LEN);
    let read = File::open(path).and_then(|f| f.take(NUL_SCAN_LEN as u64).read_to_end(&mut head));
    if let Err(e) = read {
        debug!("cannot inspect {}: {}", path.display(), e);
        return Classification::Resource;
    }

    classify_bytes(&head)
}

pub fn classify_bytes(head: &[u8]) -> Classification {
    let probe: Option<&[u8; PROBE_LEN]> = head.get(..PROBE_LEN).and_then(|b| b.try_into().ok());

    match probe.map(goblin::peek_bytes) {
        Some(Ok(Hint::Mach(hint))) => match mach_filetype(head, hint.is_lsb) {
            Some(MH_EXECUTE) | Some(MH_DYLIB) | Some(MH_BUNDLE) => Classification::Signable,
            _ => Classification::Resource,
        },
        Some(Ok(Hint::MachFat(_))) => Classification::Signable,
        Some(Ok(_)) => Classification::Resource,
        // Header inspection unavailable: fall back to looking for binary content.
        Some(Err(_)) | None => {
            if head.iter().take(NUL_SCAN_LEN).any(|&b| b == 0) {
                Classification::Signable
            } else {
                Classification::Resource
            }
        }
    }
}

fn mach_filetype(head: &[u8], is_lsb: bool) -> Option<u32> {
    let raw: [u8; 4] = head.get(12..16)?.try_into().ok()?;
    Some(if is_lsb {
        u32::from_le_bytes(raw)
    } else {
        u32::from_be_bytes(raw)
    })
}

fn has_resource_extension(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .map(|e| RESOURCE_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or(false)
}

/// Every signable file under `root`, in a stable order with
/// `main_executable` (when signable) first.
pub fn signable_files<P: AsRef<Path>>(root: P, main_executable: Option<&Path>) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root.as_ref())
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| classify(path) == Classification::Signable)
        .collect();

    if let Some(main) = main_executable {
        if let Some(index) = files.iter().position(|p| p == main) {
            let main = files.remove(index);
            files.insert(0, main);
        }
    }

    files
}
