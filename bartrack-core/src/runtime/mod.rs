use std::path::{Path, PathBuf};

/// Platform file name of the ONNX Runtime shared library.
#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(target_os = "windows")]
const ORT_LIB_NAME: &str = "onnxruntime.dll";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const ORT_LIB_NAME: &str = "libonnxruntime.so";

/// Resolve and set ORT_DYLIB_PATH at runtime when it is missing or invalid.
///
/// Priority order:
/// 1) Existing ORT_DYLIB_PATH (if file exists)
/// 2) models/onnxruntime*/lib/<library> near current exe/cwd
/// 3) the system library directory for the platform
///
/// Returns the path that will be used, if any was found.
pub fn configure_ort_dylib() -> Option<PathBuf> {
    if let Some(existing) = std::env::var_os("ORT_DYLIB_PATH") {
        let existing_path = PathBuf::from(existing);
        if existing_path.is_file() {
            tracing::info!(path = %existing_path.display(), "using ORT_DYLIB_PATH from environment");
            return Some(existing_path);
        }
        tracing::warn!(
            path = %existing_path.display(),
            "ORT_DYLIB_PATH is set but file does not exist; attempting auto-discovery"
        );
    }

    let found = ort_candidates(&search_roots())
        .into_iter()
        .find(|candidate| candidate.is_file());
    match &found {
        Some(candidate) => {
            // SAFETY: called once from the CLI thread before any ORT session
            // is created, so nothing else reads the environment concurrently.
            unsafe {
                std::env::set_var("ORT_DYLIB_PATH", candidate);
            }
            tracing::info!(path = %candidate.display(), "configured ORT_DYLIB_PATH");
        }
        None => tracing::warn!(
            library = ORT_LIB_NAME,
            "could not locate the ONNX Runtime library; set ORT_DYLIB_PATH"
        ),
    }
    found
}

fn search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        for _ in 0..7 {
            let Some(d) = dir else {
                break;
            };
            roots.push(d.clone());
            dir = d.parent().map(Path::to_path_buf);
        }
    }
    roots
}

fn ort_candidates(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    for root in roots {
        candidates.push(root.join("models/onnxruntime/lib").join(ORT_LIB_NAME));
        candidates.push(root.join("models").join(ORT_LIB_NAME));
    }

    #[cfg(target_os = "macos")]
    candidates.push(PathBuf::from("/opt/homebrew/lib").join(ORT_LIB_NAME));
    #[cfg(all(unix, not(target_os = "macos")))]
    candidates.push(PathBuf::from("/usr/local/lib").join(ORT_LIB_NAME));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_prefer_local_models_dir() {
        let roots = [PathBuf::from("/srv/bartrack")];
        let candidates = ort_candidates(&roots);
        assert_eq!(
            candidates[0],
            PathBuf::from("/srv/bartrack/models/onnxruntime/lib").join(ORT_LIB_NAME)
        );
        assert_eq!(candidates[1], PathBuf::from("/srv/bartrack/models").join(ORT_LIB_NAME));
    }
}
