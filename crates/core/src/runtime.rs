//! Locating the native pieces the upscaler shells out to or links at runtime:
//! the ffmpeg/ffprobe binaries, the ONNX Runtime dylib and the CUDA/TensorRT
//! libraries its execution providers need.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;

use tracing::{debug, info, warn};

pub const ENV_ORT_DYLIB_PATH: &str = "ORT_DYLIB_PATH";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// What [`setup_runtime_libs`] found. Logged once tracing is up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLibs {
    pub searched_dirs: Vec<PathBuf>,
    pub ort_dylib: Option<PathBuf>,
    pub ort_dylib_from_env: bool,
    pub preloaded: Vec<PathBuf>,
}

/// `<exe_dir>/lib`, `<exe_dir>/../lib`, `<cwd>/lib`, then the system dirs.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = current_exe_dir() {
        push_unique(&mut dirs, exe_dir.join("lib"));
        if let Some(parent) = exe_dir.parent() {
            push_unique(&mut dirs, parent.join("lib"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("lib"));
    }
    #[cfg(unix)]
    {
        push_unique(&mut dirs, PathBuf::from("/usr/local/lib"));
        push_unique(&mut dirs, PathBuf::from("/usr/lib"));
    }
    dirs
}

fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(exe_dir) = current_exe_dir() {
        push_unique(&mut dirs, exe_dir.clone());
        push_unique(&mut dirs, exe_dir.join("bin"));
    }
    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut dirs, cwd.join("bin"));
    }
    dirs
}

fn current_exe_dir() -> Option<PathBuf> {
    let exe = env::current_exe().and_then(|p| p.canonicalize()).ok()?;
    exe.parent().map(Path::to_path_buf)
}

fn push_unique(dirs: &mut Vec<PathBuf>, dir: PathBuf) {
    if !dirs.contains(&dir) {
        dirs.push(dir);
    }
}

fn binary_file_name(binary: &str) -> String {
    if cfg!(windows) && !binary.to_ascii_lowercase().ends_with(".exe") {
        format!("{binary}.exe")
    } else {
        binary.to_string()
    }
}

fn find_file_in_dirs(file_name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(file_name))
        .find(|candidate| candidate.is_file())
}

/// A `Command` for `binary`, preferring a copy bundled next to the executable
/// over whatever is on `PATH`.
pub fn command_for(binary: &str) -> ProcessCommand {
    match find_file_in_dirs(&binary_file_name(binary), &candidate_bin_dirs()) {
        Some(path) => ProcessCommand::new(path),
        None => ProcessCommand::new(binary),
    }
}

// CUDA runtime, then cuDNN, then TensorRT. ORT's own provider libraries are
// left alone: they need symbols from libonnxruntime, which ort loads later.
fn load_priority(name: &str) -> Option<u8> {
    const TIERS: [&[&str]; 3] = [
        &["libcudart", "libcublas", "libcufft", "libcurand", "cudart64_", "cublas"],
        &["libcudnn", "cudnn64_"],
        &["libnvinfer", "libnvonnxparser", "nvinfer", "nvonnxparser"],
    ];
    let name = name.to_ascii_lowercase();
    TIERS
        .iter()
        .position(|prefixes| prefixes.iter().any(|prefix| name.starts_with(prefix)))
        .map(|tier| tier as u8)
}

fn is_shared_library(name: &str, path: &Path) -> bool {
    if cfg!(windows) {
        name.to_ascii_lowercase().ends_with(".dll")
    } else {
        name.contains(".so") && !path.is_symlink()
    }
}

/// GPU runtime libraries in `dirs`, in load order. The first directory that
/// holds a given file name wins.
fn collect_preload_candidates(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_shared_library(&name, &path) || !seen.insert(name.clone()) {
                continue;
            }
            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

// The dynamic loader reads LD_LIBRARY_PATH once at startup, so libraries are
// opened by absolute path with RTLD_GLOBAL and intentionally never closed.
#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// Point ort at a bundled ONNX Runtime and preload GPU libraries.
///
/// Call at the very start of `main()`, before tracing or any session exists.
pub fn setup_runtime_libs() -> RuntimeLibs {
    let dirs = candidate_lib_dirs();
    let mut report = RuntimeLibs::default();

    match env::var_os(ENV_ORT_DYLIB_PATH) {
        Some(path) => {
            report.ort_dylib = Some(PathBuf::from(path));
            report.ort_dylib_from_env = true;
        }
        None => {
            if let Some(path) = find_file_in_dirs(ORT_LIB_NAME, &dirs) {
                env::set_var(ENV_ORT_DYLIB_PATH, &path);
                report.ort_dylib = Some(path);
            }
        }
    }

    for lib in collect_preload_candidates(&dirs) {
        if unsafe { load_library(&lib) } {
            report.preloaded.push(lib);
        }
    }

    report.searched_dirs = dirs;
    report
}

pub fn log_runtime_lib_status(libs: &RuntimeLibs) {
    match libs.ort_dylib.as_deref() {
        Some(path) if path.is_file() => info!(
            path = %path.display(),
            from_env = libs.ort_dylib_from_env,
            "ONNX Runtime library resolved"
        ),
        Some(path) => warn!(
            path = %path.display(),
            "{ENV_ORT_DYLIB_PATH} points at a missing file"
        ),
        None => warn!("{ENV_ORT_DYLIB_PATH} not set, ort will use its default search paths"),
    }

    if libs.preloaded.is_empty() {
        debug!("No CUDA/TensorRT libraries preloaded");
    }
    for lib in &libs.preloaded {
        debug!(path = %lib.display(), "Preloaded runtime library");
    }
}
