use std::path::{Path, PathBuf};

fn main() {
    println!("cargo:rerun-if-env-changed=FFMPEG_DIR");
    if std::env::var_os("CARGO_FEATURE_FFMPEG").is_none() {
        return;
    }

    // Windows builds ship the FFmpeg DLLs next to the binary
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("windows") {
        return;
    }

    let ffmpeg_bin = std::env::var_os("FFMPEG_DIR")
        .map(|dir| PathBuf::from(dir).join("bin"))
        .unwrap_or_else(|| PathBuf::from("third_party/ffmpeg/bin"));
    println!("cargo:rerun-if-changed={}", ffmpeg_bin.display());

    if !ffmpeg_bin.exists() {
        println!("cargo:warning=FFmpeg DLLs not found at {}", ffmpeg_bin.display());
        return;
    }

    // OUT_DIR is target/<profile>/build/<crate>/out
    let Some(target_dir) = std::env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .and_then(|out| out.ancestors().nth(3).map(Path::to_path_buf))
    else {
        println!("cargo:warning=cannot resolve the target directory");
        return;
    };

    let Ok(entries) = std::fs::read_dir(&ffmpeg_bin) else {
        println!("cargo:warning=cannot read {}", ffmpeg_bin.display());
        return;
    };
    for path in entries.flatten().map(|e| e.path()) {
        if !is_required_ffmpeg_dll(&path) {
            continue;
        }
        let Some(name) = path.file_name() else {
            continue;
        };
        let dest = target_dir.join(name);
        if dest.exists() && file_modified(&path) <= file_modified(&dest) {
            continue;
        }
        match std::fs::copy(&path, &dest) {
            Ok(_) => println!("cargo:warning=Copied {} to output dir", path.display()),
            Err(e) => println!("cargo:warning=Failed to copy {}: {}", path.display(), e),
        }
    }
    println!("cargo:rustc-link-search=native={}", ffmpeg_bin.display());
}

fn file_modified(path: &Path) -> std::time::SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
}

fn is_required_ffmpeg_dll(path: &Path) -> bool {
    const REQUIRED_DLL_PREFIXES: &[&str] = &["avcodec-", "avformat-", "avutil-", "swresample-", "swscale-"];

    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };

    let lower = file_name.to_ascii_lowercase();
    lower.ends_with(".dll") && REQUIRED_DLL_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
}
