//! Deterministic classification of the files changed on a feature branch.

use std::path::Path;

use crate::core::types::ChangeScope;

const SCRIPT_EXTENSIONS: &[&str] = &["sh", "bash", "zsh", "bats"];

const CONFIG_EXTENSIONS: &[&str] = &[
    "md", "markdown", "rst", "txt", "adoc", "json", "jsonc", "yaml", "yml", "toml", "lock", "ini",
    "cfg", "conf", "env", "csv", "svg", "png", "jpg", "jpeg", "gif",
];

const CONFIG_FILE_NAMES: &[&str] = &[
    "LICENSE",
    "LICENCE",
    "COPYING",
    "CODEOWNERS",
    "go.sum",
    ".editorconfig",
    ".gitattributes",
    ".gitmodules",
    ".nvmrc",
    ".tool-versions",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileCategory {
    Code,
    Scripts,
    Config,
}

/// Bucket changed paths into a coarse [`ChangeScope`].
///
/// - No paths, or only config/docs paths: `Config`.
/// - Code and scripts both present: `Mixed`.
/// - Otherwise whichever of code/scripts is present. Unrecognized extensions
///   count as code so that unknown files still get tested.
pub fn classify_paths<P: AsRef<Path>>(changed_paths: &[P]) -> ChangeScope {
    let mut has_code = false;
    let mut has_scripts = false;
    for path in changed_paths {
        match categorize(path.as_ref()) {
            FileCategory::Code => has_code = true,
            FileCategory::Scripts => has_scripts = true,
            FileCategory::Config => {}
        }
    }
    match (has_code, has_scripts) {
        (true, true) => ChangeScope::Mixed,
        (true, false) => ChangeScope::Code,
        (false, true) => ChangeScope::Scripts,
        (false, false) => ChangeScope::Config,
    }
}

fn categorize(path: &Path) -> FileCategory {
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        return FileCategory::Code;
    };
    if CONFIG_FILE_NAMES.contains(&file_name) || is_ignore_file(file_name) {
        return FileCategory::Config;
    }
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some(ext) if SCRIPT_EXTENSIONS.contains(&ext) => FileCategory::Scripts,
        Some(ext) if CONFIG_EXTENSIONS.contains(&ext) => FileCategory::Config,
        _ => FileCategory::Code,
    }
}

fn is_ignore_file(file_name: &str) -> bool {
    file_name.starts_with('.') && file_name.ends_with("ignore")
}
