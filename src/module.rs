// File: src/module.rs
//
// Resolves a raw `import ... from "path"` string to an absolute,
// canonical filesystem path relative to the importing file. Pure path
// arithmetic only — no parsing, no execution. Grounded on
// examples/original_source/src/ModuleResolver.cpp.

use std::path::{Path, PathBuf};

/// Resolves `raw_import_path` against the file that contains the import
/// statement. Returns `None` if the path is empty, a relative import is
/// attempted with no importer context, or the resolved file doesn't
/// exist on disk (§6.2).
pub fn resolve_import_path(importer_path: Option<&str>, raw_import_path: &str) -> Option<PathBuf> {
    if raw_import_path.is_empty() {
        return None;
    }

    let import_path = Path::new(raw_import_path);
    let candidate = if import_path.is_absolute() {
        import_path.to_path_buf()
    } else {
        let importer = importer_path?;
        if importer.is_empty() {
            return None;
        }
        Path::new(importer).parent()?.join(import_path)
    };

    let resolved = weakly_canonicalize(&candidate)?;
    if resolved.exists() {
        Some(resolved)
    } else {
        None
    }
}

/// `std::fs::canonicalize` requires the full path to exist; the original
/// resolver uses `weakly_canonical`, which normalizes `.`/`..` components
/// without requiring existence and only canonicalizes the longest
/// existing prefix. We approximate that by canonicalizing the nearest
/// existing ancestor and re-appending the remaining components.
fn weakly_canonicalize(path: &Path) -> Option<PathBuf> {
    let mut existing = path;
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();
    loop {
        if existing.exists() {
            break;
        }
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                remainder.push(name.to_os_string());
                existing = parent;
            }
            _ => {
                existing = Path::new("");
                break;
            }
        }
    }

    let mut base = if existing.as_os_str().is_empty() {
        normalize_lexically(path)
    } else {
        std::fs::canonicalize(existing).ok()?
    };

    for component in remainder.into_iter().rev() {
        base.push(component);
    }
    Some(base)
}

/// Lexical `.`/`..` normalization with no filesystem access, used only
/// when no prefix of the path exists yet to canonicalize against.
fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_import_path_resolves_to_none() {
        assert!(resolve_import_path(Some("/tmp/a.ruff"), "").is_none());
    }

    #[test]
    fn relative_import_without_importer_resolves_to_none() {
        assert!(resolve_import_path(None, "./sibling.ruff").is_none());
    }

    #[test]
    fn nonexistent_file_resolves_to_none() {
        assert!(resolve_import_path(Some("/tmp/a.ruff"), "./does_not_exist_xyz.ruff").is_none());
    }

    #[test]
    fn relative_import_resolves_against_importer_directory() {
        let dir = std::env::temp_dir().join(format!("ruff_module_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let importer = dir.join("main.ruff");
        let sibling = dir.join("util.ruff");
        std::fs::File::create(&sibling).unwrap().write_all(b"export function noop() {}").unwrap();

        let resolved = resolve_import_path(Some(importer.to_str().unwrap()), "./util.ruff");
        assert!(resolved.is_some());
        assert!(resolved.unwrap().ends_with("util.ruff"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn absolute_import_ignores_importer() {
        let dir = std::env::temp_dir().join(format!("ruff_module_test_abs_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let target = dir.join("lib.ruff");
        std::fs::File::create(&target).unwrap().write_all(b"export function noop() {}").unwrap();

        let resolved = resolve_import_path(None, target.to_str().unwrap());
        assert!(resolved.is_some());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
