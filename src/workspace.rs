//! 会话工作区（沙箱）文件操作
//!
//! 所有会话范围的文件访问都必须经过 [`resolve_in_workspace`]：解析符号链接后
//! 不在工作区根目录下的路径一律拒绝，不做静默纠正。
//!
//! 这里的函数都是阻塞 IO，异步上下文中请通过 `spawn_blocking` 调用。

use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::types::{DirectoryStructure, FileContent, FileInfo, FileSystemNode, FileType};

/// 编辑器锁文件/交换文件后缀
const NOISE_SUFFIXES: &[&str] = &[".swp", ".swx", ".lock", "~"];

/// 校验会话 ID：必须是单个安全的路径分量
pub fn validate_session_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && !session_id.starts_with('.')
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(Error::AccessDenied(format!("invalid session id: {:?}", session_id)))
    }
}

/// 解析路径中已存在的最长前缀（跟随符号链接），再拼回不存在的尾部
///
/// 被删除的文件无法 canonicalize，但它的父目录仍然可以。
pub fn resolve_existing_prefix(path: &Path) -> std::io::Result<PathBuf> {
    let mut tail: Vec<OsString> = Vec::new();
    let mut current = path.to_path_buf();

    loop {
        match current.canonicalize() {
            Ok(mut resolved) => {
                for name in tail.iter().rev() {
                    resolved.push(name);
                }
                return Ok(resolved);
            }
            Err(e) => match current.file_name() {
                Some(name) => {
                    tail.push(name.to_os_string());
                    if !current.pop() {
                        return Err(e);
                    }
                }
                None => return Err(e),
            },
        }
    }
}

/// 将请求路径解析到工作区内
///
/// 绝对路径、`..` 越界、以及经符号链接逃出根目录的路径都会返回 `AccessDenied`。
pub fn resolve_in_workspace(root: &Path, requested: &str) -> Result<PathBuf> {
    let resolved_root = root.canonicalize()?;

    let mut joined = resolved_root.clone();
    for component in Path::new(requested).components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !joined.pop() || !joined.starts_with(&resolved_root) {
                    return Err(Error::AccessDenied(requested.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::AccessDenied(requested.to_string()));
            }
        }
    }

    if !joined.starts_with(&resolved_root) {
        return Err(Error::AccessDenied(requested.to_string()));
    }

    let resolved = resolve_existing_prefix(&joined)?;
    if !resolved.starts_with(&resolved_root) {
        tracing::warn!("🚫 Sandbox violation: {:?} resolves to {:?}", requested, resolved);
        return Err(Error::AccessDenied(requested.to_string()));
    }

    Ok(resolved)
}

/// 相对路径是否为噪音（隐藏文件、`~` 开头、编辑器锁/交换文件）
pub fn is_noise_path(relative: &Path) -> bool {
    let hidden = relative.components().any(|c| match c {
        Component::Normal(part) => {
            let part = part.to_string_lossy();
            part.starts_with('.') || part.starts_with('~')
        }
        _ => false,
    });
    if hidden {
        return true;
    }

    let name = relative
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    NOISE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// 展示路径：去掉临时文件后缀，使"先写临时文件再重命名"以最终名称呈现
///
/// - `name.tmp.12345` → `name`
/// - `name.12345.tmp` → `name`
/// - `name.temp` → `name`
pub fn display_path(relative: &str) -> String {
    let (dir, name) = match relative.rfind('/') {
        Some(idx) => (&relative[..=idx], &relative[idx + 1..]),
        None => ("", relative),
    };

    let stripped = strip_temp_suffix(name);
    if stripped.is_empty() {
        return relative.to_string();
    }
    format!("{}{}", dir, stripped)
}

fn strip_temp_suffix(name: &str) -> &str {
    fn all_digits(s: &str) -> bool {
        !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
    }

    if let Some(idx) = name.rfind(".tmp.") {
        if all_digits(&name[idx + 5..]) {
            return &name[..idx];
        }
    }
    if let Some(rest) = name.strip_suffix(".tmp") {
        if let Some(idx) = rest.rfind('.') {
            if all_digits(&rest[idx + 1..]) {
                return &rest[..idx];
            }
        }
    }
    if let Some(rest) = name.strip_suffix(".temp") {
        return rest;
    }
    name
}

/// 相对路径转为 `/` 分隔的字符串
pub fn relative_string(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn format_mtime(modified: std::io::Result<SystemTime>) -> String {
    modified
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// 工作区扁平文件快照（跳过噪音文件，按路径排序）
pub fn snapshot(root: &Path) -> Vec<FileInfo> {
    if !root.is_dir() {
        return Vec::new();
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(name.starts_with('.') || name.starts_with('~'))
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!("Skipping unreadable entry during snapshot: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = match entry.path().strip_prefix(root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if is_noise_path(relative) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("Skipping {:?}: {}", entry.path(), e);
                continue;
            }
        };

        let name = entry.file_name().to_string_lossy().to_string();
        files.push(FileInfo {
            file_type: FileType::classify(&name),
            name,
            path: relative_string(relative),
            size: metadata.len(),
            modified: format_mtime(metadata.modified()),
        });
    }

    files
}

/// 构建完整文件树（包含目录）
pub fn build_tree(root: &Path, root_name: &str) -> FileSystemNode {
    fn build_node(path: &Path, name: String, relative: String) -> FileSystemNode {
        let metadata = fs::symlink_metadata(path);
        let is_file = metadata.as_ref().map(|m| m.is_file()).unwrap_or(false);

        if is_file {
            let metadata = metadata.ok();
            return FileSystemNode {
                file_type: Some(FileType::classify(&name)),
                name,
                path: relative,
                is_directory: false,
                size: metadata.as_ref().map(|m| m.len()).unwrap_or(0),
                modified: metadata.map(|m| format_mtime(m.modified())),
                children: None,
            };
        }

        let mut children = std::collections::BTreeMap::new();
        match fs::read_dir(path) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let child_name = entry.file_name().to_string_lossy().to_string();
                    if child_name.starts_with('.') {
                        continue;
                    }
                    let file_type = match entry.file_type() {
                        Ok(t) => t,
                        Err(_) => continue,
                    };
                    if !(file_type.is_file() || file_type.is_dir()) {
                        continue;
                    }
                    let child_relative = if relative.is_empty() {
                        child_name.clone()
                    } else {
                        format!("{}/{}", relative, child_name)
                    };
                    let node = build_node(&entry.path(), child_name.clone(), child_relative);
                    children.insert(child_name, node);
                }
            }
            Err(e) => {
                tracing::warn!("Cannot read directory {:?}: {}", path, e);
            }
        }

        FileSystemNode {
            name,
            path: relative,
            is_directory: true,
            size: 0,
            modified: None,
            file_type: None,
            children: Some(children),
        }
    }

    build_node(root, root_name.to_string(), String::new())
}

/// 文件树 + 扁平列表 + 统计
pub fn directory_structure(root: &Path, root_name: &str) -> DirectoryStructure {
    let tree = if root.is_dir() {
        build_tree(root, root_name)
    } else {
        FileSystemNode {
            name: root_name.to_string(),
            path: String::new(),
            is_directory: true,
            size: 0,
            modified: None,
            file_type: None,
            children: Some(Default::default()),
        }
    };
    let files = snapshot(root);
    let total_size = files.iter().map(|f| f.size).sum();

    DirectoryStructure {
        tree,
        total_files: files.len(),
        total_size,
        files,
    }
}

/// 读取工作区内文件
pub fn read_file(root: &Path, requested: &str) -> Result<FileContent> {
    let path = resolve_in_workspace(root, requested)?;
    if !path.is_file() {
        return Err(Error::NotFound(requested.to_string()));
    }

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let file_type = FileType::classify(&filename);

    if file_type != FileType::Text {
        return Ok(FileContent {
            success: false,
            content: None,
            error: Some(format!("File type '{}' is not supported for viewing", file_type)),
            file_type,
            filename,
        });
    }

    let bytes = fs::read(&path)?;
    Ok(match String::from_utf8(bytes) {
        Ok(content) => FileContent {
            success: true,
            content: Some(content),
            error: None,
            file_type: FileType::Text,
            filename,
        },
        Err(_) => FileContent {
            success: false,
            content: None,
            error: Some("File contains binary data and cannot be displayed as text".to_string()),
            file_type: FileType::Binary,
            filename,
        },
    })
}

/// 写入工作区内文件（自动创建父目录）
pub fn write_file(root: &Path, requested: &str, content: &[u8]) -> Result<FileInfo> {
    let path = resolve_in_workspace(root, requested)?;
    let resolved_root = root.canonicalize()?;
    if path == resolved_root {
        return Err(Error::AccessDenied(requested.to_string()));
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, content)?;

    let metadata = fs::metadata(&path)?;
    let relative = path.strip_prefix(&resolved_root).unwrap_or(&path);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    Ok(FileInfo {
        file_type: FileType::classify(&name),
        name,
        path: relative_string(relative),
        size: metadata.len(),
        modified: format_mtime(metadata.modified()),
    })
}

/// 删除工作区内文件或目录（不允许删除根目录本身）
pub fn delete_file(root: &Path, requested: &str) -> Result<()> {
    let path = resolve_in_workspace(root, requested)?;
    if path == root.canonicalize()? {
        return Err(Error::AccessDenied(requested.to_string()));
    }

    let metadata = match fs::symlink_metadata(&path) {
        Ok(m) => m,
        Err(_) => return Err(Error::NotFound(requested.to_string())),
    };

    if metadata.is_dir() {
        fs::remove_dir_all(&path)?;
    } else {
        fs::remove_file(&path)?;
    }
    Ok(())
}

/// 工作区文件清单（附加到提示词前）
pub fn context_message(root: &Path) -> Option<String> {
    let files = snapshot(root);
    if files.is_empty() {
        return None;
    }

    let mut context = String::from("## Available Files:\n");
    for file in &files {
        context.push_str(&format!("- {} ({})\n", file.path, file.file_type));
    }
    context.push_str(
        "\nYou can read these files with the Read tool to understand the context and work with them as needed.",
    );
    Some(context)
}

/// 组合最终提示词
pub fn compose_prompt(root: &Path, prompt: &str, include_file_context: bool) -> String {
    if !include_file_context {
        return prompt.to_string();
    }
    match context_message(root) {
        Some(context) => format!("{}\n\n## User Request:\n{}", context, prompt),
        None => prompt.to_string(),
    }
}
