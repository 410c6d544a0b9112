//! File provider: content, read-only flag, modification time, POSIX mode and
//! symlink target.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use super::error::ProviderError;
use super::fs::{ensure_parent_dir, remove_existing, temp_sibling, write_atomic};
use super::record::{AttributeSnapshot, FieldValue, LiveState};
use super::Provider;
use crate::engine::Context;
use crate::locator::ResourceKind;
use crate::template::Descriptor;

/// Name of the file content field.
pub const CONTENT_FIELD: &str = "content";

/// Captures and restores regular files and symlinks.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileProvider;

impl FileProvider {
    fn path(descriptor: &Descriptor, ctx: &Context) -> Result<PathBuf, ProviderError> {
        descriptor
            .locator
            .to_path(&ctx.env)
            .map_err(|e| ProviderError::read_failed(&descriptor.locator, e.reason))
    }
}

impl Provider for FileProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::File
    }

    fn read_live(
        &self,
        descriptor: &Descriptor,
        ctx: &Context,
    ) -> Result<Option<LiveState>, ProviderError> {
        let path = Self::path(descriptor, ctx)?;
        let fail = |e: io::Error| ProviderError::read_failed(&descriptor.locator, e);

        let link_meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(fail(e)),
        };
        let link_target = if link_meta.is_symlink() {
            Some(fs::read_link(&path).map_err(fail)?)
        } else {
            None
        };

        // Follow the link for content and metadata; a dangling link has none.
        let meta = match fs::metadata(&path) {
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == io::ErrorKind::NotFound && link_target.is_some() => None,
            Err(e) => return Err(fail(e)),
        };
        if meta.as_ref().is_some_and(fs::Metadata::is_dir) {
            return Err(ProviderError::read_failed(
                &descriptor.locator,
                "is a directory",
            ));
        }

        let mut live = LiveState::default();
        if meta.is_some() && descriptor.fields.contains_key(CONTENT_FIELD) {
            let bytes = fs::read(&path).map_err(fail)?;
            live.fields
                .insert(CONTENT_FIELD.to_string(), FieldValue::Binary(bytes));
        }
        live.attributes = Some(AttributeSnapshot {
            readonly: meta.as_ref().map(|m| m.permissions().readonly()),
            modified: meta
                .as_ref()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from),
            mode: meta.as_ref().and_then(unix_mode),
            link_target: link_target.map(|t| t.to_string_lossy().into_owned()),
            ..AttributeSnapshot::default()
        });
        Ok(Some(live))
    }

    fn write_live(
        &self,
        descriptor: &Descriptor,
        desired: &LiveState,
        current: Option<&LiveState>,
        ctx: &Context,
    ) -> Result<bool, ProviderError> {
        let path = Self::path(descriptor, ctx)?;
        let attrs = desired.attributes.clone().unwrap_or_default();
        let fail = |e: io::Error| ProviderError::apply_failed(&descriptor.locator, e);

        if let Some(target) = &attrs.link_target {
            // The link's content belongs to its target; only the link is restored.
            ensure_parent_dir(&path).map_err(fail)?;
            replace_with_symlink(Path::new(target), &path).map_err(fail)?;
            ctx.log
                .debug(&format!("linked {} -> {target}", path.display()));
            return Ok(false);
        }
        if descriptor.policy.preserve_links && current.is_some_and(is_link) {
            // Captured as a regular file, so the link goes and a file takes its place.
            remove_existing(&path).map_err(fail)?;
        }

        let created = current.is_none();
        let previous = current
            .and_then(|c| c.fields.get(CONTENT_FIELD))
            .and_then(binary);
        let mut wrote = false;
        if let Some(bytes) = desired.fields.get(CONTENT_FIELD).and_then(binary) {
            clear_readonly(&path).map_err(fail)?;
            write_atomic(&path, bytes).map_err(fail)?;
            wrote = true;
        }

        if let Err(e) = restore_metadata(&path, &attrs) {
            if wrote && let Err(undo) = roll_back(&path, previous, created) {
                ctx.log
                    .warn(&format!("rollback of {} failed: {undo}", path.display()));
            }
            return Err(fail(e));
        }
        ctx.log.debug(&format!("wrote {}", path.display()));
        Ok(false)
    }
}

fn is_link(live: &LiveState) -> bool {
    live.attributes
        .as_ref()
        .is_some_and(|a| a.link_target.is_some())
}

/// Put back what was at `path` before a failed write: the old content, or
/// nothing when the write created the file.
fn roll_back(path: &Path, previous: Option<&[u8]>, created: bool) -> io::Result<()> {
    match previous {
        Some(old) => {
            clear_readonly(path)?;
            write_atomic(path, old)
        }
        None if created => remove_existing(path),
        None => Ok(()),
    }
}

/// Swap whatever is at `link` for a symlink to `target` in one rename.
fn replace_with_symlink(target: &Path, link: &Path) -> io::Result<()> {
    let tmp = temp_sibling(link);
    remove_existing(&tmp)?;
    create_symlink(target, &tmp)?;
    fs::rename(&tmp, link).inspect_err(|_| {
        fs::remove_file(&tmp).ok();
    })
}

fn binary(value: &FieldValue) -> Option<&[u8]> {
    match value {
        FieldValue::Binary(bytes) => Some(bytes),
        FieldValue::String(text) => Some(text.as_bytes()),
        _ => None,
    }
}

/// Apply mode, then modification time, then the read-only flag (last, since
/// it blocks the others).
fn restore_metadata(path: &Path, attrs: &AttributeSnapshot) -> io::Result<()> {
    if let Some(mode) = attrs.mode {
        set_unix_mode(path, mode)?;
    }
    if let Some(modified) = attrs.modified {
        clear_readonly(path)?;
        let file = fs::File::options().write(true).open(path)?;
        file.set_modified(SystemTime::from(modified))?;
    }
    if let Some(readonly) = attrs.readonly {
        let mut perms = fs::metadata(path)?.permissions();
        if perms.readonly() != readonly {
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(readonly);
            fs::set_permissions(path, perms)?;
        }
    }
    Ok(())
}

fn clear_readonly(path: &Path) -> io::Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.permissions().readonly() => {
            let mut perms = meta.permissions();
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
            fs::set_permissions(path, perms)
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
#[allow(clippy::unnecessary_wraps)]
fn unix_mode(meta: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt as _;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
const fn unix_mode(_meta: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn set_unix_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_unix_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    let resolved = link.parent().map_or_else(|| target.to_path_buf(), |p| p.join(target));
    if resolved.is_dir() {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}
