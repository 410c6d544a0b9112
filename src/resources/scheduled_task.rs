//! Scheduled task provider: task XML definition and enabled state via
//! `schtasks`.
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::error::ProviderError;
use super::record::{FieldValue, LiveState};
use super::Provider;
use crate::engine::Context;
use crate::locator::ResourceKind;
use crate::template::Descriptor;

/// Name of the task XML field.
pub const DEFINITION_FIELD: &str = "definition";
/// Name of the enabled-state field.
pub const ENABLED_FIELD: &str = "enabled";

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Enabled state declared in a task definition.
///
/// Task Scheduler treats a missing `<Settings><Enabled>` as enabled.
fn definition_enabled(xml: &str) -> bool {
    let settings = xml
        .find("<Settings>")
        .and_then(|start| xml.get(start..))
        .unwrap_or_default();
    settings
        .find("<Enabled>")
        .and_then(|start| settings.get(start + "<Enabled>".len()..))
        .and_then(|rest| rest.split('<').next())
        .is_none_or(|value| !value.trim().eq_ignore_ascii_case("false"))
}

/// Encode `xml` the way `schtasks /XML` expects it: UTF-16LE with a BOM.
fn utf16_file_bytes(xml: &str) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xFE];
    bytes.extend(xml.encode_utf16().flat_map(u16::to_le_bytes));
    bytes
}

/// A scratch file holding a task definition; removed on drop.
struct TaskFile(PathBuf);

impl TaskFile {
    fn write(xml: &str) -> std::io::Result<Self> {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path =
            std::env::temp_dir().join(format!("snapstate-task-{}-{n}.xml", std::process::id()));
        fs::write(&path, utf16_file_bytes(xml))?;
        Ok(Self(path))
    }

    fn arg(&self) -> String {
        self.0.display().to_string()
    }
}

impl Drop for TaskFile {
    fn drop(&mut self) {
        fs::remove_file(&self.0).ok();
    }
}

/// Captures and restores Windows scheduled tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduledTaskProvider;

impl ScheduledTaskProvider {
    fn schtasks(ctx: &Context, task: &str, args: &[&str]) -> Result<(), ProviderError> {
        let result = ctx
            .executor
            .run_unchecked("schtasks", args)
            .map_err(|e| ProviderError::apply_failed(task, e))?;
        if result.success {
            Ok(())
        } else {
            Err(ProviderError::ExecutionFailed {
                program: "schtasks".to_string(),
                exit_code: result.code.unwrap_or(-1),
                detail: result.detail(),
            })
        }
    }

    fn create(ctx: &Context, task: &str, xml: &str) -> Result<(), ProviderError> {
        let file = TaskFile::write(xml).map_err(|e| ProviderError::apply_failed(task, e))?;
        let path = file.arg();
        Self::schtasks(ctx, task, &["/Create", "/TN", task, "/XML", &path, "/F"])
    }

    fn set_enabled(ctx: &Context, task: &str, enabled: bool) -> Result<(), ProviderError> {
        let flag = if enabled { "/ENABLE" } else { "/DISABLE" };
        Self::schtasks(ctx, task, &["/Change", "/TN", task, flag])
    }
}

fn text(state: Option<&LiveState>, field: &str) -> Option<String> {
    match state?.fields.get(field)? {
        FieldValue::String(s) => Some(s.clone()),
        FieldValue::Binary(b) => String::from_utf8(b.clone()).ok(),
        _ => None,
    }
}

fn flag(state: Option<&LiveState>, field: &str) -> Option<bool> {
    match state?.fields.get(field)? {
        FieldValue::Boolean(b) => Some(*b),
        _ => None,
    }
}

impl Provider for ScheduledTaskProvider {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ScheduledTask
    }

    fn read_live(
        &self,
        descriptor: &Descriptor,
        ctx: &Context,
    ) -> Result<Option<LiveState>, ProviderError> {
        if !ctx.platform.is_windows() {
            return Err(ctx.platform.unsupported("scheduled tasks").into());
        }
        let task = descriptor.locator.to_string();
        let result = ctx
            .executor
            .run_unchecked("schtasks", &["/Query", "/TN", &task, "/XML"])
            .map_err(|e| ProviderError::read_failed(&task, e))?;
        if !result.success {
            ctx.log
                .debug(&format!("task {task} not found: {}", result.detail()));
            return Ok(None);
        }
        let xml = result.stdout.trim().to_string();
        let enabled = definition_enabled(&xml);
        let mut live = LiveState::default();
        if descriptor.fields.contains_key(DEFINITION_FIELD) {
            live.fields
                .insert(DEFINITION_FIELD.to_string(), FieldValue::String(xml));
        }
        if descriptor.fields.contains_key(ENABLED_FIELD) {
            live.fields
                .insert(ENABLED_FIELD.to_string(), FieldValue::Boolean(enabled));
        }
        Ok(Some(live))
    }

    fn write_live(
        &self,
        descriptor: &Descriptor,
        desired: &LiveState,
        current: Option<&LiveState>,
        ctx: &Context,
    ) -> Result<bool, ProviderError> {
        let task = descriptor.locator.to_string();
        let want_xml = text(Some(desired), DEFINITION_FIELD);
        let have_xml = text(current, DEFINITION_FIELD);

        let recreated = match &want_xml {
            Some(xml) if have_xml.as_ref() != Some(xml) => {
                Self::create(ctx, &task, xml)?;
                true
            }
            _ => false,
        };

        let Some(want_enabled) = flag(Some(desired), ENABLED_FIELD) else {
            return Ok(false);
        };
        let have_enabled = if recreated {
            want_xml.as_deref().map(definition_enabled)
        } else {
            flag(current, ENABLED_FIELD)
        };
        if have_enabled == Some(want_enabled) {
            return Ok(false);
        }
        if let Err(e) = Self::set_enabled(ctx, &task, want_enabled) {
            if recreated && let Some(old) = &have_xml {
                // Put the previous definition back so the task is not half-applied.
                if let Err(undo) = Self::create(ctx, &task, old) {
                    ctx.log
                        .warn(&format!("rollback of task {task} failed: {undo}"));
                }
            }
            return Err(e);
        }
        Ok(false)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::platform::{Os, Platform};
    use crate::resources::store::StateStore;
    use crate::resources::test_helpers::{MockExecutor, descriptor, make_context_with};
    use crate::resources::ResourceChange;
    use crate::template::FieldType;
    use std::sync::Arc;

    const TASK_XML: &str = r#"<?xml version="1.0" encoding="UTF-16"?>
<Task version="1.2" xmlns="http://schemas.microsoft.com/windows/2004/02/mit/task">
  <Settings>
    <Enabled>true</Enabled>
  </Settings>
  <Actions Context="Author"><Exec><Command>backup.exe</Command></Exec></Actions>
</Task>"#;

    fn task_descriptor() -> Descriptor {
        descriptor(
            ResourceKind::ScheduledTask,
            r"\Vendor\Nightly Backup",
            &[
                (DEFINITION_FIELD, FieldType::String),
                (ENABLED_FIELD, FieldType::Boolean),
            ],
        )
    }

    fn windows_context(executor: Arc<MockExecutor>) -> Context {
        let (mut ctx, _log) = make_context_with(executor, false);
        ctx.platform = Arc::new(Platform::new(Os::Windows, "WS-01"));
        ctx
    }

    #[test]
    fn enabled_flag_parsed_from_settings() {
        assert!(definition_enabled(TASK_XML));
        assert!(!definition_enabled(&TASK_XML.replace(
            "<Enabled>true</Enabled>",
            "<Enabled>false</Enabled>"
        )));
        assert!(definition_enabled("<Task><Settings></Settings></Task>"));
    }

    #[test]
    fn utf16_file_has_bom() {
        let bytes = utf16_file_bytes("<a/>");
        assert_eq!(&bytes[..2], &[0xFF, 0xFE]);
        assert_eq!(bytes.len(), 2 + 4 * 2);
    }

    #[test]
    fn unsupported_on_linux() {
        let executor = Arc::new(MockExecutor::with_responses(vec![]));
        let (ctx, _log) = make_context_with(executor, false);
        let err = ScheduledTaskProvider
            .read_live(&task_descriptor(), &ctx)
            .unwrap_err();
        assert!(matches!(err, ProviderError::Platform(_)));
    }

    #[test]
    fn read_live_queries_xml() {
        let executor = Arc::new(MockExecutor::ok(TASK_XML));
        let ctx = windows_context(executor.clone());
        let live = ScheduledTaskProvider
            .read_live(&task_descriptor(), &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(live.fields[ENABLED_FIELD], FieldValue::Boolean(true));
        assert_eq!(
            executor.calls(),
            vec![r"schtasks /Query /TN \Vendor\Nightly Backup /XML".to_string()]
        );
    }

    #[test]
    fn missing_task_is_absent() {
        let ctx = windows_context(Arc::new(MockExecutor::fail()));
        assert!(
            ScheduledTaskProvider
                .read_live(&task_descriptor(), &ctx)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn restore_recreates_task_then_toggles_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let desc = task_descriptor();
        let disabled = TASK_XML.replace("<Enabled>true</Enabled>", "<Enabled>false</Enabled>");

        let capture = windows_context(Arc::new(MockExecutor::ok(&disabled)));
        ScheduledTaskProvider.capture(&desc, &store, &capture).unwrap();

        // Task was deleted since the backup: query fails, create succeeds.
        let executor = Arc::new(MockExecutor::with_responses(vec![
            (false, String::new()),
            (true, String::new()),
        ]));
        let ctx = windows_context(executor.clone());
        let outcome = ScheduledTaskProvider.apply(&desc, &store, &ctx).unwrap();
        assert_eq!(outcome.change, ResourceChange::Applied);
        let calls = executor.calls();
        assert_eq!(calls.len(), 2, "definition already disabled: {calls:?}");
        assert!(calls[1].starts_with(r"schtasks /Create /TN \Vendor\Nightly Backup /XML "));
        assert!(calls[1].ends_with(" /F"));
    }

    #[test]
    fn only_enabled_state_changes() {
        let executor = Arc::new(MockExecutor::ok(""));
        let ctx = windows_context(executor.clone());
        let current = LiveState::from_fields([
            (DEFINITION_FIELD.to_string(), FieldValue::String(TASK_XML.into())),
            (ENABLED_FIELD.to_string(), FieldValue::Boolean(true)),
        ]);
        let desired = LiveState::from_fields([
            (DEFINITION_FIELD.to_string(), FieldValue::String(TASK_XML.into())),
            (ENABLED_FIELD.to_string(), FieldValue::Boolean(false)),
        ]);
        ScheduledTaskProvider
            .write_live(&task_descriptor(), &desired, Some(&current), &ctx)
            .unwrap();
        assert_eq!(
            executor.calls(),
            vec![r"schtasks /Change /TN \Vendor\Nightly Backup /DISABLE".to_string()]
        );
    }

    #[test]
    fn failed_toggle_restores_previous_definition() {
        let executor = Arc::new(MockExecutor::with_responses(vec![
            (true, String::new()),
            (false, "access denied".to_string()),
            (true, String::new()),
        ]));
        let ctx = windows_context(executor.clone());
        let old = TASK_XML.replace("backup.exe", "old.exe");
        let current = LiveState::from_fields([
            (DEFINITION_FIELD.to_string(), FieldValue::String(old)),
            (ENABLED_FIELD.to_string(), FieldValue::Boolean(true)),
        ]);
        let desired = LiveState::from_fields([
            (DEFINITION_FIELD.to_string(), FieldValue::String(TASK_XML.into())),
            (ENABLED_FIELD.to_string(), FieldValue::Boolean(false)),
        ]);
        let err = ScheduledTaskProvider
            .write_live(&task_descriptor(), &desired, Some(&current), &ctx)
            .unwrap_err();
        assert!(err.to_string().contains("access denied"));
        let calls = executor.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[2].starts_with("schtasks /Create"));
    }
}
