//! Command: list the state records in the snapshot directory.
use std::sync::Arc;

use anyhow::Result;

use super::CommandSetup;
use crate::cli::GlobalOpts;
use crate::logging::Logger;
use crate::resources::{Manifest, StateRecord, StateStore};

/// Run the records command.
///
/// # Errors
///
/// Returns an error if the snapshot directory cannot be read.
#[allow(clippy::print_stdout)]
pub fn run(global: &GlobalOpts, log: &Arc<Logger>) -> Result<()> {
    let setup = CommandSetup::init(global, log)?;
    let store = StateStore::new(&setup.state_dir);
    let manifest = store.read_manifest()?;
    let records = store.list()?;
    if records.is_empty() {
        log.info(&format!("no records in {}", setup.state_dir.display()));
        return Ok(());
    }
    println!("{}", render(manifest.as_ref(), &records));
    Ok(())
}

/// One line per record, preceded by the manifest header when present.
#[must_use]
pub fn render(manifest: Option<&Manifest>, records: &[StateRecord]) -> String {
    let mut lines = Vec::new();
    if let Some(m) = manifest {
        lines.push(format!(
            "snapshot of {} v{} from {} at {}",
            m.template,
            m.version,
            m.machine,
            m.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    let width = records
        .iter()
        .map(|r| r.kind.as_str().len())
        .max()
        .unwrap_or_default();
    for record in records {
        let state = if record.present {
            let sealed = record.encrypted_count();
            if sealed > 0 {
                format!("{} field(s), {sealed} encrypted", record.fields.len())
            } else {
                format!("{} field(s)", record.fields.len())
            }
        } else {
            "absent".to_string()
        };
        lines.push(format!(
            "{:<width$}  {}  [{state}]",
            record.kind.as_str(),
            record.locator
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::locator::ResourceKind;
    use crate::resources::{FieldValue, StoredField};

    fn record(kind: ResourceKind, locator: &str, present: bool) -> StateRecord {
        StateRecord {
            version: 1,
            kind,
            locator: locator.to_string(),
            key: "k".to_string(),
            captured_at: Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap(),
            present,
            fields: BTreeMap::new(),
            field_is_encrypted: BTreeMap::new(),
            missing_fields: Vec::new(),
            attributes: None,
        }
    }

    #[test]
    fn renders_manifest_and_records() {
        let mut key = record(ResourceKind::Registry, r"HKCU\Software\App", true);
        key.fields.insert(
            "Theme".to_string(),
            StoredField::Plain(FieldValue::String("dark".to_string())),
        );
        key.fields
            .insert("Token".to_string(), StoredField::Sealed("c2VhbGVk".to_string()));
        key.field_is_encrypted.insert("Token".to_string(), true);
        let manifest = Manifest {
            template: "desk".to_string(),
            version: "3".to_string(),
            ancestry: vec!["desk".to_string()],
            machine: "host1".to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap(),
            records: Vec::new(),
        };
        let records = vec![record(ResourceKind::File, "~/.vimrc", false), key];
        insta::assert_snapshot!(render(Some(&manifest), &records), @r"
        snapshot of desk v3 from host1 at 2026-03-01 08:00:00 UTC
        file      ~/.vimrc  [absent]
        registry  HKCU\Software\App  [2 field(s), 1 encrypted]
        ");
    }
}
