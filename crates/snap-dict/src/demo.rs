use crate::{ScopeContext, SnapConfig, SnapDictionary, SnapError};
use snap_types::Generation;
use thiserror::Error;
use tracing::info;

const KEY: u32 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotIsolationDemoResult {
    pub reader_a_first: String,
    pub reader_during_scope: String,
    pub reader_a_after: String,
    pub reader_b: String,
    pub reader_after_rollback: String,
    pub committed_gen: Generation,
    pub isolated: bool,
}

impl SnapshotIsolationDemoResult {
    #[must_use]
    pub fn output_lines(&self) -> [String; 6] {
        [
            format!("reader A sees {}", self.reader_a_first),
            format!("reader during scope still sees {}", self.reader_during_scope),
            format!("scope commits {}", self.committed_gen),
            format!("reader A still sees {}", self.reader_a_after),
            format!(
                "reader B sees {}, after rollback {}",
                self.reader_b, self.reader_after_rollback
            ),
            format!(
                "snapshot isolation: {}",
                if self.isolated { "PASS" } else { "FAIL" }
            ),
        ]
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DemoError {
    #[error("write lock failed: {0}")]
    Lock(#[from] SnapError),
    #[error("no visible value for {reader} at key {key} for snapshot {generation}")]
    MissingVisible {
        reader: &'static str,
        key: u32,
        generation: Generation,
    },
}

/// Scripted reader/writer run: a committed scope, then a rolled-back one.
///
/// # Errors
///
/// Fails if a lock cannot be taken or a reader finds no value.
pub fn run_snapshot_isolation_demo() -> Result<SnapshotIsolationDemoResult, DemoError> {
    let dict = SnapDictionary::<u32, String>::with_config(SnapConfig::manual());
    dict.set(KEY, "v1".to_owned())?;

    let reader_a = dict.create_snapshot();
    let reader_a_first = read(&dict, &reader_a, "reader A")?;

    let scope = ScopeContext::shared();
    let writer = dict.get_scoped_write_lock(&scope)?;
    writer.set(KEY, "v2".to_owned())?;
    let committed_gen = writer.generation();
    drop(writer);

    let during = dict.create_snapshot();
    let reader_during_scope = read(&dict, &during, "reader during scope")?;
    scope.scope_exit(true);

    let reader_a_after = read(&dict, &reader_a, "reader A")?;
    let reader_b = dict.create_snapshot();
    let reader_b_value = read(&dict, &reader_b, "reader B")?;

    let aborted = ScopeContext::shared();
    dict.get_scoped_write_lock(&aborted)?
        .set(KEY, "v3".to_owned())?;
    aborted.scope_exit(false);
    let reader_c = dict.create_snapshot();
    let reader_after_rollback = read(&dict, &reader_c, "reader after rollback")?;

    let isolated = reader_a_first == "v1"
        && reader_during_scope == "v1"
        && reader_a_after == "v1"
        && reader_b_value == "v2"
        && reader_after_rollback == "v2";
    info!(
        target: "snapcache::dict",
        committed_gen = committed_gen.0,
        live_gen = dict.live_gen().0,
        isolated,
        "isolation_check"
    );

    Ok(SnapshotIsolationDemoResult {
        reader_a_first,
        reader_during_scope,
        reader_a_after,
        reader_b: reader_b_value,
        reader_after_rollback,
        committed_gen,
        isolated,
    })
}

fn read(
    dict: &SnapDictionary<u32, String>,
    snapshot: &crate::Snapshot<u32, String>,
    reader: &'static str,
) -> Result<String, DemoError> {
    let value = snapshot.get(&KEY).ok_or(DemoError::MissingVisible {
        reader,
        key: KEY,
        generation: snapshot.generation(),
    })?;
    info!(
        target: "snapcache::dict",
        dictionary = dict.id().0,
        reader,
        generation = snapshot.generation().0,
        value = value.as_str(),
        "demo_read"
    );
    Ok(value.as_ref().clone())
}
