//! Durable scheduled-action table.
//!
//! Records live in an append-only JSON-lines file. Every line is a complete
//! [`ScheduledAction`] snapshot; on load the last line for an id wins. Every
//! status change is appended and synced before the call returns, so a record
//! that was marked fired stays fired across a restart. The file is compacted
//! to one line per record whenever it is opened. A failed append is cut back
//! to the last complete line so the next record never joins a torn one.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use docrelay_core::{ActionStatus, ScheduledAction};
use tracing::{debug, info, warn};

use crate::error::{ServerError, ServerResult};

struct Table {
    file: File,
    /// Length of the file up to the last complete record.
    end: u64,
    records: HashMap<String, ScheduledAction>,
    /// Pending records a sweep is currently executing.
    in_flight: HashSet<String>,
}

impl Table {
    fn append(&mut self, action: &ScheduledAction) -> ServerResult<()> {
        let mut line = serde_json::to_vec(action)
            .map_err(|e| ServerError::action_store(format!("failed to encode action: {e}")))?;
        line.push(b'\n');

        let len = self.file.metadata()?.len();
        if len != self.end {
            warn!(
                expected = self.end,
                found = len,
                "Action table has a partial record, truncating"
            );
            self.file.set_len(self.end)?;
        }

        if let Err(e) = self
            .file
            .write_all(&line)
            .and_then(|()| self.file.sync_data())
        {
            if let Err(truncate) = self.file.set_len(self.end) {
                warn!(error = %truncate, "Failed to drop partial action record");
            }
            return Err(e.into());
        }
        self.end += line.len() as u64;
        Ok(())
    }
}

/// The scheduled-action table, owned by the daemon.
pub struct ActionStore {
    path: PathBuf,
    table: Mutex<Table>,
}

impl std::fmt::Debug for ActionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionStore").field("path", &self.path).finish()
    }
}

impl ActionStore {
    /// Opens (or creates) the table at `path`, replaying and compacting it.
    pub fn open(path: impl Into<PathBuf>) -> ServerResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let records = replay(&path)?;
        compact(&path, &records)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let end = file.metadata()?.len();
        let pending = records
            .values()
            .filter(|a| a.status == ActionStatus::Pending)
            .count();
        info!(
            path = %path.display(),
            records = records.len(),
            pending,
            "Loaded action table"
        );

        Ok(Self {
            path,
            table: Mutex::new(Table {
                file,
                end,
                records,
                in_flight: HashSet::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Durably adds a new record.
    pub fn insert(&self, action: ScheduledAction) -> ServerResult<()> {
        let mut table = self.lock();
        if table.records.contains_key(&action.id) {
            return Err(ServerError::action_store(format!(
                "duplicate action id {}",
                action.id
            )));
        }
        table.append(&action)?;
        table.records.insert(action.id.clone(), action);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<ScheduledAction> {
        self.lock().records.get(id).cloned()
    }

    /// All records ordered by trigger time.
    pub fn list(&self) -> Vec<ScheduledAction> {
        let mut actions: Vec<_> = self.lock().records.values().cloned().collect();
        actions.sort_by(|a, b| {
            a.trigger_time
                .cmp(&b.trigger_time)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        actions
    }

    /// Pending records due at `now` that no sweep holds, in trigger order.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<ScheduledAction> {
        let table = self.lock();
        let mut due: Vec<_> = table
            .records
            .values()
            .filter(|a| a.is_due_at(now) && !table.in_flight.contains(&a.id))
            .cloned()
            .collect();
        due.sort_by_key(|a| a.trigger_time);
        due
    }

    /// Marks a pending record as being executed.
    ///
    /// Returns `None` if it is missing, no longer pending, or already claimed.
    /// A claimed record cannot be cancelled.
    pub fn claim(&self, id: &str) -> Option<ScheduledAction> {
        let mut table = self.lock();
        let action = table.records.get(id)?;
        if action.status != ActionStatus::Pending || table.in_flight.contains(id) {
            return None;
        }
        let action = action.clone();
        table.in_flight.insert(id.to_string());
        Some(action)
    }

    /// Releases a claim without changing the record.
    pub fn release(&self, id: &str) {
        self.lock().in_flight.remove(id);
    }

    /// Durably moves a record to a terminal status and releases its claim.
    pub fn complete(
        &self,
        id: &str,
        status: ActionStatus,
        reason: Option<String>,
    ) -> ServerResult<ScheduledAction> {
        let mut table = self.lock();
        let current = table
            .records
            .get(id)
            .ok_or_else(|| ServerError::ActionNotFound { id: id.to_string() })?;
        let next = current
            .transitioned(status, reason)
            .ok_or_else(|| ServerError::ActionNotPending {
                id: id.to_string(),
                status: current.status,
            })?;

        table.append(&next)?;
        table.in_flight.remove(id);
        table.records.insert(id.to_string(), next.clone());
        debug!(action_id = %id, status = %status, "Recorded action status");
        Ok(next)
    }

    /// Durably cancels a pending record that no sweep has claimed.
    pub fn cancel(&self, id: &str) -> ServerResult<ScheduledAction> {
        let mut table = self.lock();
        let current = table
            .records
            .get(id)
            .ok_or_else(|| ServerError::ActionNotFound { id: id.to_string() })?;

        // A claimed record is still pending on disk but is already executing.
        let executing = table.in_flight.contains(id);
        let next = match current.transitioned(
            ActionStatus::Cancelled,
            Some("cancelled by user".to_string()),
        ) {
            Some(next) if !executing => next,
            _ => {
                return Err(ServerError::ActionNotPending {
                    id: id.to_string(),
                    status: current.status,
                });
            }
        };

        table.append(&next)?;
        table.records.insert(id.to_string(), next.clone());
        info!(action_id = %id, "Action cancelled");
        Ok(next)
    }

    /// Pending count and the earliest pending trigger time.
    pub fn pending_summary(&self) -> (usize, Option<DateTime<Utc>>) {
        let table = self.lock();
        table
            .records
            .values()
            .filter(|a| a.status == ActionStatus::Pending)
            .fold((0, None), |(count, next), a| {
                let next = match next {
                    Some(t) if t <= a.trigger_time => Some(t),
                    _ => Some(a.trigger_time),
                };
                (count + 1, next)
            })
    }
}

fn replay(path: &Path) -> ServerResult<HashMap<String, ScheduledAction>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = HashMap::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ScheduledAction>(&line) {
            Ok(action) => {
                records.insert(action.id.clone(), action);
            }
            Err(e) => {
                warn!(path = %path.display(), line = index + 1, error = %e, "Skipping malformed action record");
            }
        }
    }
    Ok(records)
}

fn compact(path: &Path, records: &HashMap<String, ScheduledAction>) -> ServerResult<()> {
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = File::create(&tmp)?;
        let mut ordered: Vec<_> = records.values().collect();
        ordered.sort_by_key(|a| a.created_at);
        for action in ordered {
            serde_json::to_writer(&mut file, action)
                .map_err(|e| ServerError::action_store(format!("failed to encode action: {e}")))?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent().and_then(|parent| File::open(parent).ok()) {
        let _ = dir.sync_all();
    }
    Ok(())
}
