use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Oldest entries are dropped past this many.
pub const MAX_ENTRIES: usize = 1000;

/// Append-only sink for processor decisions. Every entry goes to `tracing`;
/// when debugging is enabled entries are also kept in memory for inspection.
#[derive(Debug, Clone, Default)]
pub struct ProcessorLog {
    enabled: bool,
    entries: Arc<Mutex<VecDeque<String>>>,
}

impl ProcessorLog {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(target: "processors", "{message}");

        if !self.enabled {
            return;
        }
        // A poisoned sink drops the entry rather than failing the caller.
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() == MAX_ENTRIES {
                entries.pop_front();
            }
            entries.push_back(message);
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_only_when_enabled() {
        let quiet = ProcessorLog::new(false);
        quiet.log("ignored");
        assert!(quiet.entries().is_empty());

        let log = ProcessorLog::new(true);
        log.log("first");
        log.log(String::from("second"));
        assert_eq!(log.entries(), vec!["first", "second"]);

        log.clear();
        assert!(log.entries().is_empty());
    }

    #[test]
    fn drops_oldest_entries_past_capacity() {
        let log = ProcessorLog::new(true);
        for i in 0..MAX_ENTRIES + 5 {
            log.log(format!("entry {i}"));
        }

        let entries = log.entries();
        assert_eq!(entries.len(), MAX_ENTRIES);
        assert_eq!(entries[0], "entry 5");
        assert_eq!(entries[MAX_ENTRIES - 1], format!("entry {}", MAX_ENTRIES + 4));
    }
}
