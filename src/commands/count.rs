//! Per-processor command counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counts dispatched commands by type. Increments are relaxed; the numbers
/// are for observability only.
#[derive(Debug, Default)]
pub struct CommandCount {
    init_db: AtomicU64,
    query: AtomicU64,
    stmt_prepare: AtomicU64,
    stmt_execute: AtomicU64,
    stmt_close: AtomicU64,
    ping: AtomicU64,
    kill: AtomicU64,
    quit: AtomicU64,
    heartbeat: AtomicU64,
    other: AtomicU64,
}

macro_rules! counters {
    ($($field:ident => $inc:ident),* $(,)?) => {
        impl CommandCount {
            $(
                pub fn $inc(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }

                pub fn $field(&self) -> u64 {
                    self.$field.load(Ordering::Relaxed)
                }
            )*
        }
    };
}

counters!(
    init_db => do_init_db,
    query => do_query,
    stmt_prepare => do_stmt_prepare,
    stmt_execute => do_stmt_execute,
    stmt_close => do_stmt_close,
    ping => do_ping,
    kill => do_kill,
    quit => do_quit,
    heartbeat => do_heartbeat,
    other => do_other,
);

impl CommandCount {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum over every counter.
    pub fn total(&self) -> u64 {
        self.init_db()
            + self.query()
            + self.stmt_prepare()
            + self.stmt_execute()
            + self.stmt_close()
            + self.ping()
            + self.kill()
            + self.quit()
            + self.heartbeat()
            + self.other()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let count = CommandCount::new();
        count.do_query();
        count.do_query();
        count.do_ping();
        count.do_other();

        assert_eq!(count.query(), 2);
        assert_eq!(count.ping(), 1);
        assert_eq!(count.other(), 1);
        assert_eq!(count.kill(), 0);
        assert_eq!(count.total(), 4);
    }
}
