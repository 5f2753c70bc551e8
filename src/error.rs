use crossbeam_queue::SegQueue;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

pub(crate) use anyhow::Error;

pub(crate) type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Collects errors from parallel phases. Phases like the duplicate-symbol
/// check and the relocation scan are required to report every offender, not
/// just the first, so they push here and the driver calls `checkpoint` at the
/// phase boundary.
pub(crate) struct Diagnostics {
    errors: SegQueue<String>,
    count: AtomicUsize,
}

impl Diagnostics {
    pub(crate) fn new() -> Self {
        Self {
            errors: SegQueue::new(),
            count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn error(&self, message: String) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.errors.push(message);
    }

    pub(crate) fn has_errors(&self) -> bool {
        self.count.load(Ordering::Relaxed) != 0
    }

    /// Fails if any errors have accumulated since the last checkpoint. The
    /// messages are sorted so that output doesn't depend on thread timing.
    pub(crate) fn checkpoint(&self) -> Result {
        if !self.has_errors() {
            return Ok(());
        }
        let mut messages = Vec::new();
        while let Some(m) = self.errors.pop() {
            messages.push(m);
        }
        messages.sort();
        for m in &messages {
            eprintln!("weld: error: {m}");
        }
        let n = messages.len();
        self.count.store(0, Ordering::Relaxed);
        anyhow::bail!("Link failed with {n} error(s)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_clears() {
        let diags = Diagnostics::new();
        assert!(diags.checkpoint().is_ok());
        diags.error("b".to_owned());
        diags.error("a".to_owned());
        assert!(diags.has_errors());
        assert!(diags.checkpoint().is_err());
        assert!(diags.checkpoint().is_ok());
    }
}
