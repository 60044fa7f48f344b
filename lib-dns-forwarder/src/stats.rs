/// Counters for the shutdown summary.  The pipeline fills this in as
/// it disposes of datagrams; nothing reads it until the process is
/// about to exit.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct Stats {
    /// Datagrams at least the size of a header.
    pub total: u64,

    /// Queries answered `NXDOMAIN` from the blocklist.
    pub blocked: u64,

    /// Queries answered with the upstream's bytes.
    pub forwarded: u64,

    /// Queries answered with `FORMERR`, `NOTIMPL`, or `SERVFAIL`.
    pub errors: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&mut self) {
        self.total += 1;
    }

    pub fn blocked(&mut self) {
        self.blocked += 1;
    }

    pub fn forwarded(&mut self) {
        self.forwarded += 1;
    }

    pub fn error(&mut self) {
        self.errors += 1;
    }
}
