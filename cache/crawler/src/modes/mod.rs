//! Pluggable crawl modes.
//!
//! The mode set is closed, so dispatch is a pattern match over
//! [`ModeState`] rather than a table of function pointers; the
//! capability table ([`CrawlType::needs_lock`] / [`CrawlType::needs_client`])
//! is what survives of the registry row.

pub(crate) mod dump;
pub(crate) mod expired;

use crate::client::ClientSink;
use crate::storage::ExtStorage;
use dump::DumpModule;
use expired::{ExpiredModule, ExpiredStats};
use scour_core::{BucketGuard, Cache, ClassGuard, Clock};
use std::sync::Arc;

/// Crawl mode selector. The discriminants are the wire protocol tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CrawlType {
    /// Periodic system-initiated expired-item reap.
    Autoexpire = 0,
    /// User-initiated expired-item reap.
    Expired = 1,
    /// Verbose per-item metadata dump.
    Metadump = 2,
    /// Compact `mg` key dump.
    Mgdump = 3,
}

struct ModeCaps {
    needs_lock: bool,
    needs_client: bool,
}

/// One capability row per tag, in tag order.
const MODE_CAPS: [ModeCaps; 4] = [
    ModeCaps {
        needs_lock: true,
        needs_client: false,
    },
    ModeCaps {
        needs_lock: true,
        needs_client: false,
    },
    ModeCaps {
        needs_lock: false,
        needs_client: true,
    },
    ModeCaps {
        needs_lock: false,
        needs_client: true,
    },
];

impl CrawlType {
    /// Decode a wire tag.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::Autoexpire),
            1 => Some(Self::Expired),
            2 => Some(Self::Metadump),
            3 => Some(Self::Mgdump),
            _ => None,
        }
    }

    /// The wire tag.
    pub fn tag(self) -> u32 {
        self as u32
    }

    /// Whether `eval` expects the class lock held across the call.
    pub fn needs_lock(self) -> bool {
        MODE_CAPS[self as usize].needs_lock
    }

    /// Whether a client sink must be attached.
    pub fn needs_client(self) -> bool {
        MODE_CAPS[self as usize].needs_client
    }

    /// Whether this mode streams a dump (and may walk the hash table).
    pub fn is_dump(self) -> bool {
        matches!(self, Self::Metadump | Self::Mgdump)
    }
}

/// Everything an `eval` may touch. The scanner fills in what the mode's
/// capabilities entitle it to: reaping modes get the class guard and
/// bucket proof, dump modes get the sink.
pub(crate) struct EvalCx<'a, 'c, 'b> {
    pub cache: &'a Cache,
    pub storage: Option<&'a dyn ExtStorage>,
    pub sink: Option<&'a mut ClientSink>,
    pub class: Option<&'a mut ClassGuard<'c>>,
    pub bucket: Option<&'a BucketGuard<'b>>,
}

/// The active mode's state, created by `init` and consumed by `finalize`.
pub(crate) enum ModeState {
    Expired(ExpiredModule),
    Metadump(DumpModule),
    Mgdump(DumpModule),
}

impl ModeState {
    /// `init`: build the mode's state for one crawl.
    pub(crate) fn new(ty: CrawlType, data: Option<Arc<ExpiredStats>>, clock: &Clock) -> Self {
        match ty {
            CrawlType::Autoexpire | CrawlType::Expired => {
                Self::Expired(ExpiredModule::new(data, clock.now()))
            }
            CrawlType::Metadump => Self::Metadump(DumpModule::new()),
            CrawlType::Mgdump => Self::Mgdump(DumpModule::new()),
        }
    }

    /// `eval`: judge one item. The mode owns the scanner's reference and
    /// must release (or reap) it.
    pub(crate) fn eval(&mut self, cx: &mut EvalCx<'_, '_, '_>, id: u32, hv: u64, class: usize) {
        match self {
            Self::Expired(m) => m.eval(cx, id, hv, class),
            Self::Metadump(m) => m.eval_meta(cx, id),
            Self::Mgdump(m) => m.eval_keys(cx, id),
        }
    }

    /// `doneclass`: one class finished.
    pub(crate) fn doneclass(&mut self, clock: &Clock, class: usize) {
        match self {
            Self::Expired(m) => m.doneclass(clock.now(), class),
            Self::Metadump(_) | Self::Mgdump(_) => {}
        }
    }

    /// `finalize`: the whole crawl finished.
    pub(crate) fn finalize(&mut self, clock: &Clock, sink: &mut ClientSink, router: &dyn crate::client::ConnRouter) {
        match self {
            Self::Expired(m) => m.finalize(clock.now()),
            Self::Metadump(m) => m.finalize(sink, router, b"END\r\n"),
            Self::Mgdump(m) => m.finalize(sink, router, b"EN\r\n"),
        }
    }

    /// The hash iterator could not be acquired; dumps report it in their
    /// terminator.
    pub(crate) fn set_locked(&mut self) {
        match self {
            Self::Expired(_) => {}
            Self::Metadump(m) | Self::Mgdump(m) => m.set_locked(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_round_trip() {
        for ty in [
            CrawlType::Autoexpire,
            CrawlType::Expired,
            CrawlType::Metadump,
            CrawlType::Mgdump,
        ] {
            assert_eq!(CrawlType::from_tag(ty.tag()), Some(ty));
        }
        assert_eq!(CrawlType::from_tag(4), None);
    }

    #[test]
    fn test_capability_table() {
        assert!(CrawlType::Autoexpire.needs_lock());
        assert!(CrawlType::Expired.needs_lock());
        assert!(!CrawlType::Expired.needs_client());
        assert!(!CrawlType::Metadump.needs_lock());
        assert!(CrawlType::Metadump.needs_client());
        assert!(CrawlType::Mgdump.needs_client());
        assert!(CrawlType::Metadump.is_dump());
        assert!(!CrawlType::Autoexpire.is_dump());
    }
}
