//! Key dump modes.
//!
//! Metadump emits one verbose metadata line per live item; the compact
//! keydump emits `mg <key>` request lines a client can replay. Both skip
//! dead items and leave stream termination to `finalize`.

use super::EvalCx;
use crate::client::{ClientSink, ConnRouter, MIN_BUFSPACE};
use crate::encode::{base64_encode_into, uriencode_into};
use scour_core::flag;
use std::io::Write;

/// Shared state for the dump modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DumpStatus {
    Clean,
    /// The hash iterator was unavailable; report it in the terminator.
    Locked,
}

pub(crate) struct DumpModule {
    status: DumpStatus,
}

impl DumpModule {
    pub(crate) fn new() -> Self {
        Self {
            status: DumpStatus::Clean,
        }
    }

    pub(crate) fn set_locked(&mut self) {
        self.status = DumpStatus::Locked;
    }

    /// Metadump `eval`: one `key=... \n` line per live item.
    pub(crate) fn eval_meta(&mut self, cx: &mut EvalCx<'_, '_, '_>, id: u32) {
        let slot = cx.cache.pool().get(id);
        let clock = cx.cache.clock();
        let now = clock.now();
        let mut is_valid = true;
        if slot.has_flag(flag::EXT_HDR) {
            if let Some(storage) = cx.storage {
                is_valid = storage.validate(slot);
            }
        }
        if slot.is_expired(now) || cx.cache.item_is_flushed(id) || !is_valid {
            cx.cache.release(id);
            return;
        }

        let sink = cx.sink.as_mut().expect("metadump requires a client");
        let buf = sink.buffer_mut();
        let start = buf.len();

        buf.extend_from_slice(b"key=");
        uriencode_into(slot.key(), buf);
        buf.push(b' ');
        let exp = slot.exptime();
        if exp == 0 {
            buf.extend_from_slice(b"exp=-1 ");
        } else {
            let _ = write!(buf, "exp={} ", clock.to_unix(exp));
        }
        let _ = write!(buf, "la={} ", clock.to_unix(slot.last_access()));
        let _ = write!(buf, "cas={} ", slot.cas());
        if slot.has_flag(flag::FETCHED) {
            buf.extend_from_slice(b"fetch=yes ");
        } else {
            buf.extend_from_slice(b"fetch=no ");
        }
        let _ = write!(buf, "cls={} ", slot.clsid());
        let _ = write!(buf, "size={} ", slot.total_size());
        let _ = write!(buf, "flags={} ", slot.client_flags());
        if let Some(hdr) = slot.ext_header() {
            let _ = write!(buf, "ext_page={} ext_offset={} ", hdr.page_id, hdr.offset);
        }
        buf.push(b'\n');

        // The key cap keeps any single line inside the guaranteed
        // headroom: 3 bytes per encoded key byte plus fixed fields.
        debug_assert!(buf.len() - start < MIN_BUFSPACE - 1);

        cx.cache.release(id);
    }

    /// Keydump `eval`: one `mg <key>\r\n` line per live item.
    pub(crate) fn eval_keys(&mut self, cx: &mut EvalCx<'_, '_, '_>, id: u32) {
        let slot = cx.cache.pool().get(id);
        let now = cx.cache.clock().now();
        if slot.is_expired(now) || cx.cache.item_is_flushed(id) {
            cx.cache.release(id);
            return;
        }

        let sink = cx.sink.as_mut().expect("keydump requires a client");
        let buf = sink.buffer_mut();
        buf.extend_from_slice(b"mg ");
        if slot.has_flag(flag::KEY_BINARY) {
            base64_encode_into(slot.key(), buf);
            buf.extend_from_slice(b" b\r\n");
        } else {
            buf.extend_from_slice(slot.key());
            buf.extend_from_slice(b"\r\n");
        }

        cx.cache.release(id);
    }

    /// Append the stream terminator once the pending output has a chance
    /// to drain. The worker performs the final flush.
    pub(crate) fn finalize(&mut self, sink: &mut ClientSink, router: &dyn ConnRouter, end: &[u8]) {
        if !sink.is_attached() {
            return;
        }
        if sink.flush(router).is_ok() {
            let msg: &[u8] = if self.status == DumpStatus::Locked {
                b"ERROR locked try again later\r\n"
            } else {
                end
            };
            sink.buffer_mut().extend_from_slice(msg);
        }
    }
}
