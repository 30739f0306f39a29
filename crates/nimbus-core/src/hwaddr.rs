//! Hardware address allocation.

use nimbus_vm::MacAddr;
use std::collections::HashSet;

/// Organizationally-unique prefix QEMU uses for locally-administered guests.
pub const QEMU_OUI: [u8; 3] = [0x52, 0x54, 0x00];

/// Pick a `52:54:00:xx:xx:xx` address that is not in `existing`.
///
/// Retries until a free value is found. Callers must hold whatever lock
/// protects `existing` until the result has been recorded there.
pub fn allocate(existing: &HashSet<MacAddr>) -> MacAddr {
    loop {
        let host: [u8; 3] = rand::random();
        let candidate = MacAddr::new([
            QEMU_OUI[0],
            QEMU_OUI[1],
            QEMU_OUI[2],
            host[0],
            host[1],
            host[2],
        ]);
        if !existing.contains(&candidate) {
            return candidate;
        }
        tracing::trace!(%candidate, "Hardware address collision, retrying");
    }
}
