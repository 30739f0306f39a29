//! Network address observation through the host ARP table.
//!
//! Guests get their LAN address by DHCP, outside our control. The only way
//! to learn it is to look for the guest's hardware address in the kernel's
//! neighbour table, so resolution is a point-in-time probe that callers
//! repeat on every status query.

use nimbus_vm::MacAddr;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Flags value of an incomplete (unresolved) neighbour entry.
const ATF_INCOMPLETE: &str = "0x0";

/// One resolved `{ip, mac}` association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpEntry {
    /// Network address
    pub ip: Ipv4Addr,
    /// Hardware address
    pub mac: MacAddr,
}

/// Parse the text of `/proc/net/arp`.
///
/// Unparsable rows and incomplete entries are skipped.
pub fn parse_table(text: &str) -> Vec<ArpEntry> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let ip = cols.next()?.parse().ok()?;
            let _hw_type = cols.next()?;
            let flags = cols.next()?;
            let mac = cols.next()?.parse().ok()?;
            if flags == ATF_INCOMPLETE {
                return None;
            }
            Some(ArpEntry { ip, mac })
        })
        .collect()
}

/// Resolves hardware addresses to IPv4 addresses.
///
/// A parsed table is reused for `ttl` so frequent status polling does not
/// turn into one file read per instance.
#[derive(Debug)]
pub struct ArpObserver {
    path: PathBuf,
    ttl: Duration,
    cache: Mutex<Option<(Instant, Vec<ArpEntry>)>>,
}

impl ArpObserver {
    /// Observe the table at `path`, caching it for `ttl` (zero disables
    /// caching).
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Path of the observed table.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// First network address currently associated with `mac`.
    pub async fn resolve(&self, mac: &MacAddr) -> Option<Ipv4Addr> {
        let entries = self.entries().await;
        let ip = entries.iter().find(|e| e.mac == *mac).map(|e| e.ip);
        tracing::trace!(%mac, ?ip, "ARP lookup");
        ip
    }

    /// Current table, from cache when fresh.
    async fn entries(&self) -> Vec<ArpEntry> {
        let mut cache = self.cache.lock().await;
        if let Some((read_at, entries)) = cache.as_ref() {
            if read_at.elapsed() < self.ttl {
                return entries.clone();
            }
        }

        let entries = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => parse_table(&text),
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "Failed to read ARP table");
                Vec::new()
            }
        };
        if !self.ttl.is_zero() {
            *cache = Some((Instant::now(), entries.clone()));
        }
        entries
    }
}
