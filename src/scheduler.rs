//! Debounced eviction scheduling.
//!
//! One process-wide worker accepts `(location, delay)` requests over a
//! bounded channel, keeps the earliest pending deadline per location and
//! dispatches due evictions about once a second. Repeated requests for a
//! hot record collapse into the earliest deadline; a later, longer delay
//! never postpones an earlier one.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::cache::evict_global;
use crate::key::GlobalLocation;

/// Request backlog; buffered so enqueuing rarely contends with the worker.
const QUEUE_DEPTH: usize = 1 << 10;

/// How often pending deadlines are scanned.
const SCAN_INTERVAL: Duration = Duration::from_secs(1);

struct Request {
    loc: GlobalLocation,
    delay: Duration,
}

static QUEUE: Lazy<SyncSender<Request>> = Lazy::new(|| {
    let (tx, rx) = mpsc::sync_channel(QUEUE_DEPTH);
    if let Err(err) = thread::Builder::new()
        .name("soffietto-eviction".into())
        .spawn(move || run(rx))
    {
        warn!(error = %err, "failed to start the eviction scheduler");
    }
    tx
});

/// Ask for `loc` to be evicted `delay` from now.
pub(crate) fn schedule(loc: GlobalLocation, delay: Duration) {
    if QUEUE.send(Request { loc, delay }).is_err() {
        warn!("eviction scheduler is gone; dropping request");
    }
}

fn run(rx: Receiver<Request>) {
    let mut pending: HashMap<GlobalLocation, Instant> = HashMap::new();
    let mut next_scan = Instant::now() + SCAN_INTERVAL;

    loop {
        let timeout = next_scan.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(request) => {
                let deadline = Instant::now() + request.delay;
                let slot = pending.entry(request.loc).or_insert(deadline);
                if deadline < *slot {
                    *slot = deadline;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }

        let now = Instant::now();
        if now >= next_scan {
            pending.retain(|loc, deadline| {
                if *deadline > now {
                    return true;
                }
                debug!(
                    cache = loc.cache,
                    frontend = loc.frontend,
                    key = ?loc.key,
                    "scheduled eviction due"
                );
                evict_global(loc);
                false
            });
            next_scan = now + SCAN_INTERVAL;
        }
    }
}
