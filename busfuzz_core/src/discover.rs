//! Arbitration ID discovery: probe a numeric ID range and classify
//! responders, plus the passive listener used for `listener` and
//! `autoblacklist`.
//!
//! CAN buses commonly have one primary diagnostic responder, so a scan halts
//! at the first hit unless `nostop` asks for the full range. Background
//! broadcast traffic would drown a scan in false positives; `autoblacklist`
//! listens passively beforehand and excludes every ID seen broadcasting.

use crate::error::CanFuzzResult;
use crate::frame::{Direction, Frame};
use crate::session::Session;
use crate::traits::Transport;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// The ID range a discovery run walks through.
#[derive(Debug, Clone)]
pub struct DiscoveryRange {
    /// First candidate ID, inclusive.
    pub min: u32,
    /// Last candidate ID, inclusive.
    pub max: u32,
    /// IDs that are never probed and whose responses are ignored.
    pub blacklist: HashSet<u32>,
    /// Scan the whole range instead of stopping at the first responder.
    pub nostop: bool,
}

/// Probes every non-blacklisted ID in the range with `probe_payload` and
/// reports the IDs whose probe drew a response accepted by `is_response`.
/// A response on *any* arbitration ID counts, as diagnostic endpoints answer
/// on their own ID, not the probed one.
/// # Errors
pub async fn scan<T, F>(
    session: &mut Session<T>,
    range: &DiscoveryRange,
    probe_payload: &[u8],
    is_response: F,
    stop: &AtomicBool,
) -> CanFuzzResult<Vec<u32>>
where
    T: Transport,
    F: Fn(&Frame) -> bool,
{
    let mut responders = Vec::new();
    tracing::info!(
        "scanning {:#06x}..={:#06x} ({} blacklisted)",
        range.min,
        range.max,
        range.blacklist.len()
    );

    for id in range.min..=range.max {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        if range.blacklist.contains(&id) {
            continue;
        }

        let probe = Frame::new(id, probe_payload, Direction::Sent)?;
        session.drain().await?;
        session.send(&probe).await?;

        let deadline = Instant::now() + session.config.probe_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::debug!("no response for {id:#06x}");
                break;
            }
            match session.await_response(None, remaining).await? {
                None => {
                    tracing::debug!("no response for {id:#06x}");
                    break;
                }
                Some(response)
                    if !range.blacklist.contains(&response.id()) && is_response(&response) =>
                {
                    tracing::info!("ID {id:#06x} responded with {response}");
                    responders.push(id);
                    break;
                }
                // background chatter, keep waiting out the probe window
                Some(_) => {}
            }
        }

        if !range.nostop && !responders.is_empty() {
            break;
        }
    }
    Ok(responders)
}

/// Passively listens for `duration` and returns every arbitration ID seen
/// broadcasting. Runs strictly before a scan, never interleaved with it.
/// # Errors
pub async fn autoblacklist<T: Transport>(
    session: &mut Session<T>,
    duration: Duration,
) -> CanFuzzResult<HashSet<u32>> {
    tracing::info!(
        "listening {:.1}s for background traffic to blacklist",
        duration.as_secs_f64()
    );
    let mut ids = HashSet::new();
    let deadline = Instant::now() + duration;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        if let Some(frame) = session.transport.recv(remaining).await?
            && ids.insert(frame.id())
        {
            tracing::info!("auto-blacklisting {:#06x}", frame.id());
        }
    }
    Ok(ids)
}

/// Passively counts frames per arbitration ID until interrupted. Returns the
/// per-ID hit counts for the final report.
/// # Errors
pub async fn listen<T: Transport>(
    transport: &mut T,
    stop: &AtomicBool,
) -> CanFuzzResult<HashMap<u32, u64>> {
    let mut hits: HashMap<u32, u64> = HashMap::new();
    tracing::info!("running listener (press Ctrl+C to exit)");

    while !stop.load(Ordering::Relaxed) {
        let Some(frame) = transport.recv(Duration::from_millis(200)).await? else {
            continue;
        };
        let count = hits.entry(frame.id()).or_insert(0);
        *count += 1;
        if *count == 1 {
            tracing::info!(
                "last ID: {:#010x} ({} unique arbitration IDs found)",
                frame.id(),
                hits.len()
            );
        }
    }
    Ok(hits)
}
