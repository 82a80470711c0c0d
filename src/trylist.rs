//! # Endpoint Candidate Scheduling
//!
//! Each peer keeps a ranked set of candidate endpoint URLs it cycles through
//! while hunting for connectivity: supernode-advertised endpoints (replaced
//! wholesale on every refresh, so stale advertisements disappear) and
//! P2P-gossiped endpoints (added incrementally, aged out per item).
//!
//! Priority is not a clock. New items are seeded with a synthetic `last_try`
//! built from [`AF_PREFER_BIAS`] so that preferred-family endpoints sort
//! first, then the supplied per-URL order, then the non-preferred family —
//! and the scheduler simply always picks the smallest `last_try`. Once an
//! item has been tried, its `last_try` becomes real wall-clock seconds and
//! it naturally rotates to the back of the queue.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::trace;

use crate::endpoint::{EnabledAf, resolve_url};

/// Seed offset separating preferred-family candidates from non-preferred
/// ones. Must dwarf any realistic per-URL order bias.
pub const AF_PREFER_BIAS: i64 = 10_000;

/// Seconds since the Unix epoch; the scheduler's "now".
fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// One candidate endpoint. `first_try == 0` means never attempted.
#[derive(Debug, Clone)]
struct TryItem {
    url: String,
    last_try: i64,
    first_try: i64,
}

#[derive(Debug, Default)]
struct Maps {
    super_v4: HashMap<String, TryItem>,
    super_v6: HashMap<String, TryItem>,
    p2p_v4: HashMap<String, TryItem>,
    p2p_v6: HashMap<String, TryItem>,
}

/// Ranked candidate-URL scheduler for one peer's connect loop.
pub struct EndpointTryList {
    maps: RwLock<Maps>,
    timeout: Duration,
    enabled_af: EnabledAf,
}

impl EndpointTryList {
    /// `timeout` is the peer-alive timeout: P2P candidates older than this
    /// without success are dropped, and retries slow down past it.
    pub fn new(timeout: Duration, enabled_af: EnabledAf) -> Self {
        Self {
            maps: RwLock::new(Maps::default()),
            timeout,
            enabled_af,
        }
    }

    /// Re-materialise the supernode candidate maps from a fresh
    /// advertisement.
    ///
    /// `urls` carries a per-URL order bias (seconds) controlling relative
    /// priority within a family. Candidates already known keep their backoff
    /// state; candidates the supernode stopped advertising vanish. URLs that
    /// fail to resolve are skipped.
    pub async fn update_super(&self, urls: &[(String, i64)], af_prefer: u8) {
        // Resolve outside the lock; DNS must never block the send path.
        let mut resolved_urls = Vec::with_capacity(urls.len());
        for (url, order_bias) in urls {
            if url.is_empty() {
                continue;
            }
            match resolve_url(url, self.enabled_af).await {
                Ok(r) => resolved_urls.push((r, *order_bias)),
                Err(e) => {
                    trace!(url, error = %e, "skipping unresolvable supernode candidate");
                }
            }
        }

        let mut maps = self.maps.write().expect("trylist lock");
        let mut new_v4 = HashMap::new();
        let mut new_v6 = HashMap::new();

        for (resolved, order_bias) in resolved_urls {
            if let Some(addr) = resolved.v4 {
                let key = addr.to_string();
                let item = maps.super_v4.remove(&key).unwrap_or_else(|| TryItem {
                    url: key.clone(),
                    last_try: seed_last_try(order_bias, af_prefer == 4),
                    first_try: 0,
                });
                trace!(url = %key, "supernode candidate (v4)");
                new_v4.insert(key, item);
            }
            if let Some(addr) = resolved.v6 {
                let key = addr.to_string();
                let item = maps.super_v6.remove(&key).unwrap_or_else(|| TryItem {
                    url: key.clone(),
                    last_try: seed_last_try(order_bias, af_prefer == 6),
                    first_try: 0,
                });
                trace!(url = %key, "supernode candidate (v6)");
                new_v6.insert(key, item);
            }
        }

        maps.super_v4 = new_v4;
        maps.super_v6 = new_v6;
    }

    /// Add one gossiped candidate. No-op if the URL does not resolve or is
    /// already tracked.
    pub async fn update_p2p(&self, url: &str) {
        let Ok(resolved) = resolve_url(url, self.enabled_af).await else {
            return;
        };

        let now = now_secs();
        let mut maps = self.maps.write().expect("trylist lock");
        if let Some(addr) = resolved.v4 {
            let key = addr.to_string();
            maps.p2p_v4.entry(key.clone()).or_insert_with(|| {
                trace!(url = %key, "p2p candidate (v4)");
                TryItem { url: key.clone(), last_try: now, first_try: 0 }
            });
        }
        if let Some(addr) = resolved.v6 {
            let key = addr.to_string();
            maps.p2p_v6.entry(key.clone()).or_insert_with(|| {
                trace!(url = %key, "p2p candidate (v6)");
                TryItem { url: key.clone(), last_try: now, first_try: 0 }
            });
        }
    }

    /// Remove a candidate from every map (endpoint confirmed elsewhere).
    pub fn delete(&self, url: &str) {
        let mut maps = self.maps.write().expect("trylist lock");
        maps.super_v4.remove(url);
        maps.super_v6.remove(url);
        maps.p2p_v4.remove(url);
        maps.p2p_v6.remove(url);
    }

    /// Pick the next candidate to dial.
    ///
    /// Returns `(fast_retry, url)`: `fast_retry` turns false once the
    /// candidate has been failing for longer than the peer-alive timeout,
    /// telling the connect loop to pace itself. Exactly one item is
    /// refreshed per call; aged-out P2P items are dropped on the way.
    pub fn get_next_try(&self) -> Option<(bool, String)> {
        let now = now_secs();
        let mut maps = self.maps.write().expect("trylist lock");

        let timeout = self.timeout.as_secs() as i64;
        let aged = |item: &TryItem| item.first_try > 0 && item.first_try + timeout < now;
        maps.p2p_v4.retain(|url, item| {
            let keep = !aged(item);
            if !keep {
                trace!(url = %url, "dropping aged p2p candidate");
            }
            keep
        });
        maps.p2p_v6.retain(|url, item| {
            let keep = !aged(item);
            if !keep {
                trace!(url = %url, "dropping aged p2p candidate");
            }
            keep
        });

        let Maps { super_v4, super_v6, p2p_v4, p2p_v6 } = &mut *maps;
        let smallest = super_v4
            .values_mut()
            .chain(super_v6.values_mut())
            .chain(p2p_v4.values_mut())
            .chain(p2p_v6.values_mut())
            // Tie-break on the URL so iteration order never leaks through.
            .min_by(|a, b| (a.last_try, &a.url).cmp(&(b.last_try, &b.url)))?;

        smallest.last_try = now;
        if smallest.first_try == 0 {
            smallest.first_try = now;
        }
        let fast_retry = smallest.first_try + timeout >= now;
        Some((fast_retry, smallest.url.clone()))
    }

    /// Total number of tracked candidates.
    pub fn len(&self) -> usize {
        let maps = self.maps.read().expect("trylist lock");
        maps.super_v4.len() + maps.super_v6.len() + maps.p2p_v4.len() + maps.p2p_v6.len()
    }

    /// True when no candidates are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn seed_last_try(order_bias: i64, preferred: bool) -> i64 {
    let base = AF_PREFER_BIAS + order_bias;
    if preferred { base - AF_PREFER_BIAS } else { base }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V6_URL: &str = "[2001:db8::1]:3001";
    const V4_URL: &str = "192.0.2.1:3001";

    fn trylist(timeout_secs: u64) -> EndpointTryList {
        EndpointTryList::new(Duration::from_secs(timeout_secs), EnabledAf::BOTH)
    }

    #[tokio::test]
    async fn preferred_family_is_tried_first() {
        let tl = trylist(30);
        tl.update_super(
            &[(V6_URL.to_string(), 0), (V4_URL.to_string(), 0)],
            6,
        )
        .await;
        assert_eq!(tl.len(), 2);

        let (fast, url) = tl.get_next_try().expect("candidate");
        assert!(fast);
        assert_eq!(url, "[2001:db8::1]:3001");

        let (_, url) = tl.get_next_try().expect("candidate");
        assert_eq!(url, "192.0.2.1:3001");
    }

    #[tokio::test]
    async fn order_bias_ranks_within_a_family() {
        let tl = trylist(30);
        tl.update_super(
            &[
                ("192.0.2.1:3001".to_string(), 5),
                ("192.0.2.2:3001".to_string(), 0),
            ],
            4,
        )
        .await;

        let (_, url) = tl.get_next_try().unwrap();
        assert_eq!(url, "192.0.2.2:3001");
        let (_, url) = tl.get_next_try().unwrap();
        assert_eq!(url, "192.0.2.1:3001");
    }

    #[tokio::test]
    async fn refresh_preserves_backoff_of_known_candidates() {
        let tl = trylist(30);
        let urls = [(V6_URL.to_string(), 0), (V4_URL.to_string(), 0)];
        tl.update_super(&urls, 6).await;

        // Burn the v6 candidate; its last_try becomes "now".
        let (_, first) = tl.get_next_try().unwrap();
        assert_eq!(first, "[2001:db8::1]:3001");

        // A refresh with the same URLs must carry the tried item forward:
        // the untried v4 candidate (seeded at AF_PREFER_BIAS) still wins
        // over the recently-tried v6 one.
        tl.update_super(&urls, 6).await;
        let (_, url) = tl.get_next_try().unwrap();
        assert_eq!(url, "192.0.2.1:3001");
    }

    #[tokio::test]
    async fn refresh_drops_unadvertised_candidates() {
        let tl = trylist(30);
        tl.update_super(&[(V4_URL.to_string(), 0)], 4).await;
        assert_eq!(tl.len(), 1);

        tl.update_super(&[("192.0.2.9:3001".to_string(), 0)], 4).await;
        assert_eq!(tl.len(), 1);
        let (_, url) = tl.get_next_try().unwrap();
        assert_eq!(url, "192.0.2.9:3001");
    }

    #[tokio::test]
    async fn unresolvable_urls_are_skipped() {
        let tl = trylist(30);
        tl.update_super(&[("".to_string(), 0)], 4).await;
        tl.update_p2p("").await;
        assert!(tl.is_empty());
        assert!(tl.get_next_try().is_none());
    }

    #[tokio::test]
    async fn last_try_strictly_increases_on_pick() {
        let tl = trylist(30);
        tl.update_super(&[(V4_URL.to_string(), 0)], 4).await;

        let before = tl.maps.read().unwrap().super_v4[V4_URL].last_try;
        let (_, url) = tl.get_next_try().unwrap();
        let after = tl.maps.read().unwrap().super_v4[&url].last_try;
        assert!(after > before, "last_try must move forward");
        assert_eq!(tl.maps.read().unwrap().super_v4[&url].first_try, after);
    }

    #[tokio::test]
    async fn p2p_candidates_age_out() {
        let tl = trylist(30);
        tl.update_p2p(V4_URL).await;
        // Simulate a candidate that has been failing since long ago.
        tl.maps
            .write()
            .unwrap()
            .p2p_v4
            .get_mut(V4_URL)
            .unwrap()
            .first_try = 1;

        assert!(tl.get_next_try().is_none(), "aged item must be deleted, not returned");
        assert!(tl.is_empty());
    }

    #[tokio::test]
    async fn supernode_candidates_never_age_out() {
        let tl = trylist(30);
        tl.update_super(&[(V4_URL.to_string(), 0)], 4).await;
        tl.maps
            .write()
            .unwrap()
            .super_v4
            .get_mut(V4_URL)
            .unwrap()
            .first_try = 1;

        let (fast, url) = tl.get_next_try().expect("supernode items persist");
        assert_eq!(url, V4_URL);
        assert!(!fast, "long-failing candidate must switch to slow retry");
    }

    #[tokio::test]
    async fn delete_removes_from_every_map() {
        let tl = trylist(30);
        tl.update_super(&[(V4_URL.to_string(), 0)], 4).await;
        tl.update_p2p(V4_URL).await;
        tl.delete(V4_URL);
        assert!(tl.is_empty());
    }
}
