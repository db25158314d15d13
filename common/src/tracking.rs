//! Skb identity tracking
//!
//! Skbs are identified by their data address (`skb->head`), which is stable
//! for most of an skb lifetime but can be replaced (e.g. by
//! `pskb_expand_head`) and is reused once the skb is freed. [`track_skb`]
//! follows an skb across those changes so every event it emits carries the
//! same `(orig_head, timestamp)` identity for the whole skb lifetime.
//!
//! The function runs in probe context: it never fails, never loops and never
//! allocates. Every store operation is atomic on its own key but the sequence
//! as a whole is not; concurrent invocations are resolved by insert-if-absent
//! semantics, the earliest insertion winning.
//!
//! ```text
//! lookup(head) --miss--> lookup(skb) --hit--> insert(head), delete(skb) once head is indexed
//!      |                      |
//!     hit                   miss --> new info, insert(head) unless freeing
//!      |                      |
//!      +----------+-----------+
//!                 v
//!       last_seen = now
//!       inv_head: insert(skb)   free: delete(head)
//!                 v
//!       emit {orig_head, timestamp, skb, drop_reason}
//! ```

use crate::{
    constants::{DROP_REASON_NONE, SECTION_DATA_TYPE_DEFAULT, SECTION_SKB_TRACKING},
    event::EventSink,
    types::{ProbeArg, SkbTrackingEvent, TrackingConfig, TrackingInfo},
};

/// Read-only behavior configuration, keyed by function address
pub trait ConfigStore {
    fn lookup(&self, ksym: u64) -> Option<TrackingConfig>;
}

/// Bounded tracking information store, keyed by head or skb address
///
/// Implementations must never overwrite in `insert_if_absent` and must fail
/// silently (return false) when full.
pub trait TrackingStore {
    fn lookup(&self, key: u64) -> Option<TrackingInfo>;
    fn insert_if_absent(&self, key: u64, info: &TrackingInfo) -> bool;
    fn delete(&self, key: u64);
    /// Update `last_seen` of an existing entry in place; false if absent.
    fn touch(&self, key: u64, now: u64) -> bool;
}

/// Access to the typed arguments of the probed function
pub trait ProbeArgs {
    fn has_arg(&self, arg: ProbeArg) -> bool;
    fn read_arg(&self, arg: ProbeArg) -> u64;
}

/// One probe firing on an skb
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Observation {
    /// Address of the probed function
    pub ksym: u64,
    /// Probe invocation time (nanoseconds)
    pub timestamp: u64,
    /// Address of the skb
    pub skb: u64,
    /// Current skb->head, 0 if it couldn't be read
    pub head: u64,
}

/// What happened to the tracking section of an event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackOutcome {
    /// No usable head address; nothing was tracked nor emitted.
    NoHead,
    /// The tracking section was added to the event.
    Emitted,
    /// The event had no room left; the section was dropped.
    SectionFull,
}

/// Resolve the identity of the observed skb, update the stores and append a
/// tracking section to `event`.
#[inline(always)]
pub fn track_skb<C, S, A, E>(
    configs: &C,
    store: &S,
    args: &A,
    event: &mut E,
    obs: &Observation,
) -> TrackOutcome
where
    C: ConfigStore,
    S: TrackingStore,
    A: ProbeArgs,
    E: EventSink,
{
    // Most probed functions are generic and have no configuration.
    let cfg = configs.lookup(obs.ksym).unwrap_or_default();

    let head = obs.head;
    if head == 0 {
        return TrackOutcome::NoHead;
    }

    let mut info = match resolve(store, obs.skb, head) {
        Some(info) => info,
        None => {
            let new = TrackingInfo::new(head, obs.timestamp);

            // An skb first seen when being freed needs no tracking.
            if !cfg.frees() {
                store.insert_if_absent(head, &new);
            }
            new
        }
    };

    // Lets an external reaper collect entries whose free was missed.
    info.last_seen = obs.timestamp;
    store.touch(head, obs.timestamp);

    // The new head can't be known yet: also track the skb by its own address
    // until the next observation relocates it.
    if cfg.invalidates_head() {
        store.insert_if_absent(obs.skb, &info);
    }
    if cfg.frees() {
        store.delete(head);
        if cfg.invalidates_head() {
            store.delete(obs.skb);
        }
    }

    let drop_reason = if args.has_arg(ProbeArg::SkbDropReason) {
        args.read_arg(ProbeArg::SkbDropReason) as u32
    } else {
        DROP_REASON_NONE
    };

    let section = SkbTrackingEvent {
        orig_head: info.orig_head,
        timestamp: info.timestamp,
        skb: obs.skb,
        drop_reason,
    };

    if event.append_section(SECTION_SKB_TRACKING, SECTION_DATA_TYPE_DEFAULT, &section) {
        TrackOutcome::Emitted
    } else {
        TrackOutcome::SectionFull
    }
}

/// Find the tracking info of an skb, by head first and then by skb address.
/// A hit on the skb address is moved under the head key.
#[inline(always)]
fn resolve<S: TrackingStore>(store: &S, skb: u64, head: u64) -> Option<TrackingInfo> {
    if let Some(info) = store.lookup(head) {
        return Some(info);
    }

    let info = store.lookup(skb)?;
    // If another invocation already indexed this head, its entry wins. The
    // skb key is only dropped once the head key holds an entry, so a full
    // store leaves it in place for the next observation to retry.
    if store.insert_if_absent(head, &info) || store.lookup(head).is_some() {
        store.delete(skb);
    }
    Some(info)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::{constants::SECTION_HEADER_SIZE, types::RawEvent};

    const SKB: u64 = 0xffff_8880_0000_1000;
    const H1: u64 = 0xffff_8880_1111_0000;
    const H2: u64 = 0xffff_8880_2222_0000;

    const F1: u64 = 0xffff_ffff_8100_0001;
    const F2: u64 = 0xffff_ffff_8100_0002;
    const F3: u64 = 0xffff_ffff_8100_0003;
    const F4: u64 = 0xffff_ffff_8100_0004;
    const F5: u64 = 0xffff_ffff_8100_0005;
    const F6: u64 = 0xffff_ffff_8100_0006;

    fn configs() -> MemoryConfigStore {
        MemoryConfigStore::new(&[
            (F3, TrackingConfig::new(false, true)),
            (F5, TrackingConfig::new(true, false)),
            (F6, TrackingConfig::new(true, true)),
        ])
    }

    fn obs(ksym: u64, timestamp: u64, head: u64) -> Observation {
        Observation {
            ksym,
            timestamp,
            skb: SKB,
            head,
        }
    }

    fn section(event: &RawEvent) -> SkbTrackingEvent {
        let data = event.sections();
        assert_eq!(data[0], SECTION_SKB_TRACKING);
        unsafe {
            core::ptr::read_unaligned(data[SECTION_HEADER_SIZE..].as_ptr() as *const SkbTrackingEvent)
        }
    }

    fn observe(
        configs: &MemoryConfigStore,
        store: &MemoryTrackingStore,
        args: &FakeArgs,
        o: Observation,
    ) -> (TrackOutcome, Option<SkbTrackingEvent>) {
        let mut event = RawEvent::empty();
        let outcome = track_skb(configs, store, args, &mut event, &o);
        let section = (outcome == TrackOutcome::Emitted).then(|| section(&event));
        (outcome, section)
    }

    fn expected(orig_head: u64, timestamp: u64, drop_reason: u32) -> SkbTrackingEvent {
        SkbTrackingEvent {
            orig_head,
            timestamp,
            skb: SKB,
            drop_reason,
        }
    }

    #[test]
    fn skb_lifetime_across_head_change() {
        let configs = configs();
        let store = MemoryTrackingStore::with_capacity(16);
        let args = FakeArgs::default();

        // Creation
        let (_, e) = observe(&configs, &store, &args, obs(F1, 100, H1));
        assert_eq!(e, Some(expected(H1, 100, DROP_REASON_NONE)));
        assert_eq!(store.get(H1), Some(TrackingInfo::new(H1, 100)));

        // Update
        let (_, e) = observe(&configs, &store, &args, obs(F2, 150, H1));
        assert_eq!(e, Some(expected(H1, 100, DROP_REASON_NONE)));
        let info = store.get(H1).unwrap();
        assert_eq!((info.timestamp, info.last_seen), (100, 150));

        // Head about to be invalidated: also tracked by skb address
        let (_, e) = observe(&configs, &store, &args, obs(F3, 160, H1));
        assert_eq!(e, Some(expected(H1, 100, DROP_REASON_NONE)));
        assert_eq!(store.get(H1).map(|i| i.orig_head), Some(H1));
        assert_eq!(store.get(SKB).map(|i| i.orig_head), Some(H1));

        // New head: relocated from the skb key
        let (_, e) = observe(&configs, &store, &args, obs(F4, 170, H2));
        assert_eq!(e, Some(expected(H1, 100, DROP_REASON_NONE)));
        assert_eq!(store.get(SKB), None);
        let info = store.get(H2).unwrap();
        assert_eq!((info.orig_head, info.timestamp, info.last_seen), (H1, 100, 170));

        // Termination
        let args = FakeArgs {
            drop_reason: Some(2),
        };
        let (_, e) = observe(&configs, &store, &args, obs(F5, 200, H2));
        assert_eq!(e, Some(expected(H1, 100, 2)));
        assert_eq!(store.get(H2), None);

        // Reused head starts a new lifetime
        let args = FakeArgs::default();
        let (_, e) = observe(&configs, &store, &args, obs(F1, 300, H2));
        assert_eq!(e, Some(expected(H2, 300, DROP_REASON_NONE)));
    }

    #[test]
    fn repeated_observations_only_move_last_seen() {
        let configs = configs();
        let store = MemoryTrackingStore::with_capacity(16);
        let args = FakeArgs::default();

        observe(&configs, &store, &args, obs(F1, 10, H1));
        for t in 11..20 {
            let (_, e) = observe(&configs, &store, &args, obs(F2, t, H1));
            assert_eq!(e, Some(expected(H1, 10, DROP_REASON_NONE)));
            assert_eq!(
                store.get(H1),
                Some(TrackingInfo {
                    timestamp: 10,
                    last_seen: t,
                    orig_head: H1,
                })
            );
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn null_head_is_ignored() {
        let configs = configs();
        let store = MemoryTrackingStore::with_capacity(16);
        let mut event = RawEvent::empty();

        let outcome = track_skb(&configs, &store, &FakeArgs::default(), &mut event, &obs(F1, 1, 0));

        assert_eq!(outcome, TrackOutcome::NoHead);
        assert_eq!(store.len(), 0);
        assert!(event.sections().is_empty());
    }

    #[test]
    fn first_seen_while_freed_is_not_stored() {
        let configs = configs();
        let store = MemoryTrackingStore::with_capacity(16);

        let (_, e) = observe(&configs, &store, &FakeArgs::default(), obs(F5, 50, H1));

        assert_eq!(e, Some(expected(H1, 50, DROP_REASON_NONE)));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn full_store_still_emits() {
        let configs = configs();
        let store = MemoryTrackingStore::with_capacity(1);
        let args = FakeArgs::default();
        store.insert_if_absent(0xdead, &TrackingInfo::new(0xdead, 1));

        let (_, e) = observe(&configs, &store, &args, obs(F1, 100, H1));
        assert_eq!(e, Some(expected(H1, 100, DROP_REASON_NONE)));
        assert_eq!(store.get(H1), None);

        // Untracked skbs look new on every observation.
        let (_, e) = observe(&configs, &store, &args, obs(F2, 110, H1));
        assert_eq!(e, Some(expected(H1, 110, DROP_REASON_NONE)));
    }

    #[test]
    fn full_event_drops_section_but_updates_store() {
        let configs = configs();
        let store = MemoryTrackingStore::with_capacity(16);
        let mut event = RawEvent::empty();
        event.size = crate::constants::RAW_EVENT_DATA_SIZE as u16;

        let outcome = track_skb(&configs, &store, &FakeArgs::default(), &mut event, &obs(F1, 5, H1));

        assert_eq!(outcome, TrackOutcome::SectionFull);
        assert!(store.get(H1).is_some());
    }

    #[test]
    fn head_release_before_free_keeps_identity() {
        // skb_free_head runs within the normal teardown, before kfree_skbmem
        // ends the lifetime: it must not untrack the skb.
        const FREE_HEAD: u64 = F2;
        const KFREE_SKBMEM: u64 = F5;
        let configs = configs();
        let store = MemoryTrackingStore::with_capacity(16);
        let args = FakeArgs::default();

        observe(&configs, &store, &args, obs(F1, 100, H1));
        let (_, e) = observe(&configs, &store, &args, obs(FREE_HEAD, 200, H1));
        assert_eq!(e, Some(expected(H1, 100, DROP_REASON_NONE)));
        assert!(store.get(H1).is_some());

        let (_, e) = observe(&configs, &store, &args, obs(KFREE_SKBMEM, 210, H1));
        assert_eq!(e, Some(expected(H1, 100, DROP_REASON_NONE)));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn relocation_into_full_store_keeps_skb_key() {
        let configs = configs();
        let store = MemoryTrackingStore::with_capacity(2);
        let args = FakeArgs::default();

        observe(&configs, &store, &args, obs(F1, 100, H1));
        observe(&configs, &store, &args, obs(F3, 110, H1));
        assert_eq!(store.len(), 2);

        // No room for the new head: the skb key stays for a later retry.
        let (_, e) = observe(&configs, &store, &args, obs(F4, 120, H2));
        assert_eq!(e, Some(expected(H1, 100, DROP_REASON_NONE)));
        assert_eq!(store.get(H2), None);
        assert_eq!(store.get(SKB).map(|i| i.orig_head), Some(H1));

        let (_, e) = observe(&configs, &store, &args, obs(F2, 130, H2));
        assert_eq!(e, Some(expected(H1, 100, DROP_REASON_NONE)));

        // Once a slot frees up the relocation goes through.
        store.delete(H1);
        let (_, e) = observe(&configs, &store, &args, obs(F2, 140, H2));
        assert_eq!(e, Some(expected(H1, 100, DROP_REASON_NONE)));
        assert_eq!(store.get(SKB), None);
        let info = store.get(H2).unwrap();
        assert_eq!((info.orig_head, info.timestamp, info.last_seen), (H1, 100, 140));
    }

    /// Store where another core creates the same entry right before our
    /// first insertion.
    struct RacingStore {
        inner: MemoryTrackingStore,
        competitor: (u64, TrackingInfo),
        raced: core::cell::Cell<bool>,
    }

    impl TrackingStore for RacingStore {
        fn lookup(&self, key: u64) -> Option<TrackingInfo> {
            self.inner.lookup(key)
        }

        fn insert_if_absent(&self, key: u64, info: &TrackingInfo) -> bool {
            if !self.raced.replace(true) {
                self.inner.insert_if_absent(self.competitor.0, &self.competitor.1);
            }
            self.inner.insert_if_absent(key, info)
        }

        fn delete(&self, key: u64) {
            self.inner.delete(key)
        }

        fn touch(&self, key: u64, now: u64) -> bool {
            self.inner.touch(key, now)
        }
    }

    #[test]
    fn concurrent_creation_keeps_earliest() {
        let configs = configs();
        let store = RacingStore {
            inner: MemoryTrackingStore::with_capacity(16),
            competitor: (H1, TrackingInfo::new(H1, 90)),
            raced: core::cell::Cell::new(false),
        };
        let mut event = RawEvent::empty();

        track_skb(&configs, &store, &FakeArgs::default(), &mut event, &obs(F1, 100, H1));

        // Our event is built from the local copy that lost the race.
        assert_eq!(section(&event), expected(H1, 100, DROP_REASON_NONE));
        let stored = store.inner.get(H1).unwrap();
        assert_eq!((stored.timestamp, stored.last_seen), (90, 100));
    }

    #[test]
    fn relocation_does_not_clobber_existing_head_entry() {
        let configs = configs();
        let inner = MemoryTrackingStore::with_capacity(16);
        inner.insert_if_absent(SKB, &TrackingInfo::new(H1, 100));
        let store = RacingStore {
            inner,
            competitor: (H2, TrackingInfo::new(H2, 120)),
            raced: core::cell::Cell::new(false),
        };
        let mut event = RawEvent::empty();

        track_skb(&configs, &store, &FakeArgs::default(), &mut event, &obs(F4, 130, H2));

        assert_eq!(section(&event), expected(H1, 100, DROP_REASON_NONE));
        assert_eq!(store.inner.get(SKB), None);
        let stored = store.inner.get(H2).unwrap();
        assert_eq!((stored.orig_head, stored.timestamp, stored.last_seen), (H2, 120, 130));
    }

    #[test]
    fn free_and_inv_head_together_leave_nothing_behind() {
        // Not expected from a sane configuration: the invalidation runs
        // first, then both keys are removed.
        let configs = configs();
        let store = MemoryTrackingStore::with_capacity(16);
        let args = FakeArgs::default();

        observe(&configs, &store, &args, obs(F1, 100, H1));
        let (_, e) = observe(&configs, &store, &args, obs(F6, 110, H1));

        assert_eq!(e, Some(expected(H1, 100, DROP_REASON_NONE)));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn unknown_function_is_generic() {
        let configs = MemoryConfigStore::new(&[]);
        let store = MemoryTrackingStore::with_capacity(16);
        let args = FakeArgs::default();

        observe(&configs, &store, &args, obs(F5, 100, H1));
        observe(&configs, &store, &args, obs(F3, 110, H1));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(H1).map(|i| i.last_seen), Some(110));
    }
}
