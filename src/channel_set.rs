//! `ChannelSet`: the set of per-process Channel groups a caller polls for
//! samples, one entry per tracked pid.
//!
//! Grounded on `original_source/channelset.h`/`.cpp`'s `ChannelSet` class.
//! Where the original used `epoll_create`/`epoll_wait`, this uses the
//! teacher's own `mio::Poll` — already a teacher dependency, already used
//! for the same readiness-notification role in `fd.rs`'s old `Evented`
//! impl — registering each Channel's raw fd ad hoc via `mio::unix::EventedFd`
//! instead of requiring `Channel` itself to implement `Evented`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use libc::pid_t;
use mio::unix::{EventedFd, UnixReady};
use mio::{Events, Poll, PollOpt, Ready, Token};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::sample::{EventClass, Sample};

/// Matches the original's `EPOLL_BATCH_SIZE`: how many ready events
/// `poll_samples` drains from the readiness instance per call.
const POLL_BATCH_SIZE: usize = 64;

struct Inner {
    poll: Poll,
    entries: BTreeMap<pid_t, Vec<Channel>>,
    token_lookup: HashMap<Token, (pid_t, usize)>,
    next_token: usize,
    period: u64,
}

/// A set of sampled processes, each tracked through one `Channel` per event
/// class in `class_set`.
///
/// Uninitialized until `init`; `inner` is `None` beforehand and after
/// `deinit`, mirroring the original's `m_epollfd < 0` sentinel.
pub struct ChannelSet {
    class_set: Vec<EventClass>,
    inner: Option<Inner>,
}

impl ChannelSet {
    pub fn new() -> Self {
        ChannelSet {
            class_set: Vec::new(),
            inner: None,
        }
    }

    /// Initializes the set to sample `class_set` for every process later
    /// added. Fails `InvalidState` if already initialized, `InvalidArgument`
    /// if `class_set` is empty.
    pub fn init(&mut self, class_set: Vec<EventClass>) -> Result<()> {
        if self.inner.is_some() {
            return Err(Error::InvalidState);
        }
        if class_set.is_empty() {
            return Err(Error::InvalidArgument {
                reason: "class_set must not be empty",
            });
        }

        let poll = Poll::new().map_err(Error::from)?;
        self.class_set = class_set;
        self.inner = Some(Inner {
            poll,
            entries: BTreeMap::new(),
            token_lookup: HashMap::new(),
            next_token: 0,
            period: 0,
        });
        Ok(())
    }

    /// Tears every tracked process's Channels down and returns to
    /// uninitialized. A no-op if already uninitialized.
    pub fn deinit(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            for (&pid, channels) in inner.entries.iter_mut() {
                deregister_all(&inner.poll, &mut inner.token_lookup, pid, channels);
            }
            inner.entries.clear();
            self.class_set.clear();
        }
    }

    /// Adds `pid` to the set, one Channel per configured event class, at
    /// the set's current period. A no-op (returns `Ok`) if `pid` is already
    /// tracked. On any failure, every Channel created for this call is
    /// unwound and the set is left exactly as it was.
    pub fn add(&mut self, pid: pid_t) -> Result<()> {
        let class_set = self.class_set.clone();
        let inner = self.inner.as_mut().ok_or(Error::InvalidState)?;

        if inner.entries.contains_key(&pid) {
            return Ok(());
        }

        match create_channels(inner, pid, &class_set) {
            Ok(channels) => {
                inner.entries.insert(pid, channels);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Removes `pid` from the set, tearing down its Channels. A no-op if
    /// `pid` was never tracked.
    pub fn remove(&mut self, pid: pid_t) -> Result<()> {
        let inner = self.inner.as_mut().ok_or(Error::InvalidState)?;
        if let Some(mut channels) = inner.entries.remove(&pid) {
            deregister_all(&inner.poll, &mut inner.token_lookup, pid, &mut channels);
        }
        Ok(())
    }

    /// Reconciles the tracked set to exactly `pids`: anything currently
    /// tracked but absent from `pids` is removed, anything in `pids` but not
    /// yet tracked is added. Removals always happen first. If an add fails
    /// partway through, the pids added so far are kept and the error is
    /// returned immediately — unlike `add`, there is no rollback here,
    /// matching the original's `update`.
    pub fn update(&mut self, pids: &BTreeSet<pid_t>) -> Result<()> {
        if self.inner.is_none() {
            return Err(Error::InvalidState);
        }

        let tracked: BTreeSet<pid_t> = self.inner.as_ref().unwrap().entries.keys().cloned().collect();
        let (to_remove, to_add) = diff_pids(&tracked, pids);

        for pid in to_remove {
            self.remove(pid)?;
        }
        for pid in to_add {
            self.add(pid)?;
        }
        Ok(())
    }

    /// Sets the sample period on every Channel currently tracked, and on
    /// any Channel created by a future `add`. Stops at the first failure
    /// without rolling back the Channels already updated; the set's stored
    /// period is only updated once every Channel succeeds, matching the
    /// original's `m_period = period;` placement as the last statement of
    /// `setPeriod`.
    pub fn set_period(&mut self, period: u64) -> Result<()> {
        let inner = self.inner.as_mut().ok_or(Error::InvalidState)?;

        for channels in inner.entries.values_mut() {
            for channel in channels.iter_mut() {
                channel.set_period(period)?;
            }
        }

        inner.period = period;
        Ok(())
    }

    /// Blocks up to `timeout_ms` (`None` blocks indefinitely, `Some(0)`
    /// returns immediately) waiting for readiness, then drains every ready
    /// Channel, invoking `on_sample` for each decoded sample and `on_exit`
    /// for each process whose Channel reported a hangup. Returns the number
    /// of samples delivered.
    ///
    /// Deviates from the original in one respect (see SPEC_FULL.md §4.2):
    /// a hangup on one channel does not abort the rest of this batch — every
    /// ready channel in the batch is still drained before exits are handled.
    pub fn poll_samples(
        &mut self,
        timeout_ms: Option<u64>,
        mut on_sample: impl FnMut(Sample),
        mut on_exit: impl FnMut(pid_t),
    ) -> Result<usize> {
        let inner = self.inner.as_mut().ok_or(Error::InvalidState)?;

        let mut events = Events::with_capacity(POLL_BATCH_SIZE);
        let timeout = timeout_ms.map(::std::time::Duration::from_millis);
        inner.poll.poll(&mut events, timeout).map_err(Error::from)?;

        let mut sample_count = 0;
        let mut exit_pids: BTreeSet<pid_t> = BTreeSet::new();

        for event in events.iter() {
            let (pid, idx) = match inner.token_lookup.get(&event.token()) {
                Some(&entry) => entry,
                None => continue, // stale token from an already-removed channel
            };

            let ready = UnixReady::from(event.readiness());
            if ready.is_hup() {
                exit_pids.insert(pid);
                continue;
            }

            let channel = inner
                .entries
                .get_mut(&pid)
                .and_then(|channels| channels.get_mut(idx));
            let channel = match channel {
                Some(c) => c,
                None => continue,
            };

            loop {
                match channel.read_sample() {
                    Ok(sample) => {
                        on_sample(sample);
                        sample_count += 1;
                    }
                    Err(Error::WouldBlock) => break,
                    Err(e) => return Err(e),
                }
            }
        }

        for pid in exit_pids {
            if let Some(mut channels) = inner.entries.remove(&pid) {
                deregister_all(&inner.poll, &mut inner.token_lookup, pid, &mut channels);
            }
            on_exit(pid);
        }

        Ok(sample_count)
    }
}

impl Default for ChannelSet {
    fn default() -> Self {
        ChannelSet::new()
    }
}

impl Drop for ChannelSet {
    fn drop(&mut self) {
        self.deinit();
    }
}

/// Binds and registers one Channel per configured class for `pid`,
/// unwinding everything created so far if any step fails.
fn create_channels(inner: &mut Inner, pid: pid_t, class_set: &[EventClass]) -> Result<Vec<Channel>> {
    let mut channels = Vec::with_capacity(class_set.len());
    let period = inner.period;

    for &class in class_set {
        let mut channel = Channel::new();

        let result = channel
            .bind(pid, class)
            .and_then(|_| channel.set_period(period))
            .and_then(|_| register(inner, pid, channels.len(), &channel));

        if let Err(e) = result {
            deregister_all(&inner.poll, &mut inner.token_lookup, pid, &mut channels);
            return Err(e);
        }

        channels.push(channel);
    }

    Ok(channels)
}

/// Splits the symmetric difference between the currently tracked pids and a
/// desired pid set into what `update` must remove and what it must add,
/// mirroring `original_source/channelset.cpp`'s two-pointer merge over sorted
/// pid/entry sequences (expressed here via `BTreeSet::difference`, since both
/// inputs are already ordered sets).
fn diff_pids(tracked: &BTreeSet<pid_t>, desired: &BTreeSet<pid_t>) -> (Vec<pid_t>, Vec<pid_t>) {
    let to_remove: Vec<pid_t> = tracked.difference(desired).cloned().collect();
    let to_add: Vec<pid_t> = desired.difference(tracked).cloned().collect();
    (to_remove, to_add)
}

fn register(inner: &mut Inner, pid: pid_t, idx: usize, channel: &Channel) -> Result<()> {
    let fd = channel.fd().ok_or(Error::InvalidState)?;
    let token = Token(inner.next_token);
    inner.next_token += 1;

    inner
        .poll
        .register(
            &EventedFd(&fd),
            token,
            Ready::readable() | UnixReady::hup(),
            PollOpt::level(),
        )
        .map_err(Error::from)?;

    inner.token_lookup.insert(token, (pid, idx));
    Ok(())
}

/// Deregisters every Channel's fd from `poll` and drops its
/// `token_lookup` entry. Called on every teardown path for `pid`'s Channels
/// (`remove`, `update`'s remove side, `deinit`, observed process exit, and
/// the rollback path of a failed `add`) so the token side table never
/// outlives the fds it points at.
fn deregister_all(poll: &Poll, token_lookup: &mut HashMap<Token, (pid_t, usize)>, pid: pid_t, channels: &mut [Channel]) {
    for channel in channels.iter() {
        if let Some(fd) = channel.fd() {
            // best-effort: the fd is about to be closed by Channel::drop
            // regardless, so a failed deregister here is not actionable.
            let _ = poll.deregister(&EventedFd(&fd));
        }
    }
    token_lookup.retain(|_, &mut (entry_pid, _)| entry_pid != pid);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_rejects_empty_class_set() {
        let mut set = ChannelSet::new();
        let err = set.init(Vec::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn double_init_fails() {
        let mut set = ChannelSet::new();
        set.init(vec![EventClass::Load]).unwrap();
        let err = set.init(vec![EventClass::Store]).unwrap_err();
        assert!(matches!(err, Error::InvalidState));
    }

    #[test]
    fn operations_before_init_fail() {
        let mut set = ChannelSet::new();
        assert!(matches!(set.add(1), Err(Error::InvalidState)));
        assert!(matches!(set.remove(1), Err(Error::InvalidState)));
        assert!(matches!(set.update(&BTreeSet::new()), Err(Error::InvalidState)));
        assert!(matches!(set.set_period(1000), Err(Error::InvalidState)));
    }

    #[test]
    fn remove_of_untracked_pid_is_a_no_op() {
        let mut set = ChannelSet::new();
        set.init(vec![EventClass::Load]).unwrap();
        assert!(set.remove(12345).is_ok());
    }

    #[test]
    fn diff_pids_matches_remove_then_add_semantics() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let tracked: BTreeSet<pid_t> = (0..12).map(|_| rng.gen_range(1, 500)).collect();
        let desired: BTreeSet<pid_t> = (0..12).map(|_| rng.gen_range(1, 500)).collect();

        let (to_remove, to_add) = diff_pids(&tracked, &desired);

        // every removed pid was tracked and is no longer desired; every
        // added pid is desired and was not already tracked -- the same
        // partition channelset.cpp's two-pointer merge produces.
        let mut expected_remove: Vec<pid_t> = tracked.difference(&desired).cloned().collect();
        let mut expected_add: Vec<pid_t> = desired.difference(&tracked).cloned().collect();
        expected_remove.sort();
        expected_add.sort();

        let mut actual_remove = to_remove.clone();
        let mut actual_add = to_add.clone();
        actual_remove.sort();
        actual_add.sort();

        pretty_assertions::assert_eq!(actual_remove, expected_remove);
        pretty_assertions::assert_eq!(actual_add, expected_add);

        // reapplying the same sets produces no further work: the union of
        // what stays tracked after remove+add equals `desired`.
        let mut after: BTreeSet<pid_t> = tracked.clone();
        for pid in &to_remove {
            after.remove(pid);
        }
        for pid in &to_add {
            after.insert(*pid);
        }
        pretty_assertions::assert_eq!(after, desired);
    }
}
