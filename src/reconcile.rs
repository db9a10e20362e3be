// MIT License - Copyright (c) 2026 Peter Wright
// INIM Prime log bridge

//! Alignment of two overlapping snapshots of the panel's log ring.
//!
//! The panel only ever returns the most recent N log entries, with no cursor
//! and with ids that shift between calls. New entries are found by aligning
//! the previously seen window against the fresh one on event content.

use crate::log_event::LogEvent;

/// Return the events of `fresh_window` that were appended after
/// `known_tail`.
///
/// Both inputs are ordered oldest to newest. The result is always a suffix
/// of `fresh_window`. Events are matched on [`LogEvent::key`], never on `id`.
///
/// Cases are tried in this order:
///
/// 1. empty `known_tail`: everything is new;
/// 2. the trailing `min(len)` events of both windows match: nothing is new;
/// 3. `known_tail` sits intact inside a longer `fresh_window`, followed by
///    `i` events (smallest `i` wins): the last `i` events are new;
/// 4. a suffix of `known_tail` equals a prefix of `fresh_window` (longest
///    overlap wins): everything after the overlap is new;
/// 5. no alignment: the whole `fresh_window` is new.
///
/// Repeated identical entries inside one second make the alignment
/// ambiguous; the first match in the order above is taken.
pub fn reconcile<'a>(known_tail: &[LogEvent], fresh_window: &'a [LogEvent]) -> &'a [LogEvent] {
    let n_known = known_tail.len();
    let n_fresh = fresh_window.len();

    if n_known == 0 {
        return fresh_window;
    }

    let common = n_known.min(n_fresh);
    if same_keys(&known_tail[n_known - common..], &fresh_window[n_fresh - common..]) {
        return &fresh_window[n_fresh..];
    }

    if n_known < n_fresh {
        for appended in 1..=(n_fresh - n_known) {
            let end = n_fresh - appended;
            if same_keys(known_tail, &fresh_window[end - n_known..end]) {
                return &fresh_window[end..];
            }
        }
    }

    for overlap in (1..common).rev() {
        if same_keys(&known_tail[n_known - overlap..], &fresh_window[..overlap]) {
            return &fresh_window[overlap..];
        }
    }

    fresh_window
}

fn same_keys(a: &[LogEvent], b: &[LogEvent]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_occurrence(y))
}
