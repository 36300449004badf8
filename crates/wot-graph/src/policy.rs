//! Download policy.
//!
//! An identity is worth downloading iff some own identity's score grants
//! it positive capacity, or sees it at a finite rank with a non-negative
//! value. Own identities are always fetchable through their self-score.
//!
//! Fetchable identities are split between the two downloaders: anything at
//! rank ≤ 1 from some owner (the owner itself, or a direct trustee of one)
//! is polled continuously by the fast downloader; everything else is
//! fetched on demand by the slow downloader from its hint queue.
//!
//! [`refresh_fetch_state`] is called at the end of every mutating
//! operation with the set of subjects whose scores were touched. It diffs
//! the predicate against the currently commanded state and emits the
//! start/abort events for the downloaders. Start and abort for the same
//! identity are therefore always serialised in commit order. When an
//! identity stops being fetchable, its stored hints are deleted inside the
//! same transaction; a hint for an unwanted identity must never survive.

use std::collections::BTreeSet;

use tracing::debug;
use wot_core::IdentityId;

use crate::events::GraphEvent;
use crate::store::WriteTxn;

/// Reconcile the commanded fetch state of the given subjects with the
/// download predicate, queueing downloader events on the transaction.
pub(crate) fn refresh_fetch_state<I>(txn: &mut WriteTxn<'_>, affected: I)
where
    I: IntoIterator<Item = IdentityId>,
{
    let subjects: BTreeSet<IdentityId> = affected.into_iter().collect();
    for id in subjects {
        let commanded = txn.fetching_partition(id);
        let exists = txn.identity(id).is_some();
        let wanted = exists && txn.compute_should_fetch(id);

        if !wanted {
            if let Some(partition) = commanded {
                // Both the hints pointing at this identity and the hints it
                // published are now worthless: an unwanted identity is not
                // to be downloaded, and an untrusted one is not to be
                // believed.
                let deleted =
                    txn.delete_hints_for_subject(id) + txn.delete_hints_from_source(id);
                if deleted > 0 {
                    debug!(subject = %id, deleted, "dropped hints of unfetchable identity");
                }
                txn.set_fetching(id, None);
                txn.push_event(GraphEvent::AbortFetch { id, partition });
            }
            continue;
        }

        let partition = txn.compute_partition(id);
        match commanded {
            None => {
                txn.set_fetching(id, Some(partition));
                txn.push_event(GraphEvent::StartFetch { id, partition });
            }
            Some(current) if current != partition => {
                txn.set_fetching(id, Some(partition));
                txn.push_event(GraphEvent::AbortFetch {
                    id,
                    partition: current,
                });
                txn.push_event(GraphEvent::StartFetch { id, partition });
            }
            Some(_) => {}
        }
    }
}
