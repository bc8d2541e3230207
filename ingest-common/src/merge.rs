//! # Merge
//!
//! Reconciliation of a newly observed entity against its stored canonical record.
//!
//! Every field has its own merge rule and the rules are chosen so that reconciling is idempotent
//! (replaying an observation changes nothing) and, for observations that do not set the same
//! fields, commutative (delivery order does not matter):
//!
//! * `id`, `source`, `external_id`: fixed at creation.
//! * `username`, `display_name`, `url`: coalesce, a missing incoming value never erases a known one.
//! * `observed_at`: the maximum ever observed.
//! * `raw_data_reference`, `trace_id`: follow the newest observation, ordered by
//!   `(observed_at, raw_data_reference)`.
//! * `attributes`: shallow key union, incoming keys win. Nested values are replaced, not merged.
//! * `location`: replaced only by a location with both coordinates.
//! * `version`, `updated_at`: bumped only when the merged content actually differs.
use chrono::{DateTime, Utc};

use crate::observation::Observation;
use crate::record::{CanonicalRecord, RecordKey};

/// Compute the next state of the record keyed by `key` after observing `incoming`.
pub fn reconcile(
    existing: Option<&CanonicalRecord>,
    key: &RecordKey,
    incoming: &Observation,
    now: DateTime<Utc>,
) -> CanonicalRecord {
    let Some(current) = existing else {
        return CanonicalRecord {
            id: key.id,
            source: key.source,
            external_id: key.external_id.clone(),
            username: incoming.username.clone(),
            display_name: incoming.display_name.clone(),
            url: incoming.url.clone(),
            raw_data_reference: incoming.raw_data_reference.clone(),
            trace_id: incoming.trace_id,
            observed_at: incoming.observed_at,
            attributes: incoming.attributes.clone(),
            location: incoming.storable_location().cloned(),
            version: 1,
            created_at: now,
            updated_at: now,
        };
    };

    let mut next = current.clone();

    coalesce(&mut next.username, &incoming.username);
    coalesce(&mut next.display_name, &incoming.display_name);
    coalesce(&mut next.url, &incoming.url);

    if (incoming.observed_at, incoming.raw_data_reference.as_str())
        >= (current.observed_at, current.raw_data_reference.as_str())
    {
        next.raw_data_reference = incoming.raw_data_reference.clone();
        next.trace_id = incoming.trace_id;
    }

    next.observed_at = std::cmp::max(current.observed_at, incoming.observed_at);

    for (name, value) in &incoming.attributes {
        next.attributes.insert(name.clone(), value.clone());
    }

    if let Some(location) = incoming.storable_location() {
        next.location = Some(location.clone());
    }

    if next.same_content(current) {
        return current.clone();
    }

    next.version = current.version + 1;
    next.updated_at = now;
    next
}

fn coalesce(stored: &mut Option<String>, incoming: &Option<String>) {
    if let Some(value) = incoming {
        *stored = Some(value.clone());
    }
}
