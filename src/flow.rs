//! Flow identities and deltas threaded between stage operators.
//!
//! A [`Delta`] carries its document payload alongside the `(rowId, sign)`
//! pair the specification describes: rather than handing operators a bare
//! id and asking them to re-resolve the document from the row store on
//! every hop (which would not compose once a row has been transformed by
//! an upstream `$project` or fanned out by `$unwind`), the current value
//! rides along with the identity. This is the same choice differential
//! dataflow makes for its update tuples, and it is what lets `$unwind`'s
//! `on_remove` retract exactly the rows it fanned out without re-deriving
//! them from a, by then, possibly-stale row store read.
//!
//! [`FlowId`] unifies real row ids and the virtual ids minted by
//! `$unwind`/`$lookup` fan-out into one opaque identity space. Real row ids
//! occupy the low `2^32` range (a direct cast of [`RowId`]); virtual ids set
//! the top bit so the two spaces can never collide, matching the
//! specification's "never collide with real row ids" requirement for
//! virtual rows.

use std::sync::Arc;

use crate::value::{RowId, Value};

pub type FlowId = u64;

const VIRTUAL_BIT: u64 = 1u64 << 63;

pub fn real_flow_id(row_id: RowId) -> FlowId {
    row_id as u64
}

pub fn is_virtual(id: FlowId) -> bool {
    id & VIRTUAL_BIT != 0
}

/// Per-operator-instance virtual id minter. `salt` distinguishes the
/// virtual-id ranges of sibling `$unwind`/`$lookup` instances in the same
/// plan so their counters can never collide with one another.
#[derive(Debug, Clone)]
pub struct VirtualIdMinter {
    salt: u64,
    counter: u64,
}

impl VirtualIdMinter {
    pub fn new(salt: u64) -> Self {
        VirtualIdMinter {
            salt: salt & 0x7FFF,
            counter: 0,
        }
    }

    pub fn mint(&mut self) -> FlowId {
        self.counter += 1;
        VIRTUAL_BIT | (self.salt << 48) | self.counter
    }
}

/// `{ rowId, sign }` plus the document the sign applies to.
#[derive(Clone)]
pub struct Delta {
    pub id: FlowId,
    pub sign: i8,
    pub value: Arc<Value>,
}

impl Delta {
    pub fn add(id: FlowId, value: Value) -> Self {
        Delta {
            id,
            sign: 1,
            value: Arc::new(value),
        }
    }

    pub fn remove(id: FlowId, value: Arc<Value>) -> Self {
        Delta {
            id,
            sign: -1,
            value,
        }
    }

    pub fn is_add(&self) -> bool {
        self.sign > 0
    }
}

/// The materialized tip of a chain of forwarding stages: the set of
/// currently-live output identities and the document each currently maps
/// to, in arrival order. Backs final-stage materialization when a
/// pipeline's last stage is forwarding (no trailing barrier), and backs
/// `$limit`/`$skip` directly when they are the first barrier in a plan
/// (their "upstream order" is exactly this arrival order).
#[derive(Default, Clone)]
pub struct LiveSet {
    entries: std::collections::BTreeMap<FlowId, Arc<Value>>,
}

impl LiveSet {
    pub fn new() -> Self {
        LiveSet::default()
    }

    pub fn apply(&mut self, delta: &Delta) {
        if delta.is_add() {
            self.entries.insert(delta.id, Arc::clone(&delta.value));
        } else {
            self.entries.remove(&delta.id);
        }
    }

    pub fn apply_all<'a>(&mut self, deltas: impl IntoIterator<Item = &'a Delta>) {
        for d in deltas {
            self.apply(d);
        }
    }

    pub fn get(&self, id: FlowId) -> Option<&Value> {
        self.entries.get(&id).map(|v| v.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn values_in_order(&self) -> impl Iterator<Item = &Value> {
        self.entries.values().map(|v| v.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (FlowId, &Value)> {
        self.entries.iter().map(|(id, v)| (*id, v.as_ref()))
    }
}
