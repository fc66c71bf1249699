//! CRDT identifiers, operations and state vectors

use crate::encoding::{read_u8, read_var_len, read_var_u64, write_var_u64, Decode, Encode};
use crate::error::{Error, Result};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Identifies one replica (one editing peer) of a document
pub type ReplicaId = u64;

/// Globally unique operation identifier
///
/// Counters are per replica, start at 1 and have no gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    pub counter: u64,
}

impl OpId {
    pub fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }

    /// The operation issued just before this one by the same replica
    pub fn predecessor(&self) -> Option<OpId> {
        (self.counter > 1).then(|| OpId::new(self.replica, self.counter - 1))
    }
}

/// Total order over identifiers: counter first, replica id breaks ties
impl Ord for OpId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then(self.replica.cmp(&other.replica))
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.replica, self.counter)
    }
}

impl Encode for OpId {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        write_var_u64(buf, self.replica);
        write_var_u64(buf, self.counter);
    }
}

impl Decode for OpId {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let replica = read_var_u64(buf)?;
        let counter = read_var_u64(buf)?;
        if counter == 0 {
            return Err(Error::Decode(format!("operation counter of replica {} is zero", replica)));
        }
        Ok(Self { replica, counter })
    }
}

/// Highest counter applied per replica
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ReplicaId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest counter seen for `replica` (0 when nothing was seen)
    pub fn get(&self, replica: ReplicaId) -> u64 {
        self.0.get(&replica).copied().unwrap_or(0)
    }

    pub fn set(&mut self, replica: ReplicaId, counter: u64) {
        if counter == 0 {
            self.0.remove(&replica);
        } else {
            self.0.insert(replica, counter);
        }
    }

    /// Raise the entry for `id.replica` to at least `id.counter`
    pub fn observe(&mut self, id: OpId) {
        let entry = self.0.entry(id.replica).or_insert(0);
        if *entry < id.counter {
            *entry = id.counter;
        }
    }

    /// Whether the operation `id` is reflected in this vector
    pub fn contains(&self, id: OpId) -> bool {
        id.counter <= self.get(id.replica)
    }

    /// Element-wise maximum
    pub fn merge(&mut self, other: &StateVector) {
        for (&replica, &counter) in &other.0 {
            self.observe(OpId::new(replica, counter));
        }
    }

    /// Element-wise minimum; replicas missing on either side drop out
    pub fn meet(&self, other: &StateVector) -> StateVector {
        let mut out = StateVector::new();
        for (&replica, &counter) in &self.0 {
            out.set(replica, counter.min(other.get(replica)));
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.0.iter().map(|(&r, &c)| (r, c))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(ReplicaId, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (ReplicaId, u64)>>(iter: I) -> Self {
        let mut sv = StateVector::new();
        for (replica, counter) in iter {
            sv.observe(OpId::new(replica, counter));
        }
        sv
    }
}

impl Encode for StateVector {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        write_var_u64(buf, self.0.len() as u64);
        for (&replica, &counter) in &self.0 {
            write_var_u64(buf, replica);
            write_var_u64(buf, counter);
        }
    }
}

impl Decode for StateVector {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let count = read_var_len(buf)?;
        let mut sv = StateVector::new();
        for _ in 0..count {
            let replica = read_var_u64(buf)?;
            let counter = read_var_u64(buf)?;
            sv.observe(OpId::new(replica, counter));
        }
        Ok(sv)
    }
}

const TAG_INSERT: u8 = 0;
const TAG_DELETE: u8 = 1;

const HAS_ORIGIN: u8 = 0b001;
const HAS_RIGHT_ORIGIN: u8 = 0b010;
const HAS_CONTENT: u8 = 0b100;

/// A single replicated operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Insert one character between `origin` and `right_origin`.
    /// `content` is `None` when the character was already deleted and
    /// collected by the sender.
    Insert {
        id: OpId,
        origin: Option<OpId>,
        right_origin: Option<OpId>,
        content: Option<char>,
    },
    /// Tombstone the inserted character `target`
    Delete { id: OpId, target: OpId },
}

impl Operation {
    pub fn id(&self) -> OpId {
        match self {
            Operation::Insert { id, .. } | Operation::Delete { id, .. } => *id,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Operation::Insert { .. })
    }

    /// Inserted items this operation refers to
    pub fn references(&self) -> Vec<OpId> {
        match self {
            Operation::Insert { origin, right_origin, .. } => {
                origin.iter().chain(right_origin.iter()).copied().collect()
            }
            Operation::Delete { target, .. } => vec![*target],
        }
    }

    /// Whether two operations with the same id describe the same change.
    /// Collected content is compatible with any character.
    pub fn same_as(&self, other: &Operation) -> bool {
        match (self, other) {
            (
                Operation::Insert { id: a, origin: ao, right_origin: ar, content: ac },
                Operation::Insert { id: b, origin: bo, right_origin: br, content: bc },
            ) => {
                a == b
                    && ao == bo
                    && ar == br
                    && match (ac, bc) {
                        (Some(x), Some(y)) => x == y,
                        _ => true,
                    }
            }
            (
                Operation::Delete { id: a, target: at },
                Operation::Delete { id: b, target: bt },
            ) => a == b && at == bt,
            _ => false,
        }
    }
}

impl Encode for Operation {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Operation::Insert { id, origin, right_origin, content } => {
                buf.put_u8(TAG_INSERT);
                id.encode(buf);
                let mut flags = 0u8;
                if origin.is_some() {
                    flags |= HAS_ORIGIN;
                }
                if right_origin.is_some() {
                    flags |= HAS_RIGHT_ORIGIN;
                }
                if content.is_some() {
                    flags |= HAS_CONTENT;
                }
                buf.put_u8(flags);
                if let Some(origin) = origin {
                    origin.encode(buf);
                }
                if let Some(right) = right_origin {
                    right.encode(buf);
                }
                if let Some(ch) = content {
                    write_var_u64(buf, u64::from(u32::from(*ch)));
                }
            }
            Operation::Delete { id, target } => {
                buf.put_u8(TAG_DELETE);
                id.encode(buf);
                target.encode(buf);
            }
        }
    }
}

impl Decode for Operation {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        match read_u8(buf)? {
            TAG_INSERT => {
                let id = OpId::decode(buf)?;
                let flags = read_u8(buf)?;
                if flags & !(HAS_ORIGIN | HAS_RIGHT_ORIGIN | HAS_CONTENT) != 0 {
                    return Err(Error::Decode(format!("unknown insert flags {:#04x}", flags)));
                }
                let origin = if flags & HAS_ORIGIN != 0 {
                    Some(OpId::decode(buf)?)
                } else {
                    None
                };
                let right_origin = if flags & HAS_RIGHT_ORIGIN != 0 {
                    Some(OpId::decode(buf)?)
                } else {
                    None
                };
                let content = if flags & HAS_CONTENT != 0 {
                    let code = read_var_u64(buf)?;
                    let ch = u32::try_from(code)
                        .ok()
                        .and_then(char::from_u32)
                        .ok_or_else(|| Error::Decode(format!("invalid character code {}", code)))?;
                    Some(ch)
                } else {
                    None
                };
                Ok(Operation::Insert { id, origin, right_origin, content })
            }
            TAG_DELETE => {
                let id = OpId::decode(buf)?;
                let target = OpId::decode(buf)?;
                Ok(Operation::Delete { id, target })
            }
            tag => Err(Error::Decode(format!("unknown operation tag {}", tag))),
        }
    }
}

/// An immutable batch of operations exchanged between replicas
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    ops: Vec<Operation>,
}

impl Update {
    pub fn new(ops: Vec<Operation>) -> Self {
        Self { ops }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<Operation> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Highest counter per replica carried by this update
    pub fn covered(&self) -> StateVector {
        let mut sv = StateVector::new();
        for op in &self.ops {
            sv.observe(op.id());
        }
        sv
    }

    /// Concatenate updates, dropping repeated operation ids
    pub fn merge<I: IntoIterator<Item = Update>>(updates: I) -> Update {
        let mut seen = std::collections::HashSet::new();
        let mut ops = Vec::new();
        for update in updates {
            for op in update.ops {
                if seen.insert(op.id()) {
                    ops.push(op);
                }
            }
        }
        Update { ops }
    }
}

impl Encode for Update {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        write_var_u64(buf, self.ops.len() as u64);
        for op in &self.ops {
            op.encode(buf);
        }
    }
}

impl Decode for Update {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let count = read_var_len(buf)?;
        let mut ops = Vec::with_capacity(count);
        for _ in 0..count {
            ops.push(Operation::decode(buf)?);
        }
        Ok(Update { ops })
    }
}
