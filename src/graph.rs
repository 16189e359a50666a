//! Object-graph deduplication.
//!
//! Documents are loaded into an arena ([`ObjectGraph`]) where containers are
//! nodes and every slot either holds a scalar or points at a node. Pointing two
//! slots at the same node is how a graph shares (or cycles back to) an entity;
//! nothing is aliased through Rust references.
//!
//! * [`ObjectGraph::scan`] indexes every identity-bearing object by its `id`
//!   and records each location it occupies.
//! * [`ObjectGraph::merge`] unifies partial copies of one entity.
//! * [`ObjectGraph::expand`] merges every identity group in place.
//! * [`ObjectGraph::compact`] merges, externalizes one canonical copy per
//!   identity under [`REFS_KEY`], and severs cycles.

use core::hash::BuildHasherDefault;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use roaring::RoaringBitmap;
use seahash::SeaHasher;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::record::IDENTITY;
use crate::{DocstoreError, Result};

pub type NodeId = u32;
pub type NodeHasher = BuildHasherDefault<SeaHasher>;

/// Root attribute holding the externalized canonical copies.
pub const REFS_KEY: &str = "$refs";

const MERGE_PASSES: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Value(Value),
    Node(NodeId),
}

impl Slot {
    pub fn null() -> Self {
        Slot::Value(Value::Null)
    }
    pub fn string(s: &str) -> Self {
        Slot::Value(Value::String(s.to_string()))
    }
    // falsy: missing, null, false, 0, ""
    fn truthy(&self) -> bool {
        match self {
            Slot::Node(_) => true,
            Slot::Value(Value::Null) => false,
            Slot::Value(Value::Bool(b)) => *b,
            Slot::Value(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Slot::Value(Value::String(s)) => !s.is_empty(),
            Slot::Value(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Object(Vec<(String, Slot)>),
    Array(Vec<Slot>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SlotKey {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Root,
    Slot { parent: NodeId, key: SlotKey },
}

// ------------- VariableStore -------------
/// Append-only list with lookup by identity of the stored item.
#[derive(Debug)]
pub struct VariableStore<T: Eq + Hash + Copy> {
    items: Vec<T>,
    index: HashMap<T, usize, NodeHasher>,
}

impl<T: Eq + Hash + Copy> VariableStore<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::default(),
        }
    }
    pub fn search(&self, item: &T) -> Option<usize> {
        self.index.get(item).copied()
    }
    /// Slot of `item`, and whether it was already stored.
    pub fn save_if_missing(&mut self, item: T) -> (usize, bool) {
        if let Some(slot) = self.search(&item) {
            return (slot, true);
        }
        self.items.push(item);
        self.index.insert(item, self.items.len() - 1);
        (self.items.len() - 1, false)
    }
    pub fn get(&self, slot: usize) -> Option<T> {
        self.items.get(slot).copied()
    }
    pub fn len(&self) -> usize {
        self.items.len()
    }
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Eq + Hash + Copy> Default for VariableStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ------------- Cursors -------------
/// Every location currently holding one node.
#[derive(Debug, Clone, PartialEq)]
pub struct InternalCursor {
    identity: Option<String>,
    node: NodeId,
    locations: Vec<Location>,
}

impl InternalCursor {
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }
    pub fn node(&self) -> NodeId {
        self.node
    }
    pub fn locations(&self) -> &[Location] {
        &self.locations
    }
    /// Writes `slot` at every location of this cursor.
    pub fn write(&self, graph: &mut ObjectGraph, slot: Slot) {
        for location in &self.locations {
            graph.put(location, slot.clone());
        }
    }
}

#[derive(Debug, Default)]
pub struct Cache {
    order: Vec<String>,
    entries: HashMap<String, Vec<InternalCursor>>,
    by_node: HashMap<NodeId, (String, usize), NodeHasher>,
    circular: Vec<InternalCursor>,
}

impl Cache {
    fn register(&mut self, identity: &str, node: NodeId, location: Option<Location>) {
        let (identity, slot) = match self.by_node.get(&node) {
            Some((identity, slot)) => (identity.clone(), *slot),
            None => {
                let cursors = self.entries.entry(identity.to_string()).or_insert_with(|| {
                    self.order.push(identity.to_string());
                    Vec::new()
                });
                cursors.push(InternalCursor {
                    identity: Some(identity.to_string()),
                    node,
                    locations: Vec::new(),
                });
                let slot = cursors.len() - 1;
                self.by_node.insert(node, (identity.to_string(), slot));
                (identity.to_string(), slot)
            }
        };
        if let (Some(location), Some(cursors)) = (location, self.entries.get_mut(&identity)) {
            cursors[slot].locations.push(location);
        }
    }
    fn register_circular(&mut self, identity: Option<String>, node: NodeId, location: Location) {
        match self.circular.iter_mut().find(|c| c.node == node) {
            Some(cursor) => cursor.locations.push(location),
            None => self.circular.push(InternalCursor {
                identity,
                node,
                locations: vec![location],
            }),
        }
    }
    /// Identities in discovery order.
    pub fn identities(&self) -> &[String] {
        &self.order
    }
    pub fn cursors(&self, identity: &str) -> &[InternalCursor] {
        self.entries.get(identity).map(Vec::as_slice).unwrap_or(&[])
    }
    /// Distinct nodes per identity, in discovery order.
    pub fn groups(&self) -> Vec<Vec<NodeId>> {
        self.order
            .iter()
            .map(|identity| self.cursors(identity).iter().map(|c| c.node).collect())
            .collect()
    }
    /// Cursors whose locations point back at an ancestor.
    pub fn circular(&self) -> &[InternalCursor] {
        &self.circular
    }
}

// ------------- ObjectGraph -------------
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectGraph {
    nodes: Vec<Node>,
    root: Slot,
}

impl Default for ObjectGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectGraph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: Slot::null(),
        }
    }

    pub fn from_value(value: &Value) -> Self {
        let mut graph = Self::new();
        graph.root = graph.load(value);
        graph
    }

    fn load(&mut self, value: &Value) -> Slot {
        match value {
            Value::Object(map) => {
                let fields = map.iter().map(|(k, v)| (k.clone(), self.load(v))).collect();
                Slot::Node(self.alloc(Node::Object(fields)))
            }
            Value::Array(items) => {
                let items = items.iter().map(|v| self.load(v)).collect();
                Slot::Node(self.alloc(Node::Array(items)))
            }
            scalar => Slot::Value(scalar.clone()),
        }
    }

    /// Materializes the graph as a tree. Fails on cycles.
    pub fn to_value(&self) -> Result<Value> {
        let mut ancestors = RoaringBitmap::new();
        self.slot_value(&self.root, &mut ancestors)
    }

    pub fn node_value(&self, node: NodeId) -> Result<Value> {
        self.slot_value(&Slot::Node(node), &mut RoaringBitmap::new())
    }

    fn slot_value(&self, slot: &Slot, ancestors: &mut RoaringBitmap) -> Result<Value> {
        let id = match slot {
            Slot::Value(value) => return Ok(value.clone()),
            Slot::Node(id) => *id,
        };
        if !ancestors.insert(id) {
            return Err(DocstoreError::Graph(format!("cycle through node {id}")));
        }
        let value = match self.node(id)? {
            Node::Object(fields) => {
                let mut map = Map::new();
                for (key, slot) in fields {
                    map.insert(key.clone(), self.slot_value(slot, ancestors)?);
                }
                Value::Object(map)
            }
            Node::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for slot in items {
                    values.push(self.slot_value(slot, ancestors)?);
                }
                Value::Array(values)
            }
        };
        ancestors.remove(id);
        Ok(value)
    }

    // ---- building ----

    fn alloc(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        (self.nodes.len() - 1) as NodeId
    }
    pub fn add_object(&mut self, fields: Vec<(String, Slot)>) -> NodeId {
        self.alloc(Node::Object(fields))
    }
    pub fn add_array(&mut self, items: Vec<Slot>) -> NodeId {
        self.alloc(Node::Array(items))
    }
    pub fn set_root(&mut self, slot: Slot) {
        self.root = slot;
    }
    pub fn root(&self) -> &Slot {
        &self.root
    }
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id as usize)
            .ok_or_else(|| DocstoreError::Graph(format!("unknown node {id}")))
    }
    pub fn set_field(&mut self, node: NodeId, key: &str, slot: Slot) {
        if let Some(Node::Object(fields)) = self.nodes.get_mut(node as usize) {
            match fields.iter_mut().find(|(k, _)| k == key) {
                Some((_, existing)) => *existing = slot,
                None => fields.push((key.to_string(), slot)),
            }
        }
    }
    pub fn push(&mut self, node: NodeId, slot: Slot) {
        if let Some(Node::Array(items)) = self.nodes.get_mut(node as usize) {
            items.push(slot);
        }
    }
    pub fn field(&self, node: NodeId, key: &str) -> Option<&Slot> {
        match self.nodes.get(node as usize)? {
            Node::Object(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, s)| s),
            Node::Array(_) => None,
        }
    }
    fn remove_field(&mut self, node: NodeId, key: &str) -> Option<Slot> {
        match self.nodes.get_mut(node as usize)? {
            Node::Object(fields) => {
                let position = fields.iter().position(|(k, _)| k == key)?;
                Some(fields.remove(position).1)
            }
            Node::Array(_) => None,
        }
    }
    fn put(&mut self, location: &Location, slot: Slot) {
        match location {
            Location::Root => self.root = slot,
            Location::Slot { parent, key: SlotKey::Field(key) } => self.set_field(*parent, key, slot),
            Location::Slot { parent, key: SlotKey::Index(index) } => {
                if let Some(Node::Array(items)) = self.nodes.get_mut(*parent as usize) {
                    if let Some(item) = items.get_mut(*index) {
                        *item = slot;
                    }
                }
            }
        }
    }
    fn is_object(&self, node: NodeId) -> bool {
        matches!(self.nodes.get(node as usize), Some(Node::Object(_)))
    }
    fn is_array(&self, node: NodeId) -> bool {
        matches!(self.nodes.get(node as usize), Some(Node::Array(_)))
    }
    /// The `id` of an object node, when it carries one.
    pub fn identity(&self, node: NodeId) -> Option<&str> {
        match self.field(node, IDENTITY)? {
            Slot::Value(Value::String(id)) if !id.is_empty() => Some(id),
            _ => None,
        }
    }
    fn children(&self, node: NodeId) -> Vec<(SlotKey, Slot)> {
        match self.nodes.get(node as usize) {
            Some(Node::Object(fields)) => fields
                .iter()
                .map(|(k, s)| (SlotKey::Field(k.clone()), s.clone()))
                .collect(),
            Some(Node::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, s)| (SlotKey::Index(i), s.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Copies everything reachable from `start`, preserving sharing and cycles
    /// within the copy.
    pub fn deep_copy(&mut self, start: NodeId) -> NodeId {
        let mut store = VariableStore::new();
        let mut copies = Vec::new();
        self.copy_node(start, &mut store, &mut copies)
    }

    fn copy_node(&mut self, id: NodeId, store: &mut VariableStore<NodeId>, copies: &mut Vec<NodeId>) -> NodeId {
        if let Some(slot) = store.search(&id) {
            return copies[slot];
        }
        let copy = self.alloc(Node::Array(Vec::new()));
        store.save_if_missing(id);
        copies.push(copy);
        let node = match self.nodes.get(id as usize) {
            Some(node) => node.clone(),
            None => return copy,
        };
        let copied = match node {
            Node::Object(fields) => Node::Object(
                fields
                    .into_iter()
                    .map(|(k, s)| (k, self.copy_slot(s, store, copies)))
                    .collect(),
            ),
            Node::Array(items) => Node::Array(
                items
                    .into_iter()
                    .map(|s| self.copy_slot(s, store, copies))
                    .collect(),
            ),
        };
        self.nodes[copy as usize] = copied;
        copy
    }

    fn copy_slot(&mut self, slot: Slot, store: &mut VariableStore<NodeId>, copies: &mut Vec<NodeId>) -> Slot {
        match slot {
            Slot::Node(id) => Slot::Node(self.copy_node(id, store, copies)),
            value => value,
        }
    }

    // ---- scan ----

    /// Depth-first index of identity-bearing objects. With `track_cursors`
    /// every location is recorded and back edges are collected as circular
    /// cursors.
    pub fn scan(&self, track_cursors: bool) -> Cache {
        let mut cache = Cache::default();
        let mut ancestors = RoaringBitmap::new();
        let mut visited = RoaringBitmap::new();
        let root = self.root.clone();
        self.scan_slot(&root, Location::Root, &mut ancestors, &mut visited, &mut cache, track_cursors);
        cache
    }

    fn scan_slot(
        &self,
        slot: &Slot,
        location: Location,
        ancestors: &mut RoaringBitmap,
        visited: &mut RoaringBitmap,
        cache: &mut Cache,
        track: bool,
    ) {
        let Slot::Node(id) = slot else {
            return;
        };
        let id = *id;
        if ancestors.contains(id) {
            if track {
                cache.register_circular(self.identity(id).map(str::to_string), id, location);
            }
            return;
        }
        if let Some(identity) = self.identity(id) {
            cache.register(identity, id, track.then_some(location));
        }
        if !visited.insert(id) {
            return;
        }
        ancestors.insert(id);
        for (key, child) in self.children(id) {
            let location = Location::Slot { parent: id, key };
            self.scan_slot(&child, location, ancestors, visited, cache, track);
        }
        ancestors.remove(id);
    }

    // ---- merge ----

    /// Two-pass symmetric union of partial copies of one entity.
    pub fn merge(&mut self, partials: &[NodeId]) {
        if partials.len() < 2 {
            return;
        }
        let first = partials[0];
        for _ in 0..MERGE_PASSES {
            for &other in &partials[1..] {
                let mut active = HashSet::new();
                self.union(first, other, &mut active);
            }
        }
    }

    fn union(&mut self, a: NodeId, b: NodeId, active: &mut HashSet<(NodeId, NodeId)>) {
        if a == b || !self.is_object(a) || !self.is_object(b) || !active.insert((a, b)) {
            return;
        }
        for (key, incoming) in self.children(b) {
            let SlotKey::Field(key) = key else { continue };
            match self.field(a, &key).cloned() {
                None => self.adopt_field(a, &key, incoming),
                Some(existing) if existing == incoming => {}
                Some(existing) => self.resolve(a, b, &key, existing, incoming, active),
            }
        }
        for (key, outgoing) in self.children(a) {
            let SlotKey::Field(key) = key else { continue };
            if self.field(b, &key).is_none() {
                self.adopt_field(b, &key, outgoing);
            }
        }
        active.remove(&(a, b));
    }

    /// Sets `key` on `target` unless the slot leads back to `target`, as when a
    /// nested copy shares an ancestor's identity.
    fn adopt_field(&mut self, target: NodeId, key: &str, slot: Slot) {
        if self.closes_cycle(&slot, target) {
            debug!(node = target, key, "skipped a field that would nest its own owner");
            return;
        }
        self.set_field(target, key, slot);
    }

    fn closes_cycle(&self, slot: &Slot, target: NodeId) -> bool {
        let Slot::Node(start) = slot else {
            return false;
        };
        let mut visited = RoaringBitmap::new();
        let mut stack = vec![*start];
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            for (_, child) in self.children(id) {
                if let Slot::Node(child) = child {
                    stack.push(child);
                }
            }
        }
        false
    }

    fn resolve(
        &mut self,
        a: NodeId,
        b: NodeId,
        key: &str,
        left: Slot,
        right: Slot,
        active: &mut HashSet<(NodeId, NodeId)>,
    ) {
        match (left.truthy(), right.truthy()) {
            (false, true) => return self.adopt_field(a, key, right),
            (true, false) => return self.adopt_field(b, key, left),
            (false, false) => return,
            (true, true) => {}
        }
        match (&left, &right) {
            (Slot::Node(x), Slot::Node(y)) if self.is_array(*x) && self.is_array(*y) => {
                let merged = self.union_arrays(*x, *y);
                for target in [*x, *y] {
                    let items = self.adopt_items(target, &merged);
                    self.nodes[target as usize] = Node::Array(items);
                }
            }
            (Slot::Node(x), Slot::Node(y)) if self.is_object(*x) && self.is_object(*y) => {
                // two identities are references to other entities, not inline copies
                if self.identity(*x).is_none() || self.identity(*y).is_none() {
                    self.union(*x, *y, active);
                }
            }
            _ => {
                warn!(
                    identity = self.identity(a).unwrap_or_default(),
                    key,
                    left = ?left,
                    right = ?right,
                    "merge conflict left unresolved"
                );
            }
        }
    }

    fn union_arrays(&self, x: NodeId, y: NodeId) -> Vec<Slot> {
        let mut merged = match self.nodes.get(x as usize) {
            Some(Node::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        if let Some(Node::Array(items)) = self.nodes.get(y as usize) {
            for item in items {
                if !merged.iter().any(|existing| self.same_element(existing, item)) {
                    merged.push(item.clone());
                }
            }
        }
        merged
    }

    /// The merged items `target` may hold: its own plus those that do not
    /// lead back to it.
    fn adopt_items(&self, target: NodeId, merged: &[Slot]) -> Vec<Slot> {
        let own = match self.nodes.get(target as usize) {
            Some(Node::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        merged
            .iter()
            .filter(|item| own.contains(item) || !self.closes_cycle(item, target))
            .cloned()
            .collect()
    }

    fn same_element(&self, left: &Slot, right: &Slot) -> bool {
        match (left, right) {
            (Slot::Value(l), Slot::Value(r)) => l == r,
            (Slot::Node(l), Slot::Node(r)) if l == r => true,
            (Slot::Node(l), Slot::Node(r)) => match (self.identity(*l), self.identity(*r)) {
                (Some(li), Some(ri)) => li == ri,
                (None, None) => match (self.node_value(*l), self.node_value(*r)) {
                    (Ok(lv), Ok(rv)) => lv == rv,
                    _ => false,
                },
                _ => false,
            },
            _ => false,
        }
    }

    // ---- expand ----

    /// Copy-on-write [`ObjectGraph::expand_in_place`].
    pub fn expand(&self) -> ObjectGraph {
        let mut graph = self.clone();
        graph.expand_in_place();
        graph
    }

    /// Inlines an externalized [`REFS_KEY`] map (when present) and merges every
    /// identity group so each occurrence shows the unified shape.
    pub fn expand_in_place(&mut self) {
        self.inline_refs();
        let cache = self.scan(false);
        for group in cache.groups() {
            self.merge(&group);
        }
        debug!(identities = cache.identities().len(), "expanded graph");
    }

    fn inline_refs(&mut self) {
        let Slot::Node(root) = self.root else {
            return;
        };
        let refs = match self.remove_field(root, REFS_KEY) {
            Some(Slot::Node(refs)) if self.is_object(refs) => refs,
            Some(other) => {
                self.set_field(root, REFS_KEY, other);
                return;
            }
            None => return,
        };
        let mut visited = RoaringBitmap::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            for (key, slot) in self.children(id) {
                match (&key, &slot) {
                    (SlotKey::Field(field), Slot::Value(Value::String(identity))) if field == identity => {
                        if let Some(canonical) = self.field(refs, identity).cloned() {
                            self.set_field(id, field, canonical);
                        }
                    }
                    (_, Slot::Node(child)) => stack.push(*child),
                    _ => {}
                }
            }
        }
    }

    // ---- compact ----

    /// Copy-on-write [`ObjectGraph::compact_in_place`].
    pub fn compact(&self) -> ObjectGraph {
        let mut graph = self.clone();
        graph.compact_in_place();
        graph
    }

    pub fn compact_in_place(&mut self) {
        for group in self.scan(false).groups() {
            self.merge(&group);
        }
        // merging rewrites array contents, so locations are taken afterwards
        let cache = self.scan(true);
        let root_identity = match self.root {
            Slot::Node(root) => self.identity(root).map(str::to_string),
            Slot::Value(_) => None,
        };

        // one canonical snapshot per identity, the root's own left out
        let mut canonical: Vec<(String, NodeId)> = Vec::new();
        for identity in cache.identities() {
            if root_identity.as_deref() == Some(identity.as_str()) {
                continue;
            }
            if let Some(cursor) = cache.cursors(identity).first() {
                let snapshot = self.deep_copy(cursor.node());
                canonical.push((identity.clone(), snapshot));
            }
        }
        let lookup: HashMap<&str, NodeId> = canonical.iter().map(|(i, n)| (i.as_str(), *n)).collect();

        for identity in cache.identities() {
            for cursor in cache.cursors(identity) {
                for location in cursor.locations() {
                    let Location::Slot { key, .. } = location else { continue };
                    let replacement = match (key, lookup.get(identity.as_str())) {
                        (SlotKey::Field(field), Some(_)) if field == identity => Slot::string(identity),
                        (SlotKey::Field(field), None) if field == identity => {
                            let stub = self.add_object(vec![(IDENTITY.to_string(), Slot::string(identity))]);
                            Slot::Node(stub)
                        }
                        (_, Some(&snapshot)) => Slot::Node(self.deep_copy(snapshot)),
                        (_, None) => continue,
                    };
                    self.put(location, replacement);
                }
            }
        }

        if let (Slot::Node(root), false) = (self.root.clone(), canonical.is_empty()) {
            if self.is_object(root) {
                let fields = canonical
                    .iter()
                    .map(|(identity, node)| (identity.clone(), Slot::Node(*node)))
                    .collect();
                let refs = self.add_object(fields);
                self.set_field(root, REFS_KEY, Slot::Node(refs));
            }
        }

        let rescan = self.scan(true);
        for cursor in rescan.circular() {
            let replacement = match cursor.identity() {
                Some(identity) => Slot::string(identity),
                None => Slot::null(),
            };
            cursor.write(self, replacement);
        }
        debug!(
            identities = canonical.len(),
            severed = rescan.circular().len(),
            "compacted graph"
        );
    }
}

// ------------- Value helpers -------------
/// Merges partial copies given as plain values.
pub fn merge_values(partials: &[Value]) -> Result<Vec<Value>> {
    let mut graph = ObjectGraph::new();
    let nodes: Vec<NodeId> = partials
        .iter()
        .filter_map(|partial| match graph.load(partial) {
            Slot::Node(id) => Some(id),
            Slot::Value(_) => None,
        })
        .collect();
    graph.merge(&nodes);
    nodes.into_iter().map(|id| graph.node_value(id)).collect()
}

pub fn expand_value(document: &Value) -> Result<Value> {
    ObjectGraph::from_value(document).expand().to_value()
}

pub fn compact_value(document: &Value) -> Result<Value> {
    ObjectGraph::from_value(document).compact().to_value()
}
