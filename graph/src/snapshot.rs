// Copyright 2026 Graft project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use fnv::FnvHashMap as HashMap;

use crate::node::{Key, NodeOutput};
use crate::version::Version;

///
/// A read-only, consistent view of a completed build, for use by downstream consumers such as
/// query engines and reporters.
///
/// A Snapshot is materialized in a single pass under the graph lock, from the reachable closure
/// of the roots it was requested for: it contains only nodes with an observable completed output
/// in the requesting session, and only edges between two such nodes. Every edge it reports is
/// therefore between two nodes whose outputs it can also produce.
///
pub struct Snapshot<K: Key> {
    version: Version,
    outputs: HashMap<K, NodeOutput<K>>,
    direct_deps: HashMap<K, Vec<K>>,
    reverse_deps: HashMap<K, Vec<K>>,
}

impl<K: Key> Snapshot<K> {
    pub(crate) fn new(
        version: Version,
        outputs: HashMap<K, NodeOutput<K>>,
        direct_deps: HashMap<K, Vec<K>>,
        reverse_deps: HashMap<K, Vec<K>>,
    ) -> Snapshot<K> {
        Snapshot {
            version,
            outputs,
            direct_deps,
            reverse_deps,
        }
    }

    ///
    /// The graph version this Snapshot was frozen at.
    ///
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn get_value(&self, node: &K) -> Option<&NodeOutput<K>> {
        self.outputs.get(node)
    }

    ///
    /// The direct deps of the given node, in the order its last run requested them.
    ///
    pub fn get_direct_deps(&self, node: &K) -> &[K] {
        self.direct_deps.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get_reverse_deps(&self, node: &K) -> &[K] {
        self.reverse_deps
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &K> {
        self.outputs.keys()
    }
}
