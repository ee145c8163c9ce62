//! Detection of algebraic loops in the port graph.
//!
//! Edges run along every wire and, inside each item, from its input ports
//! to its output port. Integrals and accounting tables contribute no
//! internal edges: their output is defined over time, so a loop through
//! them is legitimate feedback.

use std::collections::BTreeMap;

use crate::graph::{ItemId, Model, PortId};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

struct CycleDetector<'a> {
    model: &'a Model,
    edges: BTreeMap<PortId, Vec<PortId>>,
    marks: BTreeMap<PortId, Mark>,
}

impl<'a> CycleDetector<'a> {
    fn new(model: &'a Model) -> Self {
        let mut edges: BTreeMap<PortId, Vec<PortId>> = BTreeMap::new();
        for (_, wire) in model.wires() {
            edges.entry(wire.from).or_default().push(wire.to);
        }
        for (_, item) in model.items() {
            if item.is_feedback_boundary() {
                continue;
            }
            if let Some(out) = item.output {
                for input in &item.inputs {
                    edges.entry(*input).or_default().push(out);
                }
            }
        }
        Self {
            model,
            edges,
            marks: BTreeMap::new(),
        }
    }

    /// Depth-first search from `root` with an explicit stack of
    /// `(port, next edge index)` frames. Returns the port closing a loop.
    fn visit(&mut self, root: PortId) -> Option<PortId> {
        let edges = &self.edges;
        let mut stack = vec![(root, 0usize)];
        self.marks.insert(root, Mark::OnStack);
        while let Some(frame) = stack.last_mut() {
            let (port, next) = *frame;
            let out = edges.get(&port).map(Vec::as_slice).unwrap_or(&[]);
            let Some(&to) = out.get(next) else {
                self.marks.insert(port, Mark::Done);
                stack.pop();
                continue;
            };
            frame.1 += 1;
            match self.marks.get(&to) {
                Some(Mark::OnStack) => return Some(to),
                Some(Mark::Done) => {}
                None => {
                    self.marks.insert(to, Mark::OnStack);
                    stack.push((to, 0));
                }
            }
        }
        None
    }

    fn run(&mut self) -> Option<ItemId> {
        let roots: Vec<PortId> = self
            .model
            .items()
            .filter_map(|(_, item)| item.output)
            .collect();
        for root in roots {
            if self.marks.contains_key(&root) {
                continue;
            }
            if let Some(port) = self.visit(root) {
                return self.model.port(port).map(|p| p.item);
            }
        }
        None
    }
}

/// An item on an illegal cycle, if the model has one.
pub fn find_cycle(model: &Model) -> Option<ItemId> {
    CycleDetector::new(model).run()
}

pub fn cycle_check(model: &Model) -> bool {
    find_cycle(model).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OperationType;

    #[test]
    fn empty_and_edgeless_models_are_acyclic() {
        let mut m = Model::new();
        assert!(!cycle_check(&m));
        m.add_constant(Model::ROOT, 1.0).unwrap();
        m.add_operation(Model::ROOT, OperationType::Sin).unwrap();
        assert!(!cycle_check(&m));
    }

    #[test]
    fn loop_through_operations_is_found() {
        let mut m = Model::new();
        let a = m.add_operation(Model::ROOT, OperationType::Add).unwrap();
        let b = m.add_operation(Model::ROOT, OperationType::Exp).unwrap();
        m.connect(a, b, 0).unwrap();
        m.connect(b, a, 1).unwrap();
        let item = find_cycle(&m).unwrap();
        assert!(item == a || item == b);
    }

    #[test]
    fn loop_through_integral_is_feedback() {
        let mut m = Model::new();
        let int = m.add_operation(Model::ROOT, OperationType::Integrate).unwrap();
        let neg = m.add_operation(Model::ROOT, OperationType::Multiply).unwrap();
        let k = m.add_constant(Model::ROOT, -1.0).unwrap();
        m.connect(int, neg, 0).unwrap();
        m.connect(k, neg, 1).unwrap();
        m.connect(neg, int, 0).unwrap();
        assert!(!cycle_check(&m));
    }

    #[test]
    fn long_chains_are_searched_without_recursion() {
        let mut m = Model::new();
        let first = m.add_operation(Model::ROOT, OperationType::Sin).unwrap();
        let mut last = first;
        for _ in 0..20_000 {
            let next = m.add_operation(Model::ROOT, OperationType::Sin).unwrap();
            m.connect(last, next, 0).unwrap();
            last = next;
        }
        assert!(!cycle_check(&m));
        m.connect(last, first, 0).unwrap();
        assert!(cycle_check(&m));
    }
}
