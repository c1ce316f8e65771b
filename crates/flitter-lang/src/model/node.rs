//! Scene-graph nodes
//!
//! A [`Node`] is a cheap handle onto a mutable tree element: an interned
//! kind, a tag set, an insertion-ordered attribute map and a child list.
//! Nodes have at most one parent, held as a weak link so the tree stays
//! cycle-free. Attribute maps are copy-on-write: copies share the map until
//! the first mutation.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::{IndexMap, IndexSet};

use crate::model::vector::Vector;

#[derive(Clone)]
pub struct Node(Rc<RefCell<NodeData>>);

struct NodeData {
    kind: Rc<str>,
    tags: IndexSet<Rc<str>>,
    attributes: Rc<IndexMap<Rc<str>, Vector>>,
    children: Vec<Node>,
    parent: Weak<RefCell<NodeData>>,
}

impl Node {
    pub fn new(kind: &str) -> Node {
        Node(Rc::new(RefCell::new(NodeData {
            kind: Rc::from(kind),
            tags: IndexSet::new(),
            attributes: Rc::new(IndexMap::new()),
            children: Vec::new(),
            parent: Weak::new(),
        })))
    }

    pub fn kind(&self) -> Rc<str> {
        self.0.borrow().kind.clone()
    }

    /// Stable identity for hashing; valid while the node is alive.
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn ptr_eq(&self, other: &Node) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// A parentless copy sharing the attribute map (copy-on-write) with
    /// recursively copied children.
    pub fn copy(&self) -> Node {
        let data = self.0.borrow();
        let copied = Node(Rc::new(RefCell::new(NodeData {
            kind: data.kind.clone(),
            tags: data.tags.clone(),
            attributes: Rc::clone(&data.attributes),
            children: Vec::with_capacity(data.children.len()),
            parent: Weak::new(),
        })));
        for child in &data.children {
            let child = child.copy();
            child.0.borrow_mut().parent = Rc::downgrade(&copied.0);
            copied.0.borrow_mut().children.push(child);
        }
        copied
    }

    pub fn has_parent(&self) -> bool {
        self.0.borrow().parent.strong_count() > 0
    }

    pub fn parent(&self) -> Option<Node> {
        self.0.borrow().parent.upgrade().map(Node)
    }

    pub fn add_tag(&self, tag: &str) {
        self.0.borrow_mut().tags.insert(Rc::from(tag));
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.0.borrow().tags.contains(tag)
    }

    pub fn tags(&self) -> Vec<Rc<str>> {
        self.0.borrow().tags.iter().cloned().collect()
    }

    /// Set (or, for a `null` value, remove) an attribute. Triggers the
    /// copy-on-write clone when the map is shared with another node.
    pub fn set_attribute(&self, name: &str, value: Vector) {
        let mut data = self.0.borrow_mut();
        let attributes = Rc::make_mut(&mut data.attributes);
        if value.is_empty() {
            attributes.shift_remove(name);
        } else {
            attributes.insert(Rc::from(name), value);
        }
    }

    pub fn get_attribute(&self, name: &str) -> Option<Vector> {
        self.0.borrow().attributes.get(name).cloned()
    }

    pub fn attributes(&self) -> Vec<(Rc<str>, Vector)> {
        self.0
            .borrow()
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// True while the attribute map is shared with another node.
    pub fn attributes_shared(&self) -> bool {
        Rc::strong_count(&self.0.borrow().attributes) > 1
    }

    /// Attach a child at the end. A child that already has a parent is
    /// attached as a copy.
    pub fn append(&self, child: Node) {
        let child = if child.has_parent() { child.copy() } else { child };
        child.0.borrow_mut().parent = Rc::downgrade(&self.0);
        self.0.borrow_mut().children.push(child);
    }

    /// Attach a child at the front; same re-attachment rule as [`append`].
    ///
    /// [`append`]: Node::append
    pub fn insert(&self, child: Node) {
        let child = if child.has_parent() { child.copy() } else { child };
        child.0.borrow_mut().parent = Rc::downgrade(&self.0);
        self.0.borrow_mut().children.insert(0, child);
    }

    /// Attach a parentless child at the end; silently skip a child that is
    /// already owned elsewhere.
    pub fn append_root(&self, child: &Node) {
        if !child.has_parent() {
            child.0.borrow_mut().parent = Rc::downgrade(&self.0);
            self.0.borrow_mut().children.push(child.clone());
        }
    }

    pub fn remove(&self, child: &Node) {
        let mut data = self.0.borrow_mut();
        if let Some(position) = data.children.iter().position(|c| c.ptr_eq(child)) {
            let removed = data.children.remove(position);
            removed.0.borrow_mut().parent = Weak::new();
        }
    }

    pub fn children(&self) -> Vec<Node> {
        self.0.borrow().children.clone()
    }

    pub fn child_count(&self) -> usize {
        self.0.borrow().children.len()
    }

    /// Structural equality: kind, tags, attributes and children, ignoring
    /// node identity.
    pub fn structure_eq(&self, other: &Node) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let a = self.0.borrow();
        let b = other.0.borrow();
        a.kind == b.kind
            && a.tags == b.tags
            && a.attributes == b.attributes
            && a.children.len() == b.children.len()
            && a.children
                .iter()
                .zip(b.children.iter())
                .all(|(x, y)| x.structure_eq(y))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.0.borrow();
        write!(f, "!{}", data.kind)?;
        for tag in &data.tags {
            write!(f, " #{}", tag)?;
        }
        for (name, value) in data.attributes.iter() {
            write!(f, " {}={}", name, value)?;
        }
        if !data.children.is_empty() {
            write!(f, " {{")?;
            for child in &data.children {
                write!(f, " {}", child)?;
            }
            write!(f, " }}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributes_preserve_insertion_order() {
        let node = Node::new("shape");
        node.set_attribute("size", Vector::from(2.0));
        node.set_attribute("color", Vector::from(1.0));
        let names: Vec<_> = node.attributes().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec![Rc::from("size"), Rc::from("color")]);
    }

    #[test]
    fn test_null_attribute_removes() {
        let node = Node::new("shape");
        node.set_attribute("size", Vector::from(2.0));
        node.set_attribute("size", Vector::null());
        assert!(node.get_attribute("size").is_none());
    }

    #[test]
    fn test_copy_shares_attributes_until_mutation() {
        let node = Node::new("shape");
        node.set_attribute("size", Vector::from(2.0));
        let copied = node.copy();
        assert!(copied.attributes_shared());
        copied.set_attribute("size", Vector::from(3.0));
        assert!(!copied.attributes_shared());
        assert_eq!(node.get_attribute("size"), Some(Vector::from(2.0)));
        assert_eq!(copied.get_attribute("size"), Some(Vector::from(3.0)));
    }

    #[test]
    fn test_append_owned_child_attaches_copy() {
        let first = Node::new("first");
        let second = Node::new("second");
        let child = Node::new("child");
        first.append(child.clone());
        second.append(child.clone());
        assert!(first.children()[0].ptr_eq(&child));
        assert!(!second.children()[0].ptr_eq(&child));
        assert!(second.children()[0].structure_eq(&child));
    }

    #[test]
    fn test_append_root_skips_owned_child() {
        let root = Node::new("root");
        let other = Node::new("other");
        let child = Node::new("child");
        other.append(child.clone());
        root.append_root(&child);
        assert_eq!(root.child_count(), 0);
        root.append_root(&Node::new("fresh"));
        assert_eq!(root.child_count(), 1);
    }

    #[test]
    fn test_remove_clears_parent() {
        let parent = Node::new("parent");
        let child = Node::new("child");
        parent.append(child.clone());
        assert!(child.has_parent());
        parent.remove(&child);
        assert!(!child.has_parent());
        assert_eq!(parent.child_count(), 0);
    }

    #[test]
    fn test_copy_is_deep_for_children() {
        let parent = Node::new("parent");
        let child = Node::new("child");
        child.set_attribute("x", Vector::from(1.0));
        parent.append(child);
        let copied = parent.copy();
        copied.children()[0].set_attribute("x", Vector::from(9.0));
        assert_eq!(
            parent.children()[0].get_attribute("x"),
            Some(Vector::from(1.0))
        );
    }
}
