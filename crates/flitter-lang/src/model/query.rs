//! Tree-query predicates
//!
//! A [`Query`] matches nodes by kind and tags and drives the `Search`
//! instruction. Queries compose: `subquery` restricts matching to
//! descendants of a matched node, `altquery` provides an alternative.
//!
//! Queries also have a compact string syntax:
//!
//! ```text
//! query  := term ( '|' term )*          alternation
//! term   := atom ( '>' atom )*          descendant sub-query
//! atom   := ( '*' | kind )? ( '#' tag )* flags
//! flags  := '.'                          strict: all tags must match
//!         | '!'                          stop: do not descend into matches
//!         | '?'                          first: return only the first match
//! ```

use std::rc::Rc;

use crate::model::node::Node;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub kind: Option<Rc<str>>,
    pub tags: Vec<Rc<str>>,
    /// All tags must be present, rather than any.
    pub strict: bool,
    /// Do not descend into matched nodes.
    pub stop: bool,
    /// Return only the first match.
    pub first: bool,
    /// Applied to the descendants of matched nodes; when present the
    /// matched node itself is not a result.
    pub subquery: Option<Box<Query>>,
    /// Alternative predicate tried when this one does not match.
    pub altquery: Option<Box<Query>>,
}

impl Query {
    pub fn kind(kind: &str) -> Query {
        Query {
            kind: Some(Rc::from(kind)),
            ..Query::default()
        }
    }

    pub fn tagged(tag: &str) -> Query {
        Query {
            tags: vec![Rc::from(tag)],
            ..Query::default()
        }
    }

    /// Parse the string syntax described in the module docs; `None` for an
    /// empty or malformed query.
    pub fn parse(text: &str) -> Option<Query> {
        let mut terms = Vec::new();
        for part in text.split('|') {
            terms.push(parse_term(part)?);
        }
        let mut query = terms.pop()?;
        while let Some(mut term) = terms.pop() {
            term.altquery = Some(Box::new(query));
            query = term;
        }
        Some(query)
    }

    /// Does this predicate (ignoring `subquery`/`altquery`) accept the node?
    pub fn matches(&self, node: &Node) -> bool {
        if let Some(kind) = &self.kind {
            if *node.kind() != **kind {
                return false;
            }
        }
        if self.tags.is_empty() {
            return true;
        }
        if self.strict {
            self.tags.iter().all(|tag| node.has_tag(tag))
        } else {
            self.tags.iter().any(|tag| node.has_tag(tag))
        }
    }
}

fn parse_term(text: &str) -> Option<Query> {
    let mut atoms = Vec::new();
    for part in text.split('>') {
        atoms.push(parse_atom(part)?);
    }
    let mut query = atoms.pop()?;
    while let Some(mut atom) = atoms.pop() {
        atom.subquery = Some(Box::new(query));
        query = atom;
    }
    Some(query)
}

fn parse_atom(text: &str) -> Option<Query> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let mut query = Query::default();
    let mut rest = text;
    if !rest.starts_with(['#', '.', '!', '?']) {
        let end = rest
            .find(['#', '.', '!', '?'])
            .unwrap_or(rest.len());
        let kind = &rest[..end];
        if kind != "*" {
            query.kind = Some(Rc::from(kind));
        }
        rest = &rest[end..];
    }
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix('#') {
            let end = tail.find(['#', '.', '!', '?']).unwrap_or(tail.len());
            if end == 0 {
                return None;
            }
            query.tags.push(Rc::from(&tail[..end]));
            rest = &tail[end..];
        } else if let Some(tail) = rest.strip_prefix('.') {
            query.strict = true;
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix('!') {
            query.stop = true;
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix('?') {
            query.first = true;
            rest = tail;
        } else {
            return None;
        }
    }
    Some(query)
}

/// Depth-first document-order search of the descendants of `root`.
pub fn search(root: &Node, query: &Query) -> Vec<Node> {
    let mut results = Vec::new();
    let mut done = false;
    for child in root.children() {
        visit(&child, query, &mut results, &mut done);
        if done {
            break;
        }
    }
    results
}

fn visit(node: &Node, query: &Query, results: &mut Vec<Node>, done: &mut bool) {
    let mut alternative = Some(query);
    let mut matched = None;
    while let Some(q) = alternative {
        if q.matches(node) {
            matched = Some(q);
            break;
        }
        alternative = q.altquery.as_deref();
    }
    if let Some(q) = matched {
        match &q.subquery {
            Some(sub) => {
                for child in node.children() {
                    visit(&child, sub, results, done);
                    if *done {
                        return;
                    }
                }
            }
            None => {
                results.push(node.clone());
                if q.first {
                    *done = true;
                    return;
                }
            }
        }
        if q.stop {
            return;
        }
    }
    for child in node.children() {
        visit(&child, query, results, done);
        if *done {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Node {
        let root = Node::new("root");
        let group = Node::new("group");
        group.add_tag("spin");
        let dot = Node::new("dot");
        dot.add_tag("red");
        let inner = Node::new("dot");
        inner.add_tag("red");
        inner.add_tag("small");
        dot.append(inner);
        group.append(dot);
        root.append(group);
        root.append(Node::new("dot"));
        root
    }

    #[test]
    fn test_search_by_kind() {
        let root = tree();
        let results = search(&root, &Query::kind("dot"));
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn test_search_by_tag() {
        let root = tree();
        let results = search(&root, &Query::tagged("red"));
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_stop_does_not_descend_into_matches() {
        let root = tree();
        let query = Query {
            stop: true,
            ..Query::kind("dot")
        };
        let results = search(&root, &query);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_first_returns_single_match() {
        let root = tree();
        let query = Query {
            first: true,
            ..Query::kind("dot")
        };
        let results = search(&root, &query);
        assert_eq!(results.len(), 1);
        assert!(results[0].has_tag("red"));
    }

    #[test]
    fn test_strict_requires_all_tags() {
        let root = tree();
        let any = Query {
            tags: vec![Rc::from("red"), Rc::from("small")],
            ..Query::default()
        };
        assert_eq!(search(&root, &any).len(), 2);
        let strict = Query {
            strict: true,
            ..any
        };
        assert_eq!(search(&root, &strict).len(), 1);
    }

    #[test]
    fn test_subquery_matches_descendants() {
        let root = tree();
        let query = Query::parse("group>dot").unwrap();
        let results = search(&root, &query);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_alternation() {
        let root = tree();
        let query = Query::parse("group|#small").unwrap();
        let results = search(&root, &query);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_parse_flags_and_wildcard() {
        let query = Query::parse("*#red#small.!?").unwrap();
        assert_eq!(query.kind, None);
        assert_eq!(query.tags.len(), 2);
        assert!(query.strict && query.stop && query.first);
        assert_eq!(Query::parse(""), None);
        assert_eq!(Query::parse("dot").unwrap(), Query::kind("dot"));
    }
}
