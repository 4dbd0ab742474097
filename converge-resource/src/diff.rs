//! Attribute diff engine.
//!
//! [`diff`] compares the current state of a resource with its desired
//! configuration and produces a [`ChangeSet`]. At every level of the tree
//! forces-replace scalars are compared first, then the remaining scalars, then
//! block lists, so that a replacement is found before any in-place change is
//! computed. The result does not depend on traversal order; only the point at
//! which a replacement short-circuits does.

use std::{
    collections::BTreeSet,
    fmt::{self, Display},
    ops::ControlFlow,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    schema::{AttributeDef, AttributeType, Nesting, Schema},
    value::{AttributePath, AttributeValue, Attributes, PathSegment},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Add,
    Modify,
    Remove,
    /// Destroy the resource and create it again.
    ReplaceWhole,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub path: AttributePath,
    pub old: Option<AttributeValue>,
    pub new: Option<AttributeValue>,
    pub kind: ChangeKind,
}

impl Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<AttributeValue>| match v {
            Some(v) => v.to_string(),
            None => "null".to_string(),
        };
        match self.kind {
            ChangeKind::Add => write!(f, "+ {} = {}", self.path, show(&self.new)),
            ChangeKind::Remove => write!(f, "- {} = {}", self.path, show(&self.old)),
            ChangeKind::Modify => write!(
                f,
                "~ {}: {} -> {}",
                self.path,
                show(&self.old),
                show(&self.new)
            ),
            ChangeKind::ReplaceWhole => write!(
                f,
                "-/+ {}: {} -> {} (forces replacement)",
                self.path,
                show(&self.old),
                show(&self.new)
            ),
        }
    }
}

/// Ordered attribute-level differences between current and desired state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }

    /// Whether this change set collapsed into a single replacement.
    pub fn is_replace(&self) -> bool {
        matches!(self.changes.as_slice(), [c] if c.kind == ChangeKind::ReplaceWhole)
    }

    /// Names of the top-level attributes touched by this change set.
    pub fn changed_attributes(&self) -> BTreeSet<String> {
        self.changes
            .iter()
            .filter_map(|c| c.path.root_attribute().map(str::to_string))
            .collect()
    }

    /// `new` restricted to the top-level attributes this change set touches.
    pub fn changed_subtree(&self, new: &Attributes) -> Attributes {
        let changed = self.changed_attributes();
        new.iter()
            .filter(|(name, _)| changed.contains(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Apply the in-place changes to `base`. Backends use this to compute the
    /// state that an update should produce.
    pub fn apply(&self, base: &Attributes) -> Attributes {
        let mut out = base.clone();
        let mut positional_removals = Vec::new();
        for change in &self.changes {
            match change.path.segments() {
                [PathSegment::Attribute(name)] => apply_attribute_change(&mut out, name, change),
                [PathSegment::Attribute(name), PathSegment::Index(i)] => match change.kind {
                    ChangeKind::Remove => positional_removals.push((name.clone(), *i)),
                    _ => {
                        if let Some(new) = &change.new {
                            let list = list_entry(&mut out, name);
                            if *i < list.len() {
                                list[*i] = new.clone();
                            } else {
                                list.push(new.clone());
                            }
                        }
                    }
                },
                _ => {}
            }
        }
        // Trailing removals, highest index first so the others stay valid.
        positional_removals.sort_by(|a, b| b.1.cmp(&a.1));
        for (name, i) in positional_removals {
            if let Some(AttributeValue::List(list)) = out.get_mut(&name) {
                if i < list.len() {
                    list.remove(i);
                }
            }
        }
        out
    }
}

fn list_entry<'a>(attrs: &'a mut Attributes, name: &str) -> &'a mut Vec<AttributeValue> {
    let entry = attrs
        .entry(name.to_string())
        .or_insert_with(|| AttributeValue::List(Vec::new()));
    if !matches!(entry, AttributeValue::List(_)) {
        *entry = AttributeValue::List(Vec::new());
    }
    match entry {
        AttributeValue::List(list) => list,
        _ => unreachable!("entry was just made a list"),
    }
}

fn apply_attribute_change(out: &mut Attributes, name: &str, change: &Change) {
    // A whole block at an attribute path is one element of a set-like list.
    let element = match change.kind {
        ChangeKind::Add => change.new.as_ref(),
        ChangeKind::Remove => change.old.as_ref(),
        _ => None,
    }
    .filter(|v| matches!(v, AttributeValue::Block(_)));

    match (change.kind, element) {
        (ChangeKind::Add, Some(block)) => list_entry(out, name).push(block.clone()),
        (ChangeKind::Remove, Some(block)) => {
            let list = list_entry(out, name);
            if let Some(pos) = list.iter().position(|b| b == block) {
                list.remove(pos);
            }
        }
        (ChangeKind::Add | ChangeKind::Modify, None) => {
            if let Some(new) = &change.new {
                out.insert(name.to_string(), new.clone());
            }
        }
        (ChangeKind::Remove, None) => {
            out.remove(name);
        }
        _ => {}
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

impl Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.changes.is_empty() {
            return write!(f, "no changes");
        }
        for (i, change) in self.changes.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", change)?;
        }
        Ok(())
    }
}

/// Compare `old` (current state, `None` if the resource has never been
/// created) with `new` (desired configuration, defaults applied).
pub fn diff(schema: &Schema, old: Option<&Attributes>, new: &Attributes) -> Result<ChangeSet> {
    let empty = Attributes::new();
    if let Some(old) = old {
        schema.check_shape(old)?;
    }
    schema.check_shape(new)?;

    let mut changes = Vec::new();
    let ctx = DiffContext {
        has_prior: old.is_some(),
    };
    match ctx.diff_block(
        schema,
        old.unwrap_or(&empty),
        new,
        &AttributePath::root(),
        &mut changes,
    ) {
        ControlFlow::Break(replace) => {
            tracing::debug!(path = %replace.path, "change forces replacement");
            Ok(ChangeSet {
                changes: vec![replace],
            })
        }
        ControlFlow::Continue(()) => Ok(ChangeSet { changes }),
    }
}

struct DiffContext {
    /// Without prior state nothing can force a replacement.
    has_prior: bool,
}

impl DiffContext {
    fn diff_block(
        &self,
        schema: &Schema,
        old: &Attributes,
        new: &Attributes,
        path: &AttributePath,
        changes: &mut Vec<Change>,
    ) -> ControlFlow<Change> {
        let scalars = schema
            .attributes()
            .filter(|(_, def)| def.type_.is_scalar() && !def.metadata);
        let (replacing, in_place): (Vec<_>, Vec<_>) =
            scalars.partition(|(_, def)| def.forces_replace);

        for (name, def) in replacing.into_iter().chain(in_place) {
            let attr_path = path.attr(name);
            if let Some(change) = diff_scalar(def, old.get(name), new.get(name), &attr_path) {
                if def.forces_replace && self.has_prior {
                    return ControlFlow::Break(replacement(change));
                }
                changes.push(change);
            }
        }

        for (name, def) in schema.attributes() {
            if let AttributeType::Blocks { block, nesting } = &def.type_ {
                let old_list = old.get(name).and_then(|v| v.as_list()).unwrap_or(&[]);
                let new_list = new.get(name).and_then(|v| v.as_list()).unwrap_or(&[]);
                if def.computed && !new.contains_key(name) {
                    continue;
                }
                let attr_path = path.attr(name);
                if def.forces_replace
                    && self.has_prior
                    && !lists_equal(block, *nesting, old_list, new_list)
                {
                    return ControlFlow::Break(Change {
                        path: attr_path,
                        old: old.get(name).cloned(),
                        new: new.get(name).cloned(),
                        kind: ChangeKind::ReplaceWhole,
                    });
                }
                match nesting {
                    Nesting::Unordered => diff_unordered(block, old_list, new_list, &attr_path, changes),
                    Nesting::Ordered => {
                        self.diff_ordered(block, old_list, new_list, &attr_path, changes)?
                    }
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn diff_ordered(
        &self,
        schema: &Schema,
        old: &[AttributeValue],
        new: &[AttributeValue],
        path: &AttributePath,
        changes: &mut Vec<Change>,
    ) -> ControlFlow<Change> {
        for i in 0..old.len().max(new.len()) {
            let item_path = path.index(i);
            match (old.get(i), new.get(i)) {
                (Some(o), Some(n)) => {
                    let (ob, nb) = (block_fields(o), block_fields(n));
                    if blocks_equal(schema, ob, nb) {
                        continue;
                    }
                    if self.has_prior {
                        if let Some(change) = replacing_field_change(schema, ob, nb, &item_path) {
                            return ControlFlow::Break(change);
                        }
                    }
                    changes.push(Change {
                        path: item_path,
                        old: Some(o.clone()),
                        new: Some(n.clone()),
                        kind: ChangeKind::Modify,
                    });
                }
                (Some(o), None) => changes.push(Change {
                    path: item_path,
                    old: Some(o.clone()),
                    new: None,
                    kind: ChangeKind::Remove,
                }),
                (None, Some(n)) => changes.push(Change {
                    path: item_path,
                    old: None,
                    new: Some(n.clone()),
                    kind: ChangeKind::Add,
                }),
                (None, None) => {}
            }
        }
        ControlFlow::Continue(())
    }
}

fn replacement(change: Change) -> Change {
    Change {
        kind: ChangeKind::ReplaceWhole,
        ..change
    }
}

fn diff_scalar(
    def: &AttributeDef,
    old: Option<&AttributeValue>,
    new: Option<&AttributeValue>,
    path: &AttributePath,
) -> Option<Change> {
    let kind = match (old, new) {
        (None, None) => return None,
        // The backend owns computed values the configuration leaves unset.
        (Some(_), None) if def.computed => return None,
        (Some(_), None) => ChangeKind::Remove,
        (None, Some(_)) => ChangeKind::Add,
        (Some(o), Some(n)) if o == n => return None,
        (Some(_), Some(_)) => ChangeKind::Modify,
    };
    Some(Change {
        path: path.clone(),
        old: old.cloned(),
        new: new.cloned(),
        kind,
    })
}

/// Set-like block lists: a block is identified by its compared fields, never
/// by its position.
fn diff_unordered(
    schema: &Schema,
    old: &[AttributeValue],
    new: &[AttributeValue],
    path: &AttributePath,
    changes: &mut Vec<Change>,
) {
    // Canonical order first, so that which of several equal candidates is
    // matched does not depend on how the configuration was written.
    let mut unmatched: Vec<&AttributeValue> = new.iter().collect();
    unmatched.sort_by_cached_key(|v| v.canonical_key());

    let mut removed = Vec::new();
    for o in old {
        let ob = block_fields(o);
        match unmatched
            .iter()
            .position(|n| blocks_equal(schema, ob, block_fields(n)))
        {
            Some(pos) => {
                unmatched.remove(pos);
            }
            None => removed.push(o),
        }
    }
    removed.sort_by_cached_key(|v| v.canonical_key());

    for o in removed {
        changes.push(Change {
            path: path.clone(),
            old: Some(o.clone()),
            new: None,
            kind: ChangeKind::Remove,
        });
    }
    for n in unmatched {
        changes.push(Change {
            path: path.clone(),
            old: None,
            new: Some(n.clone()),
            kind: ChangeKind::Add,
        });
    }
}

fn block_fields(v: &AttributeValue) -> &Attributes {
    static EMPTY: Attributes = Attributes::new();
    v.as_block().unwrap_or(&EMPTY)
}

/// Structural equality over the compared (non-metadata) fields.
fn blocks_equal(schema: &Schema, a: &Attributes, b: &Attributes) -> bool {
    schema.attributes().all(|(name, def)| {
        if def.metadata {
            return true;
        }
        match &def.type_ {
            AttributeType::Blocks { block, nesting } => {
                let al = a.get(name).and_then(|v| v.as_list()).unwrap_or(&[]);
                let bl = b.get(name).and_then(|v| v.as_list()).unwrap_or(&[]);
                lists_equal(block, *nesting, al, bl)
            }
            _ => a.get(name) == b.get(name),
        }
    })
}

fn lists_equal(schema: &Schema, nesting: Nesting, a: &[AttributeValue], b: &[AttributeValue]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    match nesting {
        Nesting::Ordered => a
            .iter()
            .zip(b)
            .all(|(x, y)| blocks_equal(schema, block_fields(x), block_fields(y))),
        Nesting::Unordered => {
            let mut rest: Vec<&AttributeValue> = b.iter().collect();
            a.iter().all(|x| {
                match rest
                    .iter()
                    .position(|y| blocks_equal(schema, block_fields(x), block_fields(y)))
                {
                    Some(pos) => {
                        rest.remove(pos);
                        true
                    }
                    None => false,
                }
            })
        }
    }
}

/// The first forces-replace field that differs between two blocks at the
/// same position.
fn replacing_field_change(
    schema: &Schema,
    old: &Attributes,
    new: &Attributes,
    path: &AttributePath,
) -> Option<Change> {
    schema
        .attributes()
        .filter(|(_, def)| def.forces_replace && !def.metadata)
        .find_map(|(name, def)| {
            let differs = match &def.type_ {
                AttributeType::Blocks { block, nesting } => !lists_equal(
                    block,
                    *nesting,
                    old.get(name).and_then(|v| v.as_list()).unwrap_or(&[]),
                    new.get(name).and_then(|v| v.as_list()).unwrap_or(&[]),
                ),
                _ => diff_scalar(def, old.get(name), new.get(name), path).is_some(),
            };
            differs.then(|| Change {
                path: path.attr(name),
                old: old.get(name).cloned(),
                new: new.get(name).cloned(),
                kind: ChangeKind::ReplaceWhole,
            })
        })
}
