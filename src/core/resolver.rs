//! Dependency resolution: descriptors in, install order out.
//!
//! Depth-first traversal with three-color marking (unvisited /
//! in-progress / done). Hitting an in-progress node is a cycle; the full
//! path is reported. Children are visited in ascending name order so the
//! resulting plan is deterministic across runs.

use std::collections::HashMap;

use thiserror::Error;

use crate::core::descriptor::Descriptor;
use crate::types::PackageName;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("dependency cycle: {}", render_path(.path))]
    Cycle { path: Vec<PackageName> },

    #[error("unresolved dependency '{name}'{}", render_requirer(.required_by))]
    Unresolved {
        name: PackageName,
        /// `None` when the missing package was requested directly.
        required_by: Option<PackageName>,
    },
}

fn render_path(path: &[PackageName]) -> String {
    path.iter()
        .map(PackageName::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn render_requirer(required_by: &Option<PackageName>) -> String {
    match required_by {
        Some(name) => format!(" required by '{name}'"),
        None => String::new(),
    }
}

/// A resolved, dependency-ordered sequence of build identities for one
/// requested root set. Owned by the orchestrator for a single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    order: Vec<PackageName>,
}

impl InstallPlan {
    pub fn order(&self) -> &[PackageName] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn position(&self, name: &PackageName) -> Option<usize> {
        self.order.iter().position(|n| n == name)
    }
}

impl<'a> IntoIterator for &'a InstallPlan {
    type Item = &'a PackageName;
    type IntoIter = std::slice::Iter<'a, PackageName>;

    fn into_iter(self) -> Self::IntoIter {
        self.order.iter()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    InProgress,
    Done,
}

/// Resolve an install order for `roots` using `lookup` to find each
/// descriptor by name.
///
/// Every dependency precedes its dependent; build-only and runtime
/// dependencies are ordered identically. Ties are broken by ascending
/// name. An unresolvable dependency is never silently dropped.
pub fn resolve<'a, F>(roots: &[PackageName], lookup: F) -> Result<InstallPlan, ResolveError>
where
    F: Fn(&PackageName) -> Option<&'a Descriptor>,
{
    let mut sorted_roots: Vec<PackageName> = roots.to_vec();
    sorted_roots.sort();
    sorted_roots.dedup();

    let mut order = Vec::new();
    let mut marks: HashMap<PackageName, Mark> = HashMap::new();
    let mut stack: Vec<PackageName> = Vec::new();

    for root in &sorted_roots {
        visit(root, None, &lookup, &mut order, &mut marks, &mut stack)?;
    }

    Ok(InstallPlan { order })
}

fn visit<'a, F>(
    name: &PackageName,
    required_by: Option<&PackageName>,
    lookup: &F,
    order: &mut Vec<PackageName>,
    marks: &mut HashMap<PackageName, Mark>,
    stack: &mut Vec<PackageName>,
) -> Result<(), ResolveError>
where
    F: Fn(&PackageName) -> Option<&'a Descriptor>,
{
    match marks.get(name) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::InProgress) => {
            // Report the cycle from its first occurrence on the stack,
            // closed with the repeated name.
            let start = stack.iter().position(|n| n == name).unwrap_or(0);
            let mut path: Vec<PackageName> = stack[start..].to_vec();
            path.push(name.clone());
            return Err(ResolveError::Cycle { path });
        }
        None => {}
    }

    let descriptor = lookup(name).ok_or_else(|| ResolveError::Unresolved {
        name: name.clone(),
        required_by: required_by.cloned(),
    })?;

    marks.insert(name.clone(), Mark::InProgress);
    stack.push(name.clone());

    // dependency_names() is already sorted ascending.
    for dep in descriptor.dependency_names() {
        visit(&dep, Some(name), lookup, order, marks, stack)?;
    }

    stack.pop();
    marks.insert(name.clone(), Mark::Done);
    order.push(name.clone());
    Ok(())
}
