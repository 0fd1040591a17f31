//! Dependency graph construction and topological creation order.
//!
//! Edges come from explicit `depends_on` lists plus every attribute
//! reference (`get_attr`, `${resource.attr}` substitution placeholders) in a
//! resource's properties. Order is computed by depth-first traversal with a
//! visiting set; a revisit of a node still marked visiting reports the full
//! cycle path. Ties among independent resources break by declaration order,
//! so runs are reproducible across executions of the same template.

use super::error::GraphError;
use super::eval::sub_placeholders;
use super::types::{Expr, ResourceDecl};
use indexmap::IndexMap;
use std::collections::HashMap;

/// Logical ids a resource depends on, in first-reference order, deduplicated.
pub fn dependencies(resource: &ResourceDecl) -> Vec<String> {
    let mut deps = Vec::new();
    for dep in &resource.depends_on {
        push_unique(&mut deps, dep.clone());
    }
    for expr in resource.properties.values() {
        collect_expr_deps(expr, &mut deps);
    }
    deps
}

fn collect_expr_deps(expr: &Expr, deps: &mut Vec<String>) {
    match expr {
        Expr::GetAttr { get_attr: (resource, _) } => push_unique(deps, resource.clone()),
        Expr::Sub { sub } => {
            for key in sub_placeholders(sub) {
                if let Some((resource, _)) = key.split_once('.') {
                    push_unique(deps, resource.to_string());
                }
            }
        }
        Expr::Join { join } => join.iter().for_each(|e| collect_expr_deps(e, deps)),
        Expr::Seq(items) => items.iter().for_each(|e| collect_expr_deps(e, deps)),
        Expr::Map(entries) => entries.values().for_each(|e| collect_expr_deps(e, deps)),
        Expr::Scalar(_) | Expr::Ref { .. } | Expr::FindInMap { .. } => {}
    }
}

fn push_unique(deps: &mut Vec<String>, dep: String) {
    if !deps.contains(&dep) {
        deps.push(dep);
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Compute the topological creation order for a resource set.
pub fn creation_order(
    resources: &IndexMap<String, ResourceDecl>,
) -> Result<Vec<String>, GraphError> {
    let mut edges: IndexMap<String, Vec<String>> = IndexMap::new();
    for (id, resource) in resources {
        let deps = dependencies(resource);
        for dep in &deps {
            if !resources.contains_key(dep) {
                return Err(GraphError::UnknownDependency {
                    resource: id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        edges.insert(id.clone(), deps);
    }

    let mut marks: HashMap<String, Mark> = HashMap::new();
    let mut stack: Vec<String> = Vec::new();
    let mut order: Vec<String> = Vec::new();

    for id in resources.keys() {
        visit(id, &edges, &mut marks, &mut stack, &mut order)?;
    }

    Ok(order)
}

fn visit(
    id: &str,
    edges: &IndexMap<String, Vec<String>>,
    marks: &mut HashMap<String, Mark>,
    stack: &mut Vec<String>,
    order: &mut Vec<String>,
) -> Result<(), GraphError> {
    match marks.get(id) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = stack.iter().position(|s| s == id).unwrap_or(0);
            let mut path: Vec<String> = stack[start..].to_vec();
            path.push(id.to_string());
            return Err(GraphError::Cycle { path });
        }
        None => {}
    }

    marks.insert(id.to_string(), Mark::Visiting);
    stack.push(id.to_string());
    for dep in &edges[id] {
        visit(dep, edges, marks, stack, order)?;
    }
    stack.pop();
    marks.insert(id.to_string(), Mark::Done);
    order.push(id.to_string());

    Ok(())
}
