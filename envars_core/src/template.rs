//! `{{ NAME }}` / `{{ env.get('X', default) }}` expansion and the reference-graph
//! extraction that backs cycle detection in both `resolve` and `validate`.
//!
//! Rendering itself is delegated to `tera` (Design Note "Template engine"); the
//! `env.get(...)` form is not something `tera` speaks natively, so it is
//! substituted in a pass of its own before a template ever reaches `tera`.

use std::collections::BTreeMap;

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{Graph, NodeIndex};
use regex::{Captures, Regex};

/// A cycle in the variable-reference graph: every name in it, sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle(pub Vec<String>);

/// Every `{{ NAME }}` reference in `template`, excluding the reserved `env` name
/// (which reads the process environment rather than another variable).
pub fn referenced_names(template: &str) -> Vec<String> {
    let re = Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("static regex");
    let mut names: Vec<String> = re
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .filter(|n| n != "env")
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Substitute every `{{ env.get('KEY', 'default') }}` occurrence with the
/// calling process' environment, or the literal default when `KEY` is unset and
/// a default was given. Does not touch `{{ NAME }}` variable references.
pub fn render_env_refs(template: &str, process_env: &BTreeMap<String, String>) -> String {
    let re = Regex::new(
        r#"\{\{\s*env\.get\(\s*['"]([^'"]+)['"]\s*(?:,\s*['"]?([^'")]*?)['"]?\s*)?\)\s*\}\}"#,
    )
    .expect("static regex");
    re.replace_all(template, |caps: &Captures| {
        let key = &caps[1];
        if let Some(v) = process_env.get(key) {
            v.clone()
        } else if let Some(default) = caps.get(2) {
            default.as_str().to_string()
        } else {
            String::new()
        }
    })
    .into_owned()
}

/// Topologically sort `names` given an edge list `u -> v` meaning "the value of
/// `v` references `u`". On success, names come back in render order
/// (dependencies before dependents). On a cycle, returns every name that
/// participates in one, sorted lexicographically (§4.4 Step C).
pub fn topo_order(names: &[String], edges: &[(String, String)]) -> Result<Vec<String>, Cycle> {
    let mut graph = Graph::<String, ()>::new();
    let mut index: BTreeMap<String, NodeIndex> = BTreeMap::new();
    for name in names {
        index.insert(name.clone(), graph.add_node(name.clone()));
    }
    for (u, v) in edges {
        if let (Some(&ui), Some(&vi)) = (index.get(u), index.get(v)) {
            graph.add_edge(ui, vi, ());
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(|i| graph[i].clone()).collect()),
        Err(_) => {
            let mut offenders: Vec<String> = Vec::new();
            for scc in tarjan_scc(&graph) {
                if scc.len() > 1 {
                    offenders.extend(scc.into_iter().map(|i| graph[i].clone()));
                } else {
                    let i = scc[0];
                    if graph.contains_edge(i, i) {
                        offenders.push(graph[i].clone());
                    }
                }
            }
            offenders.sort();
            offenders.dedup();
            Err(Cycle(offenders))
        }
    }
}
