//! Route resolution: which artifacts go where.
//!
//! Routes are walked in declaration order; a route matches when both its
//! `kind` and `variant` match the artifact, and a missing field matches
//! anything. Destinations may reference configured roots as
//! `${remoteRoots.KEY}`.

use std::collections::BTreeMap;

use crate::config::Route;

/// Compiled route table.
pub struct RouteTable {
    routes: Vec<Route>,
    remote_roots: BTreeMap<String, String>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>, remote_roots: BTreeMap<String, String>) -> Self {
        Self {
            routes,
            remote_roots,
        }
    }

    /// First matching route's destination, with variables expanded.
    pub fn resolve(&self, kind: &str, variant: &str) -> Option<String> {
        for route in &self.routes {
            if let Some(route_kind) = &route.kind {
                if route_kind != kind {
                    continue;
                }
            }
            if let Some(route_variant) = &route.variant {
                if route_variant != variant {
                    continue;
                }
            }
            return Some(self.expand(&route.to));
        }
        None
    }

    /// Replace `${remoteRoots.KEY}` placeholders with configured roots.
    fn expand(&self, template: &str) -> String {
        let mut result = template.to_string();
        for (key, value) in &self.remote_roots {
            let placeholder = format!("${{remoteRoots.{key}}}");
            result = result.replace(&placeholder, value);
        }
        result
    }
}
