//! Pod CIDR routes towards remote nodes.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use node_manager::error::DatapathError;
use node_manager::{Identity, Node, NodeHandler};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub cidr: IpNet,
    pub gateway: IpAddr,
    pub owner: Identity,
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("node {node} has no address to route {cidr} through")]
    NoNextHop { node: Identity, cidr: IpNet },
    #[error("{cidr} is already routed to node {owner}")]
    Conflict { cidr: IpNet, owner: Identity },
}

/// Routing table handler: every remote node's allocation CIDRs are routed
/// through the node address of the same family.
#[derive(Debug)]
pub struct RouteTable {
    local: Identity,
    routes: RwLock<BTreeMap<IpNet, Route>>,
}

impl RouteTable {
    pub fn new(local: Identity) -> Self {
        Self {
            local,
            routes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes.read().values().cloned().collect()
    }

    pub fn get(&self, cidr: &IpNet) -> Option<Route> {
        self.routes.read().get(cidr).cloned()
    }

    /// Drops a route behind the handler's back, as an external actor would.
    pub fn flush_route(&self, cidr: &IpNet) -> Option<Route> {
        self.routes.write().remove(cidr)
    }

    fn desired(&self, node: &Node) -> Result<Vec<Route>, RouteError> {
        if node.identity() == self.local {
            return Ok(Vec::new());
        }
        let owner = node.identity();
        let mut routes = Vec::new();
        for (cidrs, ipv6) in [(node.ipv4_alloc_cidrs(), false), (node.ipv6_alloc_cidrs(), true)] {
            for cidr in cidrs {
                let gateway = node.node_ip(ipv6).ok_or_else(|| RouteError::NoNextHop {
                    node: owner.clone(),
                    cidr,
                })?;
                routes.push(Route {
                    cidr,
                    gateway,
                    owner: owner.clone(),
                });
            }
        }
        Ok(routes)
    }

    /// Installs `routes`, returning how many entries changed. Either every
    /// route is installed or, on conflict, none is.
    fn install(&self, routes: Vec<Route>) -> Result<usize, RouteError> {
        let mut table = self.routes.write();
        if let Some((route, existing)) = routes.iter().find_map(|route| {
            table
                .get(&route.cidr)
                .filter(|existing| existing.owner != route.owner)
                .map(|existing| (route, existing))
        }) {
            return Err(RouteError::Conflict {
                cidr: route.cidr,
                owner: existing.owner.clone(),
            });
        }

        let mut changed = 0;
        for route in routes {
            if table.get(&route.cidr) == Some(&route) {
                continue;
            }
            debug!(cidr = %route.cidr, gateway = %route.gateway, "installing route");
            table.insert(route.cidr, route);
            changed += 1;
        }
        Ok(changed)
    }

    fn withdraw(&self, owner: &Identity, keep: &[Route]) {
        self.routes.write().retain(|cidr, route| {
            let stale = route.owner == *owner && !keep.iter().any(|k| k.cidr == *cidr);
            if stale {
                debug!(%cidr, "withdrawing route");
            }
            !stale
        });
    }
}

impl NodeHandler for RouteTable {
    fn name(&self) -> &str {
        "route-table"
    }

    fn node_add(&self, node: &Node) -> Result<(), DatapathError> {
        let routes = self.desired(node)?;
        self.install(routes)?;
        Ok(())
    }

    fn node_update(&self, old: &Node, new: &Node) -> Result<(), DatapathError> {
        let routes = self.desired(new)?;
        self.withdraw(&old.identity(), &routes);
        self.install(routes)?;
        Ok(())
    }

    fn node_delete(&self, node: &Node) -> Result<(), DatapathError> {
        self.withdraw(&node.identity(), &[]);
        Ok(())
    }

    fn node_validate_implementation(&self, node: &Node) -> Result<(), DatapathError> {
        let routes = self.desired(node)?;
        let repaired = self.install(routes).inspect_err(|err| {
            warn!(node = %node.identity(), error = %err, "route validation failed");
        })?;
        if repaired > 0 {
            info!(node = %node.identity(), repaired, "Repaired drifted routes");
        }
        Ok(())
    }
}
